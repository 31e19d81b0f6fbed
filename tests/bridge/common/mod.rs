//! In-memory debugee implementing every host trait.

use bytes::BufMut;
use pybridge::bridge::address::{GlobalAddress, RelocatedAddress};
use pybridge::bridge::error::Error;
use pybridge::bridge::frame::LogicalFrame;
use pybridge::bridge::host::{
    AccessRights, BreakpointId, Breakpoints, Evaluator, FrameContext, ModuleInstance,
    ProcessOpener, RemoteMemory, StackWalk, Symbols, ThreadControl, ThreadId, ThreadStateCandidate,
    ThreadStates,
};
use pybridge::bridge::memory::PointerSize;
use pybridge::bridge::register::Register;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::PathBuf;

pub const RUNTIME_BASE: u64 = 0x7F00_0000_0000;
pub const RUNTIME_SIZE: u64 = 0x10_0000;
pub const HEADER_RVA: u64 = 0x5000;
pub const EVAL_BREAKER: u64 = RUNTIME_BASE + 0x8000;
pub const HEAP_BASE: u64 = 0x5555_0000_0000;
pub const THREAD_STATE: u64 = HEAP_BASE + 0x1000;
pub const SUPPORT: u64 = HEAP_BASE + 0x4000;
pub const REMOTE_SUPPORT_OFFSET: u64 = 0x310;
pub const PENDING_CALL_OFFSET: u64 = 0x8;
pub const SCRIPT_PATH_OFFSET: u64 = 0x10;
pub const SCRIPT_PATH_SIZE: u64 = 260;
pub const MAIN_THREAD: ThreadId = 100;

pub const FLAG_REMOTE_DEBUG_DISABLED: u8 = 0x02;

/// Debug offsets header in the current layout, 64 bit.
pub struct Header {
    pub version: u32,
    pub flags: u8,
    pub eval_breaker: u64,
    pub script_path_size: u64,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            version: 0x030E_00F0,
            flags: 0,
            eval_breaker: EVAL_BREAKER,
            script_path_size: SCRIPT_PATH_SIZE,
        }
    }
}

impl Header {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_slice(b"xdebugpy");
        buf.put_u32_le(self.version);
        buf.put_u8(self.flags);
        buf.put_bytes(0, 3);
        buf.put_u64_le(64);
        for field in [
            self.eval_breaker,
            REMOTE_SUPPORT_OFFSET,
            PENDING_CALL_OFFSET,
            SCRIPT_PATH_OFFSET,
            self.script_path_size,
        ] {
            buf.put_u64_le(field);
        }
        buf
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    pub addr: RelocatedAddress,
    pub enabled: bool,
    pub closed: bool,
}

pub struct Debugee {
    regions: RefCell<Vec<(u64, Vec<u8>)>>,
    pub writes: Cell<usize>,
    pub threads: Vec<ThreadId>,
    pub suspend_log: RefCell<Vec<String>>,
    pub main_thread_states: Vec<ThreadStateCandidate>,
    pub deny_open: bool,
    pub fail_read_at: Option<u64>,
    pub fail_write_at: Option<u64>,
    pub has_symbols: bool,
    pub variables: HashMap<String, u64>,
    pub functions: HashMap<String, u64>,
    pub expressions: HashMap<String, u64>,
    pub registers: HashMap<Register, u64>,
    pub top: Option<FrameContext>,
    pub frames: Vec<LogicalFrame>,
    pub breakpoints: RefCell<Vec<Breakpoint>>,
}

impl Debugee {
    /// Debugee with a published header, one thread-state and its remote support structure.
    pub fn new(header: Header) -> Self {
        let debugee = Self {
            regions: RefCell::new(vec![
                (RUNTIME_BASE, vec![0; RUNTIME_SIZE as usize]),
                (HEAP_BASE, vec![0; 0x1_0000]),
            ]),
            writes: Cell::new(0),
            threads: vec![MAIN_THREAD, MAIN_THREAD + 1],
            suspend_log: RefCell::default(),
            main_thread_states: vec![ThreadStateCandidate {
                address: RelocatedAddress::from(THREAD_STATE),
                thread_id: Some(MAIN_THREAD),
            }],
            deny_open: false,
            fail_read_at: None,
            fail_write_at: None,
            has_symbols: true,
            variables: HashMap::from([("_Py_DebugOffsets".to_string(), HEADER_RVA)]),
            functions: HashMap::new(),
            expressions: HashMap::new(),
            registers: HashMap::new(),
            top: None,
            frames: vec![],
            breakpoints: RefCell::default(),
        };
        debugee.poke(RUNTIME_BASE + HEADER_RVA, &header.encode());
        debugee.poke(
            THREAD_STATE + REMOTE_SUPPORT_OFFSET,
            &SUPPORT.to_le_bytes(),
        );
        debugee
    }

    pub fn runtime() -> ModuleInstance {
        ModuleInstance::new("python314.dll", RUNTIME_BASE, RUNTIME_SIZE)
    }

    fn region_index(&self, addr: u64, len: usize) -> Option<(usize, usize)> {
        self.regions.borrow().iter().enumerate().find_map(|(i, (base, data))| {
            let offset = addr.checked_sub(*base)? as usize;
            (offset.checked_add(len)? <= data.len()).then_some((i, offset))
        })
    }

    /// Write without counting, used to set up and tamper with the debugee.
    pub fn poke(&self, addr: u64, data: &[u8]) {
        let (i, offset) = self.region_index(addr, data.len()).unwrap();
        self.regions.borrow_mut()[i].1[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn peek(&self, addr: u64, len: usize) -> Vec<u8> {
        let (i, offset) = self.region_index(addr, len).unwrap();
        self.regions.borrow()[i].1[offset..offset + len].to_vec()
    }

    pub fn peek_u32(&self, addr: u64) -> u32 {
        u32::from_le_bytes(self.peek(addr, 4).try_into().unwrap())
    }

    pub fn enabled_at(&self, addr: u64) -> bool {
        self.breakpoints
            .borrow()
            .iter()
            .any(|bp| bp.addr.as_u64() == addr && bp.enabled && !bp.closed)
    }

    pub fn live_breakpoints(&self) -> usize {
        self.breakpoints
            .borrow()
            .iter()
            .filter(|bp| !bp.closed)
            .count()
    }

    fn with_breakpoint(
        &self,
        id: BreakpointId,
        f: impl FnOnce(&mut Breakpoint),
    ) -> Result<(), Error> {
        let mut bps = self.breakpoints.borrow_mut();
        let bp = bps
            .get_mut(id as usize)
            .ok_or(Error::BreakpointNotFound(id))?;
        f(bp);
        Ok(())
    }
}

impl RemoteMemory for Debugee {
    fn pointer_size(&self) -> PointerSize {
        PointerSize::Eight
    }

    fn read_memory(&self, addr: RelocatedAddress, buf: &mut [u8]) -> Result<(), Error> {
        let len = buf.len();
        let (i, offset) = self
            .region_index(addr.as_u64(), len)
            .filter(|_| self.fail_read_at != Some(addr.as_u64()))
            .ok_or(Error::ReadMemory { addr, len })?;
        buf.copy_from_slice(&self.regions.borrow()[i].1[offset..offset + len]);
        Ok(())
    }

    fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
        self.writes.set(self.writes.get() + 1);
        self.region_index(addr.as_u64(), data.len())
            .filter(|_| self.fail_write_at != Some(addr.as_u64()))
            .ok_or(Error::WriteMemory {
                addr,
                len: data.len(),
            })?;
        self.poke(addr.as_u64(), data);
        Ok(())
    }
}

impl ThreadControl for Debugee {
    fn thread_ids(&self) -> Vec<ThreadId> {
        self.threads.clone()
    }

    fn suspend_thread(&self, tid: ThreadId) -> Result<(), Error> {
        self.suspend_log.borrow_mut().push(format!("suspend {tid}"));
        Ok(())
    }

    fn resume_thread(&self, tid: ThreadId) -> Result<(), Error> {
        self.suspend_log.borrow_mut().push(format!("resume {tid}"));
        Ok(())
    }
}

impl Symbols for Debugee {
    fn has_symbols(&self, _: &ModuleInstance) -> bool {
        self.has_symbols
    }

    fn static_variable(&self, _: &ModuleInstance, name: &str) -> Option<GlobalAddress> {
        self.variables.get(name).copied().map(GlobalAddress::from)
    }

    fn function_address(&self, _: &ModuleInstance, name: &str) -> Option<RelocatedAddress> {
        self.functions.get(name).copied().map(RelocatedAddress::from)
    }

    fn is_same_function(&self, a: RelocatedAddress, b: RelocatedAddress) -> bool {
        a.as_u64() >> 8 == b.as_u64() >> 8
    }
}

impl Evaluator for Debugee {
    fn evaluate_u64(&self, _: ThreadId, _: &FrameContext, expr: &str) -> Result<u64, Error> {
        self.expressions
            .get(expr)
            .copied()
            .ok_or_else(|| Error::Evaluation {
                expr: expr.to_string(),
                reason: "no such value".to_string(),
            })
    }

    fn read_register(&self, _: ThreadId, register: Register) -> Result<u64, Error> {
        self.registers
            .get(&register)
            .copied()
            .ok_or(Error::RegisterNotAvailable(register.to_string()))
    }

    fn top_frame(&self, _: ThreadId) -> Option<FrameContext> {
        self.top
    }
}

impl Breakpoints for Debugee {
    fn create_breakpoint(&self, addr: RelocatedAddress) -> Result<BreakpointId, Error> {
        let mut bps = self.breakpoints.borrow_mut();
        bps.push(Breakpoint {
            addr,
            enabled: false,
            closed: false,
        });
        Ok((bps.len() - 1) as BreakpointId)
    }

    fn enable_breakpoint(&self, id: BreakpointId) -> Result<(), Error> {
        self.with_breakpoint(id, |bp| bp.enabled = true)
    }

    fn disable_breakpoint(&self, id: BreakpointId) -> Result<(), Error> {
        self.with_breakpoint(id, |bp| bp.enabled = false)
    }

    fn close_breakpoint(&self, id: BreakpointId) -> Result<(), Error> {
        self.with_breakpoint(id, |bp| bp.closed = true)
    }
}

impl StackWalk for Debugee {
    fn logical_frames(&self, _: ThreadId) -> Box<dyn Iterator<Item = LogicalFrame> + '_> {
        Box::new(self.frames.iter().cloned())
    }
}

impl ThreadStates for Debugee {
    fn main_interpreter_thread_states(&self) -> Vec<ThreadStateCandidate> {
        self.main_thread_states.clone()
    }
}

/// Dedicated handle, writes through it are counted as well.
struct Handle<'a>(&'a Debugee);

impl RemoteMemory for Handle<'_> {
    fn pointer_size(&self) -> PointerSize {
        self.0.pointer_size()
    }

    fn read_memory(&self, addr: RelocatedAddress, buf: &mut [u8]) -> Result<(), Error> {
        self.0.read_memory(addr, buf)
    }

    fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
        self.0.write_memory(addr, data)
    }
}

impl ProcessOpener for Debugee {
    fn process_id(&self) -> u32 {
        4242
    }

    fn open_process(&self, rights: AccessRights) -> Result<Box<dyn RemoteMemory + '_>, Error> {
        assert_eq!(rights, AccessRights::ATTACH);
        if self.deny_open {
            return Err(Error::AccessDenied(self.process_id()));
        }
        Ok(Box::new(Handle(self)))
    }
}

/// Existing loader script with a name unique to the calling test.
pub fn loader_script(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("pybridge_{}_{name}.py", std::process::id()));
    std::fs::write(&path, "import sys\n").unwrap();
    path.canonicalize().unwrap()
}
