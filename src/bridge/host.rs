//! Callback surface consumed from the debugger host.
//!
//! The host owns processes, threads, symbols and breakpoints; the bridge only talks to it
//! through these traits. Every capability is a separate trait so that a host (or a test double)
//! implements exactly what a component needs.

use crate::bridge::address::{GlobalAddress, RelocatedAddress};
use crate::bridge::error::Error;
use crate::bridge::frame::LogicalFrame;
use crate::bridge::memory::PointerSize;
use crate::bridge::register::Register;
use std::fmt::{Display, Formatter};
use std::ops::BitOr;

pub type ThreadId = u32;
pub type BreakpointId = u64;

/// Native module loaded into the debugee.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleInstance {
    pub name: String,
    pub base: RelocatedAddress,
    pub size: u64,
}

impl ModuleInstance {
    pub fn new(name: impl Into<String>, base: impl Into<RelocatedAddress>, size: u64) -> Self {
        Self {
            name: name.into(),
            base: base.into(),
            size,
        }
    }

    pub fn contains(&self, addr: RelocatedAddress) -> bool {
        addr >= self.base && addr.as_u64() - self.base.as_u64() < self.size
    }

    /// Module image end (exclusive), saturated at the top of address space.
    pub fn end(&self) -> RelocatedAddress {
        RelocatedAddress::from(self.base.as_u64().saturating_add(self.size))
    }
}

/// Frame registers required to evaluate expressions in a frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameContext {
    pub instruction: RelocatedAddress,
    pub frame_base: u64,
    pub vframe: u64,
}

/// Access to debugee memory.
pub trait RemoteMemory {
    fn pointer_size(&self) -> PointerSize;

    /// Read exactly `buf.len()` bytes, any shortfall is an error.
    fn read_memory(&self, addr: RelocatedAddress, buf: &mut [u8]) -> Result<(), Error>;

    /// Write all bytes of `data`, any shortfall is an error.
    fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error>;
}

/// Debugee thread enumeration and suspension.
pub trait ThreadControl {
    fn thread_ids(&self) -> Vec<ThreadId>;

    fn suspend_thread(&self, tid: ThreadId) -> Result<(), Error>;

    fn resume_thread(&self, tid: ThreadId) -> Result<(), Error>;
}

/// Module symbol, section and export lookups.
pub trait Symbols {
    fn has_symbols(&self, module: &ModuleInstance) -> bool;

    /// Module relative address of a static variable, if symbols know it.
    fn static_variable(&self, module: &ModuleInstance, name: &str) -> Option<GlobalAddress>;

    /// Entry address of a function inside a module.
    fn function_address(&self, module: &ModuleInstance, name: &str) -> Option<RelocatedAddress>;

    /// Return true if both addresses belong to the same function.
    fn is_same_function(&self, a: RelocatedAddress, b: RelocatedAddress) -> bool;

    /// Module relative address of an image section whose name matches `tag`.
    /// Hosts without image knowledge return `None`, the remote image header is then walked.
    fn section_rva(&self, _module: &ModuleInstance, _tag: &str) -> Option<GlobalAddress> {
        None
    }

    /// Module relative address of an exported symbol.
    /// Hosts without export knowledge return `None`, the remote export directory is then walked.
    fn export_rva(&self, _module: &ModuleInstance, _name: &str) -> Option<GlobalAddress> {
        None
    }
}

/// Native expression evaluation and register access in a live thread.
pub trait Evaluator {
    fn evaluate_u64(&self, thread: ThreadId, frame: &FrameContext, expr: &str)
        -> Result<u64, Error>;

    fn read_register(&self, thread: ThreadId, register: Register) -> Result<u64, Error>;

    /// Context of the topmost frame of a thread, `None` if the thread is not inspectable.
    fn top_frame(&self, thread: ThreadId) -> Option<FrameContext>;
}

/// Runtime breakpoints owned by the host.
pub trait Breakpoints {
    /// Create a disabled breakpoint.
    fn create_breakpoint(&self, addr: RelocatedAddress) -> Result<BreakpointId, Error>;

    fn enable_breakpoint(&self, id: BreakpointId) -> Result<(), Error>;

    fn disable_breakpoint(&self, id: BreakpointId) -> Result<(), Error>;

    fn close_breakpoint(&self, id: BreakpointId) -> Result<(), Error>;
}

/// Host stack walk, yields already filtered frames top first.
pub trait StackWalk {
    fn logical_frames(&self, thread: ThreadId) -> Box<dyn Iterator<Item = LogicalFrame> + '_>;
}

/// Thread-control-block address known to the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadStateCandidate {
    pub address: RelocatedAddress,
    pub thread_id: Option<ThreadId>,
}

/// Runtime introspection used to pick a thread-state for an attach request.
pub trait ThreadStates {
    /// Thread states of the main interpreter, in the runtime's list order.
    fn main_interpreter_thread_states(&self) -> Vec<ThreadStateCandidate> {
        vec![]
    }

    /// Every thread state of every interpreter.
    fn thread_states(&self) -> Vec<ThreadStateCandidate> {
        vec![]
    }

    /// Current thread state as returned by the runtime's exported accessor, evaluated live.
    fn current_thread_state(&self) -> Option<RelocatedAddress> {
        None
    }
}

/// Process handle access rights.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessRights(u32);

impl AccessRights {
    pub const VM_OPERATION: AccessRights = AccessRights(0x0008);
    pub const VM_READ: AccessRights = AccessRights(0x0010);
    pub const VM_WRITE: AccessRights = AccessRights(0x0020);
    pub const QUERY_INFORMATION: AccessRights = AccessRights(0x0400);

    /// Least privilege set for a remote attach request.
    pub const ATTACH: AccessRights = AccessRights(
        Self::VM_OPERATION.0 | Self::VM_READ.0 | Self::VM_WRITE.0 | Self::QUERY_INFORMATION.0,
    );

    pub fn contains(self, other: AccessRights) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for AccessRights {
    type Output = AccessRights;

    fn bitor(self, rhs: Self) -> Self::Output {
        AccessRights(self.0 | rhs.0)
    }
}

impl Display for AccessRights {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06X}", self.0)
    }
}

/// Opens dedicated process handles.
pub trait ProcessOpener {
    fn process_id(&self) -> u32;

    /// Open a handle with exactly `rights`, a refused handle is [`Error::AccessDenied`].
    fn open_process(&self, rights: AccessRights) -> Result<Box<dyn RemoteMemory + '_>, Error>;
}

/// Everything the offsets address resolver needs.
pub trait ResolverHost: RemoteMemory + ThreadControl + Symbols + Evaluator {}

impl<T: RemoteMemory + ThreadControl + Symbols + Evaluator + ?Sized> ResolverHost for T {}

/// Everything the remote attach protocol needs.
pub trait AttachHost: RemoteMemory + ThreadStates + ProcessOpener {}

impl<T: RemoteMemory + ThreadStates + ProcessOpener + ?Sized> AttachHost for T {}

/// Everything the step gate controller needs.
pub trait StepHost: Symbols + Evaluator + Breakpoints + StackWalk {}

impl<T: Symbols + Evaluator + Breakpoints + StackWalk + ?Sized> StepHost for T {}
