//! Host implementation for a live Linux process.
//!
//! Memory is accessed with `process_vm_readv`/`process_vm_writev`, the dedicated attach handle is
//! `/proc/<pid>/mem`. Symbols, sections and exports come from the on-disk images of the mapped
//! modules. Registers are not available without a tracer, so only context free expressions are
//! evaluated. Threads are suspended as a whole group, per thread requests only act on the leader.

mod image;

pub use image::ImageIndex;

use crate::bridge::address::{GlobalAddress, RelocatedAddress};
use crate::bridge::error::Error;
use crate::bridge::host::{
    AccessRights, Evaluator, FrameContext, ModuleInstance, ProcessOpener, RemoteMemory, Symbols,
    ThreadControl, ThreadId, ThreadStates,
};
use crate::bridge::memory::PointerSize;
use crate::bridge::register::Register;
use crate::version::Version;
use crate::{muted_error, pb_debug};
use itertools::Itertools;
use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
use nix::unistd::Pid;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::rc::Rc;

pub struct LinuxProcess {
    pid: Pid,
    pointer_size: PointerSize,
    images: RefCell<HashMap<String, Option<Rc<ImageIndex>>>>,
}

impl LinuxProcess {
    pub fn new(pid: u32) -> Result<Self, Error> {
        let raw_pid = i32::try_from(pid).map_err(|_| Error::ProcessNotFound(pid))?;
        let exe = fs::read_link(format!("/proc/{pid}/exe")).map_err(|_| Error::ProcessNotFound(pid))?;
        let pointer_size = match ImageIndex::open(&exe) {
            Ok(index) if !index.is_64 => PointerSize::Four,
            Ok(_) => PointerSize::Eight,
            Err(e) => {
                pb_debug!("executable {} not indexed: {e:#}", exe.display());
                PointerSize::Eight
            }
        };
        Ok(Self {
            pid: Pid::from_raw(raw_pid),
            pointer_size,
            images: RefCell::default(),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// File backed modules of the process, ordered by load address.
    pub fn modules(&self) -> Result<Vec<ModuleInstance>, Error> {
        let maps = proc_maps::get_process_maps(self.pid.as_raw())?;
        let modules = maps
            .iter()
            .filter_map(|map| {
                let file = map.filename()?.to_str()?;
                file.starts_with('/').then_some((file, map.start(), map.start() + map.size()))
            })
            .into_group_map_by(|(file, _, _)| *file)
            .into_iter()
            .filter_map(|(file, ranges)| {
                let start = ranges.iter().map(|(_, start, _)| *start).min()?;
                let end = ranges.iter().map(|(_, _, end)| *end).max()?;
                Some(ModuleInstance::new(file, start, (end - start) as u64))
            })
            .sorted_by_key(|module| module.base)
            .collect();
        Ok(modules)
    }

    /// Module of the interpreted runtime, recognized by its versioned file name.
    pub fn runtime_module(&self) -> Result<ModuleInstance, Error> {
        self.modules()?
            .into_iter()
            .find(|module| {
                let file = Path::new(&module.name)
                    .file_name()
                    .and_then(|f| f.to_str())
                    .unwrap_or_default();
                Version::from_module_name(file).is_some()
            })
            .ok_or(Error::ModuleNotFound("runtime"))
    }

    fn image(&self, module: &ModuleInstance) -> Option<Rc<ImageIndex>> {
        self.images
            .borrow_mut()
            .entry(module.name.clone())
            .or_insert_with(|| {
                muted_error!(ImageIndex::open(Path::new(&module.name)), "image index:").map(Rc::new)
            })
            .clone()
    }

    fn module_at(&self, addr: RelocatedAddress) -> Option<ModuleInstance> {
        muted_error!(self.modules())?
            .into_iter()
            .find(|module| module.contains(addr))
    }

    /// A stop signal stops the whole thread group and a continue signal resumes it, so the
    /// process is stopped and continued once through its leader thread.
    fn signal_group(&self, tid: ThreadId, signal: Signal) -> Result<(), Error> {
        if tid as libc::pid_t != self.pid.as_raw() {
            return Ok(());
        }
        signal::kill(self.pid, signal).map_err(|e| Error::Syscall("kill", e))
    }

    /// Address of a static variable of any module.
    fn static_address(&self, name: &str) -> Option<RelocatedAddress> {
        muted_error!(self.modules())?.iter().find_map(|module| {
            let index = self.image(module)?;
            index
                .variable(name)
                .or_else(|| index.export(name))?
                .relocate(module.base)
        })
    }
}

impl RemoteMemory for LinuxProcess {
    fn pointer_size(&self) -> PointerSize {
        self.pointer_size
    }

    fn read_memory(&self, addr: RelocatedAddress, buf: &mut [u8]) -> Result<(), Error> {
        let len = buf.len();
        let remote = RemoteIoVec {
            base: addr.as_u64() as usize,
            len,
        };
        let read = process_vm_readv(self.pid, &mut [IoSliceMut::new(buf)], &[remote])
            .map_err(|_| Error::ReadMemory { addr, len })?;
        if read != len {
            return Err(Error::ReadMemory { addr, len });
        }
        Ok(())
    }

    fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
        let remote = RemoteIoVec {
            base: addr.as_u64() as usize,
            len: data.len(),
        };
        let written = process_vm_writev(self.pid, &[IoSlice::new(data)], &[remote]).map_err(|_| {
            Error::WriteMemory {
                addr,
                len: data.len(),
            }
        })?;
        if written != data.len() {
            return Err(Error::PartialWrite {
                addr,
                written,
                expected: data.len(),
            });
        }
        Ok(())
    }
}

impl ThreadControl for LinuxProcess {
    fn thread_ids(&self) -> Vec<ThreadId> {
        let Some(dir) = muted_error!(fs::read_dir(format!("/proc/{}/task", self.pid))) else {
            return vec![];
        };
        dir.filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
            .sorted()
            .collect()
    }

    fn suspend_thread(&self, tid: ThreadId) -> Result<(), Error> {
        self.signal_group(tid, Signal::SIGSTOP)
    }

    fn resume_thread(&self, tid: ThreadId) -> Result<(), Error> {
        self.signal_group(tid, Signal::SIGCONT)
    }
}

impl Symbols for LinuxProcess {
    fn has_symbols(&self, module: &ModuleInstance) -> bool {
        self.image(module).is_some_and(|index| index.has_symbols())
    }

    fn static_variable(&self, module: &ModuleInstance, name: &str) -> Option<GlobalAddress> {
        self.image(module)?.variable(name)
    }

    fn function_address(&self, module: &ModuleInstance, name: &str) -> Option<RelocatedAddress> {
        self.image(module)?.function(name)?.relocate(module.base)
    }

    fn is_same_function(&self, a: RelocatedAddress, b: RelocatedAddress) -> bool {
        let Some(module) = self.module_at(a) else {
            return false;
        };
        if !module.contains(b) {
            return false;
        }
        let Some(index) = self.image(&module) else {
            return false;
        };
        let start = |addr: RelocatedAddress| {
            addr.into_global(module.base)
                .and_then(|rva| index.function_start(rva.as_u64()))
        };
        start(a).is_some() && start(a) == start(b)
    }

    fn section_rva(&self, module: &ModuleInstance, tag: &str) -> Option<GlobalAddress> {
        self.image(module)?.section(tag)
    }

    fn export_rva(&self, module: &ModuleInstance, name: &str) -> Option<GlobalAddress> {
        self.image(module)?.export(name)
    }
}

impl Evaluator for LinuxProcess {
    fn evaluate_u64(
        &self,
        _thread: ThreadId,
        _frame: &FrameContext,
        expr: &str,
    ) -> Result<u64, Error> {
        let expr = expr.trim();
        let unsupported = |reason: &str| Error::Evaluation {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };

        if let Some(name) = expr.strip_prefix("&::") {
            return self
                .static_address(name)
                .map(RelocatedAddress::as_u64)
                .ok_or_else(|| Error::SymbolNotFound(name.to_string()));
        }
        if let Some(hex) = expr.strip_prefix("0x").or_else(|| expr.strip_prefix("0X")) {
            return u64::from_str_radix(hex, 16).map_err(|_| unsupported("bad literal"));
        }
        Err(unsupported("only static addresses and literals are supported"))
    }

    fn read_register(&self, _thread: ThreadId, register: Register) -> Result<u64, Error> {
        Err(Error::RegisterNotAvailable(register.to_string()))
    }

    fn top_frame(&self, thread: ThreadId) -> Option<FrameContext> {
        Path::new(&format!("/proc/{}/task/{thread}", self.pid))
            .exists()
            .then(FrameContext::default)
    }
}

impl ThreadStates for LinuxProcess {}

/// `/proc/<pid>/mem` opened with the requested rights only.
struct ProcMem {
    file: fs::File,
    pointer_size: PointerSize,
}

impl RemoteMemory for ProcMem {
    fn pointer_size(&self) -> PointerSize {
        self.pointer_size
    }

    fn read_memory(&self, addr: RelocatedAddress, buf: &mut [u8]) -> Result<(), Error> {
        let len = buf.len();
        self.file
            .read_exact_at(buf, addr.as_u64())
            .map_err(|_| Error::ReadMemory { addr, len })
    }

    fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
        self.file
            .write_all_at(data, addr.as_u64())
            .map_err(|_| Error::WriteMemory {
                addr,
                len: data.len(),
            })
    }
}

impl ProcessOpener for LinuxProcess {
    fn process_id(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    fn open_process(&self, rights: AccessRights) -> Result<Box<dyn RemoteMemory + '_>, Error> {
        let pid = self.process_id();
        let file = fs::OpenOptions::new()
            .read(rights.contains(AccessRights::VM_READ))
            .write(rights.contains(AccessRights::VM_WRITE))
            .open(format!("/proc/{pid}/mem"))
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => Error::AccessDenied(pid),
                std::io::ErrorKind::NotFound => Error::ProcessNotFound(pid),
                _ => Error::IO(e),
            })?;
        pb_debug!("process {pid} opened with rights {rights}");
        Ok(Box::new(ProcMem {
            file,
            pointer_size: self.pointer_size,
        }))
    }
}
