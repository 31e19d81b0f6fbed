use crate::bridge::address::{GlobalAddress, RelocatedAddress};
use crate::bridge::host::ModuleInstance;
use crate::version::Version;
use serde::{Deserialize, Serialize};

/// Module the bridge knows about, used to tag native back-references.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KnownModule {
    Runtime,
    Helper,
    Ffi,
}

impl KnownModule {
    pub fn name(self) -> &'static str {
        match self {
            KnownModule::Runtime => "runtime",
            KnownModule::Helper => "debugger helper",
            KnownModule::Ffi => "ffi",
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            KnownModule::Runtime => 1,
            KnownModule::Helper => 2,
            KnownModule::Ffi => 3,
        }
    }

    /// Role of a freshly loaded module judging by its file name. The runtime itself is found by
    /// the host, so it is never reported here.
    pub fn from_module_name(name: &str) -> Option<Self> {
        let file = name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(name)
            .to_ascii_lowercase();
        if file.starts_with("_ctypes") {
            Some(KnownModule::Ffi)
        } else if file.contains("debugger.helper") || file.starts_with("pybridge_helper") {
            Some(KnownModule::Helper)
        } else {
            None
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(KnownModule::Runtime),
            2 => Some(KnownModule::Helper),
            3 => Some(KnownModule::Ffi),
            _ => None,
        }
    }
}

/// Where a native address lives from the bridge point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleKind {
    Known(KnownModule),
    /// Runtime satellite module that may host interpreted frames (extension loader, etc.).
    Adjacent,
    Foreign,
}

/// Module relative native address tagged with its module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeAddress {
    pub module: KnownModule,
    pub offset: GlobalAddress,
}

/// Runtime related modules loaded into one debugee.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeModules {
    pub runtime: ModuleInstance,
    pub helper: Option<ModuleInstance>,
    pub ffi: Option<ModuleInstance>,
    pub adjacent: Vec<ModuleInstance>,
}

impl RuntimeModules {
    pub fn new(runtime: ModuleInstance) -> Self {
        Self {
            runtime,
            helper: None,
            ffi: None,
            adjacent: vec![],
        }
    }

    /// Runtime version guessed from the runtime module name.
    pub fn version(&self) -> Option<Version> {
        Version::from_module_name(&self.runtime.name)
    }

    pub fn module(&self, known: KnownModule) -> Option<&ModuleInstance> {
        match known {
            KnownModule::Runtime => Some(&self.runtime),
            KnownModule::Helper => self.helper.as_ref(),
            KnownModule::Ffi => self.ffi.as_ref(),
        }
    }

    pub fn classify(&self, addr: RelocatedAddress) -> ModuleKind {
        for known in [KnownModule::Runtime, KnownModule::Helper, KnownModule::Ffi] {
            if self.module(known).is_some_and(|m| m.contains(addr)) {
                return ModuleKind::Known(known);
            }
        }
        if self.adjacent.iter().any(|m| m.contains(addr)) {
            return ModuleKind::Adjacent;
        }
        ModuleKind::Foreign
    }

    /// Return true if address belongs to the runtime, helper or FFI module.
    pub fn is_known(&self, addr: RelocatedAddress) -> bool {
        matches!(self.classify(addr), ModuleKind::Known(_))
    }

    pub fn native_address(&self, addr: RelocatedAddress) -> Option<NativeAddress> {
        let ModuleKind::Known(module) = self.classify(addr) else {
            return None;
        };
        let offset = addr.into_global(self.module(module)?.base)?;
        Some(NativeAddress { module, offset })
    }

    /// Absolute address of a back-reference, `None` if its module is gone.
    pub fn relocate(&self, native: &NativeAddress) -> Option<RelocatedAddress> {
        native.offset.relocate(self.module(native.module)?.base)
    }
}
