//! Bridge between a native debugger host and the interpreted runtime living in a debugee.

pub mod address;
pub mod attach;
pub mod error;
pub mod frame;
pub mod host;
pub mod memory;
pub mod message;
pub mod offsets;
pub mod pe;
pub mod register;
pub mod resolver;
pub mod runtime;
pub mod step;
mod utils;

use crate::bridge::address::RelocatedAddress;
use crate::bridge::attach::{AttachOutcome, OffsetsLookup, RemoteAttachProtocol};
use crate::bridge::error::Error;
use crate::bridge::frame::StackFrameStitcher;
use crate::bridge::host::{
    AttachHost, BreakpointId, ModuleInstance, ResolverHost, StepHost, ThreadId,
};
use crate::bridge::memory::SuspendGuard;
use crate::bridge::offsets::{DebugOffsets, LEGACY_STRUCT_SIZE};
use crate::bridge::resolver::AddressResolver;
use crate::bridge::runtime::{KnownModule, RuntimeModules};
use crate::bridge::step::StepGateController;
use crate::bridge::utils::TryGetOrInsert;
use crate::config::{BridgeConfig, OptionsUpdate};
use crate::{pb_debug, pb_info, pb_warn};
use std::path::Path;

/// Everything a process context needs from the host.
pub trait BridgeHost: ResolverHost + AttachHost + StepHost {}

impl<T: ResolverHost + AttachHost + StepHost + ?Sized> BridgeHost for T {}

/// Bridge state of one debugee process.
///
/// The host serializes every call into a context, so the state needs no locking.
pub struct ProcessContext {
    config: BridgeConfig,
    offsets: Option<DebugOffsets>,
    resolver: AddressResolver,
    attach: RemoteAttachProtocol,
    stitcher: StackFrameStitcher,
    step: StepGateController,
    gates_registered: bool,
}

impl ProcessContext {
    pub fn new(config: BridgeConfig, runtime: ModuleInstance) -> Self {
        let resolver = AddressResolver::with_default_chain(&config.resolver);
        Self::with_resolver(config, runtime, resolver)
    }

    pub fn with_resolver(
        config: BridgeConfig,
        runtime: ModuleInstance,
        resolver: AddressResolver,
    ) -> Self {
        pb_info!("runtime module {} at {}", runtime.name, runtime.base);
        Self {
            offsets: None,
            resolver,
            attach: RemoteAttachProtocol::new(config.attach.clone(), config.simulate_partial_write),
            stitcher: StackFrameStitcher::new(RuntimeModules::new(runtime), config.options),
            step: StepGateController::new(config.step.calling_convention, config.options),
            gates_registered: false,
            config,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn modules(&self) -> &RuntimeModules {
        self.stitcher.modules()
    }

    pub fn offsets(&self) -> Option<&DebugOffsets> {
        self.offsets.as_ref()
    }

    pub fn stitcher(&self) -> &StackFrameStitcher {
        &self.stitcher
    }

    pub fn step_controller(&self) -> &StepGateController {
        &self.step
    }

    pub fn attach_protocol(&self) -> &RemoteAttachProtocol {
        &self.attach
    }

    /// Register the step-in gates of the runtime, only the first call does anything.
    pub fn on_runtime_loaded<H: StepHost>(&mut self, host: &H) -> usize {
        if self.gates_registered {
            return 0;
        }
        self.gates_registered = true;
        self.step.register_runtime_gates(host, self.stitcher.modules())
    }

    /// Track a module loaded after the runtime, return its role if the bridge knows it.
    pub fn on_module_load<H: StepHost>(
        &mut self,
        host: &H,
        module: ModuleInstance,
    ) -> Option<KnownModule> {
        let role = KnownModule::from_module_name(&module.name)?;
        pb_debug!("{} module {} loaded at {}", role.name(), module.name, module.base);
        match role {
            KnownModule::Runtime => return None,
            KnownModule::Helper => self.stitcher.modules_mut().helper = Some(module),
            KnownModule::Ffi => {
                self.stitcher.modules_mut().ffi = Some(module);
                self.step.on_ffi_loaded(host, self.stitcher.modules());
            }
        }
        Some(role)
    }

    /// Track a runtime satellite module that may execute interpreted frames.
    pub fn add_adjacent_module(&mut self, module: ModuleInstance) {
        self.stitcher.modules_mut().adjacent.push(module);
    }

    /// Parsed debug offsets of the runtime, resolved and read on first success.
    pub fn ensure_offsets<H: ResolverHost>(&mut self, host: &H) -> Result<&DebugOffsets, Error> {
        let resolver = &self.resolver;
        let runtime = &self.stitcher.modules().runtime;
        let symbol = &self.config.resolver.symbol;
        self.offsets
            .try_get_or_insert_with(|| read_offsets(host, resolver, runtime, symbol))
    }

    /// Ask the runtime to run a loader script at its next safe point.
    pub fn attach<H: ResolverHost + AttachHost>(
        &mut self,
        host: &H,
        loader_path: &Path,
    ) -> AttachOutcome {
        let offsets = self.ensure_offsets(host).cloned();
        let lookup = match &offsets {
            Ok(offsets) => OffsetsLookup::Parsed(offsets),
            Err(e @ Error::OffsetsUnresolved(_)) => {
                pb_warn!("{e:#}");
                OffsetsLookup::Unresolved
            }
            Err(e) => {
                pb_warn!("debug offsets: {e:#}");
                OffsetsLookup::Invalid
            }
        };
        self.attach.attach(host, lookup, loader_path)
    }

    /// Apply an options update to the stitcher and the step controller.
    pub fn apply_options_update(&mut self, update: OptionsUpdate) -> bool {
        let changed = self.stitcher.apply_update(update);
        self.step.apply_update(update);
        changed
    }

    pub fn begin_step_in<H: StepHost>(&mut self, host: &H, thread: ThreadId) {
        self.step
            .on_begin_step_in(host, self.stitcher.modules(), thread);
    }

    pub fn begin_step_out<H: StepHost>(&mut self, host: &H, thread: ThreadId) {
        self.step
            .on_begin_step_out(host, self.stitcher.modules(), thread);
    }

    /// Handle a breakpoint hit, return true if the breakpoint is a gate.
    pub fn on_breakpoint_hit<H: StepHost>(
        &mut self,
        host: &H,
        thread: ThreadId,
        breakpoint: BreakpointId,
    ) -> bool {
        self.step
            .on_gate_hit(host, self.stitcher.modules(), thread, breakpoint)
    }

    pub fn step_complete<H: StepHost>(&mut self, host: &H) {
        self.step.on_step_complete(host);
    }
}

fn read_offsets<H: ResolverHost>(
    host: &H,
    resolver: &AddressResolver,
    runtime: &ModuleInstance,
    symbol: &str,
) -> Result<DebugOffsets, Error> {
    let addr = resolver
        .resolve(host, runtime)
        .ok_or_else(|| Error::OffsetsUnresolved(symbol.to_string()))?;

    let data = {
        let _guard = SuspendGuard::new(host);
        read_header(host, addr)?
    };
    Ok(offsets::parse_any(&data, host.pointer_size(), addr)?)
}

/// Read enough bytes for any header layout, or the current layout only if the header sits at
/// the end of a mapping.
fn read_header<H: ResolverHost>(host: &H, addr: RelocatedAddress) -> Result<Vec<u8>, Error> {
    let mut data = vec![0; LEGACY_STRUCT_SIZE];
    if host.read_memory(addr, &mut data).is_ok() {
        return Ok(data);
    }
    let mut data = vec![0; offsets::header_size(host.pointer_size())];
    host.read_memory(addr, &mut data)?;
    Ok(data)
}
