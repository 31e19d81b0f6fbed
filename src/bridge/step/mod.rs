//! Step-in and step-out across the native/interpreted boundary.
//!
//! Step-in arms breakpoints ("gates") at runtime functions that may call out into foreign
//! native code. When a gate is hit, the function pointers it is about to call are read and a
//! breakpoint is placed at each of them. Step-out places one breakpoint at the return site of
//! the frame the step will end in. Every breakpoint created for a step is closed when the step
//! completes, gates are only disabled.

pub mod gate;

use crate::bridge::address::RelocatedAddress;
use crate::bridge::error::Error;
use crate::bridge::frame::{LogicalFrame, SourceLocation};
use crate::bridge::host::{BreakpointId, FrameContext, StepHost, ThreadId};
use crate::bridge::register::CallingConvention;
use crate::bridge::runtime::{KnownModule, RuntimeModules};
use crate::config::{DebuggerOptions, OptionsUpdate};
use crate::{muted_error, pb_debug, verbose, weak_error};
use gate::{runtime_gates, GateSpec, FFI_GATE};

/// Registered gate, lives as long as the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepGate {
    pub spec: &'static GateSpec,
    pub address: RelocatedAddress,
    pub breakpoint: BreakpointId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    StepIn,
    StepOut,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StepState {
    #[default]
    Idle,
    Armed(StepKind),
}

pub struct StepGateController {
    gates: Vec<StepGate>,
    state: StepState,
    step_in_targets: Vec<BreakpointId>,
    step_out_targets: Vec<BreakpointId>,
    calling_convention: CallingConvention,
    options: DebuggerOptions,
}

impl StepGateController {
    pub fn new(calling_convention: CallingConvention, options: DebuggerOptions) -> Self {
        Self {
            gates: vec![],
            state: StepState::Idle,
            step_in_targets: vec![],
            step_out_targets: vec![],
            calling_convention,
            options,
        }
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    pub fn gates(&self) -> &[StepGate] {
        &self.gates
    }

    /// Breakpoints created by the current step.
    pub fn targets(&self) -> impl Iterator<Item = BreakpointId> + '_ {
        self.step_in_targets
            .iter()
            .chain(self.step_out_targets.iter())
            .copied()
    }

    pub fn apply_update(&mut self, update: OptionsUpdate) -> bool {
        self.options.apply_update(update)
    }

    fn add_gate(
        &mut self,
        host: &dyn StepHost,
        modules: &RuntimeModules,
        spec: &'static GateSpec,
    ) -> Result<(), Error> {
        let module = modules
            .module(spec.module)
            .ok_or(Error::ModuleNotFound(spec.module.name()))?;
        let address = host
            .function_address(module, spec.function)
            .ok_or_else(|| Error::SymbolNotFound(spec.function.to_string()))?;
        let breakpoint = host.create_breakpoint(address)?;
        self.gates.push(StepGate {
            spec,
            address,
            breakpoint,
        });
        Ok(())
    }

    /// Create disabled gates for every runtime gate function of the runtime version.
    /// Return the number of registered gates.
    pub fn register_runtime_gates(&mut self, host: &dyn StepHost, modules: &RuntimeModules) -> usize {
        let before = self.gates.len();
        for spec in runtime_gates(modules.version()) {
            muted_error!(self.add_gate(host, modules, spec), "step gate:");
        }
        let count = self.gates.len() - before;
        pb_debug!("{count} step-in gates registered");
        count
    }

    /// Register the gate of a foreign function interface module loaded after the runtime.
    pub fn on_ffi_loaded(&mut self, host: &dyn StepHost, modules: &RuntimeModules) -> bool {
        if self.gates.iter().any(|g| g.spec.module == KnownModule::Ffi) {
            return false;
        }
        weak_error!(self.add_gate(host, modules, &FFI_GATE), "ffi step gate:").is_some()
    }

    pub fn on_begin_step_in(
        &mut self,
        host: &dyn StepHost,
        modules: &RuntimeModules,
        thread: ThreadId,
    ) {
        if !self.options.use_interpreted_stepping {
            return;
        }
        self.state = StepState::Armed(StepKind::StepIn);
        let top = host.top_frame(thread);

        for i in 0..self.gates.len() {
            let gate = self.gates[i];
            weak_error!(host.enable_breakpoint(gate.breakpoint), "enable gate:");

            // stopped inside a gate after a step-out, its exit breakpoints are gone
            if let Some(top) = top {
                if gate.spec.multiple_exits && host.is_same_function(gate.address, top.instruction) {
                    verbose!("already inside gate {}", gate.spec.function);
                    self.run_gate(host, modules, thread, gate.spec, &top, false);
                }
            }
        }
    }

    /// Handle a hit breakpoint, return true if it is a gate of this controller.
    pub fn on_gate_hit(
        &mut self,
        host: &dyn StepHost,
        modules: &RuntimeModules,
        thread: ThreadId,
        breakpoint: BreakpointId,
    ) -> bool {
        let Some(gate) = self.gates.iter().find(|g| g.breakpoint == breakpoint).copied() else {
            return false;
        };
        if self.state != StepState::Armed(StepKind::StepIn) {
            return true;
        }
        let frame = host.top_frame(thread).unwrap_or(FrameContext {
            instruction: gate.address,
            ..FrameContext::default()
        });
        let use_registers = self.calling_convention.passes_arguments_in_registers();
        self.run_gate(host, modules, thread, gate.spec, &frame, use_registers);
        true
    }

    fn run_gate(
        &mut self,
        host: &dyn StepHost,
        modules: &RuntimeModules,
        thread: ThreadId,
        spec: &GateSpec,
        frame: &FrameContext,
        use_registers: bool,
    ) {
        for probe in spec.probes {
            let arg = if use_registers {
                let Some(register) = self.calling_convention.argument_register(probe.index) else {
                    continue;
                };
                let Some(value) = muted_error!(host.read_register(thread, register)) else {
                    continue;
                };
                format!("{value:#X}")
            } else {
                probe.arg.to_string()
            };

            let expr = probe.render(&arg);
            if let Some(target) = muted_error!(host.evaluate_u64(thread, frame, &expr)) {
                self.on_potential_runtime_exit(host, modules, RelocatedAddress::from(target));
            }
        }
    }

    /// Place a step-in target breakpoint at a function pointer outside of known modules.
    fn on_potential_runtime_exit(
        &mut self,
        host: &dyn StepHost,
        modules: &RuntimeModules,
        target: RelocatedAddress,
    ) {
        if target.is_null() || modules.is_known(target) {
            return;
        }
        if let Some(bp) = weak_error!(Self::place(host, target), "step-in target:") {
            verbose!("step-in target at {target}");
            self.step_in_targets.push(bp);
        }
    }

    fn place(host: &dyn StepHost, addr: RelocatedAddress) -> Result<BreakpointId, Error> {
        let bp = host.create_breakpoint(addr)?;
        if let Err(e) = host.enable_breakpoint(bp) {
            weak_error!(host.close_breakpoint(bp));
            return Err(e);
        }
        Ok(bp)
    }

    /// Place a breakpoint where the step-out ends: the first native frame outside of known
    /// modules or the second interpreted frame, whichever comes first.
    pub fn on_begin_step_out(
        &mut self,
        host: &dyn StepHost,
        modules: &RuntimeModules,
        thread: ThreadId,
    ) {
        if !self.options.use_interpreted_stepping {
            return;
        }
        self.state = StepState::Armed(StepKind::StepOut);

        let Some(target) = Self::step_out_target(host, modules, thread) else {
            pb_debug!("no step-out destination on thread {thread}");
            return;
        };
        if let Some(bp) = weak_error!(Self::place(host, target), "step-out target:") {
            verbose!("step-out target at {target}");
            self.step_out_targets.push(bp);
        }
    }

    fn step_out_target(
        host: &dyn StepHost,
        modules: &RuntimeModules,
        thread: ThreadId,
    ) -> Option<RelocatedAddress> {
        let mut interpreted = 0;
        for frame in host.logical_frames(thread) {
            match frame {
                LogicalFrame::Native { instruction } if !modules.is_known(instruction) => {
                    return Some(instruction);
                }
                LogicalFrame::Interpreted { token } => {
                    interpreted += 1;
                    if interpreted == 2 {
                        let location = muted_error!(SourceLocation::decode(&token))?;
                        return modules.relocate(&location.native_address?);
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Disable every gate, close every breakpoint created by the step.
    pub fn on_step_complete(&mut self, host: &dyn StepHost) {
        for gate in &self.gates {
            weak_error!(host.disable_breakpoint(gate.breakpoint), "disable gate:");
        }
        for bp in self
            .step_in_targets
            .drain(..)
            .chain(self.step_out_targets.drain(..))
        {
            weak_error!(host.close_breakpoint(bp), "close step target:");
        }
        self.state = StepState::Idle;
    }
}
