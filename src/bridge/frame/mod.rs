//! Native and interpreted call stack stitching.
//!
//! The host walks the native stack and hands every raw frame to [`StackFrameStitcher::filter_frame`].
//! Runtime frames hosting an interpreted frame are replaced with an interpreted logical frame
//! addressed by a [`SourceLocation`] token, and a transition frame is inserted at every
//! boundary between native and interpreted code.

mod location;

pub use location::SourceLocation;

use crate::bridge::address::RelocatedAddress;
use crate::bridge::error::Error;
use crate::bridge::runtime::{KnownModule, ModuleKind, RuntimeModules};
use crate::config::{DebuggerOptions, OptionsUpdate};
use crate::{muted_error, weak_error};
use bytes::Bytes;
use smallvec::{smallvec, SmallVec};
use std::fmt::{Display, Formatter};

/// Frame produced by the host native stack walk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawFrame {
    pub instruction: RelocatedAddress,
    pub frame_base: u64,
    pub vframe: u64,
}

/// Interpreted frame state read from the runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterpretedFrame {
    pub file: String,
    pub line: u32,
    pub function: Option<String>,
}

/// Reads interpreted frame structures of the debugee.
pub trait FrameReader {
    /// Interpreted frame executed by the runtime frame `frame`, `None` if there is none.
    fn interpreted_frame(&self, frame: &RawFrame) -> Option<InterpretedFrame>;

    /// Interpreted frame published by the in-process helper module, the fast path.
    fn helper_frame(&self, _frame: &RawFrame) -> Option<InterpretedFrame> {
        None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionKind {
    /// Native code called into interpreted code.
    NativeToPython,
    /// Interpreted code called into native code.
    PythonToNative,
}

impl Display for TransitionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionKind::NativeToPython => f.write_str("[Native to Python Transition]"),
            TransitionKind::PythonToNative => f.write_str("[Python to Native Transition]"),
        }
    }
}

/// Frame of the unified call stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogicalFrame {
    Native { instruction: RelocatedAddress },
    Interpreted { token: Bytes },
    Transition(TransitionKind),
}

impl LogicalFrame {
    pub fn is_transition(&self) -> bool {
        matches!(self, LogicalFrame::Transition(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Native,
    Interpreted,
}

/// Per stack walk state.
#[derive(Debug, Default)]
pub struct WalkContext {
    previous: Option<FrameKind>,
}

impl WalkContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn previous(&self) -> Option<FrameKind> {
        self.previous
    }
}

/// Display name of an interpreted frame token.
pub fn frame_name(token: &[u8]) -> Result<String, Error> {
    Ok(SourceLocation::decode(token)?.to_string())
}

pub struct StackFrameStitcher {
    modules: RuntimeModules,
    options: DebuggerOptions,
}

impl StackFrameStitcher {
    pub fn new(modules: RuntimeModules, options: DebuggerOptions) -> Self {
        Self { modules, options }
    }

    pub fn modules(&self) -> &RuntimeModules {
        &self.modules
    }

    pub fn modules_mut(&mut self) -> &mut RuntimeModules {
        &mut self.modules
    }

    pub fn options(&self) -> DebuggerOptions {
        self.options
    }

    /// Apply an options update, return true if something changed.
    pub fn apply_update(&mut self, update: OptionsUpdate) -> bool {
        self.options.apply_update(update)
    }

    /// Turn one raw frame into zero, one or two logical frames.
    pub fn filter_frame(
        &self,
        ctx: &mut WalkContext,
        reader: &dyn FrameReader,
        frame: &RawFrame,
    ) -> SmallVec<[LogicalFrame; 2]> {
        let kind = self.modules.classify(frame.instruction);

        let interpreted = match kind {
            ModuleKind::Known(KnownModule::Helper) => reader.helper_frame(frame),
            _ => None,
        };
        let interpreted = match interpreted {
            Some(interpreted) => interpreted,
            None => match kind {
                ModuleKind::Known(KnownModule::Runtime) | ModuleKind::Adjacent => {
                    match reader.interpreted_frame(frame) {
                        Some(interpreted) => interpreted,
                        None if self.options.show_native_frames => {
                            return Self::native(ctx, frame);
                        }
                        None => return smallvec![],
                    }
                }
                _ => return Self::native(ctx, frame),
            },
        };

        let location = SourceLocation {
            file: interpreted.file,
            line: interpreted.line,
            function: interpreted.function,
            native_address: self.modules.native_address(frame.instruction),
        };
        let Some(token) = weak_error!(location.encode(), "frame token:") else {
            return Self::native(ctx, frame);
        };

        let mut frames = SmallVec::new();
        if ctx.previous == Some(FrameKind::Native) {
            frames.push(LogicalFrame::Transition(TransitionKind::PythonToNative));
        }
        frames.push(LogicalFrame::Interpreted { token });
        ctx.previous = Some(FrameKind::Interpreted);
        frames
    }

    fn native(ctx: &mut WalkContext, frame: &RawFrame) -> SmallVec<[LogicalFrame; 2]> {
        let mut frames = SmallVec::new();
        if ctx.previous == Some(FrameKind::Interpreted) {
            frames.push(LogicalFrame::Transition(TransitionKind::NativeToPython));
        }
        frames.push(LogicalFrame::Native {
            instruction: frame.instruction,
        });
        ctx.previous = Some(FrameKind::Native);
        frames
    }

    /// Stitch a whole native stack, top frame first.
    pub fn stitch(
        &self,
        reader: &dyn FrameReader,
        frames: impl IntoIterator<Item = RawFrame>,
    ) -> Vec<LogicalFrame> {
        let mut ctx = WalkContext::new();
        frames
            .into_iter()
            .flat_map(|frame| self.filter_frame(&mut ctx, reader, &frame))
            .collect()
    }

    /// Display name of a logical frame, `None` for native frames named by the host.
    pub fn frame_name(&self, frame: &LogicalFrame) -> Option<String> {
        match frame {
            LogicalFrame::Native { .. } => None,
            LogicalFrame::Interpreted { token } => muted_error!(frame_name(token)),
            LogicalFrame::Transition(kind) => Some(kind.to_string()),
        }
    }
}
