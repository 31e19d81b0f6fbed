//! Messages exchanged between the debugger front end and the per-process bridge.
//!
//! The set of messages is closed and registered in [`REGISTRY`], every message travels as a JSON
//! object whose `kind` field is the registry tag.

use crate::bridge::attach::AttachOutcome;
use crate::bridge::error::Error;
use crate::bridge::frame::frame_name;
use crate::bridge::host::ThreadId;
use crate::bridge::{BridgeHost, ProcessContext};
use crate::config::OptionsUpdate;
use crate::{muted_error, verbose};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum_macros::{Display, EnumString};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum MessageKind {
    BeginStepIn,
    BeginStepOut,
    StepComplete,
    SetDebuggerOptions,
    Attach,
    GetFrameName,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Sent by the front end, handled by the bridge.
    ToBridge,
    /// Sent by the front end, answered by the bridge with a reply.
    Request,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageDescriptor {
    pub kind: MessageKind,
    pub tag: &'static str,
    pub direction: Direction,
}

const fn descriptor(kind: MessageKind, tag: &'static str, direction: Direction) -> MessageDescriptor {
    MessageDescriptor {
        kind,
        tag,
        direction,
    }
}

/// Every known message.
pub static REGISTRY: &[MessageDescriptor] = &[
    descriptor(MessageKind::BeginStepIn, "begin_step_in", Direction::ToBridge),
    descriptor(MessageKind::BeginStepOut, "begin_step_out", Direction::ToBridge),
    descriptor(MessageKind::StepComplete, "step_complete", Direction::ToBridge),
    descriptor(
        MessageKind::SetDebuggerOptions,
        "set_debugger_options",
        Direction::ToBridge,
    ),
    descriptor(MessageKind::Attach, "attach", Direction::Request),
    descriptor(MessageKind::GetFrameName, "get_frame_name", Direction::Request),
];

/// Registry entry of a tag, `None` for unknown tags.
pub fn lookup(tag: &str) -> Option<&'static MessageDescriptor> {
    REGISTRY.iter().find(|d| d.tag == tag)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    BeginStepIn { thread: ThreadId },
    BeginStepOut { thread: ThreadId },
    StepComplete,
    SetDebuggerOptions { update: OptionsUpdate },
    Attach { loader_path: PathBuf },
    GetFrameName { token: Vec<u8> },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::BeginStepIn { .. } => MessageKind::BeginStepIn,
            Message::BeginStepOut { .. } => MessageKind::BeginStepOut,
            Message::StepComplete => MessageKind::StepComplete,
            Message::SetDebuggerOptions { .. } => MessageKind::SetDebuggerOptions,
            Message::Attach { .. } => MessageKind::Attach,
            Message::GetFrameName { .. } => MessageKind::GetFrameName,
        }
    }

    pub fn descriptor(&self) -> &'static MessageDescriptor {
        // registry is written in kind declaration order
        &REGISTRY[self.kind() as usize]
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a message, unregistered tags are rejected before the payload is looked at.
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let value: serde_json::Value = serde_json::from_slice(data)?;
        let tag = value
            .get("kind")
            .and_then(|kind| kind.as_str())
            .ok_or_else(|| Error::UnknownMessage(String::new()))?;
        if lookup(tag).is_none() {
            return Err(Error::UnknownMessage(tag.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Answer to a [`Direction::Request`] message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    Done,
    OptionsChanged { changed: bool },
    Attach { outcome: AttachOutcome },
    FrameName { name: Option<String> },
}

/// Route a message into a process context.
pub fn dispatch<H: BridgeHost>(ctx: &mut ProcessContext, host: &H, message: Message) -> Reply {
    verbose!("dispatch {}", message.kind());
    match message {
        Message::BeginStepIn { thread } => {
            ctx.begin_step_in(host, thread);
            Reply::Done
        }
        Message::BeginStepOut { thread } => {
            ctx.begin_step_out(host, thread);
            Reply::Done
        }
        Message::StepComplete => {
            ctx.step_complete(host);
            Reply::Done
        }
        Message::SetDebuggerOptions { update } => Reply::OptionsChanged {
            changed: ctx.apply_options_update(update),
        },
        Message::Attach { loader_path } => Reply::Attach {
            outcome: ctx.attach(host, &loader_path),
        },
        Message::GetFrameName { token } => Reply::FrameName {
            name: muted_error!(frame_name(&token)),
        },
    }
}
