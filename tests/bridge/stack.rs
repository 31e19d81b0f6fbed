use crate::common::{Debugee, Header, RUNTIME_BASE};
use pybridge::bridge::address::RelocatedAddress;
use pybridge::bridge::frame::{
    FrameReader, InterpretedFrame, LogicalFrame, RawFrame, SourceLocation, TransitionKind,
};
use pybridge::bridge::message::{dispatch, Message, Reply};
use pybridge::bridge::runtime::KnownModule;
use pybridge::bridge::ProcessContext;
use pybridge::config::{BridgeConfig, OptionsUpdate};
use std::collections::HashMap;

const FOREIGN: u64 = 0x40_1000;
const EVAL_1: u64 = RUNTIME_BASE + 0x2_0010;
const EVAL_2: u64 = RUNTIME_BASE + 0x2_0020;
const BARE_RUNTIME: u64 = RUNTIME_BASE + 0x3_0000;

struct Reader(HashMap<u64, InterpretedFrame>);

impl FrameReader for Reader {
    fn interpreted_frame(&self, frame: &RawFrame) -> Option<InterpretedFrame> {
        self.0.get(&frame.instruction.as_u64()).cloned()
    }
}

fn reader() -> Reader {
    Reader(HashMap::from([
        (
            EVAL_1,
            InterpretedFrame {
                file: "app.py".to_string(),
                line: 12,
                function: Some("handler".to_string()),
            },
        ),
        (
            EVAL_2,
            InterpretedFrame {
                file: "app.py".to_string(),
                line: 30,
                function: None,
            },
        ),
    ]))
}

fn raw(addrs: &[u64]) -> Vec<RawFrame> {
    addrs
        .iter()
        .map(|&addr| RawFrame {
            instruction: RelocatedAddress::from(addr),
            ..RawFrame::default()
        })
        .collect()
}

fn names(ctx: &ProcessContext, frames: &[LogicalFrame]) -> Vec<String> {
    frames
        .iter()
        .map(|frame| {
            ctx.stitcher()
                .frame_name(frame)
                .unwrap_or_else(|| "native".to_string())
        })
        .collect()
}

#[test]
fn test_mixed_stack() {
    let ctx = ProcessContext::new(BridgeConfig::default(), Debugee::runtime());
    let frames = ctx.stitcher().stitch(
        &reader(),
        raw(&[FOREIGN, FOREIGN + 8, EVAL_1, BARE_RUNTIME, EVAL_2, FOREIGN + 16]),
    );

    assert_eq!(
        names(&ctx, &frames),
        vec![
            "native",
            "native",
            "[Python to Native Transition]",
            "handler (app.py:12)",
            "app.py:30",
            "[Native to Python Transition]",
            "native",
        ]
    );
    assert_eq!(
        frames[2],
        LogicalFrame::Transition(TransitionKind::PythonToNative)
    );

    let LogicalFrame::Interpreted { token } = &frames[3] else {
        panic!("interpreted frame expected");
    };
    let location = SourceLocation::decode(token).unwrap();
    let native = location.native_address.unwrap();
    assert_eq!(native.module, KnownModule::Runtime);
    assert_eq!(
        ctx.modules().relocate(&native),
        Some(RelocatedAddress::from(EVAL_1))
    );
}

#[test]
fn test_show_native_frames_option() {
    let debugee = Debugee::new(Header::default());
    let mut ctx = ProcessContext::new(BridgeConfig::default(), Debugee::runtime());
    let stack = [EVAL_1, BARE_RUNTIME, EVAL_2];

    let frames = ctx.stitcher().stitch(&reader(), raw(&stack));
    assert_eq!(frames.len(), 2);

    let update = OptionsUpdate {
        show_native_frames: Some(true),
        ..OptionsUpdate::default()
    };
    let message = Message::SetDebuggerOptions { update };
    assert_eq!(
        dispatch(&mut ctx, &debugee, message.clone()),
        Reply::OptionsChanged { changed: true }
    );
    assert_eq!(
        dispatch(&mut ctx, &debugee, message),
        Reply::OptionsChanged { changed: false }
    );

    let frames = ctx.stitcher().stitch(&reader(), raw(&stack));
    assert_eq!(
        names(&ctx, &frames),
        vec![
            "handler (app.py:12)",
            "[Native to Python Transition]",
            "native",
            "[Python to Native Transition]",
            "app.py:30",
        ]
    );
}

#[test]
fn test_frame_name_request() {
    let debugee = Debugee::new(Header::default());
    let mut ctx = ProcessContext::new(BridgeConfig::default(), Debugee::runtime());
    let frames = ctx.stitcher().stitch(&reader(), raw(&[EVAL_1]));
    let LogicalFrame::Interpreted { token } = &frames[0] else {
        panic!("interpreted frame expected");
    };

    // request goes through the wire format
    let request = Message::GetFrameName {
        token: token.to_vec(),
    };
    let request = Message::decode(&request.encode().unwrap()).unwrap();
    assert_eq!(
        dispatch(&mut ctx, &debugee, request),
        Reply::FrameName {
            name: Some("handler (app.py:12)".to_string())
        }
    );

    let garbage = Message::GetFrameName {
        token: vec![0xFF, 0xFF, 1],
    };
    assert_eq!(
        dispatch(&mut ctx, &debugee, garbage),
        Reply::FrameName { name: None }
    );
}
