use crate::common::{
    loader_script, Debugee, Header, EVAL_BREAKER, FLAG_REMOTE_DEBUG_DISABLED, MAIN_THREAD,
    PENDING_CALL_OFFSET, REMOTE_SUPPORT_OFFSET, SCRIPT_PATH_OFFSET, SUPPORT, THREAD_STATE,
};
use pybridge::bridge::attach::{AttachResult, FailSite, MaskSource, SelectionStrategy};
use pybridge::bridge::ProcessContext;
use pybridge::config::{BridgeConfig, ENV_SIMULATE_PARTIAL_WRITE};
use serial_test::serial;
use std::path::Path;

fn context() -> ProcessContext {
    ProcessContext::new(BridgeConfig::default(), Debugee::runtime())
}

#[test]
fn test_attach_is_idempotent() {
    let debugee = Debugee::new(Header::default());
    let loader = loader_script("idempotent");
    let mut ctx = context();

    let outcome = ctx.attach(&debugee, &loader);
    assert!(outcome.is_success(), "{outcome}");
    assert_eq!(outcome.fail_site, FailSite::None);
    assert_eq!(outcome.selection, Some(SelectionStrategy::MainInterpreter));
    assert_eq!(outcome.thread_id, Some(MAIN_THREAD));
    assert_eq!(outcome.thread_state.as_u64(), THREAD_STATE);
    assert!(!outcome.already_set);
    assert!(!outcome.truncated_path);
    assert!(outcome.verified_script_path);
    assert!(outcome.verified_pending_call);
    assert!(outcome.breaker_bit_set);
    assert_eq!(outcome.stop_mask.map(|m| m.source), Some(MaskSource::Default));
    // script path, pending call, eval breaker
    assert_eq!(debugee.writes.get(), 3);

    let path = loader.to_string_lossy();
    let written = debugee.peek(SUPPORT + SCRIPT_PATH_OFFSET, path.len() + 1);
    assert_eq!(&written[..path.len()], path.as_bytes());
    assert_eq!(written[path.len()], 0);
    assert_eq!(debugee.peek_u32(SUPPORT + PENDING_CALL_OFFSET), 1);
    assert_eq!(debugee.peek_u32(EVAL_BREAKER), 1);
    assert_eq!(ctx.attach_protocol().cached_thread_state().map(|a| a.as_u64()), Some(THREAD_STATE));

    debugee.writes.set(0);
    let again = ctx.attach(&debugee, &loader);
    assert!(again.is_success());
    assert!(again.already_set);
    assert_eq!(again.selection, Some(SelectionStrategy::Cached));
    assert_eq!(debugee.writes.get(), 0);
    assert_eq!(
        again.to_string(),
        format!("attach already requested (thread state {})", again.thread_state)
    );
}

#[test]
fn test_stop_bit_already_set_is_not_rewritten() {
    let debugee = Debugee::new(Header::default());
    debugee.poke(EVAL_BREAKER, &0x4_u32.to_le_bytes());
    let loader = loader_script("breaker_set");

    let outcome = context().attach(&debugee, &loader);
    assert!(outcome.is_success());
    let mask = outcome.stop_mask.unwrap();
    assert_eq!(mask.mask, 4);
    assert_eq!(mask.source, MaskSource::AlreadySet);
    assert_eq!(debugee.writes.get(), 2);
    assert_eq!(debugee.peek_u32(EVAL_BREAKER), 4);
}

#[test]
fn test_loader_path_truncation() {
    let debugee = Debugee::new(Header {
        script_path_size: 16,
        ..Header::default()
    });
    let loader = loader_script("a_rather_long_loader_name");

    let outcome = context().attach(&debugee, &loader);
    assert!(outcome.is_success());
    assert!(outcome.truncated_path);
    assert!(outcome.to_string().ends_with(", loader path truncated)"));

    let written = debugee.peek(SUPPORT + SCRIPT_PATH_OFFSET, 16);
    assert_eq!(&written[..15], &loader.to_string_lossy().as_bytes()[..15]);
    assert_eq!(written[15], 0);
}

#[test]
fn test_validation_failures() {
    struct TestCase {
        header: Header,
        loader: Option<&'static str>,
        expected: AttachResult,
    }
    let test_cases = [
        TestCase {
            header: Header {
                flags: FLAG_REMOTE_DEBUG_DISABLED,
                ..Header::default()
            },
            loader: Some("policy"),
            expected: AttachResult::DisabledByPolicy,
        },
        TestCase {
            header: Header {
                version: 0x030C_0000,
                ..Header::default()
            },
            loader: Some("old_runtime"),
            expected: AttachResult::InvalidOffsets,
        },
        TestCase {
            header: Header::default(),
            loader: None,
            expected: AttachResult::LoaderNotFound,
        },
    ];

    for tc in test_cases {
        let debugee = Debugee::new(tc.header);
        let loader = match tc.loader {
            Some(name) => loader_script(name),
            None => Path::new("/nonexistent/pybridge/loader.py").to_path_buf(),
        };

        let outcome = context().attach(&debugee, &loader);
        assert_eq!(outcome.result, tc.expected);
        assert_eq!(outcome.fail_site, FailSite::Validation);
        assert_eq!(debugee.writes.get(), 0);
    }
}

#[test]
fn test_process_access_denied() {
    let mut debugee = Debugee::new(Header::default());
    debugee.deny_open = true;
    let loader = loader_script("denied");

    let outcome = context().attach(&debugee, &loader);
    assert_eq!(outcome.result, AttachResult::AccessDenied);
    assert_eq!(outcome.fail_site, FailSite::OpenProcess);
    assert_eq!(
        outcome.to_string(),
        "attach failed: access_denied at open_process"
    );
    assert_eq!(debugee.writes.get(), 0);
}

#[test]
fn test_unresolved_offsets() {
    let mut debugee = Debugee::new(Header::default());
    debugee.has_symbols = false;
    debugee.variables.clear();
    let loader = loader_script("unresolved");

    let outcome = context().attach(&debugee, &loader);
    assert_eq!(outcome.result, AttachResult::BadAddress);
    assert_eq!(outcome.fail_site, FailSite::ResolveAddress);
    assert_eq!(outcome.selection, None);
    assert_eq!(debugee.writes.get(), 0);
    assert!(debugee.suspend_log.borrow().is_empty());
}

#[test]
fn test_remote_io_failures() {
    struct TestCase {
        fail_read_at: Option<u64>,
        fail_write_at: Option<u64>,
        expected_site: FailSite,
        expected_writes: usize,
    }
    let test_cases = [
        TestCase {
            fail_read_at: None,
            fail_write_at: Some(SUPPORT + PENDING_CALL_OFFSET),
            expected_site: FailSite::WritePending,
            expected_writes: 2,
        },
        TestCase {
            fail_read_at: Some(EVAL_BREAKER),
            fail_write_at: None,
            expected_site: FailSite::ReadBreaker,
            expected_writes: 2,
        },
        TestCase {
            fail_read_at: None,
            fail_write_at: Some(EVAL_BREAKER),
            expected_site: FailSite::WriteBreaker,
            expected_writes: 3,
        },
    ];

    for tc in test_cases {
        let mut debugee = Debugee::new(Header::default());
        debugee.fail_read_at = tc.fail_read_at;
        debugee.fail_write_at = tc.fail_write_at;
        let loader = loader_script("remote_io");
        let mut ctx = context();

        let outcome = ctx.attach(&debugee, &loader);
        assert_eq!(outcome.result, AttachResult::WriteFail);
        assert_eq!(outcome.fail_site, tc.expected_site);
        assert_eq!(outcome.thread_state.as_u64(), THREAD_STATE);
        assert_eq!(outcome.stop_mask, None);
        assert_eq!(debugee.writes.get(), tc.expected_writes);
        assert_eq!(ctx.attach_protocol().cached_thread_state(), None);
        assert_eq!(debugee.peek_u32(EVAL_BREAKER), 0);
    }
}

#[test]
fn test_stale_cache_is_dropped() {
    let debugee = Debugee::new(Header::default());
    let loader = loader_script("stale");
    let mut ctx = context();
    assert!(ctx.attach(&debugee, &loader).is_success());

    // thread-state went away
    debugee.poke(THREAD_STATE + REMOTE_SUPPORT_OFFSET, &0_u64.to_le_bytes());
    debugee.writes.set(0);

    let outcome = ctx.attach(&debugee, &loader);
    assert!(outcome.cache_invalidated);
    assert_eq!(outcome.result, AttachResult::BadAddress);
    assert_eq!(outcome.fail_site, FailSite::SupportPointerNull);
    assert_eq!(ctx.attach_protocol().cached_thread_state(), None);
    assert_eq!(debugee.writes.get(), 0);
}

#[test]
fn test_heuristic_thread_state_scan() {
    let candidate = EVAL_BREAKER - 0x200;
    let mut debugee = Debugee::new(Header::default());
    debugee.main_thread_states.clear();
    debugee.poke(candidate + REMOTE_SUPPORT_OFFSET, &SUPPORT.to_le_bytes());
    let loader = loader_script("scan");

    let outcome = context().attach(&debugee, &loader);
    assert!(outcome.is_success(), "{outcome}");
    assert_eq!(outcome.selection, Some(SelectionStrategy::HeuristicScan));
    assert_eq!(outcome.thread_state.as_u64(), candidate);
    assert_eq!(outcome.thread_id, None);
}

#[test]
fn test_no_thread_state() {
    let mut debugee = Debugee::new(Header::default());
    debugee.main_thread_states.clear();
    let loader = loader_script("no_thread_state");

    let outcome = context().attach(&debugee, &loader);
    assert_eq!(outcome.result, AttachResult::BadAddress);
    assert_eq!(outcome.fail_site, FailSite::ThreadSelection);
    assert_eq!(debugee.writes.get(), 0);
}

#[test]
#[serial]
fn test_simulated_partial_write() {
    std::env::set_var(ENV_SIMULATE_PARTIAL_WRITE, "1");
    let config = BridgeConfig::load(Some(Path::new("/nonexistent/pybridge.toml")));
    std::env::remove_var(ENV_SIMULATE_PARTIAL_WRITE);
    assert!(config.simulate_partial_write);

    let debugee = Debugee::new(Header::default());
    let loader = loader_script("partial");
    let mut ctx = ProcessContext::new(config, Debugee::runtime());

    let outcome = ctx.attach(&debugee, &loader);
    assert_eq!(outcome.result, AttachResult::WriteFail);
    assert_eq!(outcome.fail_site, FailSite::WriteScript);
    // only the first half landed
    assert_eq!(debugee.writes.get(), 1);
    assert_eq!(debugee.peek_u32(SUPPORT + PENDING_CALL_OFFSET), 0);
    assert_eq!(ctx.attach_protocol().cached_thread_state(), None);

    // the fault fires once per process
    let outcome = ctx.attach(&debugee, &loader);
    assert!(outcome.is_success(), "{outcome}");
}

#[test]
#[serial]
fn test_environment_toggles_off() {
    std::env::remove_var(ENV_SIMULATE_PARTIAL_WRITE);
    let config = BridgeConfig::load(Some(Path::new("/nonexistent/pybridge.toml")));
    assert!(!config.simulate_partial_write);
}
