use crate::bridge::address::RelocatedAddress;
use crate::bridge::host::{AttachHost, RemoteMemory, ThreadId, ThreadStateCandidate};
use crate::bridge::memory::MemoryExt;
use crate::bridge::offsets::DebugOffsets;
use crate::config::AttachConfig;
use crate::verbose;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

const PAGE_SIZE: u64 = 0x1000;

/// How the attach target thread-state was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum SelectionStrategy {
    Cached,
    MainInterpreter,
    Enumerated,
    CurrentThreadExport,
    HeuristicScan,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SelectedThreadState {
    pub address: RelocatedAddress,
    pub thread_id: Option<ThreadId>,
    pub strategy: SelectionStrategy,
}

impl SelectedThreadState {
    fn from_candidate(candidate: ThreadStateCandidate, strategy: SelectionStrategy) -> Self {
        Self {
            address: candidate.address,
            thread_id: candidate.thread_id,
            strategy,
        }
    }
}

/// Choose a thread-state: main interpreter list, any enumerable thread-state, the current
/// thread-state accessor, then a bounded heuristic scan below the eval breaker.
pub fn select_thread_state(
    host: &dyn AttachHost,
    offsets: &DebugOffsets,
    config: &AttachConfig,
) -> Option<SelectedThreadState> {
    let first_valid = |candidates: Vec<ThreadStateCandidate>| {
        candidates.into_iter().find(|c| !c.address.is_null())
    };

    if let Some(candidate) = first_valid(host.main_interpreter_thread_states()) {
        return Some(SelectedThreadState::from_candidate(
            candidate,
            SelectionStrategy::MainInterpreter,
        ));
    }
    if let Some(candidate) = first_valid(host.thread_states()) {
        return Some(SelectedThreadState::from_candidate(
            candidate,
            SelectionStrategy::Enumerated,
        ));
    }
    if let Some(address) = host.current_thread_state().filter(|a| !a.is_null()) {
        return Some(SelectedThreadState {
            address,
            thread_id: None,
            strategy: SelectionStrategy::CurrentThreadExport,
        });
    }

    verbose!("no thread-state known to the runtime, scan below the eval breaker");
    HeuristicScan::new(offsets.eval_breaker, config)
        .find(|candidate| accept_candidate(host, *candidate, offsets, config))
        .map(|address| SelectedThreadState {
            address,
            thread_id: None,
            strategy: SelectionStrategy::HeuristicScan,
        })
}

/// Candidate thread-state addresses, from the eval breaker downwards.
///
/// The window spans a fixed number of pages below the eval breaker page and never goes under
/// the configured floor.
pub struct HeuristicScan {
    next: Option<u64>,
    stride: u64,
    lower: u64,
}

impl HeuristicScan {
    pub fn new(eval_breaker: RelocatedAddress, config: &AttachConfig) -> Self {
        let eval_breaker = eval_breaker.as_u64();
        let window = config.scan_pages.saturating_mul(PAGE_SIZE);
        let lower = (eval_breaker & !(PAGE_SIZE - 1))
            .saturating_sub(window)
            .max(config.scan_floor);
        Self {
            next: Some(eval_breaker),
            stride: config.scan_stride.max(1),
            lower,
        }
    }
}

impl Iterator for HeuristicScan {
    type Item = RelocatedAddress;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.filter(|c| *c >= self.lower)?;
        self.next = current.checked_sub(self.stride);
        Some(RelocatedAddress::from(current))
    }
}

/// Return true if `candidate` looks like a thread-state: its remote support pointer is set,
/// lies not too far above the eval breaker and the script path buffer behind it is readable.
/// An unreadable candidate is just rejected.
pub fn accept_candidate<M: RemoteMemory + ?Sized>(
    memory: &M,
    candidate: RelocatedAddress,
    offsets: &DebugOffsets,
    config: &AttachConfig,
) -> bool {
    let Some(support_slot) = candidate.checked_add(offsets.remote_support_offset) else {
        return false;
    };
    let Ok(support) = memory.read_pointer(support_slot) else {
        return false;
    };
    let limit = offsets
        .eval_breaker
        .as_u64()
        .saturating_add(config.max_support_distance);
    if support.is_null() || support.as_u64() > limit {
        return false;
    }
    support
        .checked_add(offsets.script_path_offset)
        .map(|script_path| memory.probe(script_path))
        .unwrap_or(false)
}
