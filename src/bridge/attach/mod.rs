//! Remote attach request.
//!
//! Asks a running runtime to execute a loader script at its next safe point. The request is a
//! fixed sequence of small remote writes into the thread-state remote support structure:
//! script path, pending call flag, then a stop bit in the eval breaker word.
//!
//! Any failed step aborts the sequence and is reported with the exact [`FailSite`]. Nothing is
//! rolled back, a script path without the pending call flag is ignored by the runtime.

mod breaker;
mod loader;
mod thread_state;

pub use breaker::{MaskSource, StopMask};
pub use loader::LoaderBuffer;
pub use thread_state::{
    accept_candidate, select_thread_state, HeuristicScan, SelectedThreadState, SelectionStrategy,
};

use crate::bridge::address::RelocatedAddress;
use crate::bridge::error::Error;
use crate::bridge::host::{AccessRights, AttachHost, RemoteMemory, ThreadId};
use crate::bridge::memory::{MemoryExt, PartialWriteInjector};
use crate::bridge::offsets::DebugOffsets;
use crate::bridge::utils::eq_ignore_case_prefix;
use crate::config::AttachConfig;
use crate::{pb_debug, pb_info, pb_warn, verbose};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt::{Display, Formatter};
use std::path::Path;
use strum_macros::Display;

/// Attach attempt result kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum AttachResult {
    Success,
    InvalidOffsets,
    LoaderNotFound,
    AccessDenied,
    DisabledByPolicy,
    BadAddress,
    WriteFail,
}

/// Step of the attach sequence that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum FailSite {
    None,
    ResolveAddress,
    Validation,
    ThreadSelection,
    SupportPointerNull,
    OpenProcess,
    WriteScript,
    WritePending,
    ReadBreaker,
    WriteBreaker,
}

/// Result of one attach attempt with everything needed for a diagnostic message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachOutcome {
    pub result: AttachResult,
    pub fail_site: FailSite,
    pub truncated_path: bool,
    pub thread_state: RelocatedAddress,
    pub thread_id: Option<ThreadId>,
    pub selection: Option<SelectionStrategy>,
    /// A previous attach request is still in place, nothing was written.
    pub already_set: bool,
    /// Cached thread-state failed revalidation and was dropped.
    pub cache_invalidated: bool,
    pub verified_script_path: bool,
    pub verified_pending_call: bool,
    pub breaker_bit_set: bool,
    pub stop_mask: Option<StopMask>,
}

/// Debug offsets state as seen by an attach attempt.
#[derive(Clone, Copy, Debug)]
pub enum OffsetsLookup<'a> {
    Parsed(&'a DebugOffsets),
    /// Header found but failed validation.
    Invalid,
    /// No resolver strategy found the header.
    Unresolved,
}

impl<'a> OffsetsLookup<'a> {
    pub fn parsed(self) -> Option<&'a DebugOffsets> {
        match self {
            OffsetsLookup::Parsed(offsets) => Some(offsets),
            OffsetsLookup::Invalid | OffsetsLookup::Unresolved => None,
        }
    }
}

impl Default for AttachOutcome {
    fn default() -> Self {
        Self {
            result: AttachResult::WriteFail,
            fail_site: FailSite::None,
            truncated_path: false,
            thread_state: RelocatedAddress::NULL,
            thread_id: None,
            selection: None,
            already_set: false,
            cache_invalidated: false,
            verified_script_path: false,
            verified_pending_call: false,
            breaker_bit_set: false,
            stop_mask: None,
        }
    }
}

impl AttachOutcome {
    pub fn is_success(&self) -> bool {
        self.result == AttachResult::Success
    }

    fn fail(mut self, result: AttachResult, site: FailSite) -> Self {
        self.result = result;
        self.fail_site = site;
        self
    }
}

impl Display for AttachOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if !self.is_success() {
            return write!(f, "attach failed: {} at {}", self.result, self.fail_site);
        }
        if self.already_set {
            return write!(f, "attach already requested (thread state {})", self.thread_state);
        }
        write!(f, "attach requested (thread state {}", self.thread_state)?;
        if let Some(selection) = self.selection {
            write!(f, ", {selection}")?;
        }
        if self.truncated_path {
            f.write_str(", loader path truncated")?;
        }
        f.write_str(")")
    }
}

#[derive(Clone, Copy, Debug)]
struct CachedThreadState {
    address: RelocatedAddress,
    thread_id: Option<ThreadId>,
}

/// Attach request sequence of one process.
///
/// Owns the thread-state of the last successful attempt and the fault injection latch, both
/// live as long as the process.
pub struct RemoteAttachProtocol {
    config: AttachConfig,
    cached: Option<CachedThreadState>,
    simulate_partial_write: bool,
    partial_write_fired: Cell<bool>,
}

impl RemoteAttachProtocol {
    pub fn new(config: AttachConfig, simulate_partial_write: bool) -> Self {
        Self {
            config,
            cached: None,
            simulate_partial_write,
            partial_write_fired: Cell::new(false),
        }
    }

    pub fn cached_thread_state(&self) -> Option<RelocatedAddress> {
        self.cached.map(|c| c.address)
    }

    pub fn forget_thread_state(&mut self) {
        self.cached = None;
    }

    /// Request the runtime to run `loader_path`.
    ///
    /// # Arguments
    ///
    /// * `host`: debugee access
    /// * `lookup`: debug offsets lookup result
    /// * `loader_path`: local loader script
    pub fn attach(
        &mut self,
        host: &dyn AttachHost,
        lookup: OffsetsLookup,
        loader_path: &Path,
    ) -> AttachOutcome {
        let mut outcome = AttachOutcome::default();
        if let OffsetsLookup::Unresolved = lookup {
            return outcome.fail(AttachResult::BadAddress, FailSite::ResolveAddress);
        }
        let offsets = lookup.parsed();
        let full_path = std::fs::canonicalize(loader_path).ok();

        if let (Some(cached), Some(offsets), Some(full_path)) = (self.cached, offsets, &full_path) {
            match self.revalidate(host, cached, offsets, full_path) {
                Ok(true) => {
                    pb_info!("attach already requested through {}", cached.address);
                    return AttachOutcome {
                        result: AttachResult::Success,
                        thread_state: cached.address,
                        thread_id: cached.thread_id,
                        selection: Some(SelectionStrategy::Cached),
                        already_set: true,
                        ..outcome
                    };
                }
                Ok(false) => {}
                Err(e) => {
                    pb_debug!("cached thread-state {} is stale: {e:#}", cached.address);
                    self.cached = None;
                    outcome.cache_invalidated = true;
                }
            }
        }

        if offsets.is_some_and(|o| o.is_remote_debug_disabled()) {
            return outcome.fail(AttachResult::DisabledByPolicy, FailSite::Validation);
        }
        let Some(offsets) = offsets else {
            return outcome.fail(AttachResult::InvalidOffsets, FailSite::Validation);
        };
        let Some(full_path) = full_path.filter(|p| p.is_file()) else {
            pb_warn!("loader {} not found", loader_path.display());
            return outcome.fail(AttachResult::LoaderNotFound, FailSite::Validation);
        };

        let Some(selected) = select_thread_state(host, offsets, &self.config) else {
            return outcome.fail(AttachResult::BadAddress, FailSite::ThreadSelection);
        };
        verbose!(
            "thread-state {} selected by {}",
            selected.address,
            selected.strategy
        );
        outcome.thread_state = selected.address;
        outcome.thread_id = selected.thread_id;
        outcome.selection = Some(selected.strategy);

        let support = selected
            .address
            .checked_add(offsets.remote_support_offset)
            .and_then(|slot| host.read_pointer(slot).ok())
            .filter(|support| !support.is_null());
        let Some(support) = support else {
            return outcome.fail(AttachResult::BadAddress, FailSite::SupportPointerNull);
        };

        let buffer = match LoaderBuffer::prepare(&full_path, offsets.script_path_size) {
            Ok(buffer) => buffer,
            Err(e) => {
                pb_warn!("loader buffer: {e:#}");
                return outcome.fail(AttachResult::InvalidOffsets, FailSite::Validation);
            }
        };
        outcome.truncated_path = buffer.truncated;
        verbose!(
            "loader buffer len={} truncated={}",
            buffer.bytes.len(),
            buffer.truncated
        );

        let outcome = self.perform_writes(host, offsets, support, &buffer, outcome);
        if outcome.is_success() {
            pb_info!("{outcome}");
            if self.config.cache_thread_state {
                self.cached = Some(CachedThreadState {
                    address: selected.address,
                    thread_id: selected.thread_id,
                });
            }
        } else {
            pb_warn!("{outcome}");
        }
        outcome
    }

    /// Return `Ok(true)` if the cached thread-state already holds a request for this loader.
    fn revalidate(
        &self,
        host: &dyn AttachHost,
        cached: CachedThreadState,
        offsets: &DebugOffsets,
        full_path: &Path,
    ) -> Result<bool, Error> {
        let slot = cached
            .address
            .checked_add(offsets.remote_support_offset)
            .ok_or(Error::AddressOverflow(cached.address, offsets.remote_support_offset))?;
        let support = host.read_pointer(slot)?;
        if support.is_null() {
            return Err(Error::NullAddress);
        }
        let script_path = support
            .checked_add(offsets.script_path_offset)
            .ok_or(Error::AddressOverflow(support, offsets.script_path_offset))?;

        let expected = LoaderBuffer::prepare(full_path, offsets.script_path_size)?;
        let probe_len = (expected.path_len + 1).min(expected.bytes.len());
        let remote = host.read_bytes(script_path, probe_len)?;
        let end = remote.iter().position(|b| *b == 0).unwrap_or(remote.len());
        let remote = &remote[..end];

        Ok(!remote.is_empty()
            && remote.len() == expected.path_len
            && eq_ignore_case_prefix(remote, full_path.to_string_lossy().as_bytes()))
    }

    fn perform_writes(
        &self,
        host: &dyn AttachHost,
        offsets: &DebugOffsets,
        support: RelocatedAddress,
        buffer: &LoaderBuffer,
        outcome: AttachOutcome,
    ) -> AttachOutcome {
        let (Some(script_path), Some(pending_call)) = (
            support.checked_add(offsets.script_path_offset),
            support.checked_add(offsets.pending_call_offset),
        ) else {
            return outcome.fail(AttachResult::BadAddress, FailSite::SupportPointerNull);
        };
        let eval_breaker = offsets.eval_breaker;
        pb_debug!(
            "support={support} script_path={script_path} pending_call={pending_call} eval_breaker={eval_breaker}"
        );

        let handle = match host.open_process(AccessRights::ATTACH) {
            Ok(handle) => handle,
            Err(e) => {
                pb_warn!(
                    "open process {} with {}: {e:#}",
                    host.process_id(),
                    AccessRights::ATTACH
                );
                return outcome.fail(AttachResult::AccessDenied, FailSite::OpenProcess);
            }
        };
        let injector;
        let memory: &dyn RemoteMemory = if self.simulate_partial_write {
            injector = PartialWriteInjector::new(&*handle, &self.partial_write_fired);
            &injector
        } else {
            &*handle
        };

        if let Err(e) = memory.write_memory(script_path, &buffer.bytes) {
            pb_debug!("write script path: {e:#}");
            return outcome.fail(AttachResult::WriteFail, FailSite::WriteScript);
        }
        if let Err(e) = memory.write_u32(pending_call, 1) {
            pb_debug!("write pending call: {e:#}");
            return outcome.fail(AttachResult::WriteFail, FailSite::WritePending);
        }
        let breaker = match memory.read_u32(eval_breaker) {
            Ok(value) => value,
            Err(e) => {
                pb_debug!("read eval breaker: {e:#}");
                return outcome.fail(AttachResult::WriteFail, FailSite::ReadBreaker);
            }
        };

        let stop_mask = StopMask::discover(
            breaker,
            &self.config.stop_mask_candidates,
            self.config.default_stop_mask,
        );
        verbose!(
            "stop mask {:#X} ({}), eval breaker {breaker:#X}",
            stop_mask.mask,
            stop_mask.source
        );
        if let Some(updated) = stop_mask.apply(breaker) {
            if let Err(e) = memory.write_u32(eval_breaker, updated) {
                pb_debug!("write eval breaker: {e:#}");
                return outcome.fail(AttachResult::WriteFail, FailSite::WriteBreaker);
            }
        }

        let mut outcome = verify(
            memory,
            script_path,
            buffer,
            pending_call,
            eval_breaker,
            stop_mask,
            outcome,
        );
        outcome.stop_mask = Some(stop_mask);
        outcome.result = AttachResult::Success;
        outcome.fail_site = FailSite::None;
        outcome
    }
}

/// Re-read every written value. Advisory, results only land in the outcome flags.
fn verify(
    memory: &dyn RemoteMemory,
    script_path: RelocatedAddress,
    buffer: &LoaderBuffer,
    pending_call: RelocatedAddress,
    eval_breaker: RelocatedAddress,
    stop_mask: StopMask,
    mut outcome: AttachOutcome,
) -> AttachOutcome {
    let probe_len = 8.min(buffer.bytes.len().saturating_sub(1));
    if probe_len > 0 {
        outcome.verified_script_path = memory
            .read_bytes(script_path, probe_len)
            .is_ok_and(|remote| remote == buffer.bytes[..probe_len]);
    }
    outcome.verified_pending_call = memory.read_u32(pending_call).is_ok_and(|v| v == 1);
    outcome.breaker_bit_set = memory
        .read_u32(eval_breaker)
        .is_ok_and(|v| stop_mask.is_set_in(v));
    verbose!(
        "attach verification: script={} pending={} breaker={}",
        outcome.verified_script_path,
        outcome.verified_pending_call,
        outcome.breaker_bit_set
    );
    outcome
}
