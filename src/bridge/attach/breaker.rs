use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Why a stop mask was chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum MaskSource {
    /// A candidate bit is already raised in the eval breaker.
    AlreadySet,
    /// No candidate matched, the default bit is used.
    Default,
}

/// Eval breaker bit requesting an interpreter level check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopMask {
    pub mask: u32,
    pub source: MaskSource,
}

impl StopMask {
    /// Pick a stop mask for the current eval breaker value.
    ///
    /// The first candidate already raised in `current` wins, it means a check is already
    /// pending and nothing has to be written. Otherwise `default` is used.
    pub fn discover(current: u32, candidates: &[u32], default: u32) -> Self {
        candidates
            .iter()
            .copied()
            .find(|mask| *mask != 0 && current & mask == *mask)
            .map(|mask| StopMask {
                mask,
                source: MaskSource::AlreadySet,
            })
            .unwrap_or(StopMask {
                mask: default,
                source: MaskSource::Default,
            })
    }

    /// New eval breaker value, `None` if the bit is already raised.
    pub fn apply(&self, current: u32) -> Option<u32> {
        let updated = current | self.mask;
        (updated != current).then_some(updated)
    }

    pub fn is_set_in(&self, value: u32) -> bool {
        value & self.mask != 0
    }
}
