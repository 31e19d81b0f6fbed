//! Bridge configuration.
//!
//! Loaded once from `~/.config/pybridge/config.toml` (or an explicit path), then overridden by
//! environment toggles. Missing file means defaults, a malformed one is reported and ignored.

use crate::bridge::error::Error;
use crate::bridge::register::CallingConvention;
use crate::{muted_error, pb_warn, weak_error};
use serde::{Deserialize, Serialize};
use std::fs::read_to_string;
use std::path::Path;

pub const ENV_VERBOSE: &str = "PYBRIDGE_VERBOSE";
pub const ENV_SIMULATE_PARTIAL_WRITE: &str = "PYBRIDGE_SIMULATE_PARTIAL_WRITE";

/// User visible debugger options shared by the stitcher and the step controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerOptions {
    /// Show runtime frames that host no interpreted frame.
    pub show_native_frames: bool,
    /// Step through interpreted code instead of native code.
    pub use_interpreted_stepping: bool,
}

impl Default for DebuggerOptions {
    fn default() -> Self {
        Self {
            show_native_frames: false,
            use_interpreted_stepping: true,
        }
    }
}

/// Partial change of [`DebuggerOptions`], `None` fields stay untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionsUpdate {
    pub show_native_frames: Option<bool>,
    pub use_interpreted_stepping: Option<bool>,
}

impl DebuggerOptions {
    /// Apply an update, return true if any option changed.
    pub fn apply_update(&mut self, update: OptionsUpdate) -> bool {
        let before = *self;
        if let Some(show) = update.show_native_frames {
            self.show_native_frames = show;
        }
        if let Some(interpreted) = update.use_interpreted_stepping {
            self.use_interpreted_stepping = interpreted;
        }
        before != *self
    }
}

/// Remote attach tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachConfig {
    /// Eval breaker bits tried, in order, before the default one.
    pub stop_mask_candidates: Vec<u32>,
    pub default_stop_mask: u32,
    /// Pages below the eval breaker covered by the thread-state heuristic scan.
    pub scan_pages: u64,
    pub scan_stride: u64,
    /// Candidates below this address are never probed.
    pub scan_floor: u64,
    /// Maximal distance above the eval breaker for a plausible support pointer.
    pub max_support_distance: u64,
    /// Remember the thread-state of a successful attach.
    pub cache_thread_state: bool,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            stop_mask_candidates: vec![0x1, 0x2, 0x4, 0x8],
            default_stop_mask: 0x1,
            scan_pages: 32,
            scan_stride: 0x10,
            scan_floor: 0x1_0000,
            max_support_distance: 0x100_0000,
            cache_thread_state: true,
        }
    }
}

/// Names used to find the debug offsets header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub symbol: String,
    pub section_tag: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            symbol: "_Py_DebugOffsets".to_string(),
            section_tag: "PyRuntime".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    pub calling_convention: CallingConvention,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub options: DebuggerOptions,
    pub attach: AttachConfig,
    pub resolver: ResolverConfig,
    pub step: StepConfig,
    pub verbose: bool,
    /// Fault injection: fail the first large remote write halfway.
    pub simulate_partial_write: bool,
}

impl BridgeConfig {
    const DEFAULT_PATH: &'static str = ".config/pybridge/config.toml";

    pub fn from_toml(data: &str) -> Result<Self, Error> {
        Ok(toml::de::from_str(data)?)
    }

    /// Load configuration from file then apply environment toggles.
    /// Defaults are used if the file is missing or malformed.
    pub fn load(path: Option<&Path>) -> Self {
        let mut config = Self::from_file(path).unwrap_or_default();
        config.apply_env_with(|name| std::env::var(name).ok());
        config
    }

    fn from_file(path: Option<&Path>) -> Option<Self> {
        let data = match path {
            None => {
                let path = home::home_dir()?.join(Self::DEFAULT_PATH);
                muted_error!(read_to_string(path))?
            }
            Some(path) => match read_to_string(path) {
                Ok(data) => data,
                Err(err) => {
                    pb_warn!("error while load config file {}: {err}", path.display());
                    return None;
                }
            },
        };
        weak_error!(Self::from_toml(&data), "config:")
    }

    /// Override file settings with environment toggles, `lookup` returns a variable value.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |name: &str| lookup(name).map(|v| v == "1" || v.eq_ignore_ascii_case("true"));
        if let Some(verbose) = flag(ENV_VERBOSE) {
            self.verbose = verbose;
        }
        if let Some(simulate) = flag(ENV_SIMULATE_PARTIAL_WRITE) {
            self.simulate_partial_write = simulate;
        }
    }
}
