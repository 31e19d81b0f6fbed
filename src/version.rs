use crate::weak_error;
use itertools::Itertools;
use once_cell::sync;
use regex::Regex;
use std::fmt::{Display, Formatter};

/// Target runtime version (major, minor, micro).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(pub (u32, u32, u32));

impl Version {
    /// Decode the runtime packed hex version, `0xMMmmuuLS`
    /// (major, minor, micro, release level, serial).
    pub fn from_hex(hex: u32) -> Self {
        Version((hex >> 24, (hex >> 16) & 0xFF, (hex >> 8) & 0xFF))
    }

    /// Parse a runtime version from a module name like:
    /// "python314.dll", "python27.dll", "libpython3.14.so.1.0", "libpython3.12d.so".
    pub fn from_module_name(name: &str) -> Option<Self> {
        static V_RE: sync::Lazy<Regex> = sync::Lazy::new(|| {
            Regex::new(r"(?i)python(\d)\.?(\d{1,2})(?:\D|$)").expect("must compile")
        });

        if let Some((_, [major, minor])) = V_RE.captures_iter(name).next().map(|c| c.extract()) {
            let major = weak_error!(major.parse::<u32>())?;
            let minor = weak_error!(minor.parse::<u32>())?;
            return Some(Version((major, minor, 0)));
        }
        None
    }

    pub fn major(&self) -> u32 {
        self.0 .0
    }

    pub fn minor(&self) -> u32 {
        self.0 .1
    }

    /// Return true if version lies in `[min, max]`, comparing major.minor only.
    /// Missing bound is unbounded.
    pub fn in_range(&self, min: Option<Version>, max: Option<Version>) -> bool {
        let this = (self.major(), self.minor());
        min.map_or(true, |min| this >= (min.major(), min.minor()))
            && max.map_or(true, |max| this <= (max.major(), max.minor()))
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.0 .0, self.0 .1, self.0 .2)
    }
}

/// Runtime versions that publish a debug offsets header.
static SUPPORTED_ATTACH: &[(Version, Version)] = &[
    (Version((3, 14, 0)), Version((3, 14, u32::MAX))),
    (Version((3, 15, 0)), Version((3, 15, u32::MAX))),
];

pub fn supported_versions_to_string() -> String {
    format!(
        "[{}]",
        SUPPORTED_ATTACH
            .iter()
            .map(|(v, _)| format!("{}.{}.x", v.0 .0, v.0 .1))
            .join(", ")
    )
}

/// Return true if a runtime version is known to support remote attach. False negative for
/// future releases, those are still tried.
pub fn is_known_attach_version(version: Version) -> bool {
    SUPPORTED_ATTACH
        .iter()
        .any(|(v_min, v_max)| version >= *v_min && version <= *v_max)
}
