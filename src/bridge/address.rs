use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Represent address in debugee process.
/// Relocated address is a `GlobalAddress` + module load base.
#[derive(
    Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Serialize, Deserialize,
)]
pub struct RelocatedAddress(u64);

impl RelocatedAddress {
    pub const NULL: RelocatedAddress = RelocatedAddress(0);

    pub fn into_global(self, base: RelocatedAddress) -> Option<GlobalAddress> {
        self.0.checked_sub(base.0).map(GlobalAddress)
    }

    /// Address `offset` bytes above this one, `None` on overflow.
    pub fn checked_add(self, offset: u64) -> Option<RelocatedAddress> {
        self.0.checked_add(offset).map(RelocatedAddress)
    }

    /// Address `offset` bytes below this one, `None` on underflow.
    pub fn checked_sub(self, offset: u64) -> Option<RelocatedAddress> {
        self.0.checked_sub(offset).map(RelocatedAddress)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for RelocatedAddress {
    fn from(addr: u64) -> Self {
        RelocatedAddress(addr)
    }
}

impl From<usize> for RelocatedAddress {
    fn from(addr: usize) -> Self {
        RelocatedAddress(addr as u64)
    }
}

impl From<RelocatedAddress> for u64 {
    fn from(addr: RelocatedAddress) -> Self {
        addr.0
    }
}

impl Display for RelocatedAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format!("{:#016X}", self.0))
    }
}

/// Represent address relative to a module image base (RVA).
/// This address unique per module but not per process.
#[derive(
    Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Serialize, Deserialize,
)]
pub struct GlobalAddress(u64);

impl GlobalAddress {
    pub fn relocate(self, base: RelocatedAddress) -> Option<RelocatedAddress> {
        base.checked_add(self.0)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for GlobalAddress {
    fn from(addr: u64) -> Self {
        GlobalAddress(addr)
    }
}

impl From<u32> for GlobalAddress {
    fn from(addr: u32) -> Self {
        GlobalAddress(addr as u64)
    }
}

impl From<GlobalAddress> for u64 {
    fn from(addr: GlobalAddress) -> Self {
        addr.0
    }
}

impl Display for GlobalAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format!("{:#X}", self.0))
    }
}
