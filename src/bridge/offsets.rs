//! Debug offsets header decoding.
//!
//! The runtime publishes a small versioned header for external debuggers:
//!
//! ```text
//! [cookie "xdebugpy": 8][version: u32 LE][flags: u8][pad to pointer alignment]
//! [size_of_struct: ptr][eval_breaker, remote_support, pending_call, script_path,
//! script_path_size: 5 x ptr]
//! ```
//!
//! Pointer sized fields keep the header portable across 32 and 64 bit targets.
//! Decoding is field by field, malformed input only ever produces a [`ParseFailure`].

use crate::bridge::address::RelocatedAddress;
use crate::bridge::memory::PointerSize;
use crate::version::Version;
use bytes::Buf;

pub const COOKIE: &[u8; 8] = b"xdebugpy";

/// Oldest runtime publishing the header, compared against major.minor only.
pub const MIN_SUPPORTED_VERSION: u32 = 0x030E_0000;

/// Upper bound for offsets into per-thread structures.
const MAX_OFFSET: u64 = 64 * 1024 * 1024;
const MAX_SCRIPT_PATH_SIZE: u64 = 1_000_000;
/// Eval breaker values below this are module relative, not absolute.
const ABSOLUTE_ADDRESS_THRESHOLD: u64 = 0x0100_0000;

const FLAG_FREE_THREADED: u8 = 0x01;
const FLAG_REMOTE_DEBUG_DISABLED: u8 = 0x02;

/// Size of the fixed legacy layout.
pub const LEGACY_STRUCT_SIZE: usize = 128;

/// Which layout a header was decoded from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OffsetsLayout {
    Current,
    Legacy,
}

/// Attach relevant offsets published by the runtime. Immutable once parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugOffsets {
    pub version: u32,
    pub flags: u8,
    pub size_of_struct: u64,
    /// Absolute address of the eval breaker word.
    pub eval_breaker: RelocatedAddress,
    /// Offset of the remote support pointer inside a thread state.
    pub remote_support_offset: u64,
    /// Offset of the pending call flag inside the remote support structure.
    pub pending_call_offset: u64,
    /// Offset of the script path buffer inside the remote support structure.
    pub script_path_offset: u64,
    pub script_path_size: u64,
    pub layout: OffsetsLayout,
}

impl DebugOffsets {
    pub fn is_free_threaded(&self) -> bool {
        self.flags & FLAG_FREE_THREADED != 0
    }

    pub fn is_remote_debug_disabled(&self) -> bool {
        self.flags & FLAG_REMOTE_DEBUG_DISABLED != 0
    }

    pub fn runtime_version(&self) -> Version {
        Version::from_hex(self.version)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseFailure {
    #[error("buffer too small: {actual} bytes, at least {needed} required")]
    BufferTooSmall { needed: usize, actual: usize },
    #[error("cookie mismatch")]
    CookieMismatch,
    #[error("unsupported version {0:#010X}")]
    UnsupportedVersion(u32),
    #[error("sizeof_struct too small ({0})")]
    SizeOfStructTooSmall(u64),
    #[error("zero offset: {0}")]
    ZeroOffset(&'static str),
    #[error("offset {0} out of expected range ({1:#X})")]
    OffsetOutOfRange(&'static str, u64),
    #[error("invalid script_path_size {0}")]
    InvalidScriptPathSize(u64),
    #[error("eval breaker relative value {0:#X} overflows base address")]
    EvalBreakerOverflow(u64),
}

/// Header length for a pointer size: cookie, version, flags, alignment, size and five fields.
pub fn header_size(pointer_size: PointerSize) -> usize {
    let ptr = pointer_size.bytes();
    align_up(COOKIE.len() + 4 + 1, ptr) + ptr + 5 * ptr
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

fn get_pointer(cursor: &mut &[u8], pointer_size: PointerSize) -> u64 {
    match pointer_size {
        PointerSize::Four => cursor.get_u32_le() as u64,
        PointerSize::Eight => cursor.get_u64_le(),
    }
}

/// Decode a header published by the runtime.
///
/// # Arguments
///
/// * `data`: bytes read at the header address
/// * `pointer_size`: debugee pointer size
/// * `base_address`: header address, base for a relative eval breaker
pub fn parse(
    data: &[u8],
    pointer_size: PointerSize,
    base_address: RelocatedAddress,
) -> Result<DebugOffsets, ParseFailure> {
    let needed = header_size(pointer_size);
    if data.len() < COOKIE.len() {
        return Err(ParseFailure::BufferTooSmall {
            needed,
            actual: data.len(),
        });
    }
    if &data[..COOKIE.len()] != COOKIE {
        return Err(ParseFailure::CookieMismatch);
    }
    if data.len() < needed {
        return Err(ParseFailure::BufferTooSmall {
            needed,
            actual: data.len(),
        });
    }

    let mut cursor = &data[COOKIE.len()..needed];
    let version = cursor.get_u32_le();
    // pre-release and patch variants are fine, only major.minor matters
    if version & 0xFFFF_0000 < MIN_SUPPORTED_VERSION {
        return Err(ParseFailure::UnsupportedVersion(version));
    }
    let flags = cursor.get_u8();

    let consumed = COOKIE.len() + 5;
    cursor.advance(align_up(consumed, pointer_size.bytes()) - consumed);

    let size_of_struct = get_pointer(&mut cursor, pointer_size);
    // some pre-release builds publish zero here
    if size_of_struct != 0 && size_of_struct < needed as u64 {
        return Err(ParseFailure::SizeOfStructTooSmall(size_of_struct));
    }

    let eval_breaker_raw = get_pointer(&mut cursor, pointer_size);
    let remote_support_offset = get_pointer(&mut cursor, pointer_size);
    let pending_call_offset = get_pointer(&mut cursor, pointer_size);
    let script_path_offset = get_pointer(&mut cursor, pointer_size);
    let script_path_size = get_pointer(&mut cursor, pointer_size);

    validate_offsets(
        eval_breaker_raw,
        remote_support_offset,
        pending_call_offset,
        script_path_offset,
        script_path_size,
    )?;

    let base = base_address.as_u64();
    let eval_breaker = if eval_breaker_raw < base || eval_breaker_raw < ABSOLUTE_ADDRESS_THRESHOLD
    {
        base.checked_add(eval_breaker_raw)
            .ok_or(ParseFailure::EvalBreakerOverflow(eval_breaker_raw))?
    } else {
        eval_breaker_raw
    };

    Ok(DebugOffsets {
        version,
        flags,
        size_of_struct,
        eval_breaker: RelocatedAddress::from(eval_breaker),
        remote_support_offset,
        pending_call_offset,
        script_path_offset,
        script_path_size,
        layout: OffsetsLayout::Current,
    })
}

/// Decode the fixed layout of older experimental runtime builds.
///
/// Layout (8 byte packing): `version: u32, pad: u32, sizeof_struct: u64, cookie: u64,
/// reserved: 8 x u64, eval_breaker, remote_support, pending_call, script_path,
/// script_path_size: 5 x u64`. The eval breaker is absolute.
pub fn parse_legacy(data: &[u8]) -> Result<DebugOffsets, ParseFailure> {
    if data.len() < LEGACY_STRUCT_SIZE {
        return Err(ParseFailure::BufferTooSmall {
            needed: LEGACY_STRUCT_SIZE,
            actual: data.len(),
        });
    }

    let mut cursor = &data[..LEGACY_STRUCT_SIZE];
    let version = cursor.get_u32_le();
    cursor.advance(4);
    let size_of_struct = cursor.get_u64_le();
    if size_of_struct < LEGACY_STRUCT_SIZE as u64 {
        return Err(ParseFailure::SizeOfStructTooSmall(size_of_struct));
    }
    let mut cookie = [0; 8];
    cursor.copy_to_slice(&mut cookie);
    if &cookie != COOKIE {
        return Err(ParseFailure::CookieMismatch);
    }
    if version < MIN_SUPPORTED_VERSION {
        return Err(ParseFailure::UnsupportedVersion(version));
    }
    cursor.advance(8 * 8);

    let eval_breaker = cursor.get_u64_le();
    let remote_support_offset = cursor.get_u64_le();
    let pending_call_offset = cursor.get_u64_le();
    let script_path_offset = cursor.get_u64_le();
    let script_path_size = cursor.get_u64_le();

    validate_offsets(
        eval_breaker,
        remote_support_offset,
        pending_call_offset,
        script_path_offset,
        script_path_size,
    )?;

    Ok(DebugOffsets {
        version,
        flags: 0,
        size_of_struct,
        eval_breaker: RelocatedAddress::from(eval_breaker),
        remote_support_offset,
        pending_call_offset,
        script_path_offset,
        script_path_size,
        layout: OffsetsLayout::Legacy,
    })
}

fn validate_offsets(
    eval_breaker: u64,
    remote_support_offset: u64,
    pending_call_offset: u64,
    script_path_offset: u64,
    script_path_size: u64,
) -> Result<(), ParseFailure> {
    if eval_breaker == 0 {
        return Err(ParseFailure::ZeroOffset("eval_breaker"));
    }
    for (name, value) in [
        ("remote_support", remote_support_offset),
        ("pending_call", pending_call_offset),
        ("script_path", script_path_offset),
    ] {
        if value == 0 {
            return Err(ParseFailure::ZeroOffset(name));
        }
        if value >= MAX_OFFSET {
            return Err(ParseFailure::OffsetOutOfRange(name, value));
        }
    }
    if script_path_size == 0 || script_path_size > MAX_SCRIPT_PATH_SIZE {
        return Err(ParseFailure::InvalidScriptPathSize(script_path_size));
    }
    Ok(())
}

/// Parse a header, falling back to the legacy layout if the current one is rejected.
pub fn parse_any(
    data: &[u8],
    pointer_size: PointerSize,
    base_address: RelocatedAddress,
) -> Result<DebugOffsets, ParseFailure> {
    match parse(data, pointer_size, base_address) {
        Ok(offsets) => Ok(offsets),
        Err(failure) => {
            crate::pb_debug!("debug offsets parse failed: {failure}, attempting legacy layout");
            parse_legacy(data).map_err(|_| failure)
        }
    }
}
