use crate::bridge::address::RelocatedAddress;
use crate::bridge::host::{BreakpointId, ThreadId};
use crate::bridge::offsets::ParseFailure;
use std::string::FromUtf8Error;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    FromUtf8(#[from] FromUtf8Error),

    // --------------------------------- remote memory errors --------------------------------------
    #[error("read {len} bytes at {addr} failed")]
    ReadMemory { addr: RelocatedAddress, len: usize },
    #[error("write {len} bytes at {addr} failed")]
    WriteMemory { addr: RelocatedAddress, len: usize },
    #[error("partial write at {addr}: {written} of {expected} bytes")]
    PartialWrite {
        addr: RelocatedAddress,
        written: usize,
        expected: usize,
    },
    #[error("address arithmetic overflow: {0} + {1:#X}")]
    AddressOverflow(RelocatedAddress, u64),
    #[error("null address")]
    NullAddress,

    // --------------------------------- process access errors -------------------------------------
    #[error("access to process {0} denied")]
    AccessDenied(u32),
    #[error("process {0} not found")]
    ProcessNotFound(u32),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),

    // --------------------------------- debugger entity not found----------------------------------
    #[error("module `{0}` not loaded")]
    ModuleNotFound(&'static str),
    #[error("symbol `{0}` not found")]
    SymbolNotFound(String),
    #[error("debug offsets `{0}` not found by any resolver strategy")]
    OffsetsUnresolved(String),
    #[error("no symbols loaded for module `{0}`")]
    NoSymbols(String),
    #[error("thread {0} not found")]
    ThreadNotFound(ThreadId),
    #[error("no live thread to evaluate in")]
    NoLiveThread,
    #[error("breakpoint {0} not found")]
    BreakpointNotFound(BreakpointId),
    #[error("register `{0}` not available")]
    RegisterNotAvailable(String),

    // --------------------------------- host evaluation errors ------------------------------------
    #[error("expression `{expr}` evaluation failed: {reason}")]
    Evaluation { expr: String, reason: String },

    // --------------------------------- parsing errors --------------------------------------------
    #[error("debug offsets: {0}")]
    Offsets(#[from] ParseFailure),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),
    #[error("malformed executable image: {0}")]
    ImageFormat(&'static str),
    #[error("malformed source location token: {0}")]
    TokenFormat(&'static str),
    #[error("unsupported pointer size {0}")]
    UnsupportedPointerSize(u8),
    #[error("loader path can't be encoded: {0}")]
    LoaderPath(&'static str),

    // --------------------------------- configuration errors --------------------------------------
    #[error("config parsing error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("message serialization error: {0}")]
    Message(#[from] serde_json::Error),
    #[error("unknown message kind `{0}`")]
    UnknownMessage(String),
}

impl Error {
    /// Return a hint to a host - continue debugging after error or give up on this process.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::IO(_) => false,
            Error::FromUtf8(_) => false,
            Error::ReadMemory { .. } => false,
            Error::WriteMemory { .. } => false,
            Error::PartialWrite { .. } => false,
            Error::AddressOverflow(_, _) => false,
            Error::NullAddress => false,
            Error::AccessDenied(_) => false,
            Error::ModuleNotFound(_) => false,
            Error::SymbolNotFound(_) => false,
            Error::OffsetsUnresolved(_) => false,
            Error::NoSymbols(_) => false,
            Error::ThreadNotFound(_) => false,
            Error::NoLiveThread => false,
            Error::BreakpointNotFound(_) => false,
            Error::RegisterNotAvailable(_) => false,
            Error::Evaluation { .. } => false,
            Error::Offsets(_) => false,
            Error::ImageFormat(_) => false,
            Error::TokenFormat(_) => false,
            Error::LoaderPath(_) => false,
            Error::Config(_) => false,
            Error::Message(_) => false,
            Error::UnknownMessage(_) => false,

            // currently fatal errors
            Error::ProcessNotFound(_) => true,
            Error::Syscall(_, _) => true,
            Error::ObjParsing(_) => true,
            Error::UnsupportedPointerSize(_) => true,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "pybridge", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "pybridge", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
