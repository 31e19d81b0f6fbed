use std::sync::atomic::{AtomicBool, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(true);
static VERBOSE: AtomicBool = AtomicBool::new(false);

#[inline(always)]
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::SeqCst)
}

#[inline(always)]
pub fn is_verbose() -> bool {
    is_enabled() && VERBOSE.load(Ordering::SeqCst)
}

pub fn disable() {
    ENABLED.store(false, Ordering::SeqCst)
}

pub fn enable() {
    ENABLED.store(true, Ordering::SeqCst)
}

/// Switch attach/resolve diagnostics on or off.
pub fn set_verbose(verbose: bool) {
    VERBOSE.store(verbose, Ordering::SeqCst)
}

#[macro_export]
macro_rules! pb_info {
    ($($arg:tt)+) => {
        if $crate::log::is_enabled() {
            log::info!(target: "pybridge", $($arg)+)
        }
    };
}

#[macro_export]
macro_rules! pb_warn {
    ($($arg:tt)+) => {
        if $crate::log::is_enabled() {
            log::warn!(target: "pybridge", $($arg)+)
        }
    };
}

#[macro_export]
macro_rules! pb_error {
    ($($arg:tt)+) => {
        if $crate::log::is_enabled() {
            log::error!(target: "pybridge", $($arg)+)
        }
    };
}

#[macro_export]
macro_rules! pb_debug {
    ($($arg:tt)+) => {
        if $crate::log::is_enabled() {
            log::debug!(target: "pybridge", $($arg)+)
        }
    };
}

/// Debug line emitted only when verbose diagnostics are switched on.
#[macro_export]
macro_rules! verbose {
    ($($arg:tt)+) => {
        if $crate::log::is_verbose() {
            log::debug!(target: "pybridge", $($arg)+)
        }
    };
}
