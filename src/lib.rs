pub mod bridge;
pub mod config;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod log;
pub mod version;
