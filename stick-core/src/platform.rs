//! Host-specific helpers.
//!
//! Linux is the only platform with a real implementation. Elsewhere the
//! helpers report "unknown" so that callers fall back to their defaults.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

/// The disk that backs the root filesystem. Not detectable on this platform.
#[cfg(not(target_os = "linux"))]
pub fn system_disk() -> Option<std::path::PathBuf> {
    None
}
