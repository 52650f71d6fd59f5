//! Ejecting the target after a successful flash.
//!
//! The exit status of the eject tool is advisory: a drive that was already
//! removed, or a reader that cannot eject, is still safe to unplug.

use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EjectOutcome {
    Ejected,
    /// The tool ran and exited non-zero (`None` when killed by a signal).
    Refused { code: Option<i32> },
    /// The tool could not be started.
    Unavailable(String),
}

impl EjectOutcome {
    pub fn is_ejected(&self) -> bool {
        matches!(self, EjectOutcome::Ejected)
    }
}

/// Runs `<tool> <device>` and waits for it.
pub fn eject(tool: &str, device: &Path) -> EjectOutcome {
    let status = Command::new(tool)
        .arg(device)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => {
            info!("Ejected {}", device.display());
            EjectOutcome::Ejected
        }
        Ok(status) => {
            warn!("{} {} exited with {}; ignoring", tool, device.display(), status);
            EjectOutcome::Refused {
                code: status.code(),
            }
        }
        Err(e) => {
            warn!("Cannot run {}: {}; ignoring", tool, e);
            EjectOutcome::Unavailable(e.to_string())
        }
    }
}
