//! Error types for the flashing core.
//!
//! Nothing below the [`FlashMachine`](crate::machine::FlashMachine) panics or
//! throws across its boundary: intents fail with a [`FlashError`], and a flash
//! attempt that ran (or tried to run) ends in a classified [`FlashFailure`].
//! Discovery and eject problems are deliberately absent here; they surface as
//! warnings on [`ScanOutcome`](crate::scan::ScanOutcome) and
//! [`EjectOutcome`](crate::eject::EjectOutcome).

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::state::FlashState;

/// Exit codes the elevation wrapper uses for "not authorized" and
/// "dialog dismissed".
pub const AUTH_DENIED_CODES: [i32; 2] = [126, 127];

/// Errors an intent sent to the state machine can fail with.
#[derive(Error, Debug)]
pub enum FlashError {
    /// The image file cannot be read or its size cannot be resolved.
    #[error("Cannot use image {path}: {source}")]
    ImageUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The requested device is not part of the last scan.
    #[error("Unknown device: {0}")]
    UnknownDevice(PathBuf),

    /// The intent is not accepted in the current state.
    #[error("Cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: FlashState,
    },

    /// A transition outside the legal transition table was attempted.
    #[error("Illegal transition: {from} -> {to}")]
    IllegalTransition { from: FlashState, to: FlashState },

    /// An argument for the copy command failed validation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The copy process could not be launched.
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Result type for state machine intents
pub type FlashResult<T> = Result<T, FlashError>;

/// Why a flash attempt did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashFailure {
    /// The copy process never started.
    Spawn(String),
    /// The elevation wrapper refused or the user dismissed it (126/127).
    Authorization { code: i32 },
    /// Any other non-zero exit. Signal deaths are reported as 128 + signal.
    Copy { code: i32 },
    /// The session was torn down while the copy was running.
    Cancelled,
}

impl FlashFailure {
    /// Classify a non-zero exit code of the elevated copy.
    pub fn from_exit_code(code: i32) -> Self {
        if AUTH_DENIED_CODES.contains(&code) {
            FlashFailure::Authorization { code }
        } else {
            FlashFailure::Copy { code }
        }
    }

    /// The user-visible text for this failure.
    pub fn message(&self) -> String {
        match self {
            FlashFailure::Spawn(reason) => format!("Failed to start flashing: {}", reason),
            FlashFailure::Authorization { .. } => "Authentication failed or cancelled.".to_string(),
            FlashFailure::Copy { code } => format!("Flashing failed with exit code: {}", code),
            FlashFailure::Cancelled => "Flashing was cancelled.".to_string(),
        }
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, FlashFailure::Authorization { .. })
    }
}

impl std::fmt::Display for FlashFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

impl From<&FlashError> for FlashFailure {
    fn from(err: &FlashError) -> Self {
        FlashFailure::Spawn(err.to_string())
    }
}
