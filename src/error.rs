//! Error types for the auraddx library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ConvertError`], **fatal for the call**: the conversion did not
//!   produce an artifact. Returned as `Err(ConvertError)` from
//!   [`crate::convert::FormatConverter::convert`] and the session helpers.
//!
//! * [`CleanupError`], **non-fatal**: one file could not be reclaimed
//!   during a sweep. Stored in [`crate::sweep::SweepReport`] and logged,
//!   never returned as `Err`, so a sweep always makes maximal progress.
//!
//! Every error maps onto one [`ErrorKind`], which also decides the host's
//! exit status.

use crate::format::FormatTag;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use texconv_auto::ProvisionError;
use thiserror::Error;

// ── Exit codes ───────────────────────────────────────────────────────────────

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_INVALID_ARGUMENT: u8 = 2;
pub const EXIT_CONVERSION_ERROR: u8 = 3;
pub const EXIT_MISSING_DEPENDENCY: u8 = 4;

/// Coarse classification of every failure the core can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected before any process was started.
    Validation,
    /// The converter could not be provisioned. Fatal, never retried.
    Configuration,
    /// The converter ran and reported failure.
    Process,
    /// The converter reported success but the artifact is missing.
    Postcondition,
    /// A single artifact could not be reclaimed. Absorbed by the sweep.
    Cleanup,
}

impl ErrorKind {
    /// Process exit status a host should use when a call fails with this kind.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Validation => EXIT_INVALID_ARGUMENT,
            Self::Configuration => EXIT_MISSING_DEPENDENCY,
            Self::Process | Self::Postcondition => EXIT_CONVERSION_ERROR,
            Self::Cleanup => EXIT_SUCCESS,
        }
    }

    /// Whether the failure happens inside the background part of a
    /// conversion and is therefore also announced on the error channel.
    pub fn is_announced(self) -> bool {
        matches!(self, Self::Process | Self::Postcondition)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Configuration => "configuration",
            Self::Process => "process",
            Self::Postcondition => "postcondition",
            Self::Cleanup => "cleanup",
        };
        f.write_str(s)
    }
}

/// All errors a conversion call can return.
#[derive(Debug, Error)]
pub enum ConvertError {
    // ── Validation ────────────────────────────────────────────────────────
    /// The requested target is not target-eligible in the registry.
    #[error("Unsupported target format {format}: it cannot be produced by the converter")]
    UnsupportedTarget { format: FormatTag },

    /// The source extension does not resolve to a source-eligible format.
    #[error("Unsupported source '{path}': expected one of the registered texture extensions")]
    UnsupportedSource { path: PathBuf },

    /// The source file does not exist.
    #[error("Source file not found: '{path}'")]
    SourceNotFound { path: PathBuf },

    /// A picture that needs no conversion could not be opened for display.
    #[error("Picture '{path}' could not be opened: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Configuration ─────────────────────────────────────────────────────
    /// The converter executable could not be provisioned.
    #[error("Converter unavailable: {0}")]
    Configuration(#[from] ProvisionError),

    /// The output directory could not be created.
    #[error("Output directory '{path}' could not be created: {source}")]
    OutputDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Process ───────────────────────────────────────────────────────────
    /// The converter could not be started at all (e.g. it was deleted
    /// after provisioning).
    #[error("Failed to launch converter '{program}': {source}")]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The converter exited with a nonzero status.
    #[error("Converter failed (exit code {}): {}", exit_code_label(.exit_code), .diagnostic)]
    Process {
        exit_code: Option<i32>,
        /// Standard error of the converter, verbatim.
        diagnostic: String,
    },

    // ── Postcondition ─────────────────────────────────────────────────────
    /// The converter exited 0 but the expected artifact does not exist.
    #[error("Converter reported success but '{expected}' was not produced")]
    Postcondition { expected: PathBuf },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (a background task panicked).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConvertError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedTarget { .. }
            | Self::UnsupportedSource { .. }
            | Self::SourceNotFound { .. }
            | Self::Unreadable { .. } => ErrorKind::Validation,
            Self::Configuration(_) | Self::OutputDirectory { .. } | Self::InvalidConfig(_) => {
                ErrorKind::Configuration
            }
            Self::Launch { .. } | Self::Process { .. } | Self::Internal(_) => ErrorKind::Process,
            Self::Postcondition { .. } => ErrorKind::Postcondition,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.kind().exit_code()
    }

    /// Converter diagnostic text, for process failures.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::Process { diagnostic, .. } => Some(diagnostic),
            _ => None,
        }
    }
}

fn exit_code_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "none, killed by signal".to_string(), |c| c.to_string())
}

/// A non-fatal failure to reclaim one file during a sweep.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("Failed to reclaim '{path}': {reason}")]
pub struct CleanupError {
    pub path: PathBuf,
    pub reason: String,
}

impl CleanupError {
    pub fn new(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Self {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Cleanup
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_error_keeps_stderr_verbatim() {
        let e = ConvertError::Process {
            exit_code: Some(1),
            diagnostic: "bad header\n".into(),
        };
        assert_eq!(e.kind(), ErrorKind::Process);
        assert_eq!(e.diagnostic(), Some("bad header\n"));
        let msg = e.to_string();
        assert!(msg.contains("exit code 1"), "got: {msg}");
        assert!(msg.contains("bad header"), "got: {msg}");
    }

    #[test]
    fn signal_termination_display() {
        let e = ConvertError::Process {
            exit_code: None,
            diagnostic: String::new(),
        };
        assert!(e.to_string().contains("killed by signal"));
    }

    #[test]
    fn kinds_map_to_exit_codes() {
        let validation = ConvertError::UnsupportedTarget {
            format: FormatTag::Ddx,
        };
        let configuration = ConvertError::Configuration(ProvisionError::Missing {
            path: "texconv".into(),
        });
        let postcondition = ConvertError::Postcondition {
            expected: "/tmp/photo.png".into(),
        };

        assert_eq!(validation.exit_code(), EXIT_INVALID_ARGUMENT);
        assert_eq!(configuration.exit_code(), EXIT_MISSING_DEPENDENCY);
        assert_eq!(postcondition.exit_code(), EXIT_CONVERSION_ERROR);
        assert!(postcondition.kind().is_announced());
        assert!(!validation.kind().is_announced());
    }

    #[test]
    fn cleanup_error_display() {
        let e = CleanupError::new("/tmp/a.png", "permission denied");
        assert_eq!(e.kind(), ErrorKind::Cleanup);
        assert!(e.to_string().contains("/tmp/a.png"));
        assert!(e.to_string().contains("permission denied"));
    }
}
