//! Error types for the guarded transfer engine.
//!
//! `EngineError` covers conditions that concern the transfer as a whole or a
//! single selected entry. File-level copy failures are recorded on the
//! `FileItem` they belong to and surface in the final summary instead.
//! `ScanError` is what a content inspector reports; the classifier resolves
//! those locally into verdicts so they never reach the decision engine.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::feedback::FeedbackState;

/// Errors raised by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Source root does not exist
    #[error("source directory not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// A request was rejected before any work started
    #[error("invalid transfer request for {}: {reason}", path.display())]
    InvalidRequest { path: PathBuf, reason: String },

    /// A selected entry vanished or could not be listed
    #[error("failed to enumerate {}", path.display())]
    Enumeration {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to read from a source file
    #[error("failed to read file: {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write a destination file
    #[error("failed to write file: {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to delete a moved source file
    #[error("failed to delete source file: {}", path.display())]
    Delete {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to create a destination directory
    #[error("failed to create directory: {}", path.display())]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Destination cannot hold the selected files
    #[error("not enough space at {}: {required} bytes required, {available} available", path.display())]
    NoSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    /// Free space of the destination could not be determined
    #[error("unable to determine free space for {}: {reason}", path.display())]
    FreeSpaceUnavailable { path: PathBuf, reason: String },

    /// The user cancelled the warning review
    #[error("transfer cancelled during review")]
    UserCancelledReview,

    /// A verdict was assigned twice to the same file
    #[error("verdict already assigned for {}", path.display())]
    VerdictAlreadyAssigned { path: PathBuf },

    /// The feedback state machine was asked to move backwards or skip
    #[error("invalid feedback transition from {from:?} to {to:?}")]
    InvalidTransition { from: FeedbackState, to: FeedbackState },

    /// The engine was built without a required collaborator
    #[error("engine configuration error: {message}")]
    Configuration { message: String },

    /// Configuration file could not be read or parsed
    #[error("failed to load configuration from {}: {message}", path.display())]
    ConfigLoad { path: PathBuf, message: String },

    /// A blocking task panicked or was cancelled by the runtime
    #[error("background task failed: {message}")]
    Task { message: String },
}

impl EngineError {
    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<u32> {
        match self {
            Self::Enumeration { source, .. }
            | Self::Read { source, .. }
            | Self::Write { source, .. }
            | Self::Delete { source, .. }
            | Self::DirectoryCreation { source, .. } => source.raw_os_error().map(|e| e as u32),
            _ => None,
        }
    }

    /// True when the underlying I/O error means the entry no longer exists.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::SourceNotFound { .. } => true,
            Self::Enumeration { source, .. } | Self::Read { source, .. } => {
                source.kind() == io::ErrorKind::NotFound
            }
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::Task {
            message: err.to_string(),
        }
    }
}

/// Errors reported by a content inspector for one delegate.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The inspector did not finish within the configured timeout.
    #[error("scan of {} timed out after {elapsed:?}", path.display())]
    Timeout { path: PathBuf, elapsed: Duration },

    /// The inspector could not produce a verdict.
    #[error("scan of {} failed on '{inspector}': {reason}", path.display())]
    Failure {
        path: PathBuf,
        inspector: String,
        reason: String,
    },

    /// The delegate was cancelled before it reported.
    #[error("scan of {} was cancelled", path.display())]
    Cancelled { path: PathBuf },
}

impl ScanError {
    /// Path of the entry the failed scan was about.
    pub fn path(&self) -> &PathBuf {
        match self {
            Self::Timeout { path, .. } | Self::Failure { path, .. } | Self::Cancelled { path } => {
                path
            }
        }
    }

    /// Create a failure error.
    pub fn failure(
        path: impl Into<PathBuf>,
        inspector: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Failure {
            path: path.into(),
            inspector: inspector.into(),
            reason: reason.into(),
        }
    }
}
