//! Unified error type for the rsext toolbox.
//!
//! All crates funnel their failures into [`Error`]. The stage driver converts
//! errors into job state at the executor boundary via
//! [`Error::failure_kind`] and [`Error::is_cancelled`]; nothing propagates to
//! the scheduler.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unified error type covering all failure modes in rsext.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The source could not be read or is not a valid media/subtitle file.
    #[error("Scan error: {0}")]
    Scan(String),

    /// A processing stage failed.
    #[error("Processing error [{stage}]: {message}")]
    Processing {
        /// The stage that failed.
        stage: String,
        /// Human-readable error description.
        message: String,
    },

    /// An external tool (ffmpeg, ffprobe) returned an error.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// Work stopped because its cancellation token was signalled.
    #[error("cancelled")]
    Cancelled,

    /// The output hit a size or token limit and is incomplete.
    #[error("Truncated result: {0}")]
    Truncated(String),

    /// A sidecar read, write, or delete failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "job", "version").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Input data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The operation conflicts with the current job state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Classification of a terminal job failure, stored on the job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Unreadable or corrupt source.
    Scan,
    /// A backend or service call failed.
    Processing,
    /// Output was cut off; a retry with more batches may succeed.
    Truncated,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scan => write!(f, "scan"),
            Self::Processing => write!(f, "processing"),
            Self::Truncated => write!(f, "truncated"),
        }
    }
}

impl Error {
    /// Whether this error is a cooperative cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Map this error onto the job failure taxonomy.
    ///
    /// Returns `None` for cancellation, which is not a failure.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Error::Cancelled => None,
            Error::Scan(_) => Some(FailureKind::Scan),
            Error::Truncated(_) => Some(FailureKind::Truncated),
            _ => Some(FailureKind::Processing),
        }
    }

    /// Convenience constructor for [`Error::Scan`].
    pub fn scan(message: impl Into<String>) -> Self {
        Error::Scan(message.into())
    }

    /// Convenience constructor for [`Error::Processing`].
    pub fn processing(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Processing {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Persistence`].
    pub fn persistence(message: impl Into<String>) -> Self {
        Error::Persistence(message.into())
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn scan_display_and_kind() {
        let err = Error::scan("corrupt header");
        assert_eq!(err.to_string(), "Scan error: corrupt header");
        assert_eq!(err.failure_kind(), Some(FailureKind::Scan));
    }

    #[test]
    fn processing_display() {
        let err = Error::processing("extract", "ffmpeg exited 1");
        assert_eq!(
            err.to_string(),
            "Processing error [extract]: ffmpeg exited 1"
        );
        assert_eq!(err.failure_kind(), Some(FailureKind::Processing));
    }

    #[test]
    fn tool_errors_are_processing_failures() {
        let err = Error::tool("ffmpeg", "exit code 1");
        assert_eq!(err.to_string(), "Tool error [ffmpeg]: exit code 1");
        assert_eq!(err.failure_kind(), Some(FailureKind::Processing));
    }

    #[test]
    fn cancelled_is_not_a_failure() {
        let err = Error::Cancelled;
        assert!(err.is_cancelled());
        assert_eq!(err.failure_kind(), None);
    }

    #[test]
    fn truncated_kind() {
        let err = Error::Truncated("3 of 10 lines returned".into());
        assert_eq!(err.failure_kind(), Some(FailureKind::Truncated));
    }

    #[test]
    fn io_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err = Error::from(io_err);
        assert_matches!(err, Error::Io { .. });
    }

    #[test]
    fn not_found_display() {
        let err = Error::not_found("job", "abc-123");
        assert_eq!(err.to_string(), "job not found: abc-123");
    }
}
