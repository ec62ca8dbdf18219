//! Error types for logdb
//!
//! Provides a unified error type for all operations.
//!
//! Two classes of failure exist. Recoverable conditions (low disk space for a
//! background merge, shutdown in the middle of a merge) never surface as
//! errors. Everything else is fatal: corrupt persisted state and violated
//! writer contracts are reported as distinct variants so the owner of a
//! partition can terminate with a precise diagnostic.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result type alias using LogDbError
pub type Result<T> = std::result::Result<T, LogDbError>;

/// Unified error type for logdb operations
#[derive(Debug, Error)]
pub enum LogDbError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Persisted State Errors
    // -------------------------------------------------------------------------
    /// Malformed part files, declared counts that do not match what was read,
    /// or ordering violations detected while reading.
    #[error("corrupted data at {path:?}: {message}")]
    Corruption { path: PathBuf, message: String },

    /// Malformed encoded bytes; the stream reader attaches the file path.
    #[error("malformed data: {0}")]
    Decode(String),

    // -------------------------------------------------------------------------
    // Contract Violations
    // -------------------------------------------------------------------------
    /// The caller broke a writer contract (unsorted stream ids, oversized
    /// sections, too many columns).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // -------------------------------------------------------------------------
    // Configuration / Input Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("part or database is closed")]
    Closed,
}

impl LogDbError {
    /// Build a corruption error for the given file or directory
    pub fn corruption(path: impl AsRef<Path>, message: impl Into<String>) -> Self {
        LogDbError::Corruption {
            path: path.as_ref().to_path_buf(),
            message: message.into(),
        }
    }

    /// Attach a file path to a bare decode error
    pub fn with_path(self, path: impl AsRef<Path>) -> Self {
        match self {
            LogDbError::Decode(message) => LogDbError::corruption(path, message),
            other => other,
        }
    }

    /// Errors that must terminate the owning process when raised by a background worker
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LogDbError::Io(_)
                | LogDbError::Corruption { .. }
                | LogDbError::Decode(_)
                | LogDbError::InvariantViolation(_)
                | LogDbError::Serialization(_)
        )
    }
}
