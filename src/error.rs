//! Admission Engine Error Types
//!
//! This module defines the error types surfaced by the admission controller,
//! wait queue, and quota storage. Rate-limit and quota denials are *not*
//! errors: they come back as `Decision { allowed: false, .. }` so callers can
//! always branch on the outcome. Errors here are infrastructure failures.

use std::time::Duration;

/// Error types for admission operations
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// Quota storage backend failure
    #[error("Quota storage error: {0}")]
    Storage(#[from] StorageError),

    /// Queued request expired before admission
    #[error("Queued request timed out after {waited:?}")]
    QueueTimeout {
        /// How long the request waited before the deadline fired
        waited: Duration,
    },

    /// Queue is at its configured size limit
    #[error("Wait queue is full: {size} entries (limit {limit})")]
    QueueFull { size: usize, limit: usize },

    /// Queue shut down while the request was waiting
    #[error("Wait queue is shut down")]
    QueueClosed,

    /// Tier name not present in configuration
    #[error("Unknown user tier: {0}")]
    UnknownTier(String),
}

/// Error types for pluggable quota storage backends
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Backend-specific failure (connection, I/O, ...)
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Store used after `close()`
    #[error("Storage is closed")]
    Closed,
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
