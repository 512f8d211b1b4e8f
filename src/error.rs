//! Error types for the coordination layer
//!
//! Two lock failures are part of the normal API surface and must be matched
//! explicitly by callers: `LockExists` (recoverable, retry with backoff) and
//! `NotLockOwner` (caller bug or ownership already lost, never retried).
//! Transport errors are propagated as-is; this layer adds no retry of its own
//! except on the idempotent ack path.

use thiserror::Error;

/// Result type alias using the coordination Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the coordination layer
#[derive(Error, Debug)]
pub enum Error {
    /// Acquire failed because the key is already held. Recoverable: the
    /// caller decides whether to retry or back off.
    #[error("Lock already held: {key}")]
    LockExists { key: String },

    /// Release attempted with a token that does not match the current owner.
    /// Not retried: either a caller bug or ownership expired underneath us.
    #[error("Not the owner of lock {key} (token {token})")]
    NotLockOwner { key: String, token: String },

    /// Transport/connection error from the backing store
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Header blob could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error returned by a caller-supplied entry handler
    #[error("Handler error: {0}")]
    Handler(anyhow::Error),

    /// Batched acknowledgment still failing after bounded retries
    #[error("Ack failed on {topic} after {attempts} attempts: {source}")]
    AckFailed {
        topic: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Operation attempted on a closed consumer or listener
    #[error("Consumer is closed")]
    Closed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for the two expected lock error kinds
    pub fn is_lock_error(&self) -> bool {
        matches!(self, Error::LockExists { .. } | Error::NotLockOwner { .. })
    }
}
