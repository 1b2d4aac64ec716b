//! Error types for the threadgate domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.
//!
//! Only thread-level, store-level and offload-level faults exist as errors.
//! An unreadable file or an item that does not fit the token budget is an
//! annotation on the reconstruction result, never an `Error`.

use thiserror::Error;

/// The top-level error type for all threadgate operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Thread lifecycle errors ---
    #[error("Thread error: {0}")]
    Thread(#[from] ThreadError),

    // --- Backing store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Large-payload offload errors ---
    #[error("Offload error: {0}")]
    Offload(#[from] OffloadError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Unknown or expired continuation id. The caller has to start over.
    pub fn is_thread_not_found(&self) -> bool {
        matches!(self, Error::Thread(ThreadError::NotFound { .. }))
    }

    /// Transient infrastructure fault; the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Store(
                StoreError::Unavailable(_)
                    | StoreError::Timeout { .. }
                    | StoreError::Contention { .. }
            )
        )
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ThreadError {
    /// Never created, or expired. Callers cannot tell which.
    #[error("Conversation thread {id} not found or expired; start a new conversation")]
    NotFound { id: String },

    #[error("Conversation thread {id} reached its limit of {limit} turns; start a new conversation")]
    TurnLimitReached { id: String, limit: usize },
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("Concurrent writers on thread {id}: gave up after {attempts} attempts")]
    Contention { id: String, attempts: u32 },

    #[error("Stored record for thread {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum OffloadError {
    #[error("Failed to write oversized prompt to {path}: {reason}")]
    WriteFailed { path: String, reason: String },
}
