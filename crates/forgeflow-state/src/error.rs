//! Error types for forgeflow-state

use thiserror::Error;

/// Errors raised by run ledger implementations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Run does not exist in the ledger
    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// Run is not in the state required by the operation
    #[error("Run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    /// Event sequence numbers must strictly increase within a run
    #[error("Run {run_id}: event seq {seq} is not greater than {last}")]
    NonMonotonicSeq { run_id: String, seq: u64, last: u64 },

    /// Digest string is not 64 hex characters
    #[error("Invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// IO error from a filesystem-backed ledger
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
