//! Storage trait definitions for forgeflow
//!
//! A pipeline run (one job bound to one trigger event) is persisted as a
//! `RunRecord` plus an ordered list of `RunEvent`s. The ledger is
//! backend-agnostic; in-memory and filesystem implementations live in
//! `fakes` and `fs_ledger`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// RunLedger
// ---------------------------------------------------------------------------

/// Unique identifier for a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata attached to a run at creation time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Source revision the run was triggered for
    pub revision: Option<String>,
    /// Job name (e.g. "ci", "release:x86_64-unknown-linux-musl")
    pub job_name: String,
    /// Arbitrary key-value tags (trigger kind, target triple, parent run)
    pub tags: serde_json::Value,
}

/// A single event in a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Monotonic sequence number within the run
    pub seq: u64,
    /// Event kind (e.g. "step_started", "step_passed", "step_failed")
    pub kind: String,
    /// Event payload
    pub payload: serde_json::Value,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

/// Summary produced when a run completes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Total events recorded
    pub total_events: u64,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Whether the run succeeded
    pub success: bool,
}

/// Status of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Whether the run has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Full run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub spec_digest: ContentDigest,
    pub metadata: RunMetadata,
    pub status: RunStatus,
    pub summary: Option<RunSummary>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Pipeline run ledger.
///
/// Guarantees:
/// - Events are ordered by strictly increasing `seq` within a run.
/// - A run transitions: Running → Completed | Failed | Cancelled (terminal).
/// - Terminal runs are immutable.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Create a new run, returning its unique ID.
    async fn create_run(
        &self,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId>;

    /// Append an event to an active run. Fails if the run is terminal.
    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()>;

    /// Mark a run as completed with a summary.
    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Mark a run as failed with a summary.
    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Mark a run as cancelled.
    async fn cancel_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Retrieve a run record by ID.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;

    /// Retrieve all events for a run, ordered by seq.
    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>>;

    /// List runs, optionally filtered by spec digest, oldest first.
    async fn list_runs(&self, spec_digest: Option<&ContentDigest>)
        -> StorageResult<Vec<RunRecord>>;
}

/// Check that `record` is still running, for use by ledger implementations.
pub(crate) fn ensure_running(record: &RunRecord) -> StorageResult<()> {
    if record.status != RunStatus::Running {
        return Err(StorageError::InvalidRunState {
            run_id: record.run_id.0.clone(),
            status: format!("{:?}", record.status),
            expected: "Running".to_string(),
        });
    }
    Ok(())
}

/// Check that `seq` follows the last recorded sequence number.
pub(crate) fn ensure_next_seq(run_id: &RunId, last: Option<u64>, seq: u64) -> StorageResult<()> {
    match last {
        Some(last) if seq <= last => Err(StorageError::NonMonotonicSeq {
            run_id: run_id.0.clone(),
            seq,
            last,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_try_from_rejects_short_strings() {
        let err = ContentDigest::try_from("abc".to_string()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidDigest { .. }));
    }

    #[test]
    fn digest_try_from_normalizes_case() {
        let upper = ContentDigest::from_bytes(b"x").as_str().to_ascii_uppercase();
        let parsed = ContentDigest::try_from(upper).unwrap();
        assert_eq!(parsed, ContentDigest::from_bytes(b"x"));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn seq_must_increase() {
        let id = RunId::new();
        assert!(ensure_next_seq(&id, None, 1).is_ok());
        assert!(ensure_next_seq(&id, Some(1), 2).is_ok());
        assert!(ensure_next_seq(&id, Some(2), 2).is_err());
    }
}
