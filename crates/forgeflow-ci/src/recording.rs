//! Records job lifecycle events into a [`RunLedger`].

use std::sync::Arc;

use chrono::Utc;
use forgeflow_state::{
    ContentDigest, RunEvent, RunId, RunLedger, RunMetadata, RunSummary, StorageResult,
};
use serde_json::Value;

use crate::obs;

/// Event kinds written by the job runner.
pub mod kinds {
    pub const STEP_STARTED: &str = "step_started";
    pub const STEP_PASSED: &str = "step_passed";
    pub const STEP_FAILED: &str = "step_failed";
    pub const STEP_SKIPPED: &str = "step_skipped";
}

/// Binds one ledger run and hands out sequence numbers.
///
/// 1. [`RunRecorder::start`] creates the run.
/// 2. [`RunRecorder::record`] appends events with increasing `seq`.
/// 3. [`RunRecorder::finish_ok`], [`RunRecorder::finish_err`] or
///    [`RunRecorder::cancel`] finalizes it.
pub struct RunRecorder {
    ledger: Arc<dyn RunLedger>,
    run_id: RunId,
    seq: u64,
}

impl RunRecorder {
    /// Start a new run in the ledger, returning a recorder bound to that run.
    pub async fn start(
        ledger: Arc<dyn RunLedger>,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<Self> {
        let job_name = metadata.job_name.clone();
        let run_id = ledger.create_run(spec_digest, metadata).await?;
        obs::emit_run_started(&run_id.to_string(), &job_name);
        Ok(Self {
            ledger,
            run_id,
            seq: 0,
        })
    }

    /// Append an event, returning its sequence number.
    pub async fn record(&mut self, kind: &str, payload: Value) -> StorageResult<u64> {
        let seq = self.seq + 1;
        self.ledger
            .append_event(
                &self.run_id,
                RunEvent {
                    seq,
                    kind: kind.to_string(),
                    payload,
                    timestamp: Utc::now(),
                },
            )
            .await?;
        self.seq = seq;
        Ok(seq)
    }

    /// Number of events recorded so far.
    pub fn events_recorded(&self) -> u64 {
        self.seq
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    fn summary(&self, duration_ms: u64, success: bool) -> RunSummary {
        RunSummary {
            total_events: self.seq,
            duration_ms,
            success,
        }
    }

    /// Finalize the run as completed.
    pub async fn finish_ok(self, duration_ms: u64) -> StorageResult<()> {
        obs::emit_run_finished(&self.run_id.to_string(), duration_ms, self.seq, true);
        let summary = self.summary(duration_ms, true);
        self.ledger.complete_run(&self.run_id, summary).await
    }

    /// Finalize the run as failed.
    pub async fn finish_err(self, duration_ms: u64) -> StorageResult<()> {
        obs::emit_run_finished(&self.run_id.to_string(), duration_ms, self.seq, false);
        let summary = self.summary(duration_ms, false);
        self.ledger.fail_run(&self.run_id, summary).await
    }

    /// Finalize the run as cancelled.
    pub async fn cancel(self, duration_ms: u64) -> StorageResult<()> {
        obs::emit_run_finished(&self.run_id.to_string(), duration_ms, self.seq, false);
        let summary = self.summary(duration_ms, false);
        self.ledger.cancel_run(&self.run_id, summary).await
    }
}
