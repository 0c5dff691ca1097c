//! Filesystem-backed run ledger.
//!
//! Layout under the ledger root:
//!
//! ```text
//! <root>/<run_id>/run.json      RunRecord, rewritten on every status change
//! <root>/<run_id>/events.jsonl  one RunEvent per line, append-only
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::*;

const RECORD_FILE: &str = "run.json";
const EVENTS_FILE: &str = "events.jsonl";

/// Run ledger persisted as JSON files below a root directory.
#[derive(Debug)]
pub struct FsRunLedger {
    root: PathBuf,
    // Serializes read-modify-write cycles on run.json.
    write_lock: Mutex<()>,
}

impl FsRunLedger {
    /// Open (and create if needed) a ledger rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Root directory of this ledger.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(&run_id.0)
    }

    async fn read_record(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let path = self.run_dir(run_id).join(RECORD_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::RunNotFound {
                    run_id: run_id.0.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write_record(&self, record: &RunRecord) -> StorageResult<()> {
        let dir = self.run_dir(&record.run_id);
        let tmp = dir.join(format!("{RECORD_FILE}.tmp"));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        tokio::fs::rename(&tmp, dir.join(RECORD_FILE)).await?;
        Ok(())
    }

    async fn read_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        let path = self.run_dir(run_id).join(EVENTS_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(StorageError::from))
            .collect()
    }

    async fn finish(
        &self,
        run_id: &RunId,
        status: RunStatus,
        summary: RunSummary,
    ) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.read_record(run_id).await?;
        ensure_running(&record)?;
        record.status = status;
        record.summary = Some(summary);
        record.completed_at = Some(Utc::now());
        self.write_record(&record).await
    }
}

#[async_trait]
impl RunLedger for FsRunLedger {
    async fn create_run(
        &self,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId> {
        let run_id = RunId::new();
        tokio::fs::create_dir_all(self.run_dir(&run_id)).await?;
        let record = RunRecord {
            run_id: run_id.clone(),
            spec_digest: spec_digest.clone(),
            metadata,
            status: RunStatus::Running,
            summary: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.write_record(&record).await?;
        debug!(run_id = %run_id, root = %self.root.display(), "created run");
        Ok(run_id)
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let record = self.read_record(run_id).await?;
        ensure_running(&record)?;
        let last = self.read_events(run_id).await?.last().map(|e| e.seq);
        ensure_next_seq(run_id, last, event.seq)?;

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_dir(run_id).join(EVENTS_FILE))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Completed, summary).await
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Failed, summary).await
    }

    async fn cancel_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Cancelled, summary).await
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        self.read_record(run_id).await
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        // Distinguish "no events yet" from "no such run".
        self.read_record(run_id).await?;
        self.read_events(run_id).await
    }

    async fn list_runs(
        &self,
        spec_digest: Option<&ContentDigest>,
    ) -> StorageResult<Vec<RunRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let run_id = RunId(entry.file_name().to_string_lossy().into_owned());
            match self.read_record(&run_id).await {
                Ok(record) => {
                    if spec_digest.map(|d| record.spec_digest == *d).unwrap_or(true) {
                        records.push(record);
                    }
                }
                Err(StorageError::RunNotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}
