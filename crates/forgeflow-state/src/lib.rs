//! forgeflow-state: run ledger for pipeline runs
//!
//! Every job forgeflow executes is recorded as one run: a `RunRecord`
//! (identity, metadata, status, summary) plus the ordered `RunEvent`s emitted
//! by its steps.
//!
//! ## Key Components
//!
//! - `RunLedger`: async persistence trait
//! - `MemoryRunLedger`: in-memory implementation
//! - `FsRunLedger`: JSON files on disk, one directory per run

mod error;
pub mod fakes;
pub mod fs_ledger;
pub mod storage_traits;

pub use error::StorageError;
pub use fs_ledger::FsRunLedger;
pub use storage_traits::{
    ContentDigest, RunEvent, RunId, RunLedger, RunMetadata, RunRecord, RunStatus, RunSummary,
    StorageResult,
};
