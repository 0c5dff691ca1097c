//! Parallel fan-out of independent jobs.

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};

use crate::error::CiResult;
use crate::job::{JobResult, JobSpec};
use crate::obs;
use crate::release::target::TargetTriple;

/// Matrix execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixConfig {
    /// Cancel jobs that have not started yet once one job fails.
    pub fail_fast: bool,

    /// Maximum number of jobs running at once.
    pub max_parallel: usize,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            fail_fast: false,
            max_parallel: 4,
        }
    }
}

/// What happened to one job of a matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatrixJobOutcome {
    /// The job ran to completion (passed or failed).
    Finished(JobResult),

    /// The job could not be carried out (ledger error, panic).
    Errored {
        job: String,
        target: Option<TargetTriple>,
        error: String,
    },

    /// Not started because a sibling failed under `fail_fast`. `run_id` is
    /// the ledger run recording the cancellation, once the caller records one.
    Cancelled {
        job: String,
        target: Option<TargetTriple>,
        #[serde(default)]
        run_id: Option<String>,
    },
}

impl MatrixJobOutcome {
    pub fn job_name(&self) -> &str {
        match self {
            MatrixJobOutcome::Finished(result) => &result.job_name,
            MatrixJobOutcome::Errored { job, .. } | MatrixJobOutcome::Cancelled { job, .. } => job,
        }
    }

    pub fn target(&self) -> Option<&TargetTriple> {
        match self {
            MatrixJobOutcome::Finished(result) => result.target.as_ref(),
            MatrixJobOutcome::Errored { target, .. }
            | MatrixJobOutcome::Cancelled { target, .. } => target.as_ref(),
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self, MatrixJobOutcome::Finished(result) if result.passed())
    }

    pub fn result(&self) -> Option<&JobResult> {
        match self {
            MatrixJobOutcome::Finished(result) => Some(result),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MatrixJobOutcome::Finished(result) if result.passed() => "passed",
            MatrixJobOutcome::Finished(_) => "failed",
            MatrixJobOutcome::Errored { .. } => "errored",
            MatrixJobOutcome::Cancelled { .. } => "cancelled",
        }
    }
}

/// Outcomes of every job of a matrix, in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixResult {
    pub jobs: Vec<MatrixJobOutcome>,
}

impl MatrixResult {
    pub fn passed(&self) -> Vec<&MatrixJobOutcome> {
        self.jobs.iter().filter(|j| j.passed()).collect()
    }

    pub fn failed(&self) -> Vec<&MatrixJobOutcome> {
        self.jobs.iter().filter(|j| !j.passed()).collect()
    }

    pub fn all_passed(&self) -> bool {
        self.jobs.iter().all(MatrixJobOutcome::passed)
    }
}

/// Runs independent jobs concurrently.
pub struct MatrixRunner;

impl MatrixRunner {
    /// Spawn one task per job (at most `max_parallel` running) and wait for
    /// all of them.
    ///
    /// A failing, erroring or panicking job never affects its siblings unless
    /// `fail_fast` is set, in which case jobs that have not started yet are
    /// reported cancelled. Jobs already running always finish.
    pub async fn run<F, Fut>(jobs: Vec<JobSpec>, config: &MatrixConfig, executor: F) -> MatrixResult
    where
        F: Fn(JobSpec) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CiResult<JobResult>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(config.max_parallel.max(1)));
        let (fail_tx, fail_rx) = watch::channel(false);
        let fail_tx = Arc::new(fail_tx);
        let executor = Arc::new(executor);
        let fail_fast = config.fail_fast;

        let tasks = jobs.into_iter().map(|job| {
            let name = job.name.clone();
            let target = job.target.clone();
            let semaphore = semaphore.clone();
            let executor = executor.clone();
            let fail_rx = fail_rx.clone();
            let fail_tx = fail_tx.clone();

            let handle = tokio::spawn({
                let name = name.clone();
                let target = target.clone();
                async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return MatrixJobOutcome::Cancelled {
                                job: name,
                                target,
                                run_id: None,
                            }
                        }
                    };
                    if fail_fast && *fail_rx.borrow() {
                        debug!(job = %name, "cancelled before start");
                        return MatrixJobOutcome::Cancelled {
                            job: name,
                            target,
                            run_id: None,
                        };
                    }
                    let outcome = match (*executor)(job).await {
                        Ok(result) => MatrixJobOutcome::Finished(result),
                        Err(e) => MatrixJobOutcome::Errored {
                            job: name,
                            target,
                            error: e.to_string(),
                        },
                    };
                    if !outcome.passed() {
                        fail_tx.send_replace(true);
                    }
                    outcome
                }
            });

            async move {
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(job = %name, error = %e, "job task failed");
                        MatrixJobOutcome::Errored {
                            job: name,
                            target,
                            error: format!("job task failed: {e}"),
                        }
                    }
                };
                obs::emit_matrix_job_finished(outcome.job_name(), outcome.label());
                outcome
            }
        });

        MatrixResult {
            jobs: join_all(tasks).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::error::CiError;
    use crate::job::JobOutcome;
    use crate::trigger::TriggerEvent;

    fn jobs(names: &[&str]) -> Vec<JobSpec> {
        names
            .iter()
            .map(|n| JobSpec {
                name: n.to_string(),
                workflow: "release".to_string(),
                trigger: TriggerEvent::release_created("v1", None, "abc"),
                target: None,
                steps: Vec::new(),
                env: BTreeMap::new(),
            })
            .collect()
    }

    fn result(name: &str, outcome: JobOutcome) -> JobResult {
        JobResult {
            run_id: format!("run-{name}"),
            job_name: name.to_string(),
            target: None,
            outcome,
            steps: Vec::new(),
            duration_ms: 0,
            artifacts: None,
            published: None,
        }
    }

    #[tokio::test]
    async fn failure_does_not_cancel_siblings() {
        let config = MatrixConfig::default();
        let out = MatrixRunner::run(jobs(&["a", "b", "c"]), &config, |job| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let outcome = if job.name == "a" {
                JobOutcome::Failed
            } else {
                JobOutcome::Passed
            };
            Ok(result(&job.name, outcome))
        })
        .await;

        let names: Vec<&str> = out.jobs.iter().map(|j| j.job_name()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(out.passed().len(), 2);
        assert_eq!(out.failed().len(), 1);
        assert!(!out.all_passed());
    }

    #[tokio::test]
    async fn panic_is_isolated_to_its_job() {
        let out = MatrixRunner::run(jobs(&["boom", "ok"]), &MatrixConfig::default(), |job| async move {
            if job.name == "boom" {
                panic!("job exploded");
            }
            Ok(result(&job.name, JobOutcome::Passed))
        })
        .await;

        assert!(matches!(out.jobs[0], MatrixJobOutcome::Errored { .. }));
        assert!(out.jobs[1].passed());
    }

    #[tokio::test]
    async fn executor_error_becomes_errored_outcome() {
        let out = MatrixRunner::run(jobs(&["a"]), &MatrixConfig::default(), |_job| async move {
            Err::<JobResult, _>(CiError::Join("ledger unavailable".to_string()))
        })
        .await;
        assert_eq!(out.jobs[0].label(), "errored");
    }

    #[tokio::test]
    async fn max_parallel_bounds_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let config = MatrixConfig {
            fail_fast: false,
            max_parallel: 2,
        };
        let (r, p) = (running.clone(), peak.clone());
        let out = MatrixRunner::run(jobs(&["a", "b", "c", "d", "e"]), &config, move |job| {
            let running = r.clone();
            let peak = p.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(result(&job.name, JobOutcome::Passed))
            }
        })
        .await;

        assert!(out.all_passed());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn fail_fast_cancels_jobs_not_yet_started() {
        let config = MatrixConfig {
            fail_fast: true,
            max_parallel: 1,
        };
        let out = MatrixRunner::run(jobs(&["a", "b", "c"]), &config, |job| async move {
            Ok(result(&job.name, JobOutcome::Failed))
        })
        .await;

        let count = |label: &str| out.jobs.iter().filter(|j| j.label() == label).count();
        assert_eq!(count("failed"), 1);
        assert_eq!(count("cancelled"), 2);
    }
}
