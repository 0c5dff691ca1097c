//! Sequential job execution and run recording.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use forgeflow_state::{RunLedger, RunMetadata};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn, Instrument};

use crate::context::JobContext;
use crate::error::CiResult;
use crate::identity::WorkflowIdentity;
use crate::obs;
use crate::recording::{kinds, RunRecorder};
use crate::release::package::ArtifactSet;
use crate::release::publish::PublishedAsset;
use crate::release::target::TargetTriple;
use crate::runner::{StepOutcome, StepResult, StepRunner};
use crate::step::{StepAction, StepConfig};
use crate::trigger::TriggerEvent;

const SKIP_DISABLED: &str = "disabled";
const SKIP_AFTER_FAILURE: &str = "previous step failed";
const SKIP_CANCELLED: &str = "cancelled";

/// One unit of work: an ordered list of steps in a fresh environment.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Job name, e.g. `ci` or `release (x86_64-apple-darwin)`.
    pub name: String,

    /// Workflow the job was planned from.
    pub workflow: String,

    pub trigger: TriggerEvent,

    /// Matrix target, for release jobs.
    pub target: Option<TargetTriple>,

    pub steps: Vec<StepConfig>,

    /// Job-level environment visible to every step.
    pub env: BTreeMap<String, String>,
}

impl JobSpec {
    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name.clone()).collect()
    }

    /// Whether any step attaches artifacts to a release.
    pub fn publishes(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s.action, StepAction::CompileAndRelease(_)))
    }

    pub fn identity(&self) -> WorkflowIdentity {
        WorkflowIdentity::new(
            &self.workflow,
            &self.step_names(),
            self.trigger.revision(),
            self.target.as_ref(),
        )
    }

    fn run_metadata(&self, identity: &WorkflowIdentity) -> RunMetadata {
        RunMetadata {
            revision: Some(identity.revision.clone()),
            job_name: self.name.clone(),
            tags: json!({
                "workflow": &self.workflow,
                "trigger": self.trigger.kind(),
                "target": self.target.as_ref().map(|t| t.as_str()),
                "steps": &identity.step_names,
            }),
        }
    }
}

/// Final state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Passed,
    Failed,
}

/// Result of a complete job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// Ledger run that recorded this job.
    pub run_id: String,

    pub job_name: String,

    pub target: Option<TargetTriple>,

    pub outcome: JobOutcome,

    /// One entry per declared step, in order.
    pub steps: Vec<StepResult>,

    pub duration_ms: u64,

    /// Artifacts built by the job, if it released anything.
    pub artifacts: Option<ArtifactSet>,

    /// Where the job's release asset was published.
    #[serde(default)]
    pub published: Option<PublishedAsset>,
}

impl JobResult {
    pub fn passed(&self) -> bool {
        self.outcome == JobOutcome::Passed
    }

    /// The step that failed the job.
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.failed())
    }

    /// Number of steps that actually executed.
    pub fn executed_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.outcome != StepOutcome::Skipped)
            .count()
    }
}

/// Runs a job's steps in order; the first failure aborts the job.
pub struct JobRunner;

impl JobRunner {
    /// Execute `spec` in `ctx` and record it as one run in `ledger`.
    ///
    /// Each executed step produces a `step_started` event followed by
    /// `step_passed` or `step_failed`; steps that do not run produce
    /// `step_skipped`. The run is completed when every step passed and
    /// failed otherwise.
    pub async fn run(
        ledger: Arc<dyn RunLedger>,
        spec: &JobSpec,
        ctx: &JobContext,
    ) -> CiResult<JobResult> {
        let span = obs::job_span(&spec.workflow, &spec.name);
        Self::run_inner(ledger, spec, ctx).instrument(span).await
    }

    async fn run_inner(
        ledger: Arc<dyn RunLedger>,
        spec: &JobSpec,
        ctx: &JobContext,
    ) -> CiResult<JobResult> {
        let start = Instant::now();
        let identity = spec.identity();
        let metadata = spec.run_metadata(&identity);
        let mut recorder = RunRecorder::start(ledger, &identity.spec_digest(), metadata).await?;
        let run_id = recorder.run_id().to_string();
        info!(run_id = %run_id, revision = %identity.revision, "starting job");

        let mut results = Vec::with_capacity(spec.steps.len());
        let mut artifacts = None;
        let mut published = None;
        let mut failed_step: Option<String> = None;

        for config in &spec.steps {
            let skip_reason = if !config.enabled {
                Some(SKIP_DISABLED)
            } else if failed_step.is_some() {
                Some(SKIP_AFTER_FAILURE)
            } else {
                None
            };
            if let Some(reason) = skip_reason {
                recorder
                    .record(
                        kinds::STEP_SKIPPED,
                        json!({ "step_name": &config.name, "reason": reason }),
                    )
                    .await?;
                results.push(StepResult::skipped(&config.name, reason));
                continue;
            }

            let seq = recorder
                .record(
                    kinds::STEP_STARTED,
                    json!({
                        "step_name": &config.name,
                        "action": config.describe(),
                        "timeout_secs": config.timeout_secs,
                    }),
                )
                .await?;
            obs::emit_step_started(&run_id, &config.name, seq);

            let step_start = Instant::now();
            let result = match StepRunner::execute(config, ctx).await {
                Ok(r) => r,
                Err(e) => {
                    // Execution error (spawn, timeout, build, publish): the step failed.
                    warn!(step = %config.name, error = %e, "step errored");
                    StepResult::errored(
                        &config.name,
                        &e,
                        step_start.elapsed().as_millis() as u64,
                    )
                }
            };

            if result.passed() {
                recorder
                    .record(
                        kinds::STEP_PASSED,
                        json!({
                            "step_name": &config.name,
                            "exit_code": result.exit_code,
                            "stdout": &result.stdout,
                            "stderr": &result.stderr,
                            "duration_ms": result.duration_ms,
                            "artifact": result.artifacts.as_ref().map(|a| a.asset_name()),
                        }),
                    )
                    .await?;
                obs::emit_step_finished(&run_id, &config.name, "passed", result.duration_ms);
            } else {
                let error = match result.exit_code {
                    Some(code) => format!("Step '{}' exited with code {}", config.name, code),
                    None => format!("Step '{}' errored: {}", config.name, result.stderr),
                };
                recorder
                    .record(
                        kinds::STEP_FAILED,
                        json!({
                            "step_name": &config.name,
                            "exit_code": result.exit_code,
                            "stdout": &result.stdout,
                            "stderr": &result.stderr,
                            "duration_ms": result.duration_ms,
                            "error": error,
                        }),
                    )
                    .await?;
                obs::emit_step_finished(&run_id, &config.name, "failed", result.duration_ms);
                failed_step = Some(config.name.clone());
            }

            if let Some(set) = &result.artifacts {
                artifacts = Some(set.clone());
            }
            if let Some(asset) = &result.published {
                published = Some(asset.clone());
            }
            results.push(result);
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let outcome = match &failed_step {
            None => {
                recorder.finish_ok(duration_ms).await?;
                JobOutcome::Passed
            }
            Some(step) => {
                info!(run_id = %run_id, step = %step, "job failed");
                recorder.finish_err(duration_ms).await?;
                JobOutcome::Failed
            }
        };

        Ok(JobResult {
            run_id,
            job_name: spec.name.clone(),
            target: spec.target.clone(),
            outcome,
            steps: results,
            duration_ms,
            artifacts,
            published,
        })
    }

    /// Record `spec` as a cancelled run without executing it: every step is
    /// `step_skipped` with reason `cancelled`. Returns the run id.
    pub async fn record_cancelled(ledger: Arc<dyn RunLedger>, spec: &JobSpec) -> CiResult<String> {
        let identity = spec.identity();
        let metadata = spec.run_metadata(&identity);
        let mut recorder = RunRecorder::start(ledger, &identity.spec_digest(), metadata).await?;
        for config in &spec.steps {
            recorder
                .record(
                    kinds::STEP_SKIPPED,
                    json!({ "step_name": &config.name, "reason": SKIP_CANCELLED }),
                )
                .await?;
        }
        let run_id = recorder.run_id().to_string();
        info!(run_id = %run_id, job = %spec.name, "job cancelled before start");
        recorder.cancel(0).await?;
        Ok(run_id)
    }
}
