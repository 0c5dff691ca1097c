//! Step execution.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::context::JobContext;
use crate::error::{CiError, CiResult};
use crate::git;
use crate::release::action::compile_and_release;
use crate::release::package::ArtifactSet;
use crate::release::publish::PublishedAsset;
use crate::step::{StepAction, StepConfig};

/// Terminal state of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Passed,
    Failed,
    /// Never executed (disabled, or an earlier step failed).
    Skipped,
}

/// Result of a step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,

    pub outcome: StepOutcome,

    /// Process exit code, when the step ran a process to completion.
    pub exit_code: Option<i32>,

    pub stdout: String,

    pub stderr: String,

    pub duration_ms: u64,

    /// Why a skipped step did not run.
    pub skip_reason: Option<String>,

    /// Artifacts produced by a compile-and-release step.
    pub artifacts: Option<ArtifactSet>,

    /// Where a compile-and-release step published its archive.
    #[serde(default)]
    pub published: Option<PublishedAsset>,
}

impl StepResult {
    pub fn passed(&self) -> bool {
        self.outcome == StepOutcome::Passed
    }

    pub fn failed(&self) -> bool {
        self.outcome == StepOutcome::Failed
    }

    /// A step that never ran.
    pub fn skipped(step_name: &str, reason: &str) -> Self {
        Self {
            step_name: step_name.to_string(),
            outcome: StepOutcome::Skipped,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            skip_reason: Some(reason.to_string()),
            artifacts: None,
            published: None,
        }
    }

    /// A step whose execution itself failed (spawn error, timeout, ...).
    pub fn errored(step_name: &str, error: &CiError, duration_ms: u64) -> Self {
        Self {
            step_name: step_name.to_string(),
            outcome: StepOutcome::Failed,
            exit_code: None,
            stdout: String::new(),
            stderr: error.to_string(),
            duration_ms,
            skip_reason: None,
            artifacts: None,
            published: None,
        }
    }

    fn from_process(step_name: &str, output: ProcessOutput, duration_ms: u64) -> Self {
        let outcome = if output.success() {
            StepOutcome::Passed
        } else {
            StepOutcome::Failed
        };
        Self {
            step_name: step_name.to_string(),
            outcome,
            exit_code: Some(output.exit_code),
            stdout: output.stdout,
            stderr: output.stderr,
            duration_ms,
            skip_reason: None,
            artifacts: None,
            published: None,
        }
    }
}

/// Captured output of a finished child process.
#[derive(Debug, Clone)]
pub(crate) struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Spawn `argv` in `cwd` and wait for it, killing it after `timeout_secs`
/// (0 = no timeout).
pub(crate) async fn run_command(
    step: &str,
    argv: &[String],
    cwd: &Path,
    env: &BTreeMap<String, String>,
    timeout_secs: u64,
) -> CiResult<ProcessOutput> {
    let (exe, args) = argv.split_first().ok_or_else(|| CiError::EmptyCommand {
        step: step.to_string(),
    })?;

    debug!(step = %step, command = %argv.join(" "), cwd = %cwd.display(), "spawning");
    let child = Command::new(exe)
        .args(args)
        .current_dir(cwd)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CiError::Spawn {
            program: exe.clone(),
            source,
        })?;

    let output = if timeout_secs > 0 {
        tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output())
            .await
            .map_err(|_| CiError::Timeout {
                step: step.to_string(),
                secs: timeout_secs,
            })??
    } else {
        child.wait_with_output().await?
    };

    Ok(ProcessOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Executes single steps inside a job context.
pub struct StepRunner;

impl StepRunner {
    /// Execute one step.
    ///
    /// A non-zero exit code is an `Ok` result with a failed outcome; `Err`
    /// means the step could not be carried out at all.
    pub async fn execute(config: &StepConfig, ctx: &JobContext) -> CiResult<StepResult> {
        let start = Instant::now();
        let env = ctx.step_env(&config.env);

        match &config.action {
            StepAction::Command { argv } => {
                let output =
                    run_command(&config.name, argv, ctx.workspace(), &env, config.timeout_secs)
                        .await?;
                Ok(StepResult::from_process(
                    &config.name,
                    output,
                    elapsed_ms(start),
                ))
            }
            StepAction::Checkout => {
                let output = git::checkout(ctx, &env, config.timeout_secs).await?;
                Ok(StepResult::from_process(
                    &config.name,
                    output,
                    elapsed_ms(start),
                ))
            }
            StepAction::CompileAndRelease(params) => {
                let fut = compile_and_release(params, ctx, &env);
                let released = if config.timeout_secs > 0 {
                    tokio::time::timeout(Duration::from_secs(config.timeout_secs), fut)
                        .await
                        .map_err(|_| CiError::Timeout {
                            step: config.name.clone(),
                            secs: config.timeout_secs,
                        })??
                } else {
                    fut.await?
                };
                Ok(StepResult {
                    step_name: config.name.clone(),
                    outcome: StepOutcome::Passed,
                    exit_code: Some(0),
                    stdout: format!(
                        "published {} ({}) to {}",
                        released.artifacts.asset_name(),
                        released.artifacts.entry_names().join(", "),
                        released.published.location
                    ),
                    stderr: String::new(),
                    duration_ms: elapsed_ms(start),
                    skip_reason: None,
                    artifacts: Some(released.artifacts),
                    published: Some(released.published),
                })
            }
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
