//! Workflow definitions, job planning and dispatch.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use forgeflow_state::RunLedger;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{ForgeConfig, PublishTarget};
use crate::context::JobContext;
use crate::error::{CiError, CiResult};
use crate::job::{JobResult, JobRunner, JobSpec};
use crate::matrix::{MatrixConfig, MatrixJobOutcome, MatrixRunner};
use crate::release::action::ReleaseParams;
use crate::release::publish::{AssetPublisher, DirectoryPublisher, GithubReleasePublisher};
use crate::release::target::TargetTriple;
use crate::step::{BuiltinStep, StepAction, StepConfig};
use crate::trigger::{ReleaseAction, TriggerEvent, TriggerFilter};

/// How a workflow turns into jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowKind {
    /// A single job.
    Sequential { steps: Vec<StepConfig> },

    /// One independent job per target; compile-and-release steps are
    /// retargeted for each job.
    Matrix {
        targets: Vec<TargetTriple>,
        steps: Vec<StepConfig>,
        matrix: MatrixConfig,
    },
}

/// A named set of jobs started by matching trigger events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub triggers: Vec<TriggerFilter>,
    /// Environment of every job.
    pub env: BTreeMap<String, String>,
    pub kind: WorkflowKind,
}

impl Workflow {
    /// Build, lint, format-check and test every push and pull request
    /// against the main branch.
    pub fn ci(config: &ForgeConfig) -> Self {
        let branches = vec![config.main_branch.clone()];
        let steps = BuiltinStep::CI_SEQUENCE
            .iter()
            .map(|step| StepConfig::from_builtin(*step, config.ci.step_timeout_secs))
            .collect();
        Self {
            name: "ci".to_string(),
            triggers: vec![
                TriggerFilter::Push {
                    branches: branches.clone(),
                },
                TriggerFilter::PullRequest { branches },
            ],
            env: term_env(config),
            kind: WorkflowKind::Sequential { steps },
        }
    }

    /// Cross-compile and attach archives for every target when a release is
    /// created.
    pub fn release(config: &ForgeConfig) -> CiResult<Self> {
        let targets = config.targets()?;
        let template_target = targets
            .first()
            .cloned()
            .ok_or_else(|| CiError::Config("release.targets is empty".to_string()))?;

        let mut params = ReleaseParams::new(template_target)
            .with_extra_files(config.release.extra_files.clone())
            .with_binaries(config.release.binaries.clone());
        if let Some(project) = &config.project {
            params = params.with_project(project.clone());
        }
        if let Some(argv) = &config.release.build_command {
            params = params.with_build_command(argv.clone());
        }

        let steps = vec![
            StepConfig::from_builtin(BuiltinStep::Checkout, config.release.step_timeout_secs),
            StepConfig::compile_and_release(params, config.release.step_timeout_secs),
        ];
        Ok(Self {
            name: "release".to_string(),
            triggers: vec![TriggerFilter::Release {
                actions: vec![ReleaseAction::Created],
            }],
            env: term_env(config),
            kind: WorkflowKind::Matrix {
                targets,
                steps,
                matrix: MatrixConfig {
                    fail_fast: config.release.fail_fast,
                    max_parallel: config.release.max_parallel,
                },
            },
        })
    }

    pub fn matches(&self, event: &TriggerEvent) -> bool {
        self.triggers.iter().any(|t| t.matches(event))
    }

    /// Jobs this workflow runs for `event`; empty when it does not match.
    pub fn plan(&self, event: &TriggerEvent) -> Vec<JobSpec> {
        if !self.matches(event) {
            return Vec::new();
        }
        match &self.kind {
            WorkflowKind::Sequential { steps } => vec![JobSpec {
                name: self.name.clone(),
                workflow: self.name.clone(),
                trigger: event.clone(),
                target: None,
                steps: steps.clone(),
                env: self.env.clone(),
            }],
            WorkflowKind::Matrix { targets, steps, .. } => targets
                .iter()
                .map(|target| {
                    let mut env = self.env.clone();
                    env.insert("RUSTTARGET".to_string(), target.to_string());
                    JobSpec {
                        name: format!("{} ({})", self.name, target),
                        workflow: self.name.clone(),
                        trigger: event.clone(),
                        target: Some(target.clone()),
                        steps: steps_for_target(steps, target),
                        env,
                    }
                })
                .collect(),
        }
    }

    pub fn matrix_config(&self) -> Option<&MatrixConfig> {
        match &self.kind {
            WorkflowKind::Matrix { matrix, .. } => Some(matrix),
            WorkflowKind::Sequential { .. } => None,
        }
    }
}

fn term_env(config: &ForgeConfig) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("CARGO_TERM_COLOR".to_string(), config.term_color.clone());
    env
}

fn steps_for_target(steps: &[StepConfig], target: &TargetTriple) -> Vec<StepConfig> {
    steps
        .iter()
        .map(|step| {
            let mut step = step.clone();
            if let StepAction::CompileAndRelease(params) = &mut step.action {
                params.target = target.clone();
            }
            step
        })
        .collect()
}

/// Where job workspaces come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceMode {
    /// Fresh temporary directory per job, cloned from `repository`.
    Ephemeral { repository: String },

    /// Run sequential jobs in an existing work tree; the checkout step
    /// requires it to be clean and at the event's revision. Matrix jobs
    /// clone it instead.
    InPlace(PathBuf),
}

/// Outcome of one dispatched workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub workflow: String,
    pub jobs: Vec<MatrixJobOutcome>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.jobs.iter().all(MatrixJobOutcome::passed)
    }
}

/// Builds each job's context and runs it.
#[derive(Clone)]
struct JobLauncher {
    ledger: Arc<dyn RunLedger>,
    workspace: WorkspaceMode,
    publisher: Option<Arc<dyn AssetPublisher>>,
}

impl JobLauncher {
    /// A launcher whose jobs never share a work tree: an in-place work tree
    /// is cloned once per job.
    fn isolated(&self) -> Self {
        let workspace = match &self.workspace {
            WorkspaceMode::InPlace(path) => WorkspaceMode::Ephemeral {
                repository: path.display().to_string(),
            },
            ephemeral => ephemeral.clone(),
        };
        Self {
            workspace,
            ..self.clone()
        }
    }

    fn context(&self, spec: &JobSpec) -> CiResult<JobContext> {
        let ctx = match &self.workspace {
            WorkspaceMode::Ephemeral { repository } => JobContext::ephemeral(repository)?,
            WorkspaceMode::InPlace(path) => JobContext::in_place(path.clone()),
        };
        let mut ctx = ctx
            .with_revision(spec.trigger.revision())
            .with_env(spec.env.clone());
        if let Some(release) = spec.trigger.release_ref() {
            ctx = ctx.with_release(release);
        }
        if spec.publishes() {
            if let Some(publisher) = &self.publisher {
                ctx = ctx.with_publisher(publisher.clone());
            }
        }
        Ok(ctx)
    }

    async fn launch(&self, spec: JobSpec) -> CiResult<JobResult> {
        let ctx = self.context(&spec)?;
        JobRunner::run(self.ledger.clone(), &spec, &ctx).await
    }
}

/// Runs every workflow that matches an event.
pub struct Dispatcher {
    workflows: Vec<Workflow>,
    launcher: JobLauncher,
}

impl Dispatcher {
    pub fn new(
        workflows: Vec<Workflow>,
        ledger: Arc<dyn RunLedger>,
        workspace: WorkspaceMode,
    ) -> Self {
        Self {
            workflows,
            launcher: JobLauncher {
                ledger,
                workspace,
                publisher: None,
            },
        }
    }

    /// The CI and release workflows described by `config`, publishing where
    /// `config.release.publish` points.
    pub fn from_config(
        config: &ForgeConfig,
        ledger: Arc<dyn RunLedger>,
        workspace: WorkspaceMode,
    ) -> CiResult<Self> {
        let workflows = vec![Workflow::ci(config), Workflow::release(config)?];
        let mut dispatcher = Self::new(workflows, ledger, workspace);
        if let Some(publisher) = publisher_from_config(config)? {
            dispatcher = dispatcher.with_publisher(publisher);
        }
        Ok(dispatcher)
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn AssetPublisher>) -> Self {
        self.launcher.publisher = Some(publisher);
        self
    }

    pub fn workflows(&self) -> &[Workflow] {
        &self.workflows
    }

    /// Jobs every matching workflow would run, grouped by workflow.
    pub fn plan(&self, event: &TriggerEvent) -> Vec<(String, Vec<JobSpec>)> {
        self.workflows
            .iter()
            .map(|w| (w.name.clone(), w.plan(event)))
            .filter(|(_, jobs)| !jobs.is_empty())
            .collect()
    }

    /// Run every workflow matching `event`, in declaration order.
    pub async fn dispatch(&self, event: &TriggerEvent) -> Vec<RunReport> {
        let mut reports = Vec::new();
        for workflow in &self.workflows {
            let jobs = workflow.plan(event);
            if jobs.is_empty() {
                continue;
            }
            info!(
                workflow = %workflow.name,
                event = event.kind(),
                jobs = jobs.len(),
                "dispatching workflow"
            );

            let outcomes = match workflow.matrix_config() {
                Some(matrix) => {
                    let launcher = self.launcher.isolated();
                    let specs = jobs.clone();
                    let mut outcomes = MatrixRunner::run(jobs, matrix, move |spec| {
                        let launcher = launcher.clone();
                        async move { launcher.launch(spec).await }
                    })
                    .await
                    .jobs;
                    self.record_cancelled(&specs, &mut outcomes).await;
                    outcomes
                }
                None => {
                    let mut outcomes = Vec::with_capacity(jobs.len());
                    for spec in jobs {
                        let name = spec.name.clone();
                        let target = spec.target.clone();
                        outcomes.push(match self.launcher.launch(spec).await {
                            Ok(result) => MatrixJobOutcome::Finished(result),
                            Err(e) => {
                                warn!(job = %name, error = %e, "job errored");
                                MatrixJobOutcome::Errored {
                                    job: name,
                                    target,
                                    error: e.to_string(),
                                }
                            }
                        });
                    }
                    outcomes
                }
            };

            reports.push(RunReport {
                workflow: workflow.name.clone(),
                jobs: outcomes,
            });
        }
        if reports.is_empty() {
            info!(event = event.kind(), "no workflow matched");
        }
        reports
    }

    /// Give every cancelled matrix job a cancelled ledger run. `outcomes`
    /// is in the order of `specs`.
    async fn record_cancelled(&self, specs: &[JobSpec], outcomes: &mut [MatrixJobOutcome]) {
        for (spec, outcome) in specs.iter().zip(outcomes.iter_mut()) {
            if let MatrixJobOutcome::Cancelled { run_id, .. } = outcome {
                match JobRunner::record_cancelled(self.launcher.ledger.clone(), spec).await {
                    Ok(id) => *run_id = Some(id),
                    Err(e) => warn!(job = %spec.name, error = %e, "could not record cancelled job"),
                }
            }
        }
    }
}

/// Publisher selected by `config.release.publish`; `None` when GitHub
/// publishing lacks a token or repository.
pub fn publisher_from_config(config: &ForgeConfig) -> CiResult<Option<Arc<dyn AssetPublisher>>> {
    let publisher: Arc<dyn AssetPublisher> = match &config.release.publish {
        PublishTarget::Directory { path } => Arc::new(DirectoryPublisher::new(path.clone())),
        PublishTarget::Github {
            api_url,
            upload_url,
        } => match (&config.token, &config.github_repository) {
            (Some(token), Some(repository)) => Arc::new(GithubReleasePublisher::new(
                api_url,
                upload_url,
                repository,
                token.clone(),
            )?),
            _ => return Ok(None),
        },
    };
    Ok(Some(publisher))
}
