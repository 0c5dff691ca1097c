//! forgeflow - run the CI and release pipelines of a cargo project.
//!
//! ## Commands
//!
//! - `ci run`: build, lint, format-check and test a revision
//! - `release run`: cross-compile, package and publish every target
//! - `trigger`: dispatch a GitHub webhook payload to all workflows
//! - `plan`: show the jobs a payload would start
//! - `runs`, `gate`: inspect recorded runs

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use forgeflow_ci::git::{capture_head_sha, current_branch, resolve_commit};
use forgeflow_ci::telemetry::{color_enabled, init_tracing};
use forgeflow_ci::{
    tag_ref, CiGate, Dispatcher, ForgeConfig, MatrixJobOutcome, PublishTarget, RunReport,
    StepOutcome, TriggerEvent, Workflow, WorkspaceMode,
};
use forgeflow_state::{FsRunLedger, RunId, RunLedger, RunRecord};
use serde_json::Value;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "forgeflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run the CI and release pipelines of a cargo project", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (default: ./forgeflow.toml when present)
    #[arg(long, global = true, env = "FORGEFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Directory runs are recorded in
    #[arg(long, global = true, env = "FORGEFLOW_LEDGER_DIR")]
    ledger_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// CI pipeline
    Ci {
        #[command(subcommand)]
        action: CiAction,
    },

    /// Release pipeline
    Release {
        #[command(subcommand)]
        action: ReleaseAction,
    },

    /// Dispatch a webhook payload to every matching workflow
    Trigger {
        #[command(flatten)]
        event: EventArgs,

        #[command(flatten)]
        workspace: WorkspaceArgs,
    },

    /// Print the jobs a webhook payload would start, without running them
    Plan {
        #[command(flatten)]
        event: EventArgs,
    },

    /// Inspect recorded runs
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },

    /// Evaluate the gate over a recorded run
    Gate {
        /// Run ID
        run_id: String,
    },
}

#[derive(Subcommand)]
enum CiAction {
    /// Run the CI pipeline as a push of a revision
    Run {
        /// Revision to test (default: HEAD of the repository)
        #[arg(long)]
        revision: Option<String>,

        /// Branch the push targets (default: the main branch)
        #[arg(long)]
        branch: Option<String>,

        #[command(flatten)]
        workspace: WorkspaceArgs,
    },
}

#[derive(Subcommand)]
enum ReleaseAction {
    /// Build and publish every target for a created release
    Run {
        /// Release tag
        #[arg(long)]
        tag: String,

        /// Release ID on GitHub (looked up from the tag when omitted)
        #[arg(long)]
        release_id: Option<u64>,

        /// Revision to build (default: the tag when it exists, else HEAD)
        #[arg(long)]
        revision: Option<String>,

        /// Targets to build instead of the configured matrix
        #[arg(long = "target")]
        targets: Vec<String>,

        /// Copy archives into <dir>/<tag>/ instead of uploading them
        #[arg(long)]
        publish_dir: Option<PathBuf>,

        #[command(flatten)]
        workspace: WorkspaceArgs,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    /// List recorded runs, newest last
    List {
        /// Show at most this many runs
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show a run and its events
    Show {
        /// Run ID
        run_id: String,
    },
}

#[derive(clap::Args)]
struct EventArgs {
    /// Webhook event name (push, pull_request, release)
    #[arg(long, env = "GITHUB_EVENT_NAME")]
    event_name: String,

    /// Path to the webhook JSON payload
    #[arg(long, env = "GITHUB_EVENT_PATH")]
    event_path: PathBuf,
}

#[derive(clap::Args)]
struct WorkspaceArgs {
    /// Run CI in the repository work tree instead of a fresh clone; the
    /// tree must be clean and at the revision. Release targets still clone.
    #[arg(long)]
    in_place: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = ForgeConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = &cli.ledger_dir {
        config.ledger_dir = dir.clone();
    }

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let ansi = color_enabled(&config.term_color, std::io::stderr().is_terminal());
    init_tracing(cli.json, level, ansi);

    match cli.command {
        Commands::Ci {
            action:
                CiAction::Run {
                    revision,
                    branch,
                    workspace,
                },
        } => cmd_ci_run(&config, revision, branch, workspace.in_place).await,
        Commands::Release {
            action:
                ReleaseAction::Run {
                    tag,
                    release_id,
                    revision,
                    targets,
                    publish_dir,
                    workspace,
                },
        } => {
            if !targets.is_empty() {
                config.release.targets = targets;
            }
            if let Some(path) = publish_dir {
                config.release.publish = PublishTarget::Directory { path };
            }
            config.validate()?;
            cmd_release_run(&config, &tag, release_id, revision, workspace.in_place).await
        }
        Commands::Trigger { event, workspace } => {
            let event = load_event(&event)?;
            cmd_dispatch(&config, &event, workspace.in_place).await
        }
        Commands::Plan { event } => {
            let event = load_event(&event)?;
            cmd_plan(&config, &event)
        }
        Commands::Runs { action } => match action {
            RunsAction::List { limit } => cmd_runs_list(&config, limit).await,
            RunsAction::Show { run_id } => cmd_runs_show(&config, &run_id).await,
        },
        Commands::Gate { run_id } => cmd_gate(&config, &run_id).await,
    }
}

async fn open_ledger(config: &ForgeConfig) -> Result<Arc<FsRunLedger>> {
    let ledger = FsRunLedger::open(config.ledger_dir.clone())
        .await
        .with_context(|| format!("Failed to open run ledger at {}", config.ledger_dir.display()))?;
    Ok(Arc::new(ledger))
}

fn workspace_mode(config: &ForgeConfig, in_place: bool) -> WorkspaceMode {
    if in_place {
        WorkspaceMode::InPlace(PathBuf::from(&config.repository))
    } else {
        WorkspaceMode::Ephemeral {
            repository: config.repository.clone(),
        }
    }
}

fn head_revision(config: &ForgeConfig, revision: Option<String>) -> Result<String> {
    match revision {
        Some(rev) => Ok(rev),
        None => capture_head_sha(Path::new(&config.repository))
            .context("Failed to resolve HEAD; pass --revision"),
    }
}

/// A release builds its tag; HEAD only when the tag does not exist yet.
fn release_revision(config: &ForgeConfig, tag: &str, revision: Option<String>) -> Result<String> {
    if revision.is_some() {
        return head_revision(config, revision);
    }
    let tagged = tag_ref(tag);
    match resolve_commit(Path::new(&config.repository), &tagged) {
        Some(sha) => {
            info!(tag = %tagged, sha = %sha, "building the tagged commit");
            Ok(tagged)
        }
        None => {
            info!(tag = %tagged, "tag not found; building HEAD");
            head_revision(config, None)
        }
    }
}

fn load_event(args: &EventArgs) -> Result<TriggerEvent> {
    let raw = std::fs::read_to_string(&args.event_path)
        .with_context(|| format!("Failed to read {}", args.event_path.display()))?;
    let payload: Value = serde_json::from_str(&raw).context("Event payload is not JSON")?;
    Ok(TriggerEvent::from_github(&args.event_name, &payload)?)
}

/// Run the CI workflow as a push to `branch`.
async fn cmd_ci_run(
    config: &ForgeConfig,
    revision: Option<String>,
    branch: Option<String>,
    in_place: bool,
) -> Result<ExitCode> {
    let revision = head_revision(config, revision)?;
    let branch = branch.unwrap_or_else(|| config.main_branch.clone());
    if let Some(checked_out) = current_branch(Path::new(&config.repository)) {
        if checked_out != branch {
            info!(checked_out = %checked_out, branch = %branch, "testing as a push to another branch");
        }
    }

    println!("Running CI for {} at {}", config.repository, revision);
    println!("Branch: {}", branch);
    println!();

    let dispatcher = Dispatcher::new(
        vec![Workflow::ci(config)],
        open_ledger(config).await?,
        workspace_mode(config, in_place),
    );
    let reports = dispatcher
        .dispatch(&TriggerEvent::push(&branch, &revision))
        .await;
    finish(config, reports).await
}

/// Run the release matrix for a created release.
async fn cmd_release_run(
    config: &ForgeConfig,
    tag: &str,
    release_id: Option<u64>,
    revision: Option<String>,
    in_place: bool,
) -> Result<ExitCode> {
    let revision = release_revision(config, tag, revision)?;
    let dispatcher = Dispatcher::from_config(
        config,
        open_ledger(config).await?,
        workspace_mode(config, in_place),
    )?;
    if matches!(config.release.publish, PublishTarget::Github { .. })
        && (config.token.is_none() || config.github_repository.is_none())
    {
        eprintln!("warning: GITHUB_TOKEN or GITHUB_REPOSITORY unset; uploads will fail");
    }

    println!("Releasing {} at {}", tag, revision);
    println!("Targets: {}", config.release.targets.join(", "));
    println!();

    let reports = dispatcher
        .dispatch(&TriggerEvent::release_created(tag, release_id, &revision))
        .await;
    finish(config, reports).await
}

async fn cmd_dispatch(config: &ForgeConfig, event: &TriggerEvent, in_place: bool) -> Result<ExitCode> {
    let dispatcher = Dispatcher::from_config(
        config,
        open_ledger(config).await?,
        workspace_mode(config, in_place),
    )?;
    println!("Event: {} at {}", event.kind(), event.revision());
    println!();
    let reports = dispatcher.dispatch(event).await;
    finish(config, reports).await
}

fn cmd_plan(config: &ForgeConfig, event: &TriggerEvent) -> Result<ExitCode> {
    let workflows = vec![Workflow::ci(config), Workflow::release(config)?];
    let mut any = false;
    for workflow in &workflows {
        let jobs = workflow.plan(event);
        if jobs.is_empty() {
            continue;
        }
        any = true;
        println!("{} ({} job(s))", workflow.name, jobs.len());
        for job in jobs {
            println!("  {}", job.name);
            for step in job.steps.iter().filter(|s| s.enabled) {
                println!("    - {}: {}", step.name, step.describe());
            }
        }
    }
    if !any {
        println!("No workflow matches {} event", event.kind());
    }
    Ok(ExitCode::SUCCESS)
}

/// Print reports and gate verdicts; success only if every job passed.
async fn finish(config: &ForgeConfig, reports: Vec<RunReport>) -> Result<ExitCode> {
    if reports.is_empty() {
        println!("No workflow matched; nothing to do.");
        return Ok(ExitCode::SUCCESS);
    }
    let ledger = open_ledger(config).await?;
    let mut all_passed = true;

    for report in &reports {
        println!("Workflow: {}", report.workflow);
        for job in &report.jobs {
            all_passed &= job.passed();
            print_job(job);
            if let Some(result) = job.result() {
                let verdict =
                    CiGate::evaluate_run(ledger.as_ref(), &RunId(result.run_id.clone())).await?;
                for violation in &verdict.violations {
                    println!("      ! {}", violation);
                }
            }
        }
        println!();
    }

    if all_passed {
        println!("✓ All jobs passed");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("✗ Some jobs failed");
        Ok(ExitCode::FAILURE)
    }
}

fn print_job(job: &MatrixJobOutcome) {
    let mark = if job.passed() { "✓" } else { "✗" };
    match job {
        MatrixJobOutcome::Finished(result) => {
            println!(
                "  {} {} [{}] ({}ms, run {})",
                mark,
                result.job_name,
                job.label(),
                result.duration_ms,
                result.run_id
            );
            for step in &result.steps {
                let status = match step.outcome {
                    StepOutcome::Passed => "✓",
                    StepOutcome::Failed => "✗",
                    StepOutcome::Skipped => "-",
                };
                match step.outcome {
                    StepOutcome::Skipped => println!(
                        "    {} {} (skipped: {})",
                        status,
                        step.step_name,
                        step.skip_reason.as_deref().unwrap_or("")
                    ),
                    _ => println!(
                        "    {} {} ({}ms, exit code: {})",
                        status,
                        step.step_name,
                        step.duration_ms,
                        step.exit_code
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "-".to_string())
                    ),
                }
                if step.failed() {
                    let lines: Vec<&str> = step.stderr.lines().collect();
                    for line in &lines[lines.len().saturating_sub(5)..] {
                        println!("        {}", line);
                    }
                }
            }
            if let Some(artifacts) = &result.artifacts {
                println!("    → {} (sha256 {})", artifacts.asset_name(), artifacts.sha256);
            }
            if let Some(published) = &result.published {
                println!("      published to {}", published.location);
            }
        }
        MatrixJobOutcome::Errored { job: name, error, .. } => {
            println!("  {} {} [errored] {}", mark, name, error);
        }
        MatrixJobOutcome::Cancelled {
            job: name, run_id, ..
        } => {
            println!(
                "  {} {} [cancelled] (run {})",
                mark,
                name,
                run_id.as_deref().unwrap_or("-")
            );
        }
    }
}

async fn cmd_runs_list(config: &ForgeConfig, limit: usize) -> Result<ExitCode> {
    let ledger = open_ledger(config).await?;
    let runs = ledger.list_runs(None).await?;
    if runs.is_empty() {
        println!("No runs recorded in {}", config.ledger_dir.display());
        return Ok(ExitCode::SUCCESS);
    }
    let skip = runs.len().saturating_sub(limit);
    for run in runs.iter().skip(skip) {
        print_run_line(run);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_run_line(run: &RunRecord) {
    let revision = run.metadata.revision.as_deref().unwrap_or("-");
    println!(
        "{}  {:<10} {:<40} {}  {}",
        run.run_id,
        format!("{:?}", run.status),
        run.metadata.job_name,
        &revision[..revision.len().min(12)],
        run.created_at.format("%Y-%m-%d %H:%M:%S")
    );
}

async fn cmd_runs_show(config: &ForgeConfig, run_id: &str) -> Result<ExitCode> {
    let ledger = open_ledger(config).await?;
    let run_id = RunId(run_id.to_string());
    let run = ledger
        .get_run(&run_id)
        .await
        .with_context(|| format!("Run {} not found", run_id))?;
    let events = ledger.get_events(&run_id).await?;

    println!("Run:      {}", run.run_id);
    println!("Job:      {}", run.metadata.job_name);
    println!("Status:   {:?}", run.status);
    println!("Revision: {}", run.metadata.revision.as_deref().unwrap_or("-"));
    println!(
        "Workflow: {} ({})",
        run.metadata.tags["workflow"].as_str().unwrap_or("-"),
        run.spec_digest.short()
    );
    if let Some(summary) = &run.summary {
        println!(
            "Summary:  {} events, {}ms",
            summary.total_events, summary.duration_ms
        );
    }
    println!();
    for event in &events {
        println!(
            "  #{:<3} {:<13} {}",
            event.seq,
            event.kind,
            event.payload["step_name"].as_str().unwrap_or("")
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_gate(config: &ForgeConfig, run_id: &str) -> Result<ExitCode> {
    let ledger = open_ledger(config).await?;
    let verdict = CiGate::evaluate_run(ledger.as_ref(), &RunId(run_id.to_string())).await?;
    println!("Gate: {}", if verdict.passed { "✓ PASSED" } else { "✗ FAILED" });
    println!("{}", verdict.message);
    for violation in &verdict.violations {
        println!("  - {}", violation);
    }
    Ok(if verdict.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
