//! Git integration: revision capture and the checkout step.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command as StdCommand;

use tracing::info;

use crate::context::{CheckoutMode, JobContext};
use crate::error::{CiError, CiResult};
use crate::runner::{run_command, ProcessOutput};

/// Capture the HEAD commit SHA from a git repository.
///
/// Runs `git rev-parse HEAD` in the given directory. Returns an error if the
/// directory is not inside a git repository or if git is not available.
pub fn capture_head_sha(repo_dir: &Path) -> CiResult<String> {
    let output = StdCommand::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo_dir)
        .output()
        .map_err(|e| CiError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CiError::Git(format!("git rev-parse HEAD failed: {stderr}")));
    }

    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if sha.is_empty() {
        return Err(CiError::Git(
            "git rev-parse HEAD returned empty output".to_string(),
        ));
    }
    Ok(sha)
}

/// Name of the checked-out branch, `None` on a detached HEAD.
pub fn current_branch(repo_dir: &Path) -> Option<String> {
    let output = StdCommand::new("git")
        .args(["symbolic-ref", "--quiet", "--short", "HEAD"])
        .current_dir(repo_dir)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!branch.is_empty()).then_some(branch)
}

/// Commit SHA `revision` names in `repo_dir`, `None` when it names none.
pub fn resolve_commit(repo_dir: &Path, revision: &str) -> Option<String> {
    let output = StdCommand::new("git")
        .args(["rev-parse", "--verify", "--quiet"])
        .arg(format!("{revision}^{{commit}}"))
        .current_dir(repo_dir)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!sha.is_empty()).then_some(sha)
}

fn git(args: &[&str]) -> Vec<String> {
    std::iter::once("git")
        .chain(args.iter().copied())
        .map(str::to_string)
        .collect()
}

/// The checkout step.
///
/// In clone mode the repository is cloned into the (empty) job workspace and
/// HEAD is detached at the requested revision, falling back to
/// `origin/<revision>` for branch names. In place, nothing is modified: the
/// step fails unless HEAD is the requested revision and no tracked file has
/// uncommitted changes.
pub(crate) async fn checkout(
    ctx: &JobContext,
    env: &BTreeMap<String, String>,
    timeout_secs: u64,
) -> CiResult<ProcessOutput> {
    let workspace = ctx.workspace();
    match ctx.checkout_mode() {
        CheckoutMode::Clone { repository } => {
            let parent = workspace
                .parent()
                .ok_or_else(|| CiError::Git("workspace has no parent".to_string()))?;
            let dest = workspace.display().to_string();
            let clone = run_command(
                "checkout",
                &git(&["clone", "--quiet", "--no-checkout", repository, &dest]),
                parent,
                env,
                timeout_secs,
            )
            .await?;
            if !clone.success() {
                return Ok(clone);
            }

            let revision = ctx.revision().unwrap_or("HEAD");
            let mut last = clone;
            for candidate in [revision.to_string(), format!("origin/{revision}")] {
                let checkout = run_command(
                    "checkout",
                    &git(&["checkout", "--quiet", "--detach", &candidate]),
                    workspace,
                    env,
                    timeout_secs,
                )
                .await?;
                if checkout.success() {
                    info!(repository = %repository, revision = %candidate, "checked out");
                    return Ok(checkout);
                }
                last = checkout;
            }
            Ok(last)
        }
        CheckoutMode::InPlace => {
            let revision = ctx.revision().unwrap_or("HEAD");
            verify_in_place(workspace, revision, env, timeout_secs).await
        }
    }
}

async fn verify_in_place(
    workspace: &Path,
    revision: &str,
    env: &BTreeMap<String, String>,
    timeout_secs: u64,
) -> CiResult<ProcessOutput> {
    let wanted = rev_parse(workspace, &format!("{revision}^{{commit}}"), env, timeout_secs).await?;
    if !wanted.success() {
        return Ok(refused(format!(
            "revision {revision} not found in {}",
            workspace.display()
        )));
    }
    let head = rev_parse(workspace, "HEAD^{commit}", env, timeout_secs).await?;
    if !head.success() {
        return Ok(head);
    }
    let (wanted, head) = (wanted.stdout.trim(), head.stdout.trim());
    if wanted != head {
        return Ok(refused(format!(
            "work tree is at {head}, not {revision} ({wanted})"
        )));
    }

    let status = run_command(
        "checkout",
        &git(&["status", "--porcelain", "--untracked-files=no"]),
        workspace,
        env,
        timeout_secs,
    )
    .await?;
    if !status.success() {
        return Ok(status);
    }
    if !status.stdout.trim().is_empty() {
        return Ok(refused(format!(
            "work tree has uncommitted changes:\n{}",
            status.stdout.trim_end()
        )));
    }
    info!(workspace = %workspace.display(), revision = %head, "verified work tree");
    Ok(ProcessOutput {
        exit_code: 0,
        stdout: format!("{head}\n"),
        stderr: String::new(),
    })
}

async fn rev_parse(
    workspace: &Path,
    spec: &str,
    env: &BTreeMap<String, String>,
    timeout_secs: u64,
) -> CiResult<ProcessOutput> {
    run_command(
        "checkout",
        &git(&["rev-parse", "--verify", "--quiet", spec]),
        workspace,
        env,
        timeout_secs,
    )
    .await
}

fn refused(message: String) -> ProcessOutput {
    ProcessOutput {
        exit_code: 1,
        stdout: String::new(),
        stderr: message,
    }
}
