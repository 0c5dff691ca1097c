//! Release matrix: one independent job per target triple.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use forgeflow_ci::git::capture_head_sha;
use forgeflow_ci::release::{DirectoryPublisher, MemoryPublisher, PublishedAsset};
use forgeflow_ci::{
    ArtifactSet, AssetPublisher, CiError, CiResult, Dispatcher, ForgeConfig, MatrixJobOutcome,
    ReleaseRef, RunReport, StepOutcome, TriggerEvent, Workflow, WorkspaceMode,
};
use forgeflow_state::fakes::MemoryRunLedger;
use forgeflow_state::{RunId, RunLedger, RunStatus};

const LINUX: &str = "x86_64-unknown-linux-musl";
const WINDOWS: &str = "x86_64-pc-windows-gnu";
const MACOS: &str = "x86_64-apple-darwin";

/// Stands in for `cargo build --release --target $RUSTTARGET`; the Windows
/// toolchain is missing.
const FAKE_BUILD: &str = r#"
case "$RUSTTARGET" in
  *windows*) echo "error: linker \`x86_64-w64-mingw32-gcc\` not found" >&2; exit 101 ;;
esac
mkdir -p "target/$RUSTTARGET/release"
printf 'binary for %s' "$RUSTTARGET" > "target/$RUSTTARGET/release/tool"
"#;

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git not available");
    assert!(
        output.status.success(),
        "git {:?}: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// A project repository with README.md and LICENSE committed.
fn project_repo() -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    git(dir.path(), &["init", "--quiet"]);
    git(dir.path(), &["config", "user.name", "release"]);
    git(dir.path(), &["config", "user.email", "release@example.com"]);
    std::fs::write(dir.path().join("README.md"), "# tool\n").unwrap();
    std::fs::write(dir.path().join("LICENSE"), "Apache-2.0\n").unwrap();
    std::fs::write(dir.path().join("NOTES.txt"), "not shipped\n").unwrap();
    git(dir.path(), &["add", "."]);
    git(dir.path(), &["commit", "--quiet", "-m", "v0.1.0"]);
    let sha = capture_head_sha(dir.path()).unwrap();
    (dir, sha)
}

fn release_config() -> ForgeConfig {
    let mut config = ForgeConfig::default();
    config.project = Some("tool".to_string());
    config.release.binaries = vec!["tool".to_string()];
    config.release.build_command = Some(vec![
        "sh".to_string(),
        "-c".to_string(),
        FAKE_BUILD.to_string(),
    ]);
    config
}

fn dispatcher(
    repo: &Path,
    ledger: Arc<MemoryRunLedger>,
    publisher: Arc<dyn AssetPublisher>,
) -> Dispatcher {
    let workflow = Workflow::release(&release_config()).unwrap();
    Dispatcher::new(
        vec![workflow],
        ledger,
        WorkspaceMode::Ephemeral {
            repository: repo.display().to_string(),
        },
    )
    .with_publisher(publisher)
}

fn job<'a>(report: &'a RunReport, triple: &str) -> &'a MatrixJobOutcome {
    report
        .jobs
        .iter()
        .find(|j| j.target().map(|t| t.as_str()) == Some(triple))
        .unwrap_or_else(|| panic!("no job for {triple}"))
}

fn tar_entry(archive: &Path, name: &str) -> String {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(archive).unwrap()));
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.path().unwrap().to_string_lossy() == name {
            let mut contents = String::new();
            entry.read_to_string(&mut contents).unwrap();
            return contents;
        }
    }
    panic!("{name} not in archive");
}

fn tar_entries(archive: &Path) -> Vec<String> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(archive).unwrap()));
    let mut names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Windows fails, Linux and macOS still publish.
#[tokio::test]
async fn test_failed_target_leaves_partial_release() {
    let (repo, sha) = project_repo();
    let ledger = Arc::new(MemoryRunLedger::new());
    let publisher = Arc::new(MemoryPublisher::new());
    let dispatcher = dispatcher(repo.path(), ledger.clone(), publisher.clone());

    let reports = dispatcher
        .dispatch(&TriggerEvent::release_created("v0.1.0", Some(42), &sha))
        .await;
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.jobs.len(), 3);
    assert!(!report.passed());

    assert!(job(report, LINUX).passed());
    assert!(job(report, MACOS).passed());
    let windows = job(report, WINDOWS).result().expect("windows job finished");
    assert!(!windows.passed());
    let failed = windows.failed_step().unwrap();
    assert_eq!(failed.step_name, "compile_and_release");
    assert!(failed.stderr.contains("not found"));
    assert_eq!(windows.steps[0].outcome, StepOutcome::Passed);

    let assets: Vec<String> = publisher
        .assets_for("v0.1.0")
        .iter()
        .map(ArtifactSet::asset_name)
        .collect();
    assert_eq!(
        assets,
        vec![
            "tool_v0.1.0_x86_64-apple-darwin.tar.gz",
            "tool_v0.1.0_x86_64-unknown-linux-musl.tar.gz",
        ]
    );

    // One ledger run per target, each with its own terminal status.
    let runs = ledger.list_runs(None).await.unwrap();
    assert_eq!(runs.len(), 3);
    for outcome in &report.jobs {
        let result = outcome.result().unwrap();
        let run = ledger.get_run(&RunId(result.run_id.clone())).await.unwrap();
        let expected = if result.passed() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        assert_eq!(run.status, expected, "{}", result.job_name);
    }
}

/// Successful jobs ship the binary plus exactly README.md and LICENSE.
#[tokio::test]
async fn test_asset_holds_binary_and_two_extra_files() {
    let (repo, sha) = project_repo();
    let releases = tempfile::tempdir().unwrap();
    let ledger = Arc::new(MemoryRunLedger::new());
    let publisher = Arc::new(DirectoryPublisher::new(releases.path()));
    let dispatcher = dispatcher(repo.path(), ledger, publisher);

    let reports = dispatcher
        .dispatch(&TriggerEvent::release_created("v0.1.0", None, &sha))
        .await;
    let linux = job(&reports[0], LINUX).result().unwrap();
    let artifacts = linux.artifacts.as_ref().expect("artifacts recorded");
    assert_eq!(artifacts.entry_names(), vec!["tool", "README.md", "LICENSE"]);

    let published = releases
        .path()
        .join("v0.1.0")
        .join("tool_v0.1.0_x86_64-unknown-linux-musl.tar.gz");
    assert_eq!(tar_entries(&published), vec!["LICENSE", "README.md", "tool"]);
    assert!(!releases
        .path()
        .join("v0.1.0")
        .join("tool_v0.1.0_x86_64-pc-windows-gnu.zip")
        .exists());
}

/// The job's result points at the published copy; the local archive went
/// away with the ephemeral workspace.
#[tokio::test]
async fn test_published_location_outlives_workspace() {
    let (repo, sha) = project_repo();
    let ledger = Arc::new(MemoryRunLedger::new());
    let publisher = Arc::new(MemoryPublisher::new());
    let dispatcher = dispatcher(repo.path(), ledger, publisher.clone());

    let reports = dispatcher
        .dispatch(&TriggerEvent::release_created("v0.1.0", None, &sha))
        .await;
    let linux = job(&reports[0], LINUX).result().unwrap();
    let archive = &linux.artifacts.as_ref().unwrap().archive;
    assert!(!archive.exists());

    let published = linux.published.as_ref().expect("published location");
    assert_eq!(
        published.location,
        "memory://v0.1.0/tool_v0.1.0_x86_64-unknown-linux-musl.tar.gz"
    );
    let bytes = publisher
        .archive_bytes("v0.1.0", &published.name)
        .expect("archive kept by publisher");
    let mut names: Vec<String> = tar::Archive::new(GzDecoder::new(bytes.as_slice()))
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["LICENSE", "README.md", "tool"]);
    assert!(job(&reports[0], WINDOWS).result().unwrap().published.is_none());
}

/// Re-running a release replaces each target's asset without touching others.
#[tokio::test]
async fn test_rerun_replaces_same_target_assets() {
    let (repo, sha) = project_repo();
    let releases = tempfile::tempdir().unwrap();
    let ledger = Arc::new(MemoryRunLedger::new());
    let publisher = Arc::new(DirectoryPublisher::new(releases.path()));
    let dispatcher = dispatcher(repo.path(), ledger.clone(), publisher);
    let event = TriggerEvent::release_created("v0.1.0", None, &sha);

    dispatcher.dispatch(&event).await;
    let reports = dispatcher.dispatch(&event).await;
    assert!(job(&reports[0], LINUX).passed());

    let mut files: Vec<String> = std::fs::read_dir(releases.path().join("v0.1.0"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    assert_eq!(
        files,
        vec![
            "tool_v0.1.0_x86_64-apple-darwin.tar.gz",
            "tool_v0.1.0_x86_64-unknown-linux-musl.tar.gz",
        ]
    );
    assert_eq!(ledger.list_runs(None).await.unwrap().len(), 6);
}

/// Rejects uploads for one target.
struct RejectingPublisher {
    inner: MemoryPublisher,
    reject: &'static str,
}

#[async_trait]
impl AssetPublisher for RejectingPublisher {
    fn name(&self) -> &str {
        "rejecting"
    }

    async fn publish(
        &self,
        release: &ReleaseRef,
        artifacts: &ArtifactSet,
    ) -> CiResult<PublishedAsset> {
        if artifacts.target.as_str() == self.reject {
            return Err(CiError::Http("502 Bad Gateway".to_string()));
        }
        self.inner.publish(release, artifacts).await
    }
}

/// An upload failure fails that target's job only.
#[tokio::test]
async fn test_upload_failure_is_isolated() {
    let (repo, sha) = project_repo();
    let ledger = Arc::new(MemoryRunLedger::new());
    let publisher = Arc::new(RejectingPublisher {
        inner: MemoryPublisher::new(),
        reject: MACOS,
    });
    let dispatcher = dispatcher(repo.path(), ledger, publisher.clone());

    let reports = dispatcher
        .dispatch(&TriggerEvent::release_created("v0.1.0", None, &sha))
        .await;
    let report = &reports[0];
    assert!(job(report, LINUX).passed());
    let macos = job(report, MACOS).result().unwrap();
    assert!(!macos.passed());
    assert!(macos.failed_step().unwrap().stderr.contains("Publish failed"));
    assert_eq!(publisher.inner.assets_for("v0.1.0").len(), 1);
}

/// Only `created` releases start the matrix.
#[tokio::test]
async fn test_published_release_does_not_trigger() {
    let (repo, sha) = project_repo();
    let ledger = Arc::new(MemoryRunLedger::new());
    let publisher = Arc::new(MemoryPublisher::new());
    let dispatcher = dispatcher(repo.path(), ledger.clone(), publisher);

    let event = TriggerEvent::Release {
        action: forgeflow_ci::ReleaseAction::Published,
        tag: "v0.1.0".to_string(),
        release_id: None,
        revision: sha,
        target_commitish: None,
    };
    assert!(dispatcher.dispatch(&event).await.is_empty());
    assert!(ledger.list_runs(None).await.unwrap().is_empty());
}

/// The release builds the tagged commit even after its branch moved on.
#[tokio::test]
async fn test_release_builds_tag_not_branch_tip() {
    let (repo, tagged) = project_repo();
    git(repo.path(), &["tag", "v0.1.0"]);
    std::fs::write(repo.path().join("README.md"), "# tool, next\n").unwrap();
    git(repo.path(), &["commit", "--quiet", "-am", "after the tag"]);
    let tip = capture_head_sha(repo.path()).unwrap();
    assert_ne!(tip, tagged);
    let branch = forgeflow_ci::git::current_branch(repo.path()).unwrap();

    let mut config = release_config();
    config.release.targets = vec![LINUX.to_string()];
    config.release.build_command = Some(vec![
        "sh".to_string(),
        "-c".to_string(),
        r#"mkdir -p "target/$RUSTTARGET/release" && git rev-parse HEAD > "target/$RUSTTARGET/release/tool""#
            .to_string(),
    ]);
    let releases = tempfile::tempdir().unwrap();
    let dispatcher = Dispatcher::new(
        vec![Workflow::release(&config).unwrap()],
        Arc::new(MemoryRunLedger::new()),
        WorkspaceMode::Ephemeral {
            repository: repo.path().display().to_string(),
        },
    )
    .with_publisher(Arc::new(DirectoryPublisher::new(releases.path())));

    let payload = serde_json::json!({
        "action": "created",
        "release": {
            "id": 7,
            "tag_name": "v0.1.0",
            "target_commitish": branch,
        }
    });
    let event = TriggerEvent::from_github("release", &payload).unwrap();
    let reports = dispatcher.dispatch(&event).await;
    assert!(job(&reports[0], LINUX).passed());

    let archive = releases
        .path()
        .join("v0.1.0")
        .join("tool_v0.1.0_x86_64-unknown-linux-musl.tar.gz");
    assert_eq!(tar_entry(&archive, "tool").trim(), tagged);
}

/// A matrix against an existing work tree builds each target in its own
/// clone and leaves the work tree alone.
#[tokio::test]
async fn test_in_place_matrix_uses_private_workspaces() {
    let (repo, sha) = project_repo();
    let publisher = Arc::new(MemoryPublisher::new());
    let dispatcher = Dispatcher::new(
        vec![Workflow::release(&release_config()).unwrap()],
        Arc::new(MemoryRunLedger::new()),
        WorkspaceMode::InPlace(repo.path().to_path_buf()),
    )
    .with_publisher(publisher.clone());

    let reports = dispatcher
        .dispatch(&TriggerEvent::release_created("v0.1.0", None, &sha))
        .await;
    assert!(job(&reports[0], LINUX).passed());
    assert!(job(&reports[0], MACOS).passed());
    assert_eq!(publisher.assets_for("v0.1.0").len(), 2);
    assert!(!repo.path().join("target").exists());
}

/// Under fail-fast, jobs that never started are recorded as cancelled runs.
#[tokio::test]
async fn test_fail_fast_records_cancelled_runs() {
    let (repo, sha) = project_repo();
    let mut config = release_config();
    config.release.fail_fast = true;
    config.release.max_parallel = 1;
    config.release.build_command = Some(vec!["false".to_string()]);
    let ledger = Arc::new(MemoryRunLedger::new());
    let dispatcher = Dispatcher::new(
        vec![Workflow::release(&config).unwrap()],
        ledger.clone(),
        WorkspaceMode::Ephemeral {
            repository: repo.path().display().to_string(),
        },
    )
    .with_publisher(Arc::new(MemoryPublisher::new()));

    let reports = dispatcher
        .dispatch(&TriggerEvent::release_created("v0.1.0", None, &sha))
        .await;
    let labels: Vec<&str> = reports[0].jobs.iter().map(MatrixJobOutcome::label).collect();
    assert_eq!(labels.iter().filter(|l| **l == "failed").count(), 1);
    assert_eq!(labels.iter().filter(|l| **l == "cancelled").count(), 2);

    let runs = ledger.list_runs(None).await.unwrap();
    assert_eq!(runs.len(), 3);
    let cancelled = runs
        .iter()
        .filter(|r| r.status == RunStatus::Cancelled)
        .count();
    assert_eq!(cancelled, 2);

    for outcome in &reports[0].jobs {
        if let MatrixJobOutcome::Cancelled { run_id, .. } = outcome {
            let run_id = run_id.as_ref().expect("cancelled run recorded");
            let events = ledger.get_events(&RunId(run_id.clone())).await.unwrap();
            assert_eq!(events.len(), 2);
            assert!(events.iter().all(|e| e.kind == "step_skipped"));
            assert_eq!(events[0].payload["reason"], "cancelled");
        }
    }
}
