//! The compile-and-release step: cross-compile one target, package it and
//! attach the archive to the triggering release.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::context::JobContext;
use crate::error::{CiError, CiResult};
use crate::release::package::{package, ArtifactSet, PackageRequest};
use crate::release::publish::PublishedAsset;
use crate::release::target::TargetTriple;
use crate::runner::run_command;
use crate::step::COMPILE_AND_RELEASE;

/// Parameters of one compile-and-release step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseParams {
    pub target: TargetTriple,

    /// Auxiliary files, relative to the workspace, bundled with the binaries.
    #[serde(default = "default_extra_files")]
    pub extra_files: Vec<String>,

    /// Binary names; discovered from `cargo metadata` when empty.
    #[serde(default)]
    pub binaries: Vec<String>,

    /// Overrides `cargo build --release --target <triple>`.
    #[serde(default)]
    pub build_command: Option<Vec<String>>,

    /// Archive name prefix; defaults to the cargo package name.
    #[serde(default)]
    pub project: Option<String>,
}

fn default_extra_files() -> Vec<String> {
    vec!["README.md".to_string(), "LICENSE".to_string()]
}

impl ReleaseParams {
    pub fn new(target: TargetTriple) -> Self {
        Self {
            target,
            extra_files: default_extra_files(),
            binaries: Vec::new(),
            build_command: None,
            project: None,
        }
    }

    pub fn with_extra_files(mut self, files: Vec<String>) -> Self {
        self.extra_files = files;
        self
    }

    pub fn with_binaries(mut self, binaries: Vec<String>) -> Self {
        self.binaries = binaries;
        self
    }

    pub fn with_build_command(mut self, argv: Vec<String>) -> Self {
        self.build_command = Some(argv);
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// The build invocation for this target.
    pub fn build_argv(&self) -> Vec<String> {
        match &self.build_command {
            Some(argv) => argv.clone(),
            None => ["cargo", "build", "--release", "--target", self.target.as_str()]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// What a successful compile-and-release step leaves behind.
#[derive(Debug, Clone)]
pub struct ReleasedAsset {
    /// Local files; the archive goes away with an ephemeral workspace.
    pub artifacts: ArtifactSet,
    pub published: PublishedAsset,
}

/// Names discovered from `cargo metadata`.
#[derive(Debug, Default)]
struct CrateInfo {
    package: Option<String>,
    binaries: Vec<String>,
}

fn parse_metadata(metadata: &Value) -> CrateInfo {
    let packages = metadata["packages"].as_array().cloned().unwrap_or_default();
    let package = packages
        .first()
        .and_then(|p| p["name"].as_str())
        .map(str::to_string);
    let binaries = packages
        .iter()
        .flat_map(|p| p["targets"].as_array().cloned().unwrap_or_default())
        .filter(|t| {
            t["kind"]
                .as_array()
                .map(|kinds| kinds.iter().any(|k| k == "bin"))
                .unwrap_or(false)
        })
        .filter_map(|t| t["name"].as_str().map(str::to_string))
        .collect();
    CrateInfo { package, binaries }
}

async fn crate_info(workspace: &Path, env: &BTreeMap<String, String>) -> CiResult<CrateInfo> {
    let argv: Vec<String> = ["cargo", "metadata", "--no-deps", "--format-version", "1"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let output = run_command(COMPILE_AND_RELEASE, &argv, workspace, env, 0).await?;
    if !output.success() {
        return Err(CiError::Package(format!(
            "cargo metadata failed: {}",
            output.stderr.trim()
        )));
    }
    let metadata: Value = serde_json::from_str(&output.stdout)?;
    Ok(parse_metadata(&metadata))
}

/// Last few lines of build output, for error messages.
fn tail(output: &str) -> String {
    let lines: Vec<&str> = output.trim_end().lines().collect();
    lines[lines.len().saturating_sub(5)..].join("\n")
}

/// Build, package and publish `params.target` for the context's release.
pub async fn compile_and_release(
    params: &ReleaseParams,
    ctx: &JobContext,
    env: &BTreeMap<String, String>,
) -> CiResult<ReleasedAsset> {
    let release = ctx
        .release()
        .cloned()
        .ok_or_else(|| CiError::MissingRelease(COMPILE_AND_RELEASE.to_string()))?;
    let publisher = ctx
        .publisher()
        .cloned()
        .ok_or_else(|| CiError::Publish("no asset publisher configured".to_string()))?;
    let target = &params.target;
    let workspace = ctx.workspace();

    let mut build_env = env.clone();
    build_env.insert("RUSTTARGET".to_string(), target.to_string());
    let build = run_command(
        COMPILE_AND_RELEASE,
        &params.build_argv(),
        workspace,
        &build_env,
        0,
    )
    .await?;
    if !build.success() {
        return Err(CiError::Build {
            target: target.to_string(),
            message: format!("exit code {}: {}", build.exit_code, tail(&build.stderr)),
        });
    }
    debug!(target = %target, "build finished");

    let info = if params.binaries.is_empty() {
        crate_info(workspace, env).await?
    } else if params.project.is_none() {
        crate_info(workspace, env).await.unwrap_or_default()
    } else {
        CrateInfo::default()
    };
    let binaries = if params.binaries.is_empty() {
        info.binaries
    } else {
        params.binaries.clone()
    };
    if binaries.is_empty() {
        return Err(CiError::Package("no binary targets found".to_string()));
    }
    let project = params
        .project
        .clone()
        .or(info.package)
        .or_else(|| {
            workspace
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "release".to_string());

    let release_dir = workspace
        .join("target")
        .join(target.as_str())
        .join("release");
    let binary_paths: Vec<PathBuf> = binaries
        .iter()
        .map(|b| release_dir.join(format!("{b}{}", target.binary_suffix())))
        .collect();
    let extra_paths: Vec<PathBuf> = params.extra_files.iter().map(|f| workspace.join(f)).collect();
    let out_dir = ctx.dist_dir();
    let tag = release.tag.clone();
    let packaged_target = target.clone();

    let artifacts = tokio::task::spawn_blocking(move || {
        package(&PackageRequest {
            project: &project,
            tag: &tag,
            target: &packaged_target,
            binaries: &binary_paths,
            extra_files: &extra_paths,
            out_dir: &out_dir,
        })
    })
    .await
    .map_err(|e| CiError::Join(e.to_string()))??;

    let published = publisher
        .publish(&release, &artifacts)
        .await
        .map_err(|e| match e {
            CiError::Publish(_) => e,
            other => CiError::Publish(other.to_string()),
        })?;
    info!(
        target = %target,
        asset = %published.name,
        location = %published.location,
        replaced = published.replaced,
        "release asset published"
    );
    Ok(ReleasedAsset {
        artifacts,
        published,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    use crate::release::publish::MemoryPublisher;
    use crate::trigger::ReleaseRef;

    fn linux() -> TargetTriple {
        TargetTriple::parse("x86_64-unknown-linux-musl").unwrap()
    }

    fn fake_build(bin: &str, triple: &str) -> Vec<String> {
        let script = format!(
            "mkdir -p target/{triple}/release && printf bin > target/{triple}/release/{bin}"
        );
        vec!["sh".to_string(), "-c".to_string(), script]
    }

    fn workspace_with_docs() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "# tool").unwrap();
        std::fs::write(dir.path().join("LICENSE"), "MIT").unwrap();
        dir
    }

    fn release() -> ReleaseRef {
        ReleaseRef {
            tag: "v0.3.0".to_string(),
            release_id: Some(7),
        }
    }

    #[test]
    fn default_build_command_targets_triple() {
        let params = ReleaseParams::new(linux());
        assert_eq!(
            params.build_argv(),
            vec![
                "cargo",
                "build",
                "--release",
                "--target",
                "x86_64-unknown-linux-musl"
            ]
        );
        assert_eq!(params.extra_files, vec!["README.md", "LICENSE"]);
    }

    #[test]
    fn metadata_lists_bin_targets_only() {
        let metadata = json!({
            "packages": [{
                "name": "tool",
                "targets": [
                    { "name": "tool", "kind": ["bin"] },
                    { "name": "tool", "kind": ["lib"] },
                    { "name": "helper", "kind": ["bin"] }
                ]
            }]
        });
        let info = parse_metadata(&metadata);
        assert_eq!(info.package.as_deref(), Some("tool"));
        assert_eq!(info.binaries, vec!["tool", "helper"]);
    }

    #[tokio::test]
    async fn builds_packages_and_publishes() {
        let dir = workspace_with_docs();
        let publisher = Arc::new(MemoryPublisher::new());
        let ctx = JobContext::in_place(dir.path())
            .with_release(release())
            .with_publisher(publisher.clone());
        let params = ReleaseParams::new(linux())
            .with_binaries(vec!["tool".to_string()])
            .with_project("tool")
            .with_build_command(fake_build("tool", "x86_64-unknown-linux-musl"));

        let released = compile_and_release(&params, &ctx, &BTreeMap::new())
            .await
            .unwrap();
        let set = &released.artifacts;
        assert_eq!(set.asset_name(), "tool_v0.3.0_x86_64-unknown-linux-musl.tar.gz");
        assert_eq!(set.entry_names(), vec!["tool", "README.md", "LICENSE"]);
        assert_eq!(publisher.assets_for("v0.3.0").len(), 1);
        assert_eq!(
            released.published.location,
            "memory://v0.3.0/tool_v0.3.0_x86_64-unknown-linux-musl.tar.gz"
        );
    }

    #[tokio::test]
    async fn build_sees_rusttarget() {
        let dir = workspace_with_docs();
        let ctx = JobContext::in_place(dir.path())
            .with_release(release())
            .with_publisher(Arc::new(MemoryPublisher::new()));
        let script = "mkdir -p target/$RUSTTARGET/release && printf bin > target/$RUSTTARGET/release/tool";
        let params = ReleaseParams::new(linux())
            .with_binaries(vec!["tool".to_string()])
            .with_project("tool")
            .with_build_command(vec!["sh".to_string(), "-c".to_string(), script.to_string()]);

        assert!(compile_and_release(&params, &ctx, &BTreeMap::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn failed_build_is_a_build_error() {
        let dir = workspace_with_docs();
        let ctx = JobContext::in_place(dir.path())
            .with_release(release())
            .with_publisher(Arc::new(MemoryPublisher::new()));
        let params = ReleaseParams::new(linux())
            .with_binaries(vec!["tool".to_string()])
            .with_build_command(vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo linker not found >&2; exit 101".to_string(),
            ]);

        let err = compile_and_release(&params, &ctx, &BTreeMap::new())
            .await
            .unwrap_err();
        match err {
            CiError::Build { target, message } => {
                assert_eq!(target, "x86_64-unknown-linux-musl");
                assert!(message.contains("linker not found"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_license_fails_packaging_and_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "# tool").unwrap();
        let publisher = Arc::new(MemoryPublisher::new());
        let ctx = JobContext::in_place(dir.path())
            .with_release(release())
            .with_publisher(publisher.clone());
        let params = ReleaseParams::new(linux())
            .with_binaries(vec!["tool".to_string()])
            .with_project("tool")
            .with_build_command(fake_build("tool", "x86_64-unknown-linux-musl"));

        let err = compile_and_release(&params, &ctx, &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CiError::Package(_)));
        assert!(publisher.assets_for("v0.3.0").is_empty());
    }

    #[tokio::test]
    async fn requires_release_coordinates() {
        let dir = workspace_with_docs();
        let ctx = JobContext::in_place(dir.path()).with_publisher(Arc::new(MemoryPublisher::new()));
        let err = compile_and_release(&ReleaseParams::new(linux()), &ctx, &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CiError::MissingRelease(_)));
    }
}
