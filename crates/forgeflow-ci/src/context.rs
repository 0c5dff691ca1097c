//! Per-job execution environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use crate::error::CiResult;
use crate::release::publish::AssetPublisher;
use crate::trigger::ReleaseRef;

/// How the checkout step materializes the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutMode {
    /// Clone `repository` into a fresh, empty workspace.
    Clone { repository: String },

    /// Use an existing work tree as-is; checkout only verifies it.
    InPlace,
}

/// Everything a job's steps can see: workspace, environment and the release
/// they publish to. Credentials stay inside the publisher.
///
/// An ephemeral context owns a temporary directory that is removed when the
/// context is dropped, so no state survives between jobs.
pub struct JobContext {
    workspace: PathBuf,
    _scratch: Option<TempDir>,
    checkout: CheckoutMode,
    revision: Option<String>,
    env: BTreeMap<String, String>,
    release: Option<ReleaseRef>,
    publisher: Option<Arc<dyn AssetPublisher>>,
}

impl JobContext {
    /// Run steps directly inside `workspace`.
    pub fn in_place(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            _scratch: None,
            checkout: CheckoutMode::InPlace,
            revision: None,
            env: BTreeMap::new(),
            release: None,
            publisher: None,
        }
    }

    /// Provision a fresh temporary workspace that the checkout step clones
    /// `repository` into.
    pub fn ephemeral(repository: &str) -> CiResult<Self> {
        let scratch = tempfile::Builder::new()
            .prefix("forgeflow-job-")
            .tempdir()?;
        // Local paths must survive the change of working directory.
        let repository = match std::fs::canonicalize(repository) {
            Ok(p) => p.display().to_string(),
            Err(_) => repository.to_string(),
        };
        Ok(Self {
            workspace: scratch.path().join("src"),
            _scratch: Some(scratch),
            checkout: CheckoutMode::Clone { repository },
            revision: None,
            env: BTreeMap::new(),
            release: None,
            publisher: None,
        })
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_release(mut self, release: ReleaseRef) -> Self {
        self.release = Some(release);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn AssetPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn checkout_mode(&self) -> &CheckoutMode {
        &self.checkout
    }

    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn release(&self) -> Option<&ReleaseRef> {
        self.release.as_ref()
    }

    pub fn publisher(&self) -> Option<&Arc<dyn AssetPublisher>> {
        self.publisher.as_ref()
    }

    /// Directory release archives are written to.
    pub fn dist_dir(&self) -> PathBuf {
        self.workspace.join("target").join("forgeflow-dist")
    }

    /// Job environment merged with `step_env` (step wins).
    pub fn step_env(&self, step_env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.extend(step_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("workspace", &self.workspace)
            .field("checkout", &self.checkout)
            .field("revision", &self.revision)
            .field("release", &self.release)
            .field("publisher", &self.publisher.as_ref().map(|p| p.name()))
            .finish()
    }
}
