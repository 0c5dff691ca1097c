//! forgeflow configuration.
//!
//! Loaded from an optional `forgeflow.toml`, then overridden by the
//! environment variables the hosted workflows use (`GITHUB_TOKEN`,
//! `RUSTTARGET`, `EXTRA_FILES`, `CARGO_TERM_COLOR`, `GITHUB_REPOSITORY`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CiError, CiResult};
use crate::release::target::{TargetTriple, DEFAULT_TARGETS};

pub const DEFAULT_CONFIG_FILE: &str = "forgeflow.toml";

/// Credential material; never printed or serialized.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretToken(String);

impl SecretToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretToken(***)")
    }
}

/// Where release archives are published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PublishTarget {
    Github {
        #[serde(default = "default_api_url")]
        api_url: String,
        #[serde(default = "default_upload_url")]
        upload_url: String,
    },
    Directory {
        path: PathBuf,
    },
}

impl Default for PublishTarget {
    fn default() -> Self {
        PublishTarget::Github {
            api_url: default_api_url(),
            upload_url: default_upload_url(),
        }
    }
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_upload_url() -> String {
    "https://uploads.github.com".to_string()
}

/// CI pipeline settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CiSection {
    /// Per-step timeout in seconds; 0 leaves it to the host.
    pub step_timeout_secs: u64,
}

/// Release pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseSection {
    pub targets: Vec<String>,
    pub extra_files: Vec<String>,
    /// Binary names to ship; discovered from `cargo metadata` when empty.
    pub binaries: Vec<String>,
    /// Replaces `cargo build --release --target <triple>`; the triple is in
    /// `RUSTTARGET`.
    pub build_command: Option<Vec<String>>,
    pub fail_fast: bool,
    pub max_parallel: usize,
    pub publish: PublishTarget,
    pub step_timeout_secs: u64,
}

impl Default for ReleaseSection {
    fn default() -> Self {
        Self {
            targets: DEFAULT_TARGETS.iter().map(|t| t.to_string()).collect(),
            extra_files: vec!["README.md".to_string(), "LICENSE".to_string()],
            binaries: Vec::new(),
            build_command: None,
            fail_fast: false,
            max_parallel: DEFAULT_TARGETS.len(),
            publish: PublishTarget::default(),
            step_timeout_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// Archive name prefix; defaults to the first cargo package name.
    pub project: Option<String>,
    /// Source cloned by the checkout step (path or URL).
    pub repository: String,
    /// `owner/name` on GitHub, used for asset upload.
    pub github_repository: Option<String>,
    pub main_branch: String,
    pub ledger_dir: PathBuf,
    pub term_color: String,
    pub ci: CiSection,
    pub release: ReleaseSection,
    #[serde(skip)]
    pub token: Option<SecretToken>,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            project: None,
            repository: ".".to_string(),
            github_repository: None,
            main_branch: "master".to_string(),
            ledger_dir: PathBuf::from(".forgeflow/runs"),
            term_color: "always".to_string(),
            ci: CiSection::default(),
            release: ReleaseSection::default(),
            token: None,
        }
    }
}

impl ForgeConfig {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> CiResult<Self> {
        toml::from_str(content).map_err(|e| CiError::Config(e.to_string()))
    }

    /// Load from `path`, or from `forgeflow.toml` in the working directory
    /// when it exists, or fall back to defaults. Environment overrides are
    /// applied last.
    pub fn load(path: Option<&Path>) -> CiResult<Self> {
        let mut config = match path {
            Some(p) => Self::read(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::read(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn read(path: &Path) -> CiResult<Self> {
        debug!(path = %path.display(), "loading configuration");
        let content = std::fs::read_to_string(path)
            .map_err(|e| CiError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = non_empty("GITHUB_TOKEN") {
            self.token = Some(SecretToken::new(token));
        }
        if let Some(target) = non_empty("RUSTTARGET") {
            self.release.targets = vec![target.trim().to_string()];
        }
        if let Some(files) = non_empty("EXTRA_FILES") {
            self.release.extra_files = split_list(&files);
        }
        if let Some(color) = non_empty("CARGO_TERM_COLOR") {
            self.term_color = color;
        }
        if let Some(repo) = non_empty("GITHUB_REPOSITORY") {
            self.github_repository = Some(repo);
        }
    }

    pub fn validate(&self) -> CiResult<()> {
        if self.release.targets.is_empty() {
            return Err(CiError::Config("release.targets is empty".to_string()));
        }
        if self.release.max_parallel == 0 {
            return Err(CiError::Config("release.max_parallel must be > 0".to_string()));
        }
        self.targets().map(|_| ())
    }

    /// Parsed release targets.
    pub fn targets(&self) -> CiResult<Vec<TargetTriple>> {
        self.release
            .targets
            .iter()
            .map(|t| TargetTriple::parse(t))
            .collect()
    }
}

/// Split a space- or comma-separated list.
fn split_list(s: &str) -> Vec<String> {
    s.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}
