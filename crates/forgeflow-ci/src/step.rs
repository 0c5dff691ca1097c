//! Step definitions and configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::release::action::ReleaseParams;

/// Name of the release job's compile-and-release step.
pub const COMPILE_AND_RELEASE: &str = "compile_and_release";

/// Builtin CI steps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinStep {
    /// Fetch the exact revision under test
    Checkout,

    /// cargo build --verbose
    Build,

    /// cargo clippy --all-targets --all-features -- -D warnings
    Lint,

    /// cargo fmt --all -- --check
    Format,

    /// cargo test --verbose
    Test,
}

impl BuiltinStep {
    /// The CI pipeline, in execution order.
    pub const CI_SEQUENCE: [BuiltinStep; 5] = [
        BuiltinStep::Checkout,
        BuiltinStep::Build,
        BuiltinStep::Lint,
        BuiltinStep::Format,
        BuiltinStep::Test,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BuiltinStep::Checkout => "checkout",
            BuiltinStep::Build => "build",
            BuiltinStep::Lint => "lint",
            BuiltinStep::Format => "format",
            BuiltinStep::Test => "test",
        }
    }

    /// The step's command, `None` for steps implemented in-process.
    pub fn command(&self) -> Option<Vec<String>> {
        let argv: &[&str] = match self {
            BuiltinStep::Checkout => return None,
            BuiltinStep::Build => &["cargo", "build", "--verbose"],
            BuiltinStep::Lint => &[
                "cargo",
                "clippy",
                "--all-targets",
                "--all-features",
                "--",
                "-D",
                "warnings",
            ],
            // Check-only: a formatting diff fails the step, files are never rewritten.
            BuiltinStep::Format => &["cargo", "fmt", "--all", "--", "--check"],
            BuiltinStep::Test => &["cargo", "test", "--verbose"],
        };
        Some(argv.iter().map(|s| s.to_string()).collect())
    }
}

/// What a step does when it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    /// Materialize the triggering revision in the job workspace.
    Checkout,

    /// Run a program (first element is the executable).
    Command { argv: Vec<String> },

    /// Cross-compile, package and attach to the triggering release.
    CompileAndRelease(ReleaseParams),
}

/// Configuration for one step of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Human-readable step name.
    pub name: String,

    pub action: StepAction,

    /// Extra environment for this step only.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Timeout in seconds; 0 disables it.
    #[serde(default)]
    pub timeout_secs: u64,

    /// Whether this step is enabled.
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

impl StepConfig {
    /// Create a step configuration from a builtin step.
    pub fn from_builtin(step: BuiltinStep, timeout_secs: u64) -> Self {
        let action = match step.command() {
            Some(argv) => StepAction::Command { argv },
            None => StepAction::Checkout,
        };
        Self {
            name: step.name().to_string(),
            action,
            env: BTreeMap::new(),
            timeout_secs,
            enabled: true,
        }
    }

    /// Create a custom command step.
    pub fn custom(name: impl Into<String>, argv: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            name: name.into(),
            action: StepAction::Command { argv },
            env: BTreeMap::new(),
            timeout_secs,
            enabled: true,
        }
    }

    /// Create the compile-and-release step for one target.
    pub fn compile_and_release(params: ReleaseParams, timeout_secs: u64) -> Self {
        Self {
            name: COMPILE_AND_RELEASE.to_string(),
            action: StepAction::CompileAndRelease(params),
            env: BTreeMap::new(),
            timeout_secs,
            enabled: true,
        }
    }

    /// Add an environment variable for this step.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Disable this step.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Short description of the step's action, for plans and events.
    pub fn describe(&self) -> String {
        match &self.action {
            StepAction::Checkout => "checkout".to_string(),
            StepAction::Command { argv } => argv.join(" "),
            StepAction::CompileAndRelease(params) => {
                format!("compile and release {}", params.target)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::target::TargetTriple;

    #[test]
    fn test_builtin_step_names() {
        let names: Vec<&str> = BuiltinStep::CI_SEQUENCE.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["checkout", "build", "lint", "format", "test"]);
    }

    #[test]
    fn test_lint_escalates_warnings() {
        let cmd = BuiltinStep::Lint.command().unwrap();
        assert_eq!(cmd[0], "cargo");
        assert!(cmd.contains(&"--all-targets".to_string()));
        assert!(cmd.contains(&"--all-features".to_string()));
        assert!(cmd.ends_with(&["-D".to_string(), "warnings".to_string()]));
    }

    #[test]
    fn test_format_is_check_only() {
        let cmd = BuiltinStep::Format.command().unwrap();
        assert!(cmd.contains(&"--check".to_string()));
    }

    #[test]
    fn test_build_and_test_are_verbose() {
        assert!(BuiltinStep::Build
            .command()
            .unwrap()
            .contains(&"--verbose".to_string()));
        assert!(BuiltinStep::Test
            .command()
            .unwrap()
            .contains(&"--verbose".to_string()));
    }

    #[test]
    fn test_checkout_runs_in_process() {
        assert!(BuiltinStep::Checkout.command().is_none());
        let config = StepConfig::from_builtin(BuiltinStep::Checkout, 0);
        assert!(matches!(config.action, StepAction::Checkout));
    }

    #[test]
    fn test_step_config_custom() {
        let config = StepConfig::custom(
            "my_step",
            vec!["echo".to_string(), "hello".to_string()],
            60,
        )
        .with_env("FOO", "bar");
        assert_eq!(config.name, "my_step");
        assert_eq!(config.timeout_secs, 60);
        assert_eq!(config.env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(config.describe(), "echo hello");
        assert!(config.enabled);
    }

    #[test]
    fn test_step_config_disabled() {
        let config = StepConfig::from_builtin(BuiltinStep::Build, 300).disabled();
        assert!(!config.enabled);
    }

    #[test]
    fn test_compile_and_release_step() {
        let target = TargetTriple::parse("x86_64-unknown-linux-musl").unwrap();
        let config = StepConfig::compile_and_release(ReleaseParams::new(target), 0);
        assert_eq!(config.name, COMPILE_AND_RELEASE);
        assert_eq!(
            config.describe(),
            "compile and release x86_64-unknown-linux-musl"
        );
    }
}
