//! forgeflow-ci: CI and release pipelines for cargo projects.
//!
//! Two workflows are built in:
//!
//! - **ci**: checkout, build, lint, format-check and test as one sequential
//!   job on every push and pull request against the main branch. The first
//!   failing step aborts the job.
//! - **release**: when a release is created, one independent job per target
//!   triple cross-compiles the project, packages the binaries with the
//!   auxiliary files and attaches the archive to the release. A failing
//!   target never cancels the others.
//!
//! Every job is recorded as one run in a [`forgeflow_state::RunLedger`].

pub mod config;
pub mod context;
pub mod error;
pub mod gate;
pub mod git;
pub mod identity;
pub mod job;
pub mod matrix;
pub mod obs;
pub mod recording;
pub mod release;
pub mod runner;
pub mod step;
pub mod telemetry;
pub mod trigger;
pub mod workflow;

pub use config::{ForgeConfig, PublishTarget, SecretToken};
pub use context::{CheckoutMode, JobContext};
pub use error::{CiError, CiResult};
pub use gate::{CiGate, GateVerdict};
pub use identity::WorkflowIdentity;
pub use job::{JobOutcome, JobResult, JobRunner, JobSpec};
pub use matrix::{MatrixConfig, MatrixJobOutcome, MatrixResult, MatrixRunner};
pub use recording::RunRecorder;
pub use release::{ArtifactSet, AssetPublisher, ReleaseParams, TargetTriple};
pub use runner::{StepOutcome, StepResult, StepRunner};
pub use step::{BuiltinStep, StepAction, StepConfig};
pub use trigger::{tag_ref, ReleaseAction, ReleaseRef, TriggerEvent, TriggerFilter};
pub use workflow::{Dispatcher, RunReport, Workflow, WorkflowKind, WorkspaceMode};
