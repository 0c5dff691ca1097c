//! Trigger events and the filters that select workflows for them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CiError, CiResult};

const HEADS_PREFIX: &str = "refs/heads/";
const TAGS_PREFIX: &str = "refs/tags/";

/// Pull request activity types that run workflows when no explicit list is given.
const PR_DEFAULT_ACTIONS: &[&str] = &["opened", "synchronize", "reopened"];

/// Lifecycle transition of a release object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseAction {
    Created,
    Published,
    Other(String),
}

impl ReleaseAction {
    pub fn parse(action: &str) -> Self {
        match action {
            "created" => ReleaseAction::Created,
            "published" => ReleaseAction::Published,
            other => ReleaseAction::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ReleaseAction::Created => "created",
            ReleaseAction::Published => "published",
            ReleaseAction::Other(s) => s,
        }
    }
}

/// An event that can start pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerEvent {
    /// Commits pushed to a ref (`refs/heads/<branch>` or `refs/tags/<tag>`).
    Push { git_ref: String, revision: String },

    /// Pull request activity against `target_branch`.
    PullRequest {
        number: u64,
        action: String,
        target_branch: String,
        revision: String,
    },

    /// Release object lifecycle event. `revision` is what gets built;
    /// `target_commitish` is the branch or commit the release was cut from
    /// and is informational only.
    Release {
        action: ReleaseAction,
        tag: String,
        release_id: Option<u64>,
        revision: String,
        #[serde(default)]
        target_commitish: Option<String>,
    },
}

impl TriggerEvent {
    /// Push of `revision` to `branch`.
    pub fn push(branch: &str, revision: &str) -> Self {
        TriggerEvent::Push {
            git_ref: format!("{HEADS_PREFIX}{}", normalize_branch(branch)),
            revision: revision.to_string(),
        }
    }

    /// Newly created release for `tag`.
    pub fn release_created(tag: &str, release_id: Option<u64>, revision: &str) -> Self {
        TriggerEvent::Release {
            action: ReleaseAction::Created,
            tag: tag.to_string(),
            release_id,
            revision: revision.to_string(),
            target_commitish: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TriggerEvent::Push { .. } => "push",
            TriggerEvent::PullRequest { .. } => "pull_request",
            TriggerEvent::Release { .. } => "release",
        }
    }

    /// Source revision under test.
    pub fn revision(&self) -> &str {
        match self {
            TriggerEvent::Push { revision, .. }
            | TriggerEvent::PullRequest { revision, .. }
            | TriggerEvent::Release { revision, .. } => revision,
        }
    }

    /// Branch of a push event; `None` for tag pushes and other events.
    pub fn push_branch(&self) -> Option<&str> {
        match self {
            TriggerEvent::Push { git_ref, .. } => git_ref.strip_prefix(HEADS_PREFIX),
            _ => None,
        }
    }

    /// Release coordinates carried by a release event.
    pub fn release_ref(&self) -> Option<ReleaseRef> {
        match self {
            TriggerEvent::Release {
                tag, release_id, ..
            } => Some(ReleaseRef {
                tag: tag.clone(),
                release_id: *release_id,
            }),
            _ => None,
        }
    }

    /// Parse a GitHub-style webhook payload.
    pub fn from_github(event_name: &str, payload: &Value) -> CiResult<Self> {
        match event_name {
            "push" => Ok(TriggerEvent::Push {
                git_ref: required_str(payload, "/ref")?,
                revision: required_str(payload, "/after")?,
            }),
            "pull_request" => Ok(TriggerEvent::PullRequest {
                number: payload
                    .pointer("/number")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| CiError::InvalidPayload("missing /number".to_string()))?,
                action: payload
                    .pointer("/action")
                    .and_then(Value::as_str)
                    .unwrap_or("opened")
                    .to_string(),
                target_branch: required_str(payload, "/pull_request/base/ref")?,
                revision: required_str(payload, "/pull_request/head/sha")?,
            }),
            "release" => {
                let tag = required_str(payload, "/release/tag_name")?;
                Ok(TriggerEvent::Release {
                    action: ReleaseAction::parse(&required_str(payload, "/action")?),
                    revision: tag_ref(&tag),
                    release_id: payload.pointer("/release/id").and_then(Value::as_u64),
                    target_commitish: payload
                        .pointer("/release/target_commitish")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    tag,
                })
            }
            other => Err(CiError::UnsupportedEvent(other.to_string())),
        }
    }
}

/// Coordinates of the release that assets are attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRef {
    pub tag: String,
    pub release_id: Option<u64>,
}

/// Selects which events start a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "on", rename_all = "snake_case")]
pub enum TriggerFilter {
    Push { branches: Vec<String> },
    PullRequest { branches: Vec<String> },
    Release { actions: Vec<ReleaseAction> },
}

impl TriggerFilter {
    pub fn matches(&self, event: &TriggerEvent) -> bool {
        match (self, event) {
            (TriggerFilter::Push { branches }, TriggerEvent::Push { .. }) => event
                .push_branch()
                .map(|b| branch_listed(branches, b))
                .unwrap_or(false),
            (
                TriggerFilter::PullRequest { branches },
                TriggerEvent::PullRequest {
                    action,
                    target_branch,
                    ..
                },
            ) => {
                PR_DEFAULT_ACTIONS.contains(&action.as_str())
                    && branch_listed(branches, target_branch)
            }
            (TriggerFilter::Release { actions }, TriggerEvent::Release { action, .. }) => {
                actions.contains(action)
            }
            _ => false,
        }
    }
}

/// Full ref of a release tag; releases always build the tagged commit.
pub fn tag_ref(tag: &str) -> String {
    format!("{TAGS_PREFIX}{}", tag.strip_prefix(TAGS_PREFIX).unwrap_or(tag))
}

fn normalize_branch(branch: &str) -> &str {
    branch.strip_prefix(HEADS_PREFIX).unwrap_or(branch)
}

fn branch_listed(branches: &[String], branch: &str) -> bool {
    let branch = normalize_branch(branch);
    branches.iter().any(|b| normalize_branch(b) == branch)
}

fn required_str(payload: &Value, pointer: &str) -> CiResult<String> {
    payload
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CiError::InvalidPayload(format!("missing {pointer}")))
}
