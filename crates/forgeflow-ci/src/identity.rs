//! Workflow identity for run linking.

use forgeflow_state::ContentDigest;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::release::target::TargetTriple;

/// Identity of one job of a workflow.
///
/// Jobs with the same ordered step names share a `steps_digest`, which is
/// stored as the run's spec digest so runs of one workflow shape can be
/// listed together regardless of revision or target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowIdentity {
    pub workflow: String,

    pub step_names: Vec<String>,

    /// SHA-256 digest of ordered step names (deterministic).
    pub steps_digest: String,

    /// Revision under test.
    pub revision: String,

    pub target: Option<TargetTriple>,
}

impl WorkflowIdentity {
    pub fn new(
        workflow: &str,
        step_names: &[String],
        revision: &str,
        target: Option<&TargetTriple>,
    ) -> Self {
        Self {
            workflow: workflow.to_string(),
            step_names: step_names.to_vec(),
            steps_digest: compute_steps_digest(step_names),
            revision: revision.to_string(),
            target: target.cloned(),
        }
    }

    /// Digest recorded as the ledger's spec digest.
    pub fn spec_digest(&self) -> ContentDigest {
        ContentDigest::from_bytes(&steps_bytes(&self.step_names))
    }
}

fn steps_bytes(steps: &[String]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for step in steps {
        bytes.extend_from_slice(step.as_bytes());
        bytes.push(0);
    }
    bytes
}

/// Compute deterministic digest of ordered step names.
fn compute_steps_digest(steps: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(steps_bytes(steps));
    hex::encode(hasher.finalize())
}
