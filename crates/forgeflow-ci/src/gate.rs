//! Pass/fail verdict over a job's recorded events.

use std::collections::BTreeSet;

use forgeflow_state::{RunEvent, RunId, RunLedger};
use serde::{Deserialize, Serialize};

use crate::error::CiResult;
use crate::obs;
use crate::recording::kinds;

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// CI gate evaluation rules.
pub struct CiGate;

impl CiGate {
    /// Evaluate a run's events.
    ///
    /// The gate fails when
    /// - a step recorded `step_failed`,
    /// - a step was started but never passed or failed, or
    /// - a step was started after an earlier step failed.
    pub fn evaluate(events: &[RunEvent]) -> GateVerdict {
        let mut violations = Vec::new();
        let mut open: BTreeSet<String> = BTreeSet::new();
        let mut first_failure: Option<String> = None;

        for event in events {
            let step = event.payload["step_name"]
                .as_str()
                .unwrap_or("unknown")
                .to_string();
            match event.kind.as_str() {
                kinds::STEP_STARTED => {
                    if let Some(failed) = &first_failure {
                        violations.push(format!(
                            "Step '{}' ran after step '{}' failed",
                            step, failed
                        ));
                    }
                    open.insert(step);
                }
                kinds::STEP_PASSED => {
                    open.remove(&step);
                }
                kinds::STEP_FAILED => {
                    open.remove(&step);
                    let error = event.payload["error"]
                        .as_str()
                        .unwrap_or("unknown error")
                        .to_string();
                    violations.push(format!("Step '{}' failed: {}", step, error));
                    first_failure.get_or_insert(step);
                }
                _ => {}
            }
        }

        for step in open {
            violations.push(format!("Step '{}' was started but never finished", step));
        }

        let passed = violations.is_empty();
        let message = if passed {
            "All steps passed".to_string()
        } else {
            format!("Gate failed with {} violation(s)", violations.len())
        };

        GateVerdict {
            passed,
            violations,
            message,
        }
    }

    /// Load a run's events from `ledger` and evaluate them.
    pub async fn evaluate_run(ledger: &dyn RunLedger, run_id: &RunId) -> CiResult<GateVerdict> {
        let events = ledger.get_events(run_id).await?;
        let verdict = Self::evaluate(&events);
        obs::emit_gate_evaluated(&run_id.to_string(), verdict.violations.len(), verdict.passed);
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Value};

    fn event(seq: u64, kind: &str, payload: Value) -> RunEvent {
        RunEvent {
            seq,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_empty_events_passes() {
        let verdict = CiGate::evaluate(&[]);
        assert!(verdict.passed);
    }

    #[test]
    fn test_passing_steps() {
        let events = vec![
            event(1, "step_started", json!({ "step_name": "build" })),
            event(2, "step_passed", json!({ "step_name": "build", "exit_code": 0 })),
            event(3, "step_started", json!({ "step_name": "test" })),
            event(4, "step_passed", json!({ "step_name": "test", "exit_code": 0 })),
        ];
        let verdict = CiGate::evaluate(&events);
        assert!(verdict.passed);
        assert_eq!(verdict.message, "All steps passed");
    }

    #[test]
    fn test_failed_step_with_skips() {
        let events = vec![
            event(1, "step_started", json!({ "step_name": "lint" })),
            event(
                2,
                "step_failed",
                json!({ "step_name": "lint", "error": "Step 'lint' exited with code 1" }),
            ),
            event(3, "step_skipped", json!({ "step_name": "test" })),
        ];
        let verdict = CiGate::evaluate(&events);
        assert!(!verdict.passed);
        assert_eq!(verdict.violations.len(), 1);
        assert!(verdict.violations[0].contains("lint"));
    }

    #[test]
    fn test_step_after_failure_is_flagged() {
        let events = vec![
            event(1, "step_started", json!({ "step_name": "build" })),
            event(2, "step_failed", json!({ "step_name": "build", "error": "boom" })),
            event(3, "step_started", json!({ "step_name": "test" })),
            event(4, "step_passed", json!({ "step_name": "test" })),
        ];
        let verdict = CiGate::evaluate(&events);
        assert!(!verdict.passed);
        assert!(verdict
            .violations
            .iter()
            .any(|v| v == "Step 'test' ran after step 'build' failed"));
    }

    #[test]
    fn test_started_but_never_finished() {
        let events = vec![event(1, "step_started", json!({ "step_name": "format" }))];
        let verdict = CiGate::evaluate(&events);
        assert!(!verdict.passed);
        assert_eq!(
            verdict.violations,
            vec!["Step 'format' was started but never finished"]
        );
    }
}
