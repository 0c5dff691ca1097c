//! Structured observability hooks for pipeline lifecycle events.
//!
//! - Job-scoped tracing spans via [`job_span`]
//! - Emission functions for run, step, matrix and gate events

use tracing::{info, warn};

/// Span covering one job; attach it to the job future with
/// `tracing::Instrument`.
pub fn job_span(workflow: &str, job: &str) -> tracing::Span {
    tracing::info_span!("forgeflow.job", workflow = %workflow, job = %job)
}

/// Emit event: run started for a job.
pub fn emit_run_started(run_id: &str, job_name: &str) {
    info!(event = "run.started", run_id = %run_id, job = %job_name);
}

/// Emit event: run finished with duration, total events, and success status.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, total_events: u64, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        total_events = total_events,
        success = success,
    );
}

pub fn emit_step_started(run_id: &str, step: &str, seq: u64) {
    info!(event = "step.started", run_id = %run_id, step = %step, seq = seq);
}

pub fn emit_step_finished(run_id: &str, step: &str, outcome: &str, duration_ms: u64) {
    info!(
        event = "step.finished",
        run_id = %run_id,
        step = %step,
        outcome = %outcome,
        duration_ms = duration_ms,
    );
}

/// Emit event: one matrix job reached a final outcome.
pub fn emit_matrix_job_finished(job: &str, outcome: &str) {
    info!(event = "matrix.job_finished", job = %job, outcome = %outcome);
}

/// Emit event: gate evaluation completed.
pub fn emit_gate_evaluated(run_id: &str, violations: usize, passed: bool) {
    info!(
        event = "gate.evaluated",
        run_id = %run_id,
        violations = violations,
        passed = passed,
    );
}

/// Emit event: run finalization error (warning level).
pub fn emit_run_finalize_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.finalize_error", run_id = %run_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_span_create() {
        let _span = job_span("ci", "ci").entered();
        emit_step_started("run-1", "build", 1);
    }
}
