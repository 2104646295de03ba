//! Span helpers for jobs and automation runs.

use tracing::Span;

use crate::model::job::{JobId, JobType};

/// Span for one job execution. `job.status` is filled in as the job moves.
pub fn start_job_span(project_id: &str, job_type: JobType, job_id: &JobId) -> Span {
    tracing::info_span!(
        "job.execute",
        "project.id" = project_id,
        "job.type" = job_type.as_str(),
        "job.id" = %job_id,
        "job.status" = tracing::field::Empty,
    )
}

pub fn start_run_span(project_id: &str, rule_id: &str, run_id: &str) -> Span {
    tracing::info_span!(
        "automation.run",
        "project.id" = project_id,
        "rule.id" = rule_id,
        "run.id" = run_id,
    )
}

/// Record a status change on `span` and emit it as an event.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("job.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
