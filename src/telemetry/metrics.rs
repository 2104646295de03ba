//! Metric instrument factories.
//!
//! Instruments come from the `"assetgen"` meter on the global
//! `MeterProvider`. Without an OTLP pipeline they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("assetgen")
}

/// Labels: `job_type`, `result` ("queued" | "failed").
pub fn jobs_created() -> Counter<u64> {
    meter()
        .u64_counter("assetgen.jobs.created")
        .with_description("Number of jobs created")
        .build()
}

/// Labels: `from`, `to`.
pub fn job_transitions() -> Counter<u64> {
    meter()
        .u64_counter("assetgen.jobs.transitions")
        .with_description("Number of job status transitions")
        .build()
}

/// Labels: `job_type`, `error_class`.
pub fn job_retries() -> Counter<u64> {
    meter()
        .u64_counter("assetgen.jobs.retries")
        .with_description("Number of scheduled job retries")
        .build()
}

/// Labels: `job_type`, `target`.
pub fn job_escalations() -> Counter<u64> {
    meter()
        .u64_counter("assetgen.jobs.escalations")
        .with_description("Number of jobs escalated after failing")
        .build()
}

/// Labels: `job_type`, `status`.
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("assetgen.jobs.duration_ms")
        .with_description("Job processing duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Labels: `event_type`, `result` ("ok" | "duplicate").
pub fn events_appended() -> Counter<u64> {
    meter()
        .u64_counter("assetgen.events.appended")
        .with_description("Number of event appends")
        .build()
}

/// Labels: `breaker_type`.
pub fn breaker_trips() -> Counter<u64> {
    meter()
        .u64_counter("assetgen.breakers.trips")
        .with_description("Number of circuit breaker trips")
        .build()
}

/// Labels: `breaker_type`.
pub fn breaker_blocks() -> Counter<u64> {
    meter()
        .u64_counter("assetgen.breakers.blocked")
        .with_description("Number of triggers blocked by a circuit breaker")
        .build()
}

/// Labels: `status`.
pub fn automation_runs() -> Counter<u64> {
    meter()
        .u64_counter("assetgen.automation.runs")
        .with_description("Number of automation runs by outcome")
        .build()
}
