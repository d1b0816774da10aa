//! Thin wrappers around the `metrics` crate's macros for the instruments
//! this crate owns from spec §6 (`validation_errors_total` belongs to the
//! input validator, specified only at its interface boundary and out of
//! this crate's scope). Centralizing the label sets here keeps call sites
//! in `orchestrator.rs`/`auth.rs` from repeating them.

use std::time::Duration;

pub fn record_step_execution(org: &str, flow: &str, step_key: &str, duration: Duration) {
    metrics::histogram!(
        "step_execution_seconds",
        "org" => org.to_string(),
        "flow" => flow.to_string(),
        "stepKey" => step_key.to_string(),
    )
    .record(duration.as_secs_f64());
}

pub fn record_step_error(org: &str, flow: &str, step_key: &str, code: &str) {
    metrics::counter!(
        "step_errors_total",
        "org" => org.to_string(),
        "flow" => flow.to_string(),
        "stepKey" => step_key.to_string(),
        "code" => code.to_string(),
    )
    .increment(1);
}

pub fn record_step_retry(org: &str, flow: &str, step_key: &str) {
    metrics::counter!(
        "step_retries_total",
        "org" => org.to_string(),
        "flow" => flow.to_string(),
        "stepKey" => step_key.to_string(),
    )
    .increment(1);
}
