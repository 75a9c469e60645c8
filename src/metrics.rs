//! Metrics definitions for the combiner.
//!
//! This module defines all metrics keys used by the combiner and
//! provides a helper [`describe_metrics`] to set metadata for
//! each metric using the `metrics` crate.

/// Metrics key for signer call latency, labelled by signer.
pub const METRICS_SIGNER_LATENCY: &str = "pnp.combiner.signer.latency";
/// Metrics key for failed signer calls, labelled by signer and failure kind.
pub const METRICS_SIGNER_ERRORS: &str = "pnp.combiner.signer.errors";
/// Metrics key for detected discrepancies, labelled by kind.
pub const METRICS_DISCREPANCIES: &str = "pnp.combiner.discrepancies";
/// Metrics key for finished rounds, labelled by outcome.
pub const METRICS_ROUNDS: &str = "pnp.combiner.rounds";
/// Metrics key for combination attempts per round.
pub const METRICS_COMBINE_ATTEMPTS: &str = "pnp.combiner.combine_attempts";

/// Describe all metrics used by the combiner.
///
/// This calls the `describe_*` functions from the `metrics` crate to set metadata on the different metrics.
pub fn describe_metrics() {
    metrics::describe_histogram!(
        METRICS_SIGNER_LATENCY,
        metrics::Unit::Seconds,
        "Time until a signer answered or failed"
    );
    metrics::describe_counter!(
        METRICS_SIGNER_ERRORS,
        metrics::Unit::Count,
        "Number of failed signer calls"
    );
    metrics::describe_counter!(
        METRICS_DISCREPANCIES,
        metrics::Unit::Count,
        "Number of inconsistencies detected between signer responses"
    );
    metrics::describe_counter!(
        METRICS_ROUNDS,
        metrics::Unit::Count,
        "Number of dispatched signing rounds"
    );
    metrics::describe_histogram!(
        METRICS_COMBINE_ATTEMPTS,
        metrics::Unit::Count,
        "Combination attempts needed per round"
    );
}

/// Labels attached to a single measurement.
pub type Labels = [(&'static str, String)];

/// Destination of the measurements taken off the request path.
pub trait MetricsSink: Send + Sync + 'static {
    fn increment(&self, key: &'static str, labels: &Labels);

    fn record(&self, key: &'static str, labels: &Labels, value: f64);
}

/// Forwards to whichever recorder is installed for the `metrics` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecorderSink;

impl MetricsSink for RecorderSink {
    fn increment(&self, key: &'static str, labels: &Labels) {
        metrics::counter!(key, labels).increment(1);
    }

    fn record(&self, key: &'static str, labels: &Labels, value: f64) {
        metrics::histogram!(key, labels).record(value);
    }
}
