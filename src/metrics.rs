//! Store instrumentation.
//!
//! The transaction runner reports through a [`Recorder`] handed to it at
//! construction, so nothing in the store touches a global registry.
//!
//! # Metrics
//!
//! - `payments_pg_store_errors{method}` - transient failures per operation
//! - `payments_pg_store_retries{method}` - attempts repeated per operation
//! - `payments_pg_store_db_time{method}` - wall time of whole operations

use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

const NAMESPACE: &str = "payments";
const SUBSYSTEM: &str = "pg_store";
const DB_TIME_BUCKETS: &[f64] = &[0.025, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Observability sink for store operations
pub trait Recorder: Send + Sync {
    /// A transient failure (begin, statement or commit) in `operation`
    fn record_error(&self, operation: &str);

    /// `operation` is about to be attempted again
    fn record_retry(&self, operation: &str);

    /// Total elapsed time of `operation`, across all attempts
    fn observe_duration(&self, operation: &str, elapsed: Duration);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl Recorder for NoopRecorder {
    fn record_error(&self, _operation: &str) {}
    fn record_retry(&self, _operation: &str) {}
    fn observe_duration(&self, _operation: &str, _elapsed: Duration) {}
}

/// Prometheus-backed recorder
#[derive(Clone)]
pub struct PrometheusRecorder {
    errors: IntCounterVec,
    retries: IntCounterVec,
    db_time: HistogramVec,
}

impl PrometheusRecorder {
    /// Create the collectors and register them with `registry`.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let errors = IntCounterVec::new(
            Opts::new("errors", "wallet store err count")
                .namespace(NAMESPACE)
                .subsystem(SUBSYSTEM),
            &["method"],
        )?;
        registry.register(Box::new(errors.clone()))?;

        let retries = IntCounterVec::new(
            Opts::new("retries", "wallet store retried attempts")
                .namespace(NAMESPACE)
                .subsystem(SUBSYSTEM),
            &["method"],
        )?;
        registry.register(Box::new(retries.clone()))?;

        let db_time = HistogramVec::new(
            HistogramOpts::new("db_time", "wallet store operation time in seconds")
                .namespace(NAMESPACE)
                .subsystem(SUBSYSTEM)
                .buckets(DB_TIME_BUCKETS.to_vec()),
            &["method"],
        )?;
        registry.register(Box::new(db_time.clone()))?;

        Ok(Self {
            errors,
            retries,
            db_time,
        })
    }
}

impl Recorder for PrometheusRecorder {
    fn record_error(&self, operation: &str) {
        self.errors.with_label_values(&[operation]).inc();
    }

    fn record_retry(&self, operation: &str) {
        self.retries.with_label_values(&[operation]).inc();
    }

    fn observe_duration(&self, operation: &str, elapsed: Duration) {
        self.db_time
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_counts_per_method() {
        let registry = Registry::new();
        let recorder = PrometheusRecorder::new(&registry).unwrap();

        recorder.record_error("DepositWithdraw");
        recorder.record_error("DepositWithdraw");
        recorder.record_retry("DepositWithdraw");
        recorder.observe_duration("TransferFunds", Duration::from_millis(30));

        assert_eq!(
            recorder.errors.with_label_values(&["DepositWithdraw"]).get(),
            2
        );
        assert_eq!(
            recorder.retries.with_label_values(&["DepositWithdraw"]).get(),
            1
        );
        assert_eq!(
            recorder
                .db_time
                .with_label_values(&["TransferFunds"])
                .get_sample_count(),
            1
        );

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"payments_pg_store_errors".to_string()));
        assert!(names.contains(&"payments_pg_store_db_time".to_string()));
    }

    #[test]
    fn registering_twice_in_one_registry_fails() {
        let registry = Registry::new();
        PrometheusRecorder::new(&registry).unwrap();
        assert!(PrometheusRecorder::new(&registry).is_err());
    }
}
