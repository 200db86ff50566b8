//! Performance samples and threshold alerting.
//!
//! Every pipeline stage reports through a [`MetricsSink`]. A sink measures
//! elapsed time, reads host utilization from a [`ResourceProbe`], persists the
//! resulting [`MetricSample`] to a [`MetricsBackend`] and evaluates the
//! configured [`Thresholds`]. Recording never fails past the caller: backend
//! and alert-log failures are logged and dropped.
//!
//! [`report::AlertReporter`] works over the accumulated samples afterwards.

pub mod alerts;
pub mod probe;
pub mod report;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use alerts::{Alert, AlertLog, Thresholds, evaluate};
pub use probe::{FixedProbe, ResourceProbe, ResourceUsage, SystemProbe};

use crate::store::MetricsBackend;

/// One timestamped measurement of a named operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub store_kind: String,
    pub operation: String,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub latency_ms: f64,
    pub error_count: u64,
    pub mismatch_count: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Records samples and raises threshold alerts.
#[derive(Clone)]
pub struct MetricsSink {
    backend: Arc<dyn MetricsBackend>,
    probe: Arc<dyn ResourceProbe>,
    thresholds: Thresholds,
    alert_log: Option<AlertLog>,
}

impl MetricsSink {
    pub fn new(
        backend: Arc<dyn MetricsBackend>,
        probe: Arc<dyn ResourceProbe>,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            backend,
            probe,
            thresholds,
            alert_log: None,
        }
    }

    /// Also append triggered alerts to `log`.
    pub fn with_alert_log(mut self, log: AlertLog) -> Self {
        self.alert_log = Some(log);
        self
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Record an operation that began at `start` and has just finished.
    pub fn record(
        &self,
        store_kind: &str,
        operation: &str,
        start: Instant,
        error_count: u64,
        mismatch_count: u64,
    ) -> MetricSample {
        self.record_elapsed(
            store_kind,
            operation,
            start.elapsed(),
            error_count,
            mismatch_count,
        )
    }

    /// Record an operation whose duration was measured by the caller.
    pub fn record_elapsed(
        &self,
        store_kind: &str,
        operation: &str,
        elapsed: Duration,
        error_count: u64,
        mismatch_count: u64,
    ) -> MetricSample {
        let usage = self.probe.sample();
        let sample = MetricSample {
            store_kind: store_kind.to_string(),
            operation: operation.to_string(),
            cpu_percent: usage.cpu_percent,
            mem_percent: usage.mem_percent,
            latency_ms: elapsed.as_secs_f64() * 1000.0,
            error_count,
            mismatch_count,
            recorded_at: Utc::now(),
        };
        self.persist(sample)
    }

    fn persist(&self, sample: MetricSample) -> MetricSample {
        if let Err(e) = self.backend.insert_metric(&sample) {
            tracing::warn!(
                error = %e,
                operation = %sample.operation,
                "failed to persist metric sample"
            );
        }
        tracing::debug!(
            store = %sample.store_kind,
            operation = %sample.operation,
            latency_ms = sample.latency_ms,
            cpu = sample.cpu_percent,
            errors = sample.error_count,
            mismatches = sample.mismatch_count,
            "metric recorded"
        );

        let alerts = evaluate(&sample, &self.thresholds);
        if alerts.is_empty() {
            return sample;
        }
        let messages: Vec<String> = alerts
            .iter()
            .map(|alert| format!("{} ({})", alert.message(), sample.store_kind))
            .collect();
        for message in &messages {
            tracing::warn!(alert = %message, "threshold exceeded");
        }
        if let Some(log) = &self.alert_log {
            if let Err(e) = log.append(sample.recorded_at, &messages) {
                tracing::warn!(
                    error = %e,
                    path = %log.path().display(),
                    "failed to append to alert log"
                );
            }
        }
        sample
    }
}

impl std::fmt::Debug for MetricsSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsSink")
            .field("thresholds", &self.thresholds)
            .field("alert_log", &self.alert_log)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StoreError, StoreResult};
    use crate::store::mem::MemRecordStore;

    struct Unavailable;

    impl MetricsBackend for Unavailable {
        fn insert_metric(&self, _sample: &MetricSample) -> StoreResult<()> {
            Err(StoreError::Connection {
                store: "relational".into(),
                message: "refused".into(),
            })
        }

        fn metrics(&self) -> StoreResult<Vec<MetricSample>> {
            Ok(Vec::new())
        }
    }

    fn quiet_probe() -> Arc<dyn ResourceProbe> {
        Arc::new(FixedProbe(ResourceUsage {
            cpu_percent: 10.0,
            mem_percent: 20.0,
        }))
    }

    #[test]
    fn record_persists_one_sample() {
        let store = Arc::new(MemRecordStore::new());
        let sink = MetricsSink::new(store.clone(), quiet_probe(), Thresholds::default());
        let sample = sink.record("relational", "etl_chunk", Instant::now(), 2, 0);
        assert_eq!(sample.error_count, 2);
        assert_eq!(sample.cpu_percent, 10.0);
        let stored = store.metrics().unwrap();
        assert_eq!(stored, vec![sample]);
    }

    #[test]
    fn backend_failure_is_swallowed() {
        let sink = MetricsSink::new(Arc::new(Unavailable), quiet_probe(), Thresholds::default());
        let sample = sink.record("relational", "sync_fetch", Instant::now(), 0, 0);
        assert_eq!(sample.operation, "sync_fetch");
    }

    #[test]
    fn slow_operation_lands_in_alert_log() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = AlertLog::new(dir.path().join("alerts.log"));
        let sink = MetricsSink::new(
            Arc::new(MemRecordStore::new()),
            quiet_probe(),
            Thresholds::default(),
        )
        .with_alert_log(log.clone());

        sink.record_elapsed("document", "sync_write", Duration::from_millis(500), 0, 0);
        assert!(!log.path().exists());

        sink.record_elapsed("document", "sync_write", Duration::from_millis(501), 0, 0);
        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(content.contains("SLOW OPERATION: sync_write"));
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn unwritable_alert_log_is_swallowed() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();
        let sink = MetricsSink::new(
            Arc::new(MemRecordStore::new()),
            quiet_probe(),
            Thresholds::default(),
        )
        .with_alert_log(AlertLog::new(blocker.join("alerts.log")));
        let sample = sink.record("relational", "validation", Instant::now(), 0, 4);
        assert_eq!(sample.mismatch_count, 4);
    }
}
