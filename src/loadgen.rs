//! Concurrent load against the record store.
//!
//! Independent insert, update and read workers share one store handle and run
//! on scoped threads. Each worker reports a single metric sample; worker
//! failures are counted rather than propagated.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use rust_decimal::Decimal;

use crate::metrics::MetricsSink;
use crate::schema::NewTrip;
use crate::store::{RECORD_STORE, RecordStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadConfig {
    pub insert_workers: usize,
    pub update_workers: usize,
    pub read_workers: usize,
    pub rows_per_insert_worker: usize,
    /// Upper bound on rows touched by one update worker.
    pub update_limit: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            insert_workers: 3,
            update_workers: 2,
            read_workers: 5,
            rows_per_insert_worker: 100,
            update_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Insert,
    Update,
    Read,
}

impl WorkerKind {
    /// Metric operation name reported by this kind of worker.
    pub fn operation(self) -> &'static str {
        match self {
            Self::Insert => "concurrent_insert",
            Self::Update => "concurrent_update",
            Self::Read => "concurrent_select",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOutcome {
    pub kind: WorkerKind,
    pub worker: usize,
    /// Rows written, rows updated or rows counted, by kind.
    pub rows: u64,
    pub errors: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadTestReport {
    pub workers: Vec<WorkerOutcome>,
    pub duration: Duration,
}

impl LoadTestReport {
    pub fn error_count(&self) -> u64 {
        self.workers.iter().map(|w| w.errors).sum()
    }

    pub fn rows(&self, kind: WorkerKind) -> u64 {
        self.workers
            .iter()
            .filter(|w| w.kind == kind)
            .map(|w| w.rows)
            .sum()
    }
}

/// The fixed trip appended by insert workers.
pub fn synthetic_trip() -> NewTrip {
    let now = Utc::now().naive_utc();
    NewTrip {
        vendor_id: "1".into(),
        pickup_datetime: now,
        dropoff_datetime: now,
        passenger_count: 1,
        trip_distance: Decimal::new(12, 1),
        rate_code_id: 1,
        store_and_fwd_flag: "N".into(),
        pu_location_id: 10,
        do_location_id: 20,
        payment_type: 1,
        fare_amount: Decimal::new(50, 1),
        extra: Decimal::new(5, 1),
        mta_tax: Decimal::new(5, 1),
        tip_amount: Decimal::new(10, 1),
        tolls_amount: Decimal::ZERO,
        improvement_surcharge: Decimal::new(3, 1),
        total_amount: Decimal::new(73, 1),
        congestion_surcharge: Decimal::ZERO,
        airport_fee: Decimal::ZERO,
    }
}

pub struct LoadGenerator {
    store: Arc<dyn RecordStore>,
    metrics: MetricsSink,
    config: LoadConfig,
}

impl LoadGenerator {
    pub fn new(store: Arc<dyn RecordStore>, metrics: MetricsSink, config: LoadConfig) -> Self {
        Self {
            store,
            metrics,
            config,
        }
    }

    /// Run every worker to completion and collect their outcomes.
    pub fn run(&self) -> LoadTestReport {
        let started = Instant::now();
        let c = &self.config;
        let plan: Vec<WorkerKind> = std::iter::repeat_n(WorkerKind::Insert, c.insert_workers)
            .chain(std::iter::repeat_n(WorkerKind::Update, c.update_workers))
            .chain(std::iter::repeat_n(WorkerKind::Read, c.read_workers))
            .collect();
        tracing::info!(workers = plan.len(), "starting concurrent load");

        let workers = thread::scope(|scope| {
            let handles: Vec<_> = plan
                .iter()
                .enumerate()
                .map(|(i, kind)| {
                    let kind = *kind;
                    let worker = i + 1;
                    (kind, worker, scope.spawn(move || self.work(kind, worker)))
                })
                .collect();
            handles
                .into_iter()
                .map(|(kind, worker, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        tracing::error!(worker, "worker panicked");
                        WorkerOutcome {
                            kind,
                            worker,
                            rows: 0,
                            errors: 1,
                            elapsed: Duration::ZERO,
                        }
                    })
                })
                .collect::<Vec<_>>()
        });

        let report = LoadTestReport {
            workers,
            duration: started.elapsed(),
        };
        tracing::info!(
            workers = report.workers.len(),
            errors = report.error_count(),
            secs = report.duration.as_secs_f64(),
            "concurrent load complete"
        );
        report
    }

    fn work(&self, kind: WorkerKind, worker: usize) -> WorkerOutcome {
        let start = Instant::now();
        let (rows, errors) = match kind {
            WorkerKind::Insert => self.insert(worker),
            WorkerKind::Update => self.update(worker),
            WorkerKind::Read => self.read(worker),
        };
        self.metrics
            .record(RECORD_STORE, kind.operation(), start, errors, 0);
        let elapsed = start.elapsed();
        tracing::info!(
            worker,
            operation = kind.operation(),
            rows,
            errors,
            ms = elapsed.as_millis() as u64,
            "worker finished"
        );
        WorkerOutcome {
            kind,
            worker,
            rows,
            errors,
            elapsed,
        }
    }

    fn insert(&self, worker: usize) -> (u64, u64) {
        let (mut rows, mut errors) = (0, 0);
        for _ in 0..self.config.rows_per_insert_worker {
            match self.store.insert_trips(&[synthetic_trip()]) {
                Ok(outcome) => {
                    rows += outcome.inserted() as u64;
                    errors += outcome.failures.len() as u64;
                }
                Err(e) => {
                    tracing::warn!(worker, error = %e, "insert failed");
                    errors += 1;
                }
            }
        }
        (rows, errors)
    }

    fn update(&self, worker: usize) -> (u64, u64) {
        match self
            .store
            .bump_fares(10, self.config.update_limit, Decimal::new(1, 2))
        {
            Ok(changed) => (changed as u64, 0),
            Err(e) => {
                tracing::warn!(worker, error = %e, "update failed");
                (0, 1)
            }
        }
    }

    fn read(&self, worker: usize) -> (u64, u64) {
        match self.store.fare_stats() {
            Ok(stats) => {
                tracing::debug!(
                    worker,
                    count = stats.count,
                    avg_fare = ?stats.avg_fare,
                    "fare stats"
                );
                (stats.count, 0)
            }
            Err(e) => {
                tracing::warn!(worker, error = %e, "select failed");
                (0, 1)
            }
        }
    }
}

impl std::fmt::Debug for LoadGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadGenerator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{FixedProbe, Thresholds};
    use crate::store::MetricsBackend;
    use crate::store::mem::MemRecordStore;

    fn generator(store: Arc<MemRecordStore>, config: LoadConfig) -> LoadGenerator {
        let sink = MetricsSink::new(
            store.clone(),
            Arc::new(FixedProbe::default()),
            Thresholds::default(),
        );
        LoadGenerator::new(store, sink, config)
    }

    #[test]
    fn default_fan_out_emits_one_sample_per_worker() {
        let store = Arc::new(MemRecordStore::new());
        let report = generator(store.clone(), LoadConfig::default()).run();

        assert_eq!(report.workers.len(), 10);
        assert_eq!(report.error_count(), 0);
        assert_eq!(report.rows(WorkerKind::Insert), 300);
        assert_eq!(store.count_trips().unwrap(), 300);

        let samples = store.metrics().unwrap();
        let count = |op: &str| samples.iter().filter(|s| s.operation == op).count();
        assert_eq!(count("concurrent_insert"), 3);
        assert_eq!(count("concurrent_update"), 2);
        assert_eq!(count("concurrent_select"), 5);
    }

    #[test]
    fn updates_only_touch_every_tenth_row() {
        let store = Arc::new(MemRecordStore::new());
        let rows: Vec<NewTrip> = (0..50).map(|_| synthetic_trip()).collect();
        store.insert_trips(&rows).unwrap();

        let config = LoadConfig {
            insert_workers: 0,
            update_workers: 2,
            read_workers: 0,
            ..LoadConfig::default()
        };
        let report = generator(store.clone(), config).run();
        assert_eq!(report.rows(WorkerKind::Update), 10);

        let bumped = store.get_trip(20).unwrap().unwrap();
        assert_eq!(bumped.trip.fare_amount, Decimal::new(502, 2));
        let untouched = store.get_trip(21).unwrap().unwrap();
        assert_eq!(untouched.trip.fare_amount, Decimal::new(50, 1));
    }

    #[test]
    fn synthetic_trip_totals_add_up() {
        let t = synthetic_trip();
        let sum = t.fare_amount
            + t.extra
            + t.mta_tax
            + t.tip_amount
            + t.tolls_amount
            + t.improvement_surcharge;
        assert_eq!(sum, t.total_amount);
    }
}
