//! Batched replication from the record store into the document store.
//!
//! A run reads the most recent window of trips in one snapshot, converts each
//! row into a [`ReplicatedDocument`] and upserts the documents in fixed-size
//! batches keyed on `trip_id`. Replaying a run over the same window leaves the
//! document store unchanged apart from `synced_at`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::error::{SyncError, SyncResult};
use crate::metrics::MetricsSink;
use crate::schema::ReplicatedDocument;
use crate::store::{DOCUMENT_STORE, DocumentStore, ItemResult, RECORD_STORE, RecordStore};

pub const DEFAULT_WINDOW: usize = 100_000;
pub const DEFAULT_BATCH_SIZE: usize = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Number of most recent rows replicated per run.
    pub window: usize,
    /// Documents per bulk upsert.
    pub batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub fetched: usize,
    pub batches: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub conversion_errors: u64,
    pub document_errors: u64,
    pub failed_batches: u64,
    pub duration: Duration,
}

impl SyncReport {
    /// Documents written, new or replaced.
    pub fn synced(&self) -> usize {
        self.inserted + self.replaced
    }

    pub fn error_count(&self) -> u64 {
        self.conversion_errors + self.document_errors + self.failed_batches
    }
}

pub struct Synchronizer {
    records: Arc<dyn RecordStore>,
    documents: Arc<dyn DocumentStore>,
    metrics: MetricsSink,
    config: SyncConfig,
}

impl Synchronizer {
    pub fn new(
        records: Arc<dyn RecordStore>,
        documents: Arc<dyn DocumentStore>,
        metrics: MetricsSink,
        config: SyncConfig,
    ) -> Self {
        Self {
            records,
            documents,
            metrics,
            config: SyncConfig {
                window: config.window,
                batch_size: config.batch_size.max(1),
            },
        }
    }

    pub fn run(&self) -> SyncResult<SyncReport> {
        let started = Instant::now();
        let mut report = SyncReport::default();

        let fetch_start = Instant::now();
        let window = match self.records.fetch_window(self.config.window) {
            Ok(window) => window,
            Err(source) => {
                tracing::error!(error = %source, "failed to read replication window");
                self.metrics
                    .record(RECORD_STORE, "sync_fetch", fetch_start, 1, 0);
                return Err(SyncError::Fetch { source });
            }
        };
        report.fetched = window.len();
        self.metrics
            .record(RECORD_STORE, "sync_fetch", fetch_start, 0, 0);
        tracing::info!(rows = report.fetched, window = self.config.window, "window fetched");

        let synced_at = Utc::now();
        let mut documents = Vec::with_capacity(window.len());
        for record in &window {
            match ReplicatedDocument::from_record(record, synced_at) {
                Ok(doc) => documents.push(doc),
                Err(e) => {
                    report.conversion_errors += 1;
                    tracing::warn!(trip_id = e.trip_id, error = %e, "conversion failed");
                }
            }
        }
        drop(window);

        let write_start = Instant::now();
        for (index, batch) in documents.chunks(self.config.batch_size).enumerate() {
            let batch_no = index + 1;
            report.batches += 1;
            match self.documents.upsert_batch(batch) {
                Ok(outcome) => {
                    report.inserted += outcome.inserted;
                    report.replaced += outcome.replaced;
                    report.document_errors += outcome.failed() as u64;
                    for item in &outcome.items {
                        if let ItemResult::Failed { key, reason } = item {
                            tracing::warn!(batch = batch_no, key = %key, reason = %reason, "document rejected");
                        }
                    }
                }
                Err(source) if source.is_fatal() => {
                    tracing::error!(batch = batch_no, error = %source, "document store unavailable");
                    self.metrics.record(
                        DOCUMENT_STORE,
                        "sync_write",
                        write_start,
                        report.error_count() + 1,
                        0,
                    );
                    return Err(SyncError::Write {
                        batch: batch_no,
                        source,
                    });
                }
                Err(e) => {
                    report.failed_batches += 1;
                    tracing::warn!(batch = batch_no, size = batch.len(), error = %e, "batch failed");
                }
            }
        }
        let write_errors = report.document_errors + report.failed_batches;
        self.metrics
            .record(DOCUMENT_STORE, "sync_write", write_start, write_errors, 0);

        report.duration = started.elapsed();
        self.metrics.record(
            DOCUMENT_STORE,
            "sync_complete",
            started,
            report.error_count(),
            0,
        );
        tracing::info!(
            synced = report.synced(),
            inserted = report.inserted,
            replaced = report.replaced,
            batches = report.batches,
            errors = report.error_count(),
            "sync complete"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StoreError, StoreResult};
    use crate::metrics::{FixedProbe, MetricSample, Thresholds};
    use crate::schema::NewTrip;
    use crate::store::mem::{MemDocumentStore, MemRecordStore};
    use crate::store::{AnomalyRecord, BulkWriteOutcome, MetricsBackend};
    use rust_decimal::Decimal;

    fn seeded(rows: usize) -> Arc<MemRecordStore> {
        let store = Arc::new(MemRecordStore::new());
        let trips: Vec<NewTrip> = (0..rows)
            .map(|i| NewTrip {
                total_amount: Decimal::new(1000 + i as i64, 2),
                ..NewTrip::default()
            })
            .collect();
        store.insert_trips(&trips).unwrap();
        store
    }

    fn sink(store: Arc<MemRecordStore>) -> MetricsSink {
        MetricsSink::new(store, Arc::new(FixedProbe::default()), Thresholds::default())
    }

    fn ops(samples: &[MetricSample]) -> Vec<&str> {
        samples.iter().map(|s| s.operation.as_str()).collect()
    }

    #[test]
    fn replicates_the_most_recent_window() {
        let records = seeded(30);
        let docs = Arc::new(MemDocumentStore::new());
        let sync = Synchronizer::new(
            records.clone(),
            docs.clone(),
            sink(records.clone()),
            SyncConfig {
                window: 20,
                batch_size: 8,
            },
        );
        let report = sync.run().unwrap();
        assert_eq!(report.fetched, 20);
        assert_eq!(report.batches, 3);
        assert_eq!(report.inserted, 20);
        assert_eq!(report.error_count(), 0);
        assert_eq!(docs.count().unwrap(), 20);
        assert!(docs.get(10).unwrap().is_none());
        assert!(docs.get(11).unwrap().is_some());
        assert_eq!(
            ops(&records.metrics().unwrap()),
            vec!["sync_fetch", "sync_write", "sync_complete"]
        );
    }

    #[test]
    fn second_run_replaces_without_changing_content() {
        let records = seeded(12);
        let docs = Arc::new(MemDocumentStore::new());
        let sync = Synchronizer::new(
            records.clone(),
            docs.clone(),
            sink(records.clone()),
            SyncConfig {
                window: 100,
                batch_size: 5,
            },
        );
        sync.run().unwrap();
        let before: Vec<_> = (1..=12).map(|id| docs.get(id).unwrap().unwrap()).collect();
        let second = sync.run().unwrap();
        assert_eq!((second.inserted, second.replaced), (0, 12));
        for old in before {
            let new = docs.get(old.trip_id).unwrap().unwrap();
            assert_eq!(new.fields, old.fields);
        }
        assert_eq!(docs.count().unwrap(), 12);
    }

    /// Document store that rejects single documents, whole batches or loses
    /// its connection when it sees particular keys.
    struct Picky {
        inner: MemDocumentStore,
        reject_document: i64,
        reject_batch_with: i64,
        disconnect_on: i64,
    }

    impl Picky {
        fn new() -> Self {
            Self {
                inner: MemDocumentStore::new(),
                reject_document: -1,
                reject_batch_with: -1,
                disconnect_on: -1,
            }
        }
    }

    impl DocumentStore for Picky {
        fn upsert_batch(&self, docs: &[ReplicatedDocument]) -> StoreResult<BulkWriteOutcome> {
            if docs.iter().any(|d| d.trip_id == self.disconnect_on) {
                return Err(StoreError::Timeout {
                    store: DOCUMENT_STORE.into(),
                    timeout_ms: 5,
                });
            }
            if docs.iter().any(|d| d.trip_id == self.reject_batch_with) {
                return Err(StoreError::Batch {
                    message: "write concern error".into(),
                });
            }
            let Some(pos) = docs.iter().position(|d| d.trip_id == self.reject_document) else {
                return self.inner.upsert_batch(docs);
            };
            let accepted: Vec<ReplicatedDocument> = docs
                .iter()
                .filter(|d| d.trip_id != self.reject_document)
                .cloned()
                .collect();
            let mut outcome = self.inner.upsert_batch(&accepted)?;
            outcome.items.insert(
                pos,
                ItemResult::Failed {
                    key: self.reject_document.to_string(),
                    reason: "document failed validation".into(),
                },
            );
            Ok(outcome)
        }
        fn get(&self, trip_id: i64) -> StoreResult<Option<ReplicatedDocument>> {
            self.inner.get(trip_id)
        }
        fn sample_keys(&self, k: usize, rng: &mut dyn rand::RngCore) -> StoreResult<Vec<i64>> {
            self.inner.sample_keys(k, rng)
        }
        fn count(&self) -> StoreResult<u64> {
            self.inner.count()
        }
        fn insert_anomalies(&self, rows: &[AnomalyRecord]) -> StoreResult<usize> {
            self.inner.insert_anomalies(rows)
        }
        fn anomalies(&self) -> StoreResult<Vec<AnomalyRecord>> {
            self.inner.anomalies()
        }
    }

    #[test]
    fn rejected_document_does_not_fail_its_batch() {
        let records = seeded(20);
        let docs = Arc::new(Picky {
            reject_document: 9,
            ..Picky::new()
        });
        let sync = Synchronizer::new(
            records.clone(),
            docs.clone(),
            sink(records.clone()),
            SyncConfig {
                window: 20,
                batch_size: 5,
            },
        );
        let report = sync.run().unwrap();
        assert_eq!(report.batches, 4);
        assert_eq!(report.inserted, 19);
        assert_eq!(report.document_errors, 1);
        assert_eq!(report.failed_batches, 0);
        assert_eq!(report.error_count(), 1);
        assert!(docs.get(9).unwrap().is_none());
        assert!(docs.get(8).unwrap().is_some());
        assert!(docs.get(10).unwrap().is_some());

        let samples = records.metrics().unwrap();
        let write = samples.iter().find(|s| s.operation == "sync_write").unwrap();
        assert_eq!(write.error_count, 1);
    }

    #[test]
    fn failed_batch_does_not_stop_later_batches() {
        let records = seeded(20);
        let docs = Arc::new(Picky {
            reject_batch_with: 7,
            ..Picky::new()
        });
        let sync = Synchronizer::new(
            records.clone(),
            docs.clone(),
            sink(records.clone()),
            SyncConfig {
                window: 20,
                batch_size: 5,
            },
        );
        let report = sync.run().unwrap();
        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.inserted, 15);
        assert!(docs.get(7).unwrap().is_none());
        assert!(docs.get(20).unwrap().is_some());

        let samples = records.metrics().unwrap();
        let write = samples.iter().find(|s| s.operation == "sync_write").unwrap();
        assert_eq!(write.error_count, 1);
    }

    #[test]
    fn timeout_is_fatal() {
        let records = seeded(20);
        let docs = Arc::new(Picky {
            disconnect_on: 12,
            ..Picky::new()
        });
        let sync = Synchronizer::new(
            records.clone(),
            docs.clone(),
            sink(records.clone()),
            SyncConfig {
                window: 20,
                batch_size: 5,
            },
        );
        let err = sync.run().unwrap_err();
        assert!(matches!(err, SyncError::Write { batch: 3, .. }));
        assert_eq!(docs.count().unwrap(), 10);
        let samples = records.metrics().unwrap();
        assert_eq!(ops(&samples), vec!["sync_fetch", "sync_write"]);
        assert!(samples[1].error_count >= 1);
    }

    #[test]
    fn empty_window_is_a_clean_run() {
        let records = Arc::new(MemRecordStore::new());
        let docs = Arc::new(MemDocumentStore::new());
        let sync = Synchronizer::new(
            records.clone(),
            docs,
            sink(records.clone()),
            SyncConfig::default(),
        );
        let report = sync.run().unwrap();
        assert_eq!(report.batches, 0);
        assert_eq!(report.synced(), 0);
    }
}
