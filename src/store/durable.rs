//! ACID-durable store backends on redb.
//!
//! Each store owns one database file. Trip rows, metric samples, ETL summaries
//! and anomaly rows are bincode-encoded; documents are stored as JSON because
//! their field map is flattened. Reads use MVCC snapshots, so a window read
//! never observes writes committed after it began.

use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use redb::{Database, DatabaseError, ReadableTable, ReadableTableMetadata, TableDefinition};
use rust_decimal::Decimal;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{StoreError, StoreResult};
use crate::metrics::MetricSample;
use crate::schema::{NewTrip, ReplicatedDocument, TripRecord};
use crate::store::{
    AnomalyRecord, BulkWriteOutcome, DOCUMENT_STORE, DocumentStore, EtlSummary, FareStats,
    InsertOutcome, ItemResult, MetricsBackend, RECORD_STORE, RecordStore, check_document,
    sample_from, serialization_error,
};

const TRIPS: TableDefinition<i64, &[u8]> = TableDefinition::new("taxi_trips");
const METRICS: TableDefinition<u64, &[u8]> = TableDefinition::new("db_metrics");
const ETL_SUMMARY: TableDefinition<u64, &[u8]> = TableDefinition::new("etl_metrics");
const ANOMALIES: TableDefinition<u64, &[u8]> = TableDefinition::new("anomalies");

const DOCS: TableDefinition<i64, &str> = TableDefinition::new("taxi_trips");
const DOC_ANOMALIES: TableDefinition<i64, &str> = TableDefinition::new("anomalies_taxi");

fn redb_err<E: Display>(op: &'static str) -> impl Fn(E) -> StoreError {
    move |e| StoreError::Redb {
        message: format!("{op} failed: {e}"),
    }
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(serialization_error)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    bincode::deserialize(bytes).map_err(serialization_error)
}

/// Wait used by [`DurableRecordStore::open`] and [`DurableDocumentStore::open`].
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const LOCK_POLL: Duration = Duration::from_millis(25);

/// Open the database file, waiting up to `connect_timeout` while another
/// handle holds its lock.
fn open_database(path: &Path, store: &str, connect_timeout: Duration) -> StoreResult<Arc<Database>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::Connection {
            store: store.into(),
            message: format!("cannot create {}: {e}", parent.display()),
        })?;
    }
    let started = Instant::now();
    loop {
        match Database::create(path) {
            Ok(db) => return Ok(Arc::new(db)),
            Err(DatabaseError::DatabaseAlreadyOpen) if started.elapsed() < connect_timeout => {
                std::thread::sleep(LOCK_POLL);
            }
            Err(DatabaseError::DatabaseAlreadyOpen) => {
                return Err(StoreError::Timeout {
                    store: store.into(),
                    timeout_ms: connect_timeout.as_millis() as u64,
                });
            }
            Err(e) => {
                return Err(StoreError::Connection {
                    store: store.into(),
                    message: format!("failed to open redb at {}: {e}", path.display()),
                });
            }
        }
    }
}

/// Append `rows` to a sequence-keyed table inside one transaction.
fn append_all<T: Serialize>(
    db: &Database,
    def: TableDefinition<u64, &[u8]>,
    rows: &[T],
) -> StoreResult<()> {
    let txn = db.begin_write().map_err(redb_err("begin_write"))?;
    {
        let mut table = txn.open_table(def).map_err(redb_err("open_table"))?;
        let mut next = table
            .last()
            .map_err(redb_err("last"))?
            .map(|(k, _)| k.value() + 1)
            .unwrap_or(1);
        for row in rows {
            let bytes = encode(row)?;
            table
                .insert(next, bytes.as_slice())
                .map_err(redb_err("insert"))?;
            next += 1;
        }
    }
    txn.commit().map_err(redb_err("commit"))
}

fn read_all<T: DeserializeOwned>(
    db: &Database,
    def: TableDefinition<u64, &[u8]>,
) -> StoreResult<Vec<T>> {
    let txn = db.begin_read().map_err(redb_err("begin_read"))?;
    let table = txn.open_table(def).map_err(redb_err("open_table"))?;
    let mut out = Vec::new();
    for entry in table.iter().map_err(redb_err("iter"))? {
        let (_, value) = entry.map_err(redb_err("iter"))?;
        out.push(decode(value.value())?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Record store
// ---------------------------------------------------------------------------

/// Record store persisted in a single redb file.
pub struct DurableRecordStore {
    db: Arc<Database>,
}

impl DurableRecordStore {
    /// Open or create the record store at `path`, creating every table.
    pub fn open(path: &Path) -> StoreResult<Self> {
        Self::open_with_timeout(path, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn open_with_timeout(path: &Path, connect_timeout: Duration) -> StoreResult<Self> {
        let db = open_database(path, RECORD_STORE, connect_timeout)?;
        let txn = db.begin_write().map_err(redb_err("begin_write"))?;
        txn.open_table(TRIPS).map_err(redb_err("open_table"))?;
        txn.open_table(METRICS).map_err(redb_err("open_table"))?;
        txn.open_table(ETL_SUMMARY).map_err(redb_err("open_table"))?;
        txn.open_table(ANOMALIES).map_err(redb_err("open_table"))?;
        txn.commit().map_err(redb_err("commit"))?;
        Ok(Self { db })
    }
}

impl std::fmt::Debug for DurableRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableRecordStore").finish()
    }
}

impl MetricsBackend for DurableRecordStore {
    fn insert_metric(&self, sample: &MetricSample) -> StoreResult<()> {
        append_all(&self.db, METRICS, std::slice::from_ref(sample))
    }

    fn metrics(&self) -> StoreResult<Vec<MetricSample>> {
        read_all(&self.db, METRICS)
    }
}

impl RecordStore for DurableRecordStore {
    fn insert_trips(&self, rows: &[NewTrip]) -> StoreResult<InsertOutcome> {
        let mut outcome = InsertOutcome::default();
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        {
            let mut table = txn.open_table(TRIPS).map_err(redb_err("open_table"))?;
            let mut next = table
                .last()
                .map_err(redb_err("last"))?
                .map(|(k, _)| k.value() + 1)
                .unwrap_or(1);
            for (index, row) in rows.iter().enumerate() {
                let bytes = match encode(row) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        outcome.failures.push((index, e.to_string()));
                        continue;
                    }
                };
                table
                    .insert(next, bytes.as_slice())
                    .map_err(redb_err("insert"))?;
                outcome.assigned.push(next);
                next += 1;
            }
        }
        txn.commit().map_err(redb_err("commit"))?;
        Ok(outcome)
    }

    fn fetch_window(&self, limit: usize) -> StoreResult<Vec<TripRecord>> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(TRIPS).map_err(redb_err("open_table"))?;
        let mut window = Vec::with_capacity(limit.min(table.len().map_err(redb_err("len"))? as usize));
        for entry in table.iter().map_err(redb_err("iter"))?.rev().take(limit) {
            let (key, value) = entry.map_err(redb_err("iter"))?;
            window.push(TripRecord {
                trip_id: key.value(),
                trip: decode(value.value())?,
            });
        }
        window.reverse();
        Ok(window)
    }

    fn get_trip(&self, trip_id: i64) -> StoreResult<Option<TripRecord>> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(TRIPS).map_err(redb_err("open_table"))?;
        match table.get(trip_id).map_err(redb_err("get"))? {
            Some(guard) => Ok(Some(TripRecord {
                trip_id,
                trip: decode(guard.value())?,
            })),
            None => Ok(None),
        }
    }

    fn count_trips(&self) -> StoreResult<u64> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(TRIPS).map_err(redb_err("open_table"))?;
        table.len().map_err(redb_err("len"))
    }

    fn bump_fares(&self, modulus: i64, limit: usize, delta: Decimal) -> StoreResult<usize> {
        if modulus <= 0 || limit == 0 {
            return Ok(0);
        }
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        let changed = {
            let mut table = txn.open_table(TRIPS).map_err(redb_err("open_table"))?;
            let mut targets: Vec<(i64, NewTrip)> = Vec::new();
            for entry in table.iter().map_err(redb_err("iter"))? {
                let (key, value) = entry.map_err(redb_err("iter"))?;
                let id = key.value();
                if id % modulus == 0 {
                    targets.push((id, decode(value.value())?));
                    if targets.len() == limit {
                        break;
                    }
                }
            }
            for (id, trip) in &mut targets {
                trip.fare_amount += delta;
                let bytes = encode(trip)?;
                table
                    .insert(*id, bytes.as_slice())
                    .map_err(redb_err("insert"))?;
            }
            targets.len()
        };
        txn.commit().map_err(redb_err("commit"))?;
        Ok(changed)
    }

    fn fare_stats(&self) -> StoreResult<FareStats> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(TRIPS).map_err(redb_err("open_table"))?;
        let mut count = 0u64;
        let mut sum = Decimal::ZERO;
        for entry in table.iter().map_err(redb_err("iter"))? {
            let (_, value) = entry.map_err(redb_err("iter"))?;
            let trip: NewTrip = decode(value.value())?;
            sum += trip.fare_amount;
            count += 1;
        }
        let avg_fare = (count > 0).then(|| sum / Decimal::from(count));
        Ok(FareStats { count, avg_fare })
    }

    fn record_etl_summary(&self, summary: &EtlSummary) -> StoreResult<()> {
        append_all(&self.db, ETL_SUMMARY, std::slice::from_ref(summary))
    }

    fn etl_summaries(&self) -> StoreResult<Vec<EtlSummary>> {
        read_all(&self.db, ETL_SUMMARY)
    }

    fn insert_anomalies(&self, rows: &[AnomalyRecord]) -> StoreResult<usize> {
        append_all(&self.db, ANOMALIES, rows)?;
        Ok(rows.len())
    }

    fn anomalies(&self) -> StoreResult<Vec<AnomalyRecord>> {
        read_all(&self.db, ANOMALIES)
    }
}

// ---------------------------------------------------------------------------
// Document store
// ---------------------------------------------------------------------------

/// Document store persisted in a single redb file, one JSON document per key.
pub struct DurableDocumentStore {
    db: Arc<Database>,
}

impl DurableDocumentStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        Self::open_with_timeout(path, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn open_with_timeout(path: &Path, connect_timeout: Duration) -> StoreResult<Self> {
        let db = open_database(path, DOCUMENT_STORE, connect_timeout)?;
        let txn = db.begin_write().map_err(redb_err("begin_write"))?;
        txn.open_table(DOCS).map_err(redb_err("open_table"))?;
        txn.open_table(DOC_ANOMALIES).map_err(redb_err("open_table"))?;
        txn.commit().map_err(redb_err("commit"))?;
        Ok(Self { db })
    }
}

impl std::fmt::Debug for DurableDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableDocumentStore").finish()
    }
}

impl DocumentStore for DurableDocumentStore {
    fn upsert_batch(&self, docs: &[ReplicatedDocument]) -> StoreResult<BulkWriteOutcome> {
        let batch_failed = |e: redb::Error| StoreError::Batch {
            message: e.to_string(),
        };
        let mut outcome = BulkWriteOutcome::default();
        let txn = self
            .db
            .begin_write()
            .map_err(|e| batch_failed(e.into()))?;
        {
            let mut table = txn.open_table(DOCS).map_err(|e| batch_failed(e.into()))?;
            for doc in docs {
                let mut item = check_document(doc);
                if item.is_ok() {
                    match serde_json::to_string(doc) {
                        Ok(json) => {
                            let previous = table
                                .insert(doc.trip_id, json.as_str())
                                .map_err(|e| batch_failed(e.into()))?;
                            if previous.is_some() {
                                outcome.replaced += 1;
                            } else {
                                outcome.inserted += 1;
                            }
                        }
                        Err(e) => {
                            item = ItemResult::Failed {
                                key: doc.trip_id.to_string(),
                                reason: e.to_string(),
                            };
                        }
                    }
                }
                outcome.items.push(item);
            }
        }
        txn.commit().map_err(|e| batch_failed(e.into()))?;
        Ok(outcome)
    }

    fn get(&self, trip_id: i64) -> StoreResult<Option<ReplicatedDocument>> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(DOCS).map_err(redb_err("open_table"))?;
        match table.get(trip_id).map_err(redb_err("get"))? {
            Some(guard) => serde_json::from_str(guard.value())
                .map(Some)
                .map_err(serialization_error),
            None => Ok(None),
        }
    }

    fn sample_keys(&self, k: usize, rng: &mut dyn rand::RngCore) -> StoreResult<Vec<i64>> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(DOCS).map_err(redb_err("open_table"))?;
        let mut keys = Vec::new();
        for entry in table.iter().map_err(redb_err("iter"))? {
            let (key, _) = entry.map_err(redb_err("iter"))?;
            keys.push(key.value());
        }
        Ok(sample_from(keys, k, rng))
    }

    fn count(&self) -> StoreResult<u64> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(DOCS).map_err(redb_err("open_table"))?;
        table.len().map_err(redb_err("len"))
    }

    fn insert_anomalies(&self, rows: &[AnomalyRecord]) -> StoreResult<usize> {
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        {
            let mut table = txn.open_table(DOC_ANOMALIES).map_err(redb_err("open_table"))?;
            for row in rows {
                let json = serde_json::to_string(row).map_err(serialization_error)?;
                table
                    .insert(row.trip_id, json.as_str())
                    .map_err(redb_err("insert"))?;
            }
        }
        txn.commit().map_err(redb_err("commit"))?;
        Ok(rows.len())
    }

    fn anomalies(&self) -> StoreResult<Vec<AnomalyRecord>> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(DOC_ANOMALIES).map_err(redb_err("open_table"))?;
        let mut rows = Vec::new();
        for entry in table.iter().map_err(redb_err("iter"))? {
            let (_, value) = entry.map_err(redb_err("iter"))?;
            rows.push(serde_json::from_str(value.value()).map_err(serialization_error)?);
        }
        Ok(rows)
    }
}
