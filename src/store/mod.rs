//! Record and document store interfaces.
//!
//! Two stores take part in replication:
//!
//! - [`RecordStore`]: the system of record holding canonical trip rows, the
//!   metric samples, ETL summaries and anomaly rows
//! - [`DocumentStore`]: the keyed document mirror written by the synchronizer
//!
//! Each has an embedded backend ([`durable`], redb) and an in-memory backend
//! ([`mem`]). [`open_record_store`] and [`open_document_store`] pick one from a
//! [`StoreUrl`].

pub mod durable;
pub mod mem;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, StoreError, StoreResult};
use crate::metrics::MetricSample;
use crate::schema::{NewTrip, ReplicatedDocument, TripRecord};

/// Outcome for a single row or document inside a batched write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemResult {
    Ok,
    Failed { key: String, reason: String },
}

impl ItemResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Result of a batched row insert into the record store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Identifiers assigned to the rows that were written, in input order.
    pub assigned: Vec<i64>,
    /// Rows that were rejected, as `(input_index, reason)`.
    pub failures: Vec<(usize, String)>,
}

impl InsertOutcome {
    pub fn inserted(&self) -> usize {
        self.assigned.len()
    }
}

/// Result of one unordered bulk upsert into the document store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteOutcome {
    /// Documents whose key did not exist before this write.
    pub inserted: usize,
    /// Documents that replaced an existing document.
    pub replaced: usize,
    /// Per-document results, in input order.
    pub items: Vec<ItemResult>,
}

impl BulkWriteOutcome {
    pub fn failed(&self) -> usize {
        self.items.iter().filter(|item| !item.is_ok()).count()
    }
}

/// One row of the ETL-summary table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtlSummary {
    pub rows_loaded: u64,
    pub duration_secs: f64,
    pub created_at: DateTime<Utc>,
}

/// One row written by the external outlier scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub trip_id: i64,
    pub source: String,
    pub label: String,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

/// Aggregate returned by [`RecordStore::fare_stats`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FareStats {
    pub count: u64,
    pub avg_fare: Option<Decimal>,
}

/// Where a metric sample ends up. Implemented by every [`RecordStore`].
pub trait MetricsBackend: Send + Sync {
    fn insert_metric(&self, sample: &MetricSample) -> StoreResult<()>;
    fn metrics(&self) -> StoreResult<Vec<MetricSample>>;
}

/// The relational system of record.
pub trait RecordStore: MetricsBackend {
    /// Append rows in one batch; identifiers are assigned by the store.
    ///
    /// A rejected row does not prevent the others from being written.
    fn insert_trips(&self, rows: &[NewTrip]) -> StoreResult<InsertOutcome>;

    /// The most recent `limit` rows, ordered by ascending `trip_id`, read from a
    /// single consistent snapshot.
    fn fetch_window(&self, limit: usize) -> StoreResult<Vec<TripRecord>>;

    fn get_trip(&self, trip_id: i64) -> StoreResult<Option<TripRecord>>;

    fn count_trips(&self) -> StoreResult<u64>;

    /// Add `delta` to `fare_amount` for up to `limit` rows whose id is a
    /// multiple of `modulus`. Returns the number of rows changed.
    fn bump_fares(&self, modulus: i64, limit: usize, delta: Decimal) -> StoreResult<usize>;

    fn fare_stats(&self) -> StoreResult<FareStats>;

    fn record_etl_summary(&self, summary: &EtlSummary) -> StoreResult<()>;

    fn etl_summaries(&self) -> StoreResult<Vec<EtlSummary>>;

    fn insert_anomalies(&self, rows: &[AnomalyRecord]) -> StoreResult<usize>;

    /// Anomaly rows in insertion order.
    fn anomalies(&self) -> StoreResult<Vec<AnomalyRecord>>;
}

/// Lets a shared record store handle back a [`crate::metrics::MetricsSink`].
impl MetricsBackend for Arc<dyn RecordStore> {
    fn insert_metric(&self, sample: &MetricSample) -> StoreResult<()> {
        (**self).insert_metric(sample)
    }

    fn metrics(&self) -> StoreResult<Vec<MetricSample>> {
        (**self).metrics()
    }
}

/// The keyed document mirror.
pub trait DocumentStore: Send + Sync {
    /// Unordered insert-or-replace by `trip_id`. A document that fails does not
    /// block the rest of the batch.
    fn upsert_batch(&self, docs: &[ReplicatedDocument]) -> StoreResult<BulkWriteOutcome>;

    fn get(&self, trip_id: i64) -> StoreResult<Option<ReplicatedDocument>>;

    /// Up to `k` distinct keys drawn uniformly from the keys present.
    fn sample_keys(&self, k: usize, rng: &mut dyn rand::RngCore) -> StoreResult<Vec<i64>>;

    fn count(&self) -> StoreResult<u64>;

    /// Insert-or-replace anomaly rows keyed by `trip_id`.
    fn insert_anomalies(&self, rows: &[AnomalyRecord]) -> StoreResult<usize>;

    /// Anomaly rows ordered by `trip_id`.
    fn anomalies(&self) -> StoreResult<Vec<AnomalyRecord>>;
}

/// Label used in metric samples and logs.
pub const RECORD_STORE: &str = "relational";
pub const DOCUMENT_STORE: &str = "document";

// ---------------------------------------------------------------------------
// Store selection
// ---------------------------------------------------------------------------

/// Parsed store location: `redb://<path>` or `memory://`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUrl {
    Redb(PathBuf),
    Memory,
}

impl std::str::FromStr for StoreUrl {
    type Err = ConfigError;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::StoreUrl { url: url.into() };
        if let Some(path) = url.strip_prefix("redb://") {
            if path.is_empty() {
                return Err(invalid());
            }
            Ok(Self::Redb(PathBuf::from(path)))
        } else if url == "memory://" || url == "memory" {
            Ok(Self::Memory)
        } else {
            Err(invalid())
        }
    }
}

impl std::fmt::Display for StoreUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Redb(path) => write!(f, "redb://{}", path.display()),
            Self::Memory => f.write_str("memory://"),
        }
    }
}

/// Open the record store behind `url`, waiting up to `connect_timeout` for a
/// redb file held by another process.
pub fn open_record_store(
    url: &StoreUrl,
    connect_timeout: Duration,
) -> StoreResult<Arc<dyn RecordStore>> {
    match url {
        StoreUrl::Redb(path) => Ok(Arc::new(durable::DurableRecordStore::open_with_timeout(
            path,
            connect_timeout,
        )?)),
        StoreUrl::Memory => Ok(Arc::new(mem::MemRecordStore::new())),
    }
}

pub fn open_document_store(
    url: &StoreUrl,
    connect_timeout: Duration,
) -> StoreResult<Arc<dyn DocumentStore>> {
    match url {
        StoreUrl::Redb(path) => Ok(Arc::new(durable::DurableDocumentStore::open_with_timeout(
            path,
            connect_timeout,
        )?)),
        StoreUrl::Memory => Ok(Arc::new(mem::MemDocumentStore::new())),
    }
}

/// Reject non-positive keys and non-finite numbers before a document is written.
pub(crate) fn check_document(doc: &ReplicatedDocument) -> ItemResult {
    match doc.check_well_formed() {
        Ok(()) => ItemResult::Ok,
        Err(reason) => ItemResult::Failed {
            key: doc.trip_id.to_string(),
            reason,
        },
    }
}

/// Draw up to `k` distinct keys uniformly from `keys`.
pub(crate) fn sample_from(keys: Vec<i64>, k: usize, rng: &mut dyn rand::RngCore) -> Vec<i64> {
    if keys.len() <= k {
        return keys;
    }
    rand::seq::index::sample(rng, keys.len(), k)
        .into_iter()
        .map(|i| keys[i])
        .collect()
}

pub(crate) fn serialization_error<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Serialization {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn parse_store_urls() {
        assert_eq!(
            "redb://data/records.redb".parse::<StoreUrl>().unwrap(),
            StoreUrl::Redb(PathBuf::from("data/records.redb"))
        );
        assert_eq!("memory://".parse::<StoreUrl>().unwrap(), StoreUrl::Memory);
        assert!("mysql://localhost/taxi".parse::<StoreUrl>().is_err());
        assert!("redb://".parse::<StoreUrl>().is_err());
    }

    #[test]
    fn store_url_display_round_trips() {
        let url = StoreUrl::Redb(PathBuf::from("/tmp/docs.redb"));
        assert_eq!(url.to_string().parse::<StoreUrl>().unwrap(), url);
    }

    #[test]
    fn sample_is_distinct_and_bounded() {
        let mut rng = StdRng::seed_from_u64(7);
        let keys: Vec<i64> = (1..=100).collect();
        let mut sample = sample_from(keys, 10, &mut rng);
        assert_eq!(sample.len(), 10);
        sample.sort_unstable();
        sample.dedup();
        assert_eq!(sample.len(), 10);

        let small = sample_from(vec![1, 2, 3], 10, &mut rng);
        assert_eq!(small, vec![1, 2, 3]);
    }

    #[test]
    fn fatal_errors_are_connection_and_timeout() {
        let conn = StoreError::Connection {
            store: RECORD_STORE.into(),
            message: "refused".into(),
        };
        let timeout = StoreError::Timeout {
            store: DOCUMENT_STORE.into(),
            timeout_ms: 10,
        };
        let batch = StoreError::Batch {
            message: "dropped".into(),
        };
        assert!(conn.is_fatal());
        assert!(timeout.is_fatal());
        assert!(!batch.is_fatal());
    }
}
