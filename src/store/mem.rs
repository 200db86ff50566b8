//! In-memory store backends.
//!
//! Records live in a `RwLock<BTreeMap>` so a window read sees one consistent
//! snapshot; documents live in a DashMap for per-key atomic upserts. All data
//! is lost on process exit.

use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

use dashmap::DashMap;
use rust_decimal::Decimal;

use crate::error::{StoreError, StoreResult};
use crate::metrics::MetricSample;
use crate::schema::{NewTrip, ReplicatedDocument, TripRecord};
use crate::store::{
    AnomalyRecord, BulkWriteOutcome, DocumentStore, EtlSummary, FareStats, InsertOutcome,
    MetricsBackend, RecordStore, check_document, sample_from,
};

fn poisoned(what: &str) -> StoreError {
    StoreError::Connection {
        store: "memory".into(),
        message: format!("{what} lock poisoned"),
    }
}

#[derive(Debug, Default)]
struct Tables {
    trips: BTreeMap<i64, NewTrip>,
    next_id: i64,
}

/// Record store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemRecordStore {
    tables: RwLock<Tables>,
    metrics: Mutex<Vec<MetricSample>>,
    etl: Mutex<Vec<EtlSummary>>,
    anomalies: Mutex<Vec<AnomalyRecord>>,
}

impl MemRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricsBackend for MemRecordStore {
    fn insert_metric(&self, sample: &MetricSample) -> StoreResult<()> {
        self.metrics
            .lock()
            .map_err(|_| poisoned("metrics"))?
            .push(sample.clone());
        Ok(())
    }

    fn metrics(&self) -> StoreResult<Vec<MetricSample>> {
        Ok(self.metrics.lock().map_err(|_| poisoned("metrics"))?.clone())
    }
}

impl RecordStore for MemRecordStore {
    fn insert_trips(&self, rows: &[NewTrip]) -> StoreResult<InsertOutcome> {
        let mut tables = self.tables.write().map_err(|_| poisoned("trips"))?;
        let mut outcome = InsertOutcome::default();
        for row in rows {
            tables.next_id += 1;
            let id = tables.next_id;
            tables.trips.insert(id, row.clone());
            outcome.assigned.push(id);
        }
        Ok(outcome)
    }

    fn fetch_window(&self, limit: usize) -> StoreResult<Vec<TripRecord>> {
        let tables = self.tables.read().map_err(|_| poisoned("trips"))?;
        let mut window: Vec<TripRecord> = tables
            .trips
            .iter()
            .rev()
            .take(limit)
            .map(|(id, trip)| TripRecord {
                trip_id: *id,
                trip: trip.clone(),
            })
            .collect();
        window.reverse();
        Ok(window)
    }

    fn get_trip(&self, trip_id: i64) -> StoreResult<Option<TripRecord>> {
        let tables = self.tables.read().map_err(|_| poisoned("trips"))?;
        Ok(tables.trips.get(&trip_id).map(|trip| TripRecord {
            trip_id,
            trip: trip.clone(),
        }))
    }

    fn count_trips(&self) -> StoreResult<u64> {
        Ok(self.tables.read().map_err(|_| poisoned("trips"))?.trips.len() as u64)
    }

    fn bump_fares(&self, modulus: i64, limit: usize, delta: Decimal) -> StoreResult<usize> {
        let mut tables = self.tables.write().map_err(|_| poisoned("trips"))?;
        let mut changed = 0;
        for (_, trip) in tables
            .trips
            .iter_mut()
            .filter(|(id, _)| modulus > 0 && *id % modulus == 0)
            .take(limit)
        {
            trip.fare_amount += delta;
            changed += 1;
        }
        Ok(changed)
    }

    fn fare_stats(&self) -> StoreResult<FareStats> {
        let tables = self.tables.read().map_err(|_| poisoned("trips"))?;
        let count = tables.trips.len() as u64;
        let avg_fare = (count > 0).then(|| {
            let sum: Decimal = tables.trips.values().map(|t| t.fare_amount).sum();
            sum / Decimal::from(count)
        });
        Ok(FareStats { count, avg_fare })
    }

    fn record_etl_summary(&self, summary: &EtlSummary) -> StoreResult<()> {
        self.etl
            .lock()
            .map_err(|_| poisoned("etl"))?
            .push(summary.clone());
        Ok(())
    }

    fn etl_summaries(&self) -> StoreResult<Vec<EtlSummary>> {
        Ok(self.etl.lock().map_err(|_| poisoned("etl"))?.clone())
    }

    fn insert_anomalies(&self, rows: &[AnomalyRecord]) -> StoreResult<usize> {
        self.anomalies
            .lock()
            .map_err(|_| poisoned("anomalies"))?
            .extend_from_slice(rows);
        Ok(rows.len())
    }

    fn anomalies(&self) -> StoreResult<Vec<AnomalyRecord>> {
        Ok(self
            .anomalies
            .lock()
            .map_err(|_| poisoned("anomalies"))?
            .clone())
    }
}

/// Document store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemDocumentStore {
    docs: DashMap<i64, ReplicatedDocument>,
    anomalies: DashMap<i64, AnomalyRecord>,
}

impl MemDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemDocumentStore {
    fn upsert_batch(&self, docs: &[ReplicatedDocument]) -> StoreResult<BulkWriteOutcome> {
        let mut outcome = BulkWriteOutcome::default();
        for doc in docs {
            let item = check_document(doc);
            if item.is_ok() {
                match self.docs.insert(doc.trip_id, doc.clone()) {
                    Some(_) => outcome.replaced += 1,
                    None => outcome.inserted += 1,
                }
            }
            outcome.items.push(item);
        }
        Ok(outcome)
    }

    fn get(&self, trip_id: i64) -> StoreResult<Option<ReplicatedDocument>> {
        Ok(self.docs.get(&trip_id).map(|entry| entry.value().clone()))
    }

    fn sample_keys(&self, k: usize, rng: &mut dyn rand::RngCore) -> StoreResult<Vec<i64>> {
        let mut keys: Vec<i64> = self.docs.iter().map(|entry| *entry.key()).collect();
        keys.sort_unstable();
        Ok(sample_from(keys, k, rng))
    }

    fn count(&self) -> StoreResult<u64> {
        Ok(self.docs.len() as u64)
    }

    fn insert_anomalies(&self, rows: &[AnomalyRecord]) -> StoreResult<usize> {
        for row in rows {
            self.anomalies.insert(row.trip_id, row.clone());
        }
        Ok(rows.len())
    }

    fn anomalies(&self) -> StoreResult<Vec<AnomalyRecord>> {
        let mut rows: Vec<AnomalyRecord> = self
            .anomalies
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by_key(|row| row.trip_id);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::str::FromStr;

    fn trip(total: &str) -> NewTrip {
        NewTrip {
            total_amount: Decimal::from_str(total).unwrap(),
            fare_amount: Decimal::from_str(total).unwrap(),
            ..NewTrip::default()
        }
    }

    #[test]
    fn ids_are_assigned_in_order() {
        let store = MemRecordStore::new();
        let first = store.insert_trips(&[trip("1"), trip("2")]).unwrap();
        let second = store.insert_trips(&[trip("3")]).unwrap();
        assert_eq!(first.assigned, vec![1, 2]);
        assert_eq!(second.assigned, vec![3]);
        assert_eq!(store.count_trips().unwrap(), 3);
    }

    #[test]
    fn window_is_most_recent_ascending() {
        let store = MemRecordStore::new();
        let rows: Vec<NewTrip> = (0..10).map(|i| trip(&i.to_string())).collect();
        store.insert_trips(&rows).unwrap();
        let window = store.fetch_window(3).unwrap();
        let ids: Vec<i64> = window.iter().map(|r| r.trip_id).collect();
        assert_eq!(ids, vec![8, 9, 10]);
    }

    #[test]
    fn bump_fares_respects_modulus_and_limit() {
        let store = MemRecordStore::new();
        let rows: Vec<NewTrip> = (0..30).map(|_| trip("5")).collect();
        store.insert_trips(&rows).unwrap();
        let changed = store
            .bump_fares(10, 2, Decimal::from_str("0.01").unwrap())
            .unwrap();
        assert_eq!(changed, 2);
        let bumped = store.get_trip(10).unwrap().unwrap();
        assert_eq!(bumped.trip.fare_amount, Decimal::from_str("5.01").unwrap());
        let untouched = store.get_trip(30).unwrap().unwrap();
        assert_eq!(untouched.trip.fare_amount, Decimal::from(5));
    }

    #[test]
    fn fare_stats_on_empty_store() {
        let store = MemRecordStore::new();
        let stats = store.fare_stats().unwrap();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.avg_fare, None);
    }

    #[test]
    fn upsert_replaces_by_key() {
        let store = MemDocumentStore::new();
        let record = TripRecord {
            trip_id: 1,
            trip: trip("7.30"),
        };
        let doc = ReplicatedDocument::from_record(&record, Utc::now()).unwrap();
        let first = store.upsert_batch(&[doc.clone()]).unwrap();
        let second = store.upsert_batch(&[doc]).unwrap();
        assert_eq!((first.inserted, first.replaced), (1, 0));
        assert_eq!((second.inserted, second.replaced), (0, 1));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn malformed_document_does_not_block_batch() {
        let store = MemDocumentStore::new();
        let mut docs: Vec<ReplicatedDocument> = (1..=5)
            .map(|id| {
                let record = TripRecord {
                    trip_id: id,
                    trip: trip("3"),
                };
                ReplicatedDocument::from_record(&record, Utc::now()).unwrap()
            })
            .collect();
        docs[2].fields.insert(
            "total_amount".into(),
            crate::schema::DocValue::Float(f64::INFINITY),
        );
        let outcome = store.upsert_batch(&docs).unwrap();
        assert_eq!(outcome.failed(), 1);
        assert_eq!(outcome.inserted, 4);
        assert!(store.get(3).unwrap().is_none());
        assert!(store.get(5).unwrap().is_some());
    }

    #[test]
    fn sample_keys_only_returns_present_keys() {
        let store = MemDocumentStore::new();
        let docs: Vec<ReplicatedDocument> = [2, 4, 6]
            .into_iter()
            .map(|id| {
                let record = TripRecord {
                    trip_id: id,
                    trip: trip("1"),
                };
                ReplicatedDocument::from_record(&record, Utc::now()).unwrap()
            })
            .collect();
        store.upsert_batch(&docs).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let mut keys = store.sample_keys(10, &mut rng).unwrap();
        keys.sort_unstable();
        assert_eq!(keys, vec![2, 4, 6]);
    }

    #[test]
    fn anomalies_keep_order_or_key_per_store() {
        let row = |trip_id: i64, score: f64| AnomalyRecord {
            trip_id,
            source: crate::store::RECORD_STORE.into(),
            label: "outlier".into(),
            score,
            created_at: Utc::now(),
        };
        let records = MemRecordStore::new();
        let rows = vec![row(9, -0.4), row(3, -0.2)];
        assert_eq!(records.insert_anomalies(&rows).unwrap(), 2);
        assert_eq!(records.anomalies().unwrap(), rows);

        let documents = MemDocumentStore::new();
        documents
            .insert_anomalies(&[row(9, -0.4), row(3, -0.2), row(9, -0.9)])
            .unwrap();
        let stored = documents.anomalies().unwrap();
        let keys: Vec<i64> = stored.iter().map(|r| r.trip_id).collect();
        assert_eq!(keys, vec![3, 9]);
        assert_eq!(stored[1].score, -0.9);
    }
}
