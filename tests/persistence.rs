//! Persistence tests for the redb-backed stores.
//!
//! These verify that trips, metric samples, ETL summaries and replicated
//! documents survive closing and reopening the database files.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rust_decimal::Decimal;

use tripmirror::metrics::MetricSample;
use tripmirror::schema::{NewTrip, ReplicatedDocument};
use tripmirror::store::durable::{DurableDocumentStore, DurableRecordStore};
use tripmirror::store::{
    DocumentStore, EtlSummary, MetricsBackend, RECORD_STORE, RecordStore, StoreUrl,
    open_record_store,
};

const TIMEOUT: Duration = Duration::from_secs(2);

fn trip(total: i64) -> NewTrip {
    NewTrip {
        vendor_id: "2".into(),
        total_amount: Decimal::new(total, 2),
        ..Default::default()
    }
}

#[test]
fn trips_and_metrics_survive_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("records.redb");

    // First session: write rows, a metric sample and a summary.
    {
        let store = DurableRecordStore::open(&path).unwrap();
        let outcome = store
            .insert_trips(&[trip(1050), trip(2275), trip(999)])
            .unwrap();
        assert_eq!(outcome.assigned, vec![1, 2, 3]);

        store
            .insert_metric(&MetricSample {
                store_kind: RECORD_STORE.into(),
                operation: "etl_complete".into(),
                cpu_percent: 20.0,
                mem_percent: 30.0,
                latency_ms: 125.0,
                error_count: 0,
                mismatch_count: 0,
                recorded_at: Utc::now(),
            })
            .unwrap();
        store
            .record_etl_summary(&EtlSummary {
                rows_loaded: 3,
                duration_secs: 0.12,
                created_at: Utc::now(),
            })
            .unwrap();
    }

    // Second session: everything is still there and ids keep counting.
    {
        let store = DurableRecordStore::open(&path).unwrap();
        assert_eq!(store.count_trips().unwrap(), 3);

        let second = store.get_trip(2).unwrap().unwrap();
        assert_eq!(second.trip.vendor_id, "2");
        assert_eq!(second.trip.total_amount, Decimal::new(2275, 2));

        let metrics = store.metrics().unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].operation, "etl_complete");
        assert_eq!(metrics[0].latency_ms, 125.0);

        assert_eq!(store.etl_summaries().unwrap()[0].rows_loaded, 3);

        let next = store.insert_trips(&[trip(500)]).unwrap();
        assert_eq!(next.assigned, vec![4]);

        let window = store.fetch_window(2).unwrap();
        let ids: Vec<i64> = window.iter().map(|r| r.trip_id).collect();
        assert_eq!(ids, vec![3, 4]);
    }
}

#[test]
fn documents_survive_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("documents.redb");
    let records = open_record_store(&StoreUrl::Memory, TIMEOUT).unwrap();
    records
        .insert_trips(&(1..=5).map(|i| trip(i * 100)).collect::<Vec<_>>())
        .unwrap();
    let docs: Vec<ReplicatedDocument> = records
        .fetch_window(5)
        .unwrap()
        .iter()
        .map(|r| ReplicatedDocument::from_record(r, Utc::now()).unwrap())
        .collect();

    {
        let store = DurableDocumentStore::open(&path).unwrap();
        let outcome = store.upsert_batch(&docs).unwrap();
        assert_eq!(outcome.inserted, 5);
    }

    {
        let store: Arc<dyn DocumentStore> = Arc::new(DurableDocumentStore::open(&path).unwrap());
        assert_eq!(store.count().unwrap(), 5);

        let doc = store.get(3).unwrap().unwrap();
        assert_eq!(doc.number("total_amount"), Some(3.0));

        // Rewriting the same keys replaces rather than duplicates.
        let outcome = store.upsert_batch(&docs).unwrap();
        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.replaced, 5);
        assert_eq!(store.count().unwrap(), 5);

        let mut rng = StdRng::seed_from_u64(1);
        let mut keys = store.sample_keys(10, &mut rng).unwrap();
        keys.sort_unstable();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
    }
}

#[test]
fn store_url_opens_redb_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("nested").join("records.redb");
    let url: StoreUrl = format!("redb://{}", path.display()).parse().unwrap();

    {
        let store = open_record_store(&url, TIMEOUT).unwrap();
        store.insert_trips(&[trip(100)]).unwrap();
    }

    assert!(path.exists());
    let store = open_record_store(&url, TIMEOUT).unwrap();
    assert_eq!(store.count_trips().unwrap(), 1);
}
