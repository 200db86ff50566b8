//! Chunked extract-transform-load into the record store.
//!
//! A [`BatchLoader`] reads a dataset in fixed-size chunks, normalizes each
//! chunk onto the canonical schema and appends it to the [`RecordStore`] with
//! one batched insert. Row-level problems are counted and logged; only
//! unreadable input or a lost store connection abort the run.

pub mod source;
pub mod transform;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::error::{LoadError, LoadResult};
use crate::metrics::MetricsSink;
use crate::store::{EtlSummary, RECORD_STORE, RecordStore};

pub use source::{DatasetFormat, FetchOptions, RawRow, RowReader, fetch_dataset, open_rows};
pub use transform::{NormalizedChunk, RowRejection, normalize_chunk, normalize_row};

/// Default number of source rows per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 50_000;

/// Totals for one load run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub chunks: usize,
    pub rows_read: u64,
    pub rows_loaded: u64,
    pub row_errors: u64,
    pub duration: Duration,
}

pub struct BatchLoader {
    store: Arc<dyn RecordStore>,
    metrics: MetricsSink,
    chunk_size: usize,
}

impl BatchLoader {
    pub fn new(store: Arc<dyn RecordStore>, metrics: MetricsSink, chunk_size: usize) -> Self {
        Self {
            store,
            metrics,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Load every row of the dataset at `path`.
    pub fn load_file(&self, path: &Path) -> LoadResult<LoadReport> {
        let started = Instant::now();
        let reader = match open_rows(path) {
            Ok(reader) => reader,
            Err(e) => return Err(self.abort(started, 0, e)),
        };
        self.load_from(reader, started)
    }

    /// Load from an already opened reader. `started` marks the beginning of
    /// the run, including any download time the caller wants counted.
    pub fn load_from(&self, mut reader: RowReader, started: Instant) -> LoadResult<LoadReport> {
        tracing::info!(
            path = %reader.path().display(),
            chunk_size = self.chunk_size,
            "starting load"
        );
        let mut report = LoadReport::default();

        loop {
            let chunk_start = Instant::now();
            let first_row = reader.position();
            let rows = match reader.next_chunk(self.chunk_size) {
                Ok(Some(rows)) => rows,
                Ok(None) => break,
                Err(e) => return Err(self.abort(started, report.row_errors, e)),
            };
            report.chunks += 1;
            report.rows_read += rows.len() as u64;

            let chunk = normalize_chunk(&rows, first_row);
            drop(rows);
            let mut errors = chunk.rejected.len() as u64;
            for rejection in chunk.rejected.iter().take(5) {
                tracing::warn!(
                    row = rejection.row,
                    error = %rejection.error,
                    "row rejected during normalization"
                );
            }

            match self.store.insert_trips(&chunk.trips) {
                Ok(outcome) => {
                    report.rows_loaded += outcome.inserted() as u64;
                    errors += outcome.failures.len() as u64;
                    for (index, reason) in outcome.failures.iter().take(5) {
                        tracing::warn!(index, reason = %reason, "row insert failed");
                    }
                }
                Err(e) if e.is_fatal() => {
                    let error = LoadError::Chunk {
                        chunk: report.chunks,
                        source: e,
                    };
                    return Err(self.abort(started, report.row_errors + errors, error));
                }
                Err(e) => {
                    tracing::warn!(chunk = report.chunks, error = %e, "chunk insert failed");
                    errors += chunk.trips.len() as u64;
                }
            }
            report.row_errors += errors;

            self.metrics
                .record(RECORD_STORE, "etl_chunk", chunk_start, errors, 0);
            tracing::info!(
                chunk = report.chunks,
                rows = chunk.trips.len(),
                errors,
                total = report.rows_loaded,
                "chunk loaded"
            );
        }

        report.duration = started.elapsed();
        let summary = EtlSummary {
            rows_loaded: report.rows_loaded,
            duration_secs: (report.duration.as_secs_f64() * 100.0).round() / 100.0,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.record_etl_summary(&summary) {
            tracing::warn!(error = %e, "failed to record ETL summary");
        }
        self.metrics
            .record(RECORD_STORE, "etl_complete", started, report.row_errors, 0);
        tracing::info!(
            rows = report.rows_loaded,
            errors = report.row_errors,
            chunks = report.chunks,
            secs = summary.duration_secs,
            "load complete"
        );
        Ok(report)
    }

    fn abort(&self, started: Instant, prior_errors: u64, error: LoadError) -> LoadError {
        tracing::error!(error = %error, "load aborted");
        self.metrics
            .record(RECORD_STORE, "etl_abort", started, prior_errors + 1, 0);
        error
    }
}

impl std::fmt::Debug for BatchLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchLoader")
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}
