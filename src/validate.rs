//! Sampling-based consistency checks between the two stores.
//!
//! [`Validator::run`] samples keys that exist in the document store and
//! compares each document's `total_amount` against the record store.
//! [`Validator::check_source_coverage`] goes the other way and reports keys in
//! the replication window that never reached the document store.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rust_decimal::Decimal;

use crate::error::{StoreError, ValidateError, ValidateResult};
use crate::metrics::MetricsSink;
use crate::schema::{ReplicatedDocument, TripRecord};
use crate::store::{DOCUMENT_STORE, DocumentStore, RECORD_STORE, RecordStore, sample_from};

pub const DEFAULT_SAMPLE_SIZE: usize = 1_000;

/// The monetary field compared across stores.
const COMPARED_FIELD: &str = "total_amount";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidatorConfig {
    pub sample_size: usize,
    /// Largest accepted absolute difference between the two totals.
    pub tolerance: Decimal,
    /// Size of the record-store window examined by the coverage check.
    pub coverage_window: usize,
    /// Fixed RNG seed; `None` draws a fresh sample each run.
    pub seed: Option<u64>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            sample_size: DEFAULT_SAMPLE_SIZE,
            tolerance: Decimal::new(1, 2),
            coverage_window: crate::sync::DEFAULT_WINDOW,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub checked: usize,
    pub not_found: usize,
    pub mismatches: usize,
    /// Non-fatal read failures; each is also counted in `not_found`.
    pub read_errors: usize,
}

impl ValidationReport {
    pub fn issues(&self) -> usize {
        self.not_found + self.mismatches
    }

    pub fn passed(&self) -> bool {
        self.issues() == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed() { 0 } else { 1 }
    }
}

/// Keys from the record-store window that are absent from the document store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageReport {
    pub checked: usize,
    pub missing: Vec<i64>,
}

impl CoverageReport {
    pub fn passed(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed() { 0 } else { 1 }
    }
}

/// Outcome of comparing one key across both stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCheck {
    Match,
    NotFound,
    Mismatch,
}

/// Compare one record with its document, if both exist.
pub fn compare(
    record: Option<&TripRecord>,
    document: Option<&ReplicatedDocument>,
    tolerance: Decimal,
) -> KeyCheck {
    let (Some(record), Some(document)) = (record, document) else {
        return KeyCheck::NotFound;
    };
    // Parse the float's shortest decimal rendering so 14.3 compares as 14.3,
    // not as its binary approximation.
    let Some(replicated) = document
        .number(COMPARED_FIELD)
        .and_then(|f| Decimal::from_str(&f.to_string()).ok())
    else {
        return KeyCheck::Mismatch;
    };
    if (record.trip.total_amount - replicated).abs() > tolerance {
        KeyCheck::Mismatch
    } else {
        KeyCheck::Match
    }
}

pub struct Validator {
    records: Arc<dyn RecordStore>,
    documents: Arc<dyn DocumentStore>,
    metrics: MetricsSink,
    config: ValidatorConfig,
}

impl Validator {
    pub fn new(
        records: Arc<dyn RecordStore>,
        documents: Arc<dyn DocumentStore>,
        metrics: MetricsSink,
        config: ValidatorConfig,
    ) -> Self {
        Self {
            records,
            documents,
            metrics,
            config,
        }
    }

    fn rng(&self) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Sample destination keys and compare them against the record store.
    pub fn run(&self) -> ValidateResult<ValidationReport> {
        let started = Instant::now();
        let mut rng = self.rng();
        let keys = self
            .documents
            .sample_keys(self.config.sample_size, &mut rng)
            .map_err(|source| ValidateError::Sample {
                store: DOCUMENT_STORE.into(),
                source,
            })?;
        tracing::info!(keys = keys.len(), "validating sampled documents");

        let mut report = ValidationReport::default();
        for trip_id in keys {
            report.checked += 1;
            let pair = self
                .records
                .get_trip(trip_id)
                .and_then(|record| Ok((record, self.documents.get(trip_id)?)));
            let (record, document) = match pair {
                Ok(pair) => pair,
                Err(source) => {
                    self.tolerate(trip_id, source)?;
                    report.read_errors += 1;
                    report.not_found += 1;
                    continue;
                }
            };
            match compare(record.as_ref(), document.as_ref(), self.config.tolerance) {
                KeyCheck::Match => {}
                KeyCheck::NotFound => report.not_found += 1,
                KeyCheck::Mismatch => {
                    report.mismatches += 1;
                    tracing::debug!(trip_id, "total_amount differs between stores");
                }
            }
        }

        self.metrics.record(
            DOCUMENT_STORE,
            "validation",
            started,
            report.read_errors as u64,
            report.issues() as u64,
        );
        if report.passed() {
            tracing::info!(checked = report.checked, "validation passed");
        } else {
            tracing::warn!(
                checked = report.checked,
                not_found = report.not_found,
                mismatches = report.mismatches,
                "validation found {} issues",
                report.issues()
            );
        }
        Ok(report)
    }

    /// Sample keys from the record-store window and report those absent from
    /// the document store.
    pub fn check_source_coverage(&self) -> ValidateResult<CoverageReport> {
        let started = Instant::now();
        let sample_err = |source| ValidateError::Sample {
            store: RECORD_STORE.into(),
            source,
        };
        let window = self
            .records
            .fetch_window(self.config.coverage_window)
            .map_err(sample_err)?;
        let ids: Vec<i64> = window.iter().map(|r| r.trip_id).collect();
        drop(window);
        let keys = sample_from(ids, self.config.sample_size, &mut self.rng());

        let mut report = CoverageReport::default();
        let mut errors = 0u64;
        for trip_id in keys {
            report.checked += 1;
            match self.documents.get(trip_id) {
                Ok(Some(_)) => {}
                Ok(None) => report.missing.push(trip_id),
                Err(source) => {
                    self.tolerate(trip_id, source)?;
                    errors += 1;
                    report.missing.push(trip_id);
                }
            }
        }
        report.missing.sort_unstable();

        self.metrics.record(
            DOCUMENT_STORE,
            "validation_coverage",
            started,
            errors,
            report.missing.len() as u64,
        );
        tracing::info!(
            checked = report.checked,
            missing = report.missing.len(),
            "source coverage checked"
        );
        Ok(report)
    }

    /// Log a non-fatal read failure, or turn a fatal one into an error.
    fn tolerate(&self, trip_id: i64, source: StoreError) -> ValidateResult<()> {
        if source.is_fatal() {
            return Err(ValidateError::Read { trip_id, source });
        }
        tracing::warn!(trip_id, error = %source, "read failed during validation");
        Ok(())
    }
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
