//! The assembled replication pipeline.
//!
//! [`Pipeline`] owns both store handles and the shared [`MetricsSink`], and
//! builds each stage from one [`PipelineConfig`]. It is the entry point used by
//! the `tripmirror` binary.

use std::sync::Arc;
use std::time::Instant;

use crate::config::PipelineConfig;
use crate::error::{PipelineResult, ReportError};
use crate::loader::{BatchLoader, LoadReport, fetch_dataset, open_rows};
use crate::loadgen::{LoadGenerator, LoadTestReport};
use crate::metrics::report::{AlertCheck, AlertReporter, CoverageCheck, MetricsSummary, verify_coverage};
use crate::metrics::{AlertLog, MetricSample, MetricsSink, ResourceProbe, SystemProbe};
use crate::store::{
    DocumentStore, MetricsBackend, RECORD_STORE, RecordStore, open_document_store,
    open_record_store,
};
use crate::sync::{SyncReport, Synchronizer};
use crate::validate::{CoverageReport, ValidationReport, Validator};

/// Outcome of a full `load → sync → validate → check → report` run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub load: LoadReport,
    pub sync: SyncReport,
    pub validation: ValidationReport,
    pub alerts: AlertCheck,
    pub report: MetricsSummary,
}

impl RunSummary {
    /// The run passes when validation passes; alerts are reported alongside.
    pub fn exit_code(&self) -> i32 {
        self.validation.exit_code()
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    records: Arc<dyn RecordStore>,
    documents: Arc<dyn DocumentStore>,
    metrics: MetricsSink,
}

impl Pipeline {
    /// Open both stores named by `config` and sample host resources with
    /// `sysinfo`.
    pub fn open(config: PipelineConfig) -> PipelineResult<Self> {
        let timeout = config.store_connect_timeout();
        let records = open_record_store(&config.record_store_url()?, timeout)?;
        let documents = open_document_store(&config.document_store_url()?, timeout)?;
        tracing::info!(
            records = %config.stores.record_url,
            documents = %config.stores.document_url,
            "stores opened"
        );
        Ok(Self::with_stores(
            config,
            records,
            documents,
            Arc::new(SystemProbe::new()),
        ))
    }

    /// Assemble a pipeline over existing store handles.
    pub fn with_stores(
        config: PipelineConfig,
        records: Arc<dyn RecordStore>,
        documents: Arc<dyn DocumentStore>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Self {
        let metrics = MetricsSink::new(Arc::new(records.clone()), probe, config.thresholds())
            .with_alert_log(AlertLog::new(&config.outputs.alert_log));
        Self {
            config,
            records,
            documents,
            metrics,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    pub fn metrics(&self) -> &MetricsSink {
        &self.metrics
    }

    /// Fetch the configured dataset and load it.
    pub fn load(&self) -> PipelineResult<LoadReport> {
        self.load_uri(&self.config.loader.dataset_url)
    }

    /// Fetch the dataset at `uri` and load it. Download time counts towards
    /// the run's `etl_complete` latency.
    pub fn load_uri(&self, uri: &str) -> PipelineResult<LoadReport> {
        let started = Instant::now();
        let loader = BatchLoader::new(
            self.records.clone(),
            self.metrics.clone(),
            self.config.loader.chunk_size,
        );
        let opened = fetch_dataset(uri, &self.config.fetch_options())
            .and_then(|path| open_rows(&path));
        let reader = match opened {
            Ok(reader) => reader,
            Err(e) => {
                tracing::error!(error = %e, "dataset unavailable");
                self.metrics
                    .record(RECORD_STORE, "etl_abort", started, 1, 0);
                return Err(e.into());
            }
        };
        Ok(loader.load_from(reader, started)?)
    }

    pub fn sync(&self) -> PipelineResult<SyncReport> {
        let synchronizer = Synchronizer::new(
            self.records.clone(),
            self.documents.clone(),
            self.metrics.clone(),
            self.config.sync_config(),
        );
        Ok(synchronizer.run()?)
    }

    fn validator(&self) -> PipelineResult<Validator> {
        Ok(Validator::new(
            self.records.clone(),
            self.documents.clone(),
            self.metrics.clone(),
            self.config.validator_config()?,
        ))
    }

    pub fn validate(&self) -> PipelineResult<ValidationReport> {
        Ok(self.validator()?.run()?)
    }

    pub fn check_source_coverage(&self) -> PipelineResult<CoverageReport> {
        Ok(self.validator()?.check_source_coverage()?)
    }

    pub fn load_test(&self) -> LoadTestReport {
        LoadGenerator::new(
            self.records.clone(),
            self.metrics.clone(),
            self.config.load_config(),
        )
        .run()
    }

    /// Every metric sample recorded so far.
    pub fn samples(&self) -> PipelineResult<Vec<MetricSample>> {
        Ok(self
            .records
            .metrics()
            .map_err(|source| ReportError::Samples { source })?)
    }

    fn reporter(&self) -> AlertReporter {
        AlertReporter::new(self.config.thresholds())
    }

    /// Judge all samples and append the outcome to the alert log.
    pub fn check_alerts(&self) -> PipelineResult<AlertCheck> {
        let samples = self.samples()?;
        let log = AlertLog::new(&self.config.outputs.alert_log);
        Ok(self.reporter().check_and_log(&samples, &log)?)
    }

    pub fn write_report(&self) -> PipelineResult<MetricsSummary> {
        let samples = self.samples()?;
        Ok(self
            .reporter()
            .write_report(&samples, &self.config.outputs.report)?)
    }

    pub fn verify(&self) -> PipelineResult<CoverageCheck> {
        Ok(verify_coverage(&self.samples()?))
    }

    /// Run every stage in order. A fatal stage error stops the run.
    pub fn run(&self) -> PipelineResult<RunSummary> {
        let load = self.load()?;
        let sync = self.sync()?;
        let validation = self.validate()?;
        let alerts = self.check_alerts()?;
        let report = self.write_report()?;
        Ok(RunSummary {
            load,
            sync,
            validation,
            alerts,
            report,
        })
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}
