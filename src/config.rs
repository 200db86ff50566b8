//! Pipeline configuration.
//!
//! [`PipelineConfig`] is built once per process and handed to each component's
//! constructor. Values come from, in increasing precedence: built-in defaults,
//! an optional TOML file (`--config` or `TRIPMIRROR_CONFIG`), and environment
//! keys such as `SYNC_BATCH_SIZE`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::loader::FetchOptions;
use crate::loadgen::LoadConfig;
use crate::metrics::Thresholds;
use crate::store::StoreUrl;
use crate::sync::SyncConfig;
use crate::validate::ValidatorConfig;

/// Environment key naming the TOML config file.
pub const CONFIG_PATH_KEY: &str = "TRIPMIRROR_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoresConfig {
    /// `redb://<path>` or `memory://`.
    #[serde(default = "default_record_url")]
    pub record_url: String,
    #[serde(default = "default_document_url")]
    pub document_url: String,
    /// How long opening a store may wait while another process holds it.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_record_url() -> String {
    "redb://data/records.redb".into()
}
fn default_document_url() -> String {
    "redb://data/documents.redb".into()
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for StoresConfig {
    fn default() -> Self {
        Self {
            record_url: default_record_url(),
            document_url: default_document_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderSection {
    #[serde(default = "default_dataset_url")]
    pub dataset_url: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_fetch_connect_timeout_ms")]
    pub fetch_connect_timeout_ms: u64,
    #[serde(default = "default_fetch_read_timeout_ms")]
    pub fetch_read_timeout_ms: u64,
}

fn default_dataset_url() -> String {
    "https://d37ci6vzurychx.cloudfront.net/trip-data/yellow_tripdata_2023-01.parquet".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_chunk_size() -> usize {
    crate::loader::DEFAULT_CHUNK_SIZE
}
fn default_fetch_connect_timeout_ms() -> u64 {
    10_000
}
fn default_fetch_read_timeout_ms() -> u64 {
    60_000
}

impl Default for LoaderSection {
    fn default() -> Self {
        Self {
            dataset_url: default_dataset_url(),
            data_dir: default_data_dir(),
            chunk_size: default_chunk_size(),
            fetch_connect_timeout_ms: default_fetch_connect_timeout_ms(),
            fetch_read_timeout_ms: default_fetch_read_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSection {
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_window() -> usize {
    crate::sync::DEFAULT_WINDOW
}
fn default_batch_size() -> usize {
    crate::sync::DEFAULT_BATCH_SIZE
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            window: default_window(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSection {
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Fixed sampling seed for reproducible runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

fn default_sample_size() -> usize {
    crate::validate::DEFAULT_SAMPLE_SIZE
}
fn default_tolerance() -> f64 {
    0.01
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            sample_size: default_sample_size(),
            tolerance: default_tolerance(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSection {
    #[serde(default = "default_cpu_percent")]
    pub cpu_percent: f64,
    #[serde(default = "default_latency_ms")]
    pub latency_ms: f64,
    #[serde(default)]
    pub mismatch_count: u64,
}

fn default_cpu_percent() -> f64 {
    85.0
}
fn default_latency_ms() -> f64 {
    500.0
}

impl Default for AlertSection {
    fn default() -> Self {
        Self {
            cpu_percent: default_cpu_percent(),
            latency_ms: default_latency_ms(),
            mismatch_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSection {
    #[serde(default = "default_alert_log")]
    pub alert_log: PathBuf,
    #[serde(default = "default_report")]
    pub report: PathBuf,
}

fn default_alert_log() -> PathBuf {
    PathBuf::from("logs/alerts.log")
}
fn default_report() -> PathBuf {
    PathBuf::from("logs/monitoring_report.txt")
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            alert_log: default_alert_log(),
            report: default_report(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadgenSection {
    #[serde(default = "default_insert_workers")]
    pub insert_workers: usize,
    #[serde(default = "default_update_workers")]
    pub update_workers: usize,
    #[serde(default = "default_read_workers")]
    pub read_workers: usize,
    #[serde(default = "default_rows_per_insert_worker")]
    pub rows_per_insert_worker: usize,
}

fn default_insert_workers() -> usize {
    3
}
fn default_update_workers() -> usize {
    2
}
fn default_read_workers() -> usize {
    5
}
fn default_rows_per_insert_worker() -> usize {
    100
}

impl Default for LoadgenSection {
    fn default() -> Self {
        Self {
            insert_workers: default_insert_workers(),
            update_workers: default_update_workers(),
            read_workers: default_read_workers(),
            rows_per_insert_worker: default_rows_per_insert_worker(),
        }
    }
}

/// Complete pipeline configuration, persisted as TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub stores: StoresConfig,
    #[serde(default)]
    pub loader: LoaderSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub validation: ValidationSection,
    #[serde(default)]
    pub alerts: AlertSection,
    #[serde(default)]
    pub outputs: OutputSection,
    #[serde(default)]
    pub loadgen: LoadgenSection,
}

fn parse<T: FromStr>(key: &str, raw: &str, expected: &str) -> ConfigResult<T> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.into(),
        value: raw.into(),
        expected: expected.into(),
    })
}

fn invalid(key: &str, value: impl ToString, expected: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.into(),
        value: value.to_string(),
        expected: expected.into(),
    }
}

const POSITIVE_INT: &str = "Expected a positive integer.";
const NON_NEGATIVE_NUM: &str = "Expected a non-negative number.";

impl PipelineConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Resolve the full configuration from the process environment.
    pub fn from_env(config_path: Option<&Path>) -> ConfigResult<Self> {
        Self::from_lookup(config_path, |key| std::env::var(key).ok())
    }

    /// Resolve the full configuration using `lookup` for environment keys.
    pub fn from_lookup(
        config_path: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> ConfigResult<Self> {
        let file = config_path
            .map(Path::to_path_buf)
            .or_else(|| lookup(CONFIG_PATH_KEY).map(PathBuf::from));
        let mut config = match file {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        config.apply_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from environment keys that are present.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("RECORD_STORE_URL") {
            self.stores.record_url = v;
        }
        if let Some(v) = get("DOCUMENT_STORE_URL") {
            self.stores.document_url = v;
        }
        if let Some(v) = get("STORE_CONNECT_TIMEOUT_MS") {
            self.stores.connect_timeout_ms = parse("STORE_CONNECT_TIMEOUT_MS", &v, POSITIVE_INT)?;
        }
        if let Some(v) = get("DATASET_URL") {
            self.loader.dataset_url = v;
        }
        if let Some(v) = get("DATA_DIR") {
            self.loader.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("ETL_CHUNK_SIZE") {
            self.loader.chunk_size = parse("ETL_CHUNK_SIZE", &v, POSITIVE_INT)?;
        }
        if let Some(v) = get("FETCH_CONNECT_TIMEOUT_MS") {
            self.loader.fetch_connect_timeout_ms =
                parse("FETCH_CONNECT_TIMEOUT_MS", &v, POSITIVE_INT)?;
        }
        if let Some(v) = get("FETCH_READ_TIMEOUT_MS") {
            self.loader.fetch_read_timeout_ms = parse("FETCH_READ_TIMEOUT_MS", &v, POSITIVE_INT)?;
        }
        if let Some(v) = get("SYNC_WINDOW") {
            self.sync.window = parse("SYNC_WINDOW", &v, POSITIVE_INT)?;
        }
        if let Some(v) = get("SYNC_BATCH_SIZE") {
            self.sync.batch_size = parse("SYNC_BATCH_SIZE", &v, POSITIVE_INT)?;
        }
        if let Some(v) = get("VALIDATION_SAMPLE_SIZE") {
            self.validation.sample_size = parse("VALIDATION_SAMPLE_SIZE", &v, POSITIVE_INT)?;
        }
        if let Some(v) = get("VALIDATION_TOLERANCE") {
            self.validation.tolerance = parse("VALIDATION_TOLERANCE", &v, NON_NEGATIVE_NUM)?;
        }
        if let Some(v) = get("ALERT_CPU_PERCENT") {
            self.alerts.cpu_percent = parse("ALERT_CPU_PERCENT", &v, NON_NEGATIVE_NUM)?;
        }
        if let Some(v) = get("ALERT_LATENCY_MS") {
            self.alerts.latency_ms = parse("ALERT_LATENCY_MS", &v, NON_NEGATIVE_NUM)?;
        }
        if let Some(v) = get("ALERT_LOG_PATH") {
            self.outputs.alert_log = PathBuf::from(v);
        }
        if let Some(v) = get("REPORT_PATH") {
            self.outputs.report = PathBuf::from(v);
        }
        if let Some(v) = get("LOADGEN_INSERT_WORKERS") {
            self.loadgen.insert_workers = parse("LOADGEN_INSERT_WORKERS", &v, POSITIVE_INT)?;
        }
        if let Some(v) = get("LOADGEN_UPDATE_WORKERS") {
            self.loadgen.update_workers = parse("LOADGEN_UPDATE_WORKERS", &v, POSITIVE_INT)?;
        }
        if let Some(v) = get("LOADGEN_READ_WORKERS") {
            self.loadgen.read_workers = parse("LOADGEN_READ_WORKERS", &v, POSITIVE_INT)?;
        }
        Ok(())
    }

    /// Reject zero sizes, negative thresholds and malformed store URLs.
    pub fn validate(&self) -> ConfigResult<()> {
        self.record_store_url()?;
        self.document_store_url()?;

        let sizes = [
            ("ETL_CHUNK_SIZE", self.loader.chunk_size),
            ("SYNC_WINDOW", self.sync.window),
            ("SYNC_BATCH_SIZE", self.sync.batch_size),
            ("VALIDATION_SAMPLE_SIZE", self.validation.sample_size),
        ];
        for (key, value) in sizes {
            if value == 0 {
                return Err(invalid(key, value, POSITIVE_INT));
            }
        }
        let timeouts = [
            ("STORE_CONNECT_TIMEOUT_MS", self.stores.connect_timeout_ms),
            ("FETCH_CONNECT_TIMEOUT_MS", self.loader.fetch_connect_timeout_ms),
            ("FETCH_READ_TIMEOUT_MS", self.loader.fetch_read_timeout_ms),
        ];
        for (key, value) in timeouts {
            if value == 0 {
                return Err(invalid(key, value, POSITIVE_INT));
            }
        }
        let thresholds = [
            ("VALIDATION_TOLERANCE", self.validation.tolerance),
            ("ALERT_CPU_PERCENT", self.alerts.cpu_percent),
            ("ALERT_LATENCY_MS", self.alerts.latency_ms),
        ];
        for (key, value) in thresholds {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(key, value, NON_NEGATIVE_NUM));
            }
        }
        self.tolerance()?;
        Ok(())
    }

    pub fn record_store_url(&self) -> ConfigResult<StoreUrl> {
        self.stores.record_url.parse()
    }

    pub fn document_store_url(&self) -> ConfigResult<StoreUrl> {
        self.stores.document_url.parse()
    }

    /// Validation tolerance as an exact decimal.
    pub fn tolerance(&self) -> ConfigResult<Decimal> {
        let raw = self.validation.tolerance.to_string();
        Decimal::from_str(&raw).map_err(|_| invalid("VALIDATION_TOLERANCE", raw, NON_NEGATIVE_NUM))
    }

    /// Bound on waiting for a store file held by another process.
    pub fn store_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.stores.connect_timeout_ms)
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            data_dir: self.loader.data_dir.clone(),
            connect_timeout: Duration::from_millis(self.loader.fetch_connect_timeout_ms),
            read_timeout: Duration::from_millis(self.loader.fetch_read_timeout_ms),
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            window: self.sync.window,
            batch_size: self.sync.batch_size,
        }
    }

    pub fn validator_config(&self) -> ConfigResult<ValidatorConfig> {
        Ok(ValidatorConfig {
            sample_size: self.validation.sample_size,
            tolerance: self.tolerance()?,
            coverage_window: self.sync.window,
            seed: self.validation.seed,
        })
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            cpu_percent: self.alerts.cpu_percent,
            latency_ms: self.alerts.latency_ms,
            mismatch_count: self.alerts.mismatch_count,
        }
    }

    pub fn load_config(&self) -> LoadConfig {
        LoadConfig {
            insert_workers: self.loadgen.insert_workers,
            update_workers: self.loadgen.update_workers,
            read_workers: self.loadgen.read_workers,
            rows_per_insert_worker: self.loadgen.rows_per_insert_worker,
            ..LoadConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = PipelineConfig::from_lookup(None, env(&[])).unwrap();
        assert_eq!(config.loader.chunk_size, 50_000);
        assert_eq!(config.sync.window, 100_000);
        assert_eq!(config.sync.batch_size, 5_000);
        assert_eq!(config.validation.sample_size, 1_000);
        assert_eq!(config.tolerance().unwrap(), Decimal::new(1, 2));
        assert_eq!(config.thresholds(), Thresholds::default());
        assert_eq!(config.load_config(), LoadConfig::default());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = PipelineConfig::from_lookup(
            None,
            env(&[
                ("RECORD_STORE_URL", "memory://"),
                ("SYNC_BATCH_SIZE", "250"),
                ("ALERT_LATENCY_MS", "750.5"),
                ("VALIDATION_TOLERANCE", "0.05"),
                ("DATA_DIR", "/tmp/taxi"),
            ]),
        )
        .unwrap();
        assert_eq!(config.record_store_url().unwrap(), StoreUrl::Memory);
        assert_eq!(config.sync.batch_size, 250);
        assert_eq!(config.alerts.latency_ms, 750.5);
        assert_eq!(config.tolerance().unwrap(), Decimal::new(5, 2));
        assert_eq!(config.fetch_options().data_dir, PathBuf::from("/tmp/taxi"));
    }

    #[test]
    fn store_and_fetch_timeouts_are_separate_settings() {
        let config = PipelineConfig::from_lookup(
            None,
            env(&[
                ("STORE_CONNECT_TIMEOUT_MS", "250"),
                ("FETCH_READ_TIMEOUT_MS", "90000"),
            ]),
        )
        .unwrap();
        assert_eq!(config.store_connect_timeout(), Duration::from_millis(250));
        let fetch = config.fetch_options();
        assert_eq!(fetch.connect_timeout, Duration::from_millis(10_000));
        assert_eq!(fetch.read_timeout, Duration::from_millis(90_000));

        let zero = PipelineConfig::from_lookup(None, env(&[("FETCH_CONNECT_TIMEOUT_MS", "0")]));
        assert!(
            matches!(zero, Err(ConfigError::InvalidValue { key, .. }) if key == "FETCH_CONNECT_TIMEOUT_MS")
        );
    }

    #[test]
    fn file_sits_between_defaults_and_environment() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tripmirror.toml");
        std::fs::write(
            &path,
            "[sync]\nwindow = 500\nbatch_size = 50\n\n[alerts]\ncpu_percent = 90.0\n",
        )
        .unwrap();
        let path_str = path.display().to_string();
        let config = PipelineConfig::from_lookup(
            None,
            env(&[(CONFIG_PATH_KEY, path_str.as_str()), ("SYNC_BATCH_SIZE", "10")]),
        )
        .unwrap();
        assert_eq!(config.sync.window, 500);
        assert_eq!(config.sync.batch_size, 10);
        assert_eq!(config.alerts.cpu_percent, 90.0);
        assert_eq!(config.alerts.latency_ms, 500.0);
    }

    #[test]
    fn save_then_load_preserves_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("conf/tripmirror.toml");
        let mut config = PipelineConfig::default();
        config.validation.seed = Some(9);
        config.stores.document_url = "memory://".into();
        config.save(&path).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn rejects_zero_sizes_and_negative_thresholds() {
        let zero = PipelineConfig::from_lookup(None, env(&[("ETL_CHUNK_SIZE", "0")]));
        assert!(matches!(zero, Err(ConfigError::InvalidValue { key, .. }) if key == "ETL_CHUNK_SIZE"));

        let negative = PipelineConfig::from_lookup(None, env(&[("ALERT_CPU_PERCENT", "-1")]));
        assert!(matches!(negative, Err(ConfigError::InvalidValue { .. })));

        let garbage = PipelineConfig::from_lookup(None, env(&[("SYNC_WINDOW", "lots")]));
        assert!(matches!(garbage, Err(ConfigError::InvalidValue { .. })));

        let url = PipelineConfig::from_lookup(None, env(&[("DOCUMENT_STORE_URL", "mongodb://x")]));
        assert!(matches!(url, Err(ConfigError::StoreUrl { .. })));
    }

    #[test]
    fn missing_config_file_is_a_read_error() {
        let result = PipelineConfig::from_lookup(Some(Path::new("/nonexistent/tripmirror.toml")), env(&[]));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
