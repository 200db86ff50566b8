//! Rich diagnostic error types for the replication pipeline.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text so operators know which store, file or
//! setting caused a run to abort.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for a pipeline run.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain through to the binary.
#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Validate(#[from] ValidateError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Report(#[from] ReportError),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config file: {path}")]
    #[diagnostic(
        code(tripmirror::config::read),
        help("Ensure the file named by --config or TRIPMIRROR_CONFIG exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    #[diagnostic(
        code(tripmirror::config::parse),
        help("Check the TOML syntax; section names are stores, loader, sync, validation, alerts, outputs and loadgen.")
    )]
    Parse { path: String, message: String },

    #[error("failed to write config file: {path}")]
    #[diagnostic(
        code(tripmirror::config::write),
        help("Ensure you have write permissions to the config directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value for {key}: \"{value}\"")]
    #[diagnostic(
        code(tripmirror::config::invalid_value),
        help("{expected}")
    )]
    InvalidValue {
        key: String,
        value: String,
        expected: String,
    },

    #[error("unsupported store url: \"{url}\"")]
    #[diagnostic(
        code(tripmirror::config::store_url),
        help("Store URLs take the form redb://<path-to-file> or memory://.")
    )]
    StoreUrl { url: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("cannot connect to {store} store: {message}")]
    #[diagnostic(
        code(tripmirror::store::connect),
        help(
            "The store could not be opened. Check the store URL, that the parent \
             directory exists and is writable, and that no other process holds the file."
        )
    )]
    Connection { store: String, message: String },

    #[error("{store} store timed out after {timeout_ms}ms")]
    #[diagnostic(
        code(tripmirror::store::timeout),
        help(
            "Another process is holding the store file. Wait for it to finish or raise \
             STORE_CONNECT_TIMEOUT_MS. Timeouts are not retried."
        )
    )]
    Timeout { store: String, timeout_ms: u64 },

    #[error("redb transaction error: {message}")]
    #[diagnostic(
        code(tripmirror::store::redb),
        help(
            "The embedded database rejected a transaction. If this repeats, \
             the file may be corrupt; point the store URL at a fresh file and resync."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(tripmirror::store::serde),
        help("A stored row or document could not be encoded or decoded.")
    )]
    Serialization { message: String },

    #[error("batch write failed: {message}")]
    #[diagnostic(
        code(tripmirror::store::batch),
        help("The whole batch was rejected. Later batches are still attempted.")
    )]
    Batch { message: String },
}

impl StoreError {
    /// Whether this error must terminate the current run.
    ///
    /// Connection and timeout failures are fatal; everything else is scoped
    /// to the row, document or batch that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Loader errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum LoadError {
    #[error("failed to download dataset from \"{url}\": {message}")]
    #[diagnostic(
        code(tripmirror::load::fetch),
        help("Check that DATASET_URL is reachable and the network is available.")
    )]
    Fetch { url: String, message: String },

    #[error("unsupported dataset format: \"{path}\"")]
    #[diagnostic(
        code(tripmirror::load::format),
        help("Datasets must be .csv or .parquet files.")
    )]
    UnsupportedFormat { path: String },

    #[error("failed to read {path}: {message}")]
    #[diagnostic(
        code(tripmirror::load::read),
        help("The dataset could not be decoded. Verify the file is not truncated.")
    )]
    Read { path: String, message: String },

    #[error("chunk {chunk} could not be loaded: {source}")]
    #[diagnostic(code(tripmirror::load::chunk))]
    Chunk {
        chunk: usize,
        #[source]
        source: StoreError,
    },

    #[error("I/O error: {source}")]
    #[diagnostic(
        code(tripmirror::load::io),
        help("Check that DATA_DIR exists and is writable.")
    )]
    Io {
        #[source]
        source: std::io::Error,
    },
}

pub type LoadResult<T> = std::result::Result<T, LoadError>;

// ---------------------------------------------------------------------------
// Sync errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("failed to read the replication window: {source}")]
    #[diagnostic(code(tripmirror::sync::fetch))]
    Fetch {
        #[source]
        source: StoreError,
    },

    #[error("document store unavailable during batch {batch}: {source}")]
    #[diagnostic(
        code(tripmirror::sync::write),
        help("The run was aborted; replaying it is safe because upserts are keyed on trip_id.")
    )]
    Write {
        batch: usize,
        #[source]
        source: StoreError,
    },
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ValidateError {
    #[error("failed to sample keys from the {store} store: {source}")]
    #[diagnostic(code(tripmirror::validate::sample))]
    Sample {
        store: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to read trip {trip_id}: {source}")]
    #[diagnostic(code(tripmirror::validate::read))]
    Read {
        trip_id: i64,
        #[source]
        source: StoreError,
    },
}

pub type ValidateResult<T> = std::result::Result<T, ValidateError>;

// ---------------------------------------------------------------------------
// Report errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ReportError {
    #[error("failed to load metric samples: {source}")]
    #[diagnostic(code(tripmirror::report::samples))]
    Samples {
        #[source]
        source: StoreError,
    },

    #[error("failed to write {path}")]
    #[diagnostic(
        code(tripmirror::report::write),
        help("Check that the directory for REPORT_PATH / ALERT_LOG_PATH is writable.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type ReportResult<T> = std::result::Result<T, ReportError>;
