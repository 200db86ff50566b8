// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # tripmirror
//!
//! Keeps a document store eventually consistent with a relational system of
//! record for high-volume taxi trip data, and measures the health of that
//! replication as it runs.
//!
//! ## Architecture
//!
//! - **Schema** (`schema`): the canonical 19-field trip and its document projection
//! - **Stores** (`store`): record and document store traits with redb and in-memory backends
//! - **Loader** (`loader`): chunked CSV/Parquet extract-transform-load into the record store
//! - **Sync** (`sync`): windowed, batched, idempotent upserts into the document store
//! - **Validation** (`validate`): destination-sampled consistency checks and source coverage
//! - **Metrics** (`metrics`): per-operation samples, threshold alerts and the monitoring report
//! - **Load generation** (`loadgen`): concurrent insert/update/read workers
//!
//! ## Library usage
//!
//! ```no_run
//! use tripmirror::config::PipelineConfig;
//! use tripmirror::pipeline::Pipeline;
//!
//! let config = PipelineConfig::from_env(None).unwrap();
//! let pipeline = Pipeline::open(config).unwrap();
//! let summary = pipeline.run().unwrap();
//! std::process::exit(summary.exit_code());
//! ```

pub mod config;
pub mod error;
pub mod loader;
pub mod loadgen;
pub mod metrics;
pub mod pipeline;
pub mod schema;
pub mod store;
pub mod sync;
pub mod validate;
