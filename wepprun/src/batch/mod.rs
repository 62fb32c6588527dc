//! Batch orchestration: templated fan-out of child runs.
//!
//! A batch takes a GeoJSON dataset, a run-id template over its feature
//! properties, and a canonical template run directory. Validation expands
//! the template over every feature and pins the dataset with a SHA-256
//! checksum; enqueueing refuses to proceed if the dataset changed since.
//! Each child run is a clone of the template directory executing the
//! pipeline as a background job; a final completion job fires
//! `BATCH_RUN_COMPLETED` on `<name>:batch` once every child is terminal.

mod runner;
mod template;

pub use runner::{Batch, BatchHandles, BatchRunner, PipelineFn};
pub use template::{resource_checksum, sanitize_runid, BatchTemplate, TemplateState};

use std::path::PathBuf;

use thiserror::Error;

use crate::rundir::RunDirError;

/// Batch validation and fan-out failures.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid template pattern: {0}")]
    Pattern(String),

    #[error("malformed GeoJSON: {0}")]
    Geojson(String),

    #[error("feature {index} has no property {field}")]
    MissingField { index: usize, field: String },

    #[error("feature {index} expands to an empty runid")]
    EmptyRunid { index: usize },

    #[error("template expands to duplicate runid {runid}")]
    DuplicateRunid { runid: String },

    #[error("batch {name} has no validated template")]
    NotValidated { name: String },

    /// The dataset changed after validation; the template must be
    /// revalidated before the batch can run.
    #[error("resource checksum mismatch for {path}")]
    ChecksumMismatch { path: PathBuf },

    #[error(transparent)]
    RunDir(#[from] RunDirError),
}
