//! Error types for ensemble-ipa
//!
//! Stale or missing cache entries are not errors: the pipeline cache
//! regenerates them internally. Only stage failures, bad indices and
//! storage/configuration problems reach the caller.

use thiserror::Error;

use crate::cache::DatasetName;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// ensemble-ipa error types
#[derive(Error, Debug)]
pub enum Error {
    /// A sub-pipeline stage failed while (re)generating a derived dataset
    #[error("Stage failure while generating '{dataset}': {source}")]
    StageFailure {
        /// Dataset that was being generated
        dataset: DatasetName,
        /// Underlying cause
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Walker index out of range for the queried iteration
    #[error("Invalid seg_id {seg_id} for iteration {iteration}: seg_id should be less than {n_particles}")]
    InvalidIndex {
        /// Requested walker
        seg_id: usize,
        /// Iteration that was queried
        iteration: u32,
        /// Walker count of that iteration
        n_particles: usize,
    },

    /// Iteration outside `1..=n_iterations`
    #[error("Iteration {iteration} out of range (store holds iterations 1..={n_iterations})")]
    IterationOutOfRange {
        /// Requested iteration
        iteration: u32,
        /// Number of complete iterations
        n_iterations: u32,
    },

    /// No scheme with that name or index
    #[error("Analysis scheme not found: {0}")]
    SchemeNotFound(String),

    /// Scheme exists but is disabled in the settings
    #[error("Analysis scheme '{0}' is not enabled")]
    SchemeDisabled(String),

    /// Invalid analysis settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error (Parquet/Arrow layout problems)
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Invalid argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// JSON (settings or metadata) error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an error raised inside a stage with the dataset it was producing.
    #[must_use]
    pub fn stage(dataset: DatasetName, source: Self) -> Self {
        Self::StageFailure {
            dataset,
            source: Box::new(source),
        }
    }
}
