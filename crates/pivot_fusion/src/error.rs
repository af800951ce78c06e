//! Error taxonomy for the pivot layer and the DataFusion boundary conversion.

use datafusion::common::DataFusionError;
use pivot_store::StoreError;

/// Errors raised by pattern compilation, key building, and the operators.
///
/// Every variant aborts the current statement; in-flight write batches are
/// discarded on unwind without committing.
#[derive(Debug, thiserror::Error)]
pub enum PivotError {
    /// Invalid key pattern at compile time.
    #[error("invalid key pattern: {0}")]
    Pattern(String),
    /// Key construction failed (capture count, empty capture, empty attr).
    #[error("cannot build key: {0}")]
    Build(String),
    /// Malformed user input to a table operation.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Catalog operation this storage model does not offer.
    #[error("not supported: {0}")]
    NotSupported(String),
    /// Engine-level storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PivotError {
    pub fn pattern(message: impl Into<String>) -> Self {
        Self::Pattern(message.into())
    }

    pub fn build(message: impl Into<String>) -> Self {
        Self::Build(message.into())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported(message.into())
    }
}

pub type PivotResult<T> = Result<T, PivotError>;

/// Converts a pivot-layer error into the host's query-execution error.
pub fn df_external(err: PivotError) -> DataFusionError {
    DataFusionError::Execution(err.to_string())
}
