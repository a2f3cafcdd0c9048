//! Admission-controlled incremental estimation.
//!
//! [`IncrementalEstimator`] grows an [`AccumulatedProblem`](crate::core::problem::AccumulatedProblem)
//! one batch at a time, keeping a batch only when it adds enough mutual information about the
//! marginalized design-variable group.

pub mod incremental_estimator;
pub mod options;
pub mod return_value;

pub use incremental_estimator::IncrementalEstimator;
pub use options::{EstimatorConfig, Options};
pub use return_value::ReturnValue;

use thiserror::Error;
use tracing::error;

/// Argument errors raised by the estimator's public operations
#[derive(Debug, Clone, Error)]
pub enum EstimatorError {
    /// Empty or malformed batch
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Removal by index outside `0..num_batches`
    #[error("Batch index {index} out of range for {num_batches} accepted batches")]
    BatchIndexOutOfRange { index: usize, num_batches: usize },

    /// Removal by handle of a batch that is not currently accepted
    #[error("Batch is not part of the accumulated problem")]
    UnknownBatch,
}

impl EstimatorError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the error that caused it
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}
