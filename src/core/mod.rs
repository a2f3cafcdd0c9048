//! Core bookkeeping for incremental calibration problems.
//!
//! This module contains the building blocks the estimator accumulates over time:
//! - Design variables (parameter blocks tagged with a group id)
//! - Error terms (factors wired to named design variables)
//! - Batches (atomic bundles of variables and error terms)
//! - The accumulated problem (arena storage, column layout, sparse linearization)

pub mod batch;
pub mod error_term;
pub mod problem;
pub mod variable;

use thiserror::Error;
use tracing::error;

/// Core module error types for problem bookkeeping and linearization
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Error term construction or evaluation failed
    #[error("Error term error: {0}")]
    ErrorTerm(String),

    /// Variable definition conflicts with the stored variable
    #[error("Variable error: {0}")]
    Variable(String),

    /// An error term references a variable that is neither in its batch nor in the problem
    #[error("Unknown design variable '{0}'")]
    UnknownVariable(String),

    /// Batch index does not name an accumulated batch
    #[error("Batch index {index} out of range for {num_batches} batches")]
    BatchIndex { index: usize, num_batches: usize },

    /// Factor linearization failed
    #[error("Factor linearization failed: {0}")]
    FactorLinearization(String),

    /// Symbolic structure construction failed
    #[error("Symbolic structure error: {0}")]
    SymbolicStructure(String),

    /// Dimension mismatch between residual/Jacobian/variables
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| CoreError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the source error from a third-party library
    ///
    /// # Example
    /// ```ignore
    /// SymbolicSparseColMat::try_new_from_indices(rows, cols, &indices)
    ///     .map_err(|e| {
    ///         CoreError::SymbolicStructure("Failed to build sparse structure".to_string())
    ///             .log_with_source(e)
    ///     })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for core module operations
pub type CoreResult<T> = Result<T, CoreError>;
