//! Top-level error and result types.
//!
//! Every module owns its own `thiserror` enum; [`CalibrationError`] wraps them transparently so
//! public operations can return one type while `source()` still reaches the original cause.
//!
//! ```text
//! CalibrationError::Optimizer(
//!     OptimizerError::LinAlg(LinAlgError::SingularMatrix)
//! )
//! ```

use crate::{
    core::CoreError, estimator::EstimatorError, factors::FactorError, linalg::LinAlgError,
    optimizer::OptimizerError,
};
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the crate
pub type CalibrationResult<T> = Result<T, CalibrationError>;

#[derive(Debug, Error)]
pub enum CalibrationError {
    /// Problem construction and bookkeeping errors (variables, error terms, batches)
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Measurement model errors
    #[error(transparent)]
    Factor(#[from] FactorError),

    /// Linear algebra errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    /// Optimization algorithm errors
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    /// Invalid arguments to the estimator
    #[error(transparent)]
    Estimator(#[from] EstimatorError),
}

impl CalibrationError {
    /// Full error chain, one cause per line.
    ///
    /// ```rust,ignore
    /// if let Err(e) = estimator.add_batch(batch, false) {
    ///     warn!("Full chain: {}", e.chain());
    /// }
    /// ```
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Single-line variant of [`CalibrationError::chain`].
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CalibrationError::from(LinAlgError::SingularMatrix);
        assert!(error.to_string().contains("Singular matrix"));
    }

    #[test]
    fn test_nested_chain() {
        let error = CalibrationError::from(OptimizerError::from(LinAlgError::FactorizationFailed(
            "Cholesky factorization failed".to_string(),
        )));

        let chain = error.chain();
        assert!(chain.contains("Linear algebra error"));
        assert!(chain.contains("Cholesky"));
        assert!(error.chain_compact().contains(" → "));
    }

    #[test]
    fn test_transparent_error_conversion() {
        let estimator_error = EstimatorError::BatchIndexOutOfRange {
            index: 3,
            num_batches: 1,
        };
        let error: CalibrationError = estimator_error.into();
        assert!(matches!(error, CalibrationError::Estimator(_)));
        assert!(error.chain_compact().contains("3"));
    }

    #[test]
    fn test_core_error_conversion() {
        let result: CalibrationResult<()> =
            Err(CoreError::UnknownVariable("x42".to_string()).into());
        let Err(error) = result else {
            panic!("Expected an error");
        };
        assert!(matches!(error, CalibrationError::Core(_)));
        assert!(error.to_string().contains("x42"));
    }
}
