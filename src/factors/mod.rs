//! Measurement models that produce error terms.
//!
//! Factors compute a residual vector and its Jacobian with respect to the connected design
//! variables. The estimator never inspects a factor beyond this interface, so measurement models
//! for a concrete sensor setup live outside the crate and implement [`Factor`] themselves.
//!
//! ```text
//! minimize Σ_i ||r_i(x)||²
//! ```
//!
//! The factors shipped here are Euclidean and weighted by an optional square-root information
//! matrix `S` (so the squared residual is a Mahalanobis distance):
//!
//! - [`PriorFactor`]: `r = S (x - z)`
//! - [`BetweenFactor`]: `r = S ((x_j - x_i) - z)`
//! - [`LinearFactor`]: `r = S (Σ_k A_k x_k - b)`

use nalgebra::{DMatrix, DVector};
use thiserror::Error;
use tracing::error;

pub mod between_factor;
pub mod linear_factor;
pub mod prior_factor;

pub use between_factor::BetweenFactor;
pub use linear_factor::LinearFactor;
pub use prior_factor::PriorFactor;

/// Factor-specific error types
#[derive(Debug, Clone, Error)]
pub enum FactorError {
    /// Invalid dimension mismatch between expected and actual
    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    /// Invalid parameter values
    #[error("Invalid parameter values: {0}")]
    InvalidParameters(String),
}

impl FactorError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error for debugging context
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for factor operations
pub type FactorResult<T> = Result<T, FactorError>;

/// Trait for measurement models.
///
/// Factors must be `Send + Sync`: error terms are linearized in parallel and batches are shared
/// between the caller and the accumulated problem.
///
/// # Example
///
/// ```
/// use incremental_calibration::factors::Factor;
/// use nalgebra::{DMatrix, DVector};
///
/// // Odometry displacement observed through an unknown scale: r = s * (p1 - p0) - z
/// struct ScaledDisplacement {
///     measurement: f64,
/// }
///
/// impl Factor for ScaledDisplacement {
///     fn linearize(
///         &self,
///         params: &[DVector<f64>],
///         compute_jacobian: bool,
///     ) -> (DVector<f64>, Option<DMatrix<f64>>) {
///         let (p0, p1, s) = (params[0][0], params[1][0], params[2][0]);
///         let residual = DVector::from_vec(vec![s * (p1 - p0) - self.measurement]);
///         let jacobian = compute_jacobian
///             .then(|| DMatrix::from_row_slice(1, 3, &[-s, s, p1 - p0]));
///         (residual, jacobian)
///     }
///
///     fn get_dimension(&self) -> usize {
///         1
///     }
/// }
/// ```
pub trait Factor: Send + Sync {
    /// Compute the residual and Jacobian at the given parameter values.
    ///
    /// * `params` - one vector per connected variable, in error-term key order
    /// * `compute_jacobian` - whether to compute the Jacobian matrix
    ///
    /// Returns `(residual, jacobian)` with `residual` of length [`Factor::get_dimension`] and
    /// `jacobian` of size `dimension × Σ params[i].len()`.
    fn linearize(
        &self,
        params: &[DVector<f64>],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>);

    /// Dimension of the residual vector.
    fn get_dimension(&self) -> usize;

    /// Sizes of the variables the factor accepts, when they are fixed.
    ///
    /// Used to reject mis-wired error terms when a batch is appended instead of failing inside
    /// the solver. `None` skips the check.
    fn variable_sizes(&self) -> Option<Vec<usize>> {
        None
    }
}

/// Validate an optional square-root information matrix against a residual dimension.
pub(crate) fn check_sqrt_information(
    sqrt_information: &DMatrix<f64>,
    dimension: usize,
) -> FactorResult<()> {
    if sqrt_information.nrows() != dimension {
        return Err(FactorError::InvalidDimension {
            expected: dimension,
            actual: sqrt_information.nrows(),
        }
        .log());
    }
    if sqrt_information.ncols() != dimension {
        return Err(FactorError::InvalidDimension {
            expected: dimension,
            actual: sqrt_information.ncols(),
        }
        .log());
    }
    if sqrt_information.iter().any(|v| !v.is_finite()) {
        return Err(FactorError::InvalidParameters(
            "Square-root information contains non-finite entries".to_string(),
        )
        .log());
    }
    Ok(())
}
