//! Error terms: factors wired to the named design variables they constrain.
//!
//! An `ErrorTerm` is owned by the batch that introduced it. It holds the factor that computes
//! the residual `r(x)` and Jacobian `J = ∂r/∂x`, plus the ordered list of variable names whose
//! values are passed to the factor. Row placement inside the stacked Jacobian is decided by
//! the accumulated problem's column layout, not by the error term.
//!
//! # Example
//!
//! ```
//! use incremental_calibration::core::error_term::ErrorTerm;
//! use incremental_calibration::factors::PriorFactor;
//! use nalgebra::dvector;
//!
//! let term = ErrorTerm::new(&["x0"], Box::new(PriorFactor::new(dvector![0.0, 0.0])));
//! assert_eq!(term.get_dimension(), 2);
//! assert_eq!(term.variable_key_list, vec!["x0".to_string()]);
//! ```

use nalgebra::{DMatrix, DVector};

use crate::core::{CoreError, CoreResult};
use crate::factors::Factor;

/// A residual function over one or more design variables.
pub struct ErrorTerm {
    /// Names of the variables passed to the factor, in factor argument order
    pub variable_key_list: Vec<String>,

    /// The factor that computes residuals and Jacobians
    pub factor: Box<dyn Factor>,
}

impl ErrorTerm {
    pub fn new(variable_keys: &[&str], factor: Box<dyn Factor>) -> Self {
        Self {
            variable_key_list: variable_keys.iter().map(|s| s.to_string()).collect(),
            factor,
        }
    }

    /// Residual dimension of the wrapped factor.
    pub fn get_dimension(&self) -> usize {
        self.factor.get_dimension()
    }

    /// Check the sizes of the connected variables against what the factor accepts.
    pub fn check_variable_sizes(&self, sizes: &[usize]) -> CoreResult<()> {
        let arity_matches = sizes.len() == self.variable_key_list.len();
        let sizes_match = self
            .factor
            .variable_sizes()
            .is_none_or(|expected| expected.as_slice() == sizes);
        if !arity_matches || !sizes_match {
            return Err(CoreError::DimensionMismatch(format!(
                "Error term over {:?} cannot take variables of sizes {:?}",
                self.variable_key_list, sizes
            ))
            .log());
        }
        Ok(())
    }

    /// Evaluate the residual only.
    pub fn residual(&self, params: &[DVector<f64>]) -> CoreResult<DVector<f64>> {
        self.check_params(params)?;
        let (residual, _) = self.factor.linearize(params, false);
        self.check_residual(&residual)?;
        Ok(residual)
    }

    /// Evaluate residual and Jacobian, checking both against the declared shapes.
    ///
    /// The Jacobian has one row per residual entry and one column per degree of freedom of
    /// the connected variables, stacked in `variable_key_list` order.
    pub fn residual_and_jacobian(
        &self,
        params: &[DVector<f64>],
    ) -> CoreResult<(DVector<f64>, DMatrix<f64>)> {
        self.check_params(params)?;
        let (residual, jacobian) = self.factor.linearize(params, true);
        self.check_residual(&residual)?;

        let jacobian = jacobian.ok_or_else(|| {
            CoreError::FactorLinearization(
                "Factor returned None for Jacobian when compute_jacobian=true".to_string(),
            )
            .log()
        })?;

        let total_dof: usize = params.iter().map(|p| p.len()).sum();
        if jacobian.nrows() != residual.len() || jacobian.ncols() != total_dof {
            return Err(CoreError::DimensionMismatch(format!(
                "Jacobian of error term over {:?} is {}x{}, expected {}x{}",
                self.variable_key_list,
                jacobian.nrows(),
                jacobian.ncols(),
                residual.len(),
                total_dof
            ))
            .log());
        }

        Ok((residual, jacobian))
    }

    fn check_params(&self, params: &[DVector<f64>]) -> CoreResult<()> {
        let sizes: Vec<usize> = params.iter().map(|p| p.len()).collect();
        self.check_variable_sizes(&sizes)
    }

    fn check_residual(&self, residual: &DVector<f64>) -> CoreResult<()> {
        if residual.len() != self.get_dimension() {
            return Err(CoreError::DimensionMismatch(format!(
                "Error term over {:?} produced {} residuals, declared {}",
                self.variable_key_list,
                residual.len(),
                self.get_dimension()
            ))
            .log());
        }
        Ok(())
    }
}

impl std::fmt::Debug for ErrorTerm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorTerm")
            .field("variable_key_list", &self.variable_key_list)
            .field("dimension", &self.get_dimension())
            .finish()
    }
}
