//! Prior factor for unary constraints on variables.

use super::{Factor, FactorResult, check_sqrt_information};
use nalgebra::{DMatrix, DVector};

/// Prior factor (unary constraint) on a single variable.
///
/// Represents a direct measurement of, or prior belief about, a variable's value:
///
/// ```text
/// r = S (x - x_prior)
/// ```
///
/// The Jacobian is `S` (the identity when no weighting is given).
///
/// # Example
///
/// ```
/// use incremental_calibration::factors::{Factor, PriorFactor};
/// use nalgebra::dvector;
///
/// let prior = PriorFactor::with_weight(dvector![1.0, 2.0], 10.0);
/// let (residual, jacobian) = prior.linearize(&[dvector![1.5, 2.3]], true);
///
/// assert!((residual[0] - 5.0).abs() < 1e-10);
/// assert!((residual[1] - 3.0).abs() < 1e-10);
/// if let Some(jac) = jacobian {
///     assert_eq!(jac[(0, 0)], 10.0);
///     assert_eq!(jac[(0, 1)], 0.0);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct PriorFactor {
    /// The prior value (measurement or known value)
    pub data: DVector<f64>,
    /// Square-root information; `None` means unit weight
    pub sqrt_information: Option<DMatrix<f64>>,
}

impl PriorFactor {
    pub fn new(data: DVector<f64>) -> Self {
        Self {
            data,
            sqrt_information: None,
        }
    }

    /// Isotropic weighting: `S = weight · I`.
    pub fn with_weight(data: DVector<f64>, weight: f64) -> Self {
        let n = data.len();
        Self {
            data,
            sqrt_information: Some(DMatrix::identity(n, n) * weight),
        }
    }

    pub fn with_sqrt_information(
        data: DVector<f64>,
        sqrt_information: DMatrix<f64>,
    ) -> FactorResult<Self> {
        check_sqrt_information(&sqrt_information, data.len())?;
        Ok(Self {
            data,
            sqrt_information: Some(sqrt_information),
        })
    }
}

impl Factor for PriorFactor {
    fn linearize(
        &self,
        params: &[DVector<f64>],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let error = &params[0] - &self.data;
        match &self.sqrt_information {
            Some(s) => (s * error, compute_jacobian.then(|| s.clone())),
            None => {
                let n = error.nrows();
                (
                    error,
                    compute_jacobian.then(|| DMatrix::<f64>::identity(n, n)),
                )
            }
        }
    }

    fn get_dimension(&self) -> usize {
        self.data.len()
    }

    fn variable_sizes(&self) -> Option<Vec<usize>> {
        Some(vec![self.data.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{dmatrix, dvector};

    #[test]
    fn test_unweighted_prior() {
        let prior = PriorFactor::new(dvector![1.0, 2.0]);
        let (residual, jacobian) = prior.linearize(&[dvector![1.5, 2.3]], true);

        assert!((residual[0] - 0.5).abs() < 1e-10);
        assert!((residual[1] - 0.3).abs() < 1e-10);
        assert_eq!(jacobian, Some(DMatrix::identity(2, 2)));
    }

    #[test]
    fn test_full_sqrt_information() -> Result<(), Box<dyn std::error::Error>> {
        let s = dmatrix![2.0, 1.0; 0.0, 3.0];
        let prior = PriorFactor::with_sqrt_information(dvector![0.0, 0.0], s.clone())?;
        let (residual, jacobian) = prior.linearize(&[dvector![1.0, 1.0]], true);

        assert_eq!(residual, dvector![3.0, 3.0]);
        assert_eq!(jacobian, Some(s));
        Ok(())
    }

    #[test]
    fn test_residual_only_skips_jacobian() {
        let prior = PriorFactor::with_weight(dvector![0.0], 2.0);
        let (residual, jacobian) = prior.linearize(&[dvector![1.0]], false);
        assert_eq!(residual, dvector![2.0]);
        assert!(jacobian.is_none());
    }

    #[test]
    fn test_rejects_wrong_information_size() {
        let result = PriorFactor::with_sqrt_information(dvector![0.0, 0.0], DMatrix::identity(3, 3));
        assert!(result.is_err());
    }
}
