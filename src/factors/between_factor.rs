//! Between factor for relative constraints between two variables.

use super::{Factor, FactorResult, check_sqrt_information};
use nalgebra::{DMatrix, DVector};

/// Relative measurement between two variables of equal size.
///
/// ```text
/// r = S ((x_j - x_i) - z)
/// J = [ -S | S ]
/// ```
///
/// Typical uses are odometry increments between consecutive states, or an offset between a
/// sensor reading and the state it observes.
///
/// # Example
///
/// ```
/// use incremental_calibration::factors::{BetweenFactor, Factor};
/// use nalgebra::dvector;
///
/// let between = BetweenFactor::new(dvector![1.0, 0.0]);
/// let (residual, jacobian) = between.linearize(&[dvector![0.0, 0.0], dvector![1.2, 0.1]], true);
///
/// assert!((residual[0] - 0.2).abs() < 1e-10);
/// assert!((residual[1] - 0.1).abs() < 1e-10);
/// assert_eq!(jacobian.map(|j| j.shape()), Some((2, 4)));
/// ```
#[derive(Debug, Clone)]
pub struct BetweenFactor {
    /// Measured difference `x_j - x_i`
    pub measurement: DVector<f64>,
    /// Square-root information; `None` means unit weight
    pub sqrt_information: Option<DMatrix<f64>>,
}

impl BetweenFactor {
    pub fn new(measurement: DVector<f64>) -> Self {
        Self {
            measurement,
            sqrt_information: None,
        }
    }

    /// Isotropic weighting: `S = weight · I`.
    pub fn with_weight(measurement: DVector<f64>, weight: f64) -> Self {
        let n = measurement.len();
        Self {
            measurement,
            sqrt_information: Some(DMatrix::identity(n, n) * weight),
        }
    }

    pub fn with_sqrt_information(
        measurement: DVector<f64>,
        sqrt_information: DMatrix<f64>,
    ) -> FactorResult<Self> {
        check_sqrt_information(&sqrt_information, measurement.len())?;
        Ok(Self {
            measurement,
            sqrt_information: Some(sqrt_information),
        })
    }
}

impl Factor for BetweenFactor {
    fn linearize(
        &self,
        params: &[DVector<f64>],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let n = self.measurement.len();
        let error = &params[1] - &params[0] - &self.measurement;
        let weight = self
            .sqrt_information
            .clone()
            .unwrap_or_else(|| DMatrix::identity(n, n));

        let jacobian = compute_jacobian.then(|| {
            let mut jac = DMatrix::zeros(n, 2 * n);
            jac.view_mut((0, 0), (n, n)).copy_from(&(-&weight));
            jac.view_mut((0, n), (n, n)).copy_from(&weight);
            jac
        });

        (&weight * error, jacobian)
    }

    fn get_dimension(&self) -> usize {
        self.measurement.len()
    }

    fn variable_sizes(&self) -> Option<Vec<usize>> {
        let n = self.measurement.len();
        Some(vec![n, n])
    }
}
