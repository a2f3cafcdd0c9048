//! Linear measurement factor over any number of variables.

use super::{Factor, FactorError, FactorResult, check_sqrt_information};
use nalgebra::{DMatrix, DVector};

/// Linear measurement model `b = Σ_k A_k x_k + noise`.
///
/// ```text
/// r = S (Σ_k A_k x_k - b)
/// J = S [ A_0 | A_1 | ... ]
/// ```
///
/// Useful for calibration models that are linear in the unknowns, e.g. a sensor reading that
/// observes a state through a fixed gain plus an unknown additive offset.
///
/// # Example
///
/// ```
/// use incremental_calibration::factors::{Factor, LinearFactor};
/// use nalgebra::{dmatrix, dvector};
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
///
/// // reading = 2 * state + offset
/// let factor = LinearFactor::new(vec![dmatrix![2.0], dmatrix![1.0]], dvector![5.0])?;
/// let (residual, _) = factor.linearize(&[dvector![2.0], dvector![1.0]], false);
/// assert!(residual[0].abs() < 1e-12);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LinearFactor {
    /// One coefficient block per connected variable
    pub blocks: Vec<DMatrix<f64>>,
    /// Measurement vector
    pub measurement: DVector<f64>,
    /// Square-root information; `None` means unit weight
    pub sqrt_information: Option<DMatrix<f64>>,
}

impl LinearFactor {
    pub fn new(blocks: Vec<DMatrix<f64>>, measurement: DVector<f64>) -> FactorResult<Self> {
        if blocks.is_empty() {
            return Err(FactorError::InvalidParameters(
                "Linear factor needs at least one coefficient block".to_string(),
            )
            .log());
        }
        for block in &blocks {
            if block.nrows() != measurement.len() {
                return Err(FactorError::InvalidDimension {
                    expected: measurement.len(),
                    actual: block.nrows(),
                }
                .log());
            }
        }
        Ok(Self {
            blocks,
            measurement,
            sqrt_information: None,
        })
    }

    pub fn with_sqrt_information(mut self, sqrt_information: DMatrix<f64>) -> FactorResult<Self> {
        check_sqrt_information(&sqrt_information, self.measurement.len())?;
        self.sqrt_information = Some(sqrt_information);
        Ok(self)
    }

    /// Isotropic weighting: `S = weight · I`.
    pub fn with_weight(self, weight: f64) -> FactorResult<Self> {
        let n = self.measurement.len();
        self.with_sqrt_information(DMatrix::identity(n, n) * weight)
    }
}

impl Factor for LinearFactor {
    fn linearize(
        &self,
        params: &[DVector<f64>],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let mut prediction = -&self.measurement;
        for (block, x) in self.blocks.iter().zip(params) {
            prediction += block * x;
        }

        let jacobian = compute_jacobian.then(|| {
            let total: usize = self.blocks.iter().map(|b| b.ncols()).sum();
            let mut jac = DMatrix::zeros(self.measurement.len(), total);
            let mut col = 0;
            for block in &self.blocks {
                jac.view_mut((0, col), block.shape()).copy_from(block);
                col += block.ncols();
            }
            jac
        });

        match &self.sqrt_information {
            Some(s) => (s * prediction, jacobian.map(|j| s * j)),
            None => (prediction, jacobian),
        }
    }

    fn get_dimension(&self) -> usize {
        self.measurement.len()
    }

    fn variable_sizes(&self) -> Option<Vec<usize>> {
        Some(self.blocks.iter().map(|b| b.ncols()).collect())
    }
}
