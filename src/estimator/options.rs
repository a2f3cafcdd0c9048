//! Estimator options and the configuration shape accepted by
//! [`IncrementalEstimator::from_config`](super::IncrementalEstimator::from_config).

use serde::{Deserialize, Serialize};

use crate::linalg::{LinearSolverType, marginal::MarginalizationParams};
use crate::optimizer::SolverSettings;

/// Policy thresholds of an estimator.
///
/// Missing fields in a deserialized document fall back to the defaults:
///
/// ```
/// use incremental_calibration::estimator::Options;
///
/// let options: Options = serde_json::from_str(r#"{ "mi_tol": 0.1 }"#).unwrap();
/// assert_eq!(options.mi_tol, 0.1);
/// assert_eq!(options.max_iterations, 20);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Minimum mutual information (nats) for a batch to be kept
    pub mi_tol: f64,
    /// QR rank tolerance; `<= 0` switches to the adaptive tolerance
    pub qr_tol: f64,
    /// Report every decision at INFO instead of DEBUG
    pub verbose: bool,
    /// Normalize marginal Jacobian columns before the rank-revealing QR
    pub col_norm: bool,
    pub max_iterations: usize,
    /// Solver convergence tolerance (gradient and relative step)
    pub norm_tol: f64,
    /// Relative singular value threshold for the marginal rank
    pub eps_tol_svd: f64,
    pub linear_solver: LinearSolverType,
    /// Tikhonov term for the normal equations and the Schur elimination, relative to the
    /// largest diagonal entry of the system
    pub min_diagonal: f64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            mi_tol: 0.5,
            qr_tol: 0.02,
            verbose: true,
            col_norm: true,
            max_iterations: 20,
            norm_tol: 1e-8,
            eps_tol_svd: 1e-4,
            linear_solver: LinearSolverType::SparseCholesky,
            min_diagonal: 1e-10,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mi_tol(mut self, mi_tol: f64) -> Self {
        self.mi_tol = mi_tol;
        self
    }

    pub fn with_qr_tol(mut self, qr_tol: f64) -> Self {
        self.qr_tol = qr_tol;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_col_norm(mut self, col_norm: bool) -> Self {
        self.col_norm = col_norm;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_norm_tol(mut self, norm_tol: f64) -> Self {
        self.norm_tol = norm_tol;
        self
    }

    pub fn with_eps_tol_svd(mut self, eps_tol_svd: f64) -> Self {
        self.eps_tol_svd = eps_tol_svd;
        self
    }

    pub fn with_linear_solver(mut self, linear_solver: LinearSolverType) -> Self {
        self.linear_solver = linear_solver;
        self
    }

    pub fn with_min_diagonal(mut self, min_diagonal: f64) -> Self {
        self.min_diagonal = min_diagonal;
        self
    }
}

impl From<&Options> for MarginalizationParams {
    fn from(options: &Options) -> Self {
        Self {
            qr_tol: options.qr_tol,
            col_norm: options.col_norm,
            norm_tol: options.norm_tol,
            eps_tol_svd: options.eps_tol_svd,
            min_diagonal: options.min_diagonal,
            linear_solver: options.linear_solver,
        }
    }
}

impl From<&Options> for SolverSettings {
    fn from(options: &Options) -> Self {
        Self {
            max_iterations: options.max_iterations,
            norm_tol: options.norm_tol,
            linear_solver: options.linear_solver,
            min_diagonal: options.min_diagonal,
        }
    }
}

/// External configuration source for an estimator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Group whose marginal statistics are tracked
    pub marg_group_id: usize,
    #[serde(default)]
    pub options: Options,
}
