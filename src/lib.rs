//! # Incremental Calibration
//!
//! Incremental nonlinear least-squares calibration with information-gated batch admission.
//!
//! Measurements arrive in batches. Each batch is tentatively added to the accumulated problem,
//! the problem is re-optimized with a trust-region Gauss-Newton solver, and the marginalized
//! group of design variables (the calibration parameters) is factored with a rank-revealing
//! decomposition. The batch is kept only if the mutual information it adds about that group
//! clears a threshold; otherwise the problem is restored exactly to its previous state.
//!
//! ## Modules
//!
//! - [`core`]: design variables, error terms, batches and the accumulated problem
//! - [`factors`]: measurement models (prior, between, linear)
//! - [`linalg`]: sparse Cholesky/QR solvers and the marginal-block factorization
//! - [`optimizer`]: the [`Solver`] trait and trust-region [`GaussNewton`]
//! - [`estimator`]: the [`IncrementalEstimator`], its [`Options`] and [`ReturnValue`]

pub mod core;
pub mod error;
pub mod estimator;
pub mod factors;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod optimizer;

pub use core::{
    batch::{Batch, BatchHandle},
    error_term::ErrorTerm,
    problem::AccumulatedProblem,
    variable::DesignVariable,
};
pub use error::{CalibrationError, CalibrationResult};
pub use estimator::{EstimatorConfig, IncrementalEstimator, Options, ReturnValue};
pub use factors::{BetweenFactor, Factor, LinearFactor, PriorFactor};
pub use linalg::{LinearSolverType, SparseCholeskySolver, SparseLinearSolver, SparseQRSolver};
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_for, init_logger_with_level};
pub use optimizer::{GaussNewton, Solver};
