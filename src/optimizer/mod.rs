//! Nonlinear least-squares solvers over an [`AccumulatedProblem`].
//!
//! A [`Solver`] does two jobs for the estimator: drive the problem to a local minimum
//! ([`Solver::optimize`]) and produce the rank-revealing factorization of the marginalized
//! block at that minimum ([`Solver::rank_revealing_factor`]).

use crate::core::problem::AccumulatedProblem;
use crate::error::CalibrationResult;
use crate::linalg::{
    self, LinearSolverType,
    marginal::{MarginalizationParams, RankRevealingFactor, factor_marginal_block},
};
use faer::{Mat, sparse::SparseColMat};
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use thiserror::Error;
use tracing::error;
use web_time as time;

pub mod gauss_newton;

pub use gauss_newton::GaussNewton;

/// Failures that abort an optimization run.
///
/// Running out of iterations or failing to decrease the cost are not errors; they are
/// reported through [`OptimizationStatus`].
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// The normal equations produced a step with NaN or Inf entries
    #[error("Non-finite step at iteration {iteration}")]
    NonFiniteStep { iteration: usize },

    /// Linear algebra operation failed
    #[error("Linear algebra error: {0}")]
    LinAlg(#[from] linalg::LinAlgError),
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| OptimizerError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Counters and norms from the last iteration of a run.
#[derive(Debug, Clone)]
pub struct ConvergenceInfo {
    /// `||J^T r||` at the last linearization
    pub final_gradient_norm: f64,
    /// Norm of the last accepted step, 0 if it was rejected
    pub final_parameter_update_norm: f64,
    /// Residual evaluations, including those of halved trial steps
    pub cost_evaluations: usize,
    pub jacobian_evaluations: usize,
}

impl Display for ConvergenceInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "|g| {:.2e}, |dx| {:.2e}, {} residual / {} Jacobian evaluations",
            self.final_gradient_norm,
            self.final_parameter_update_norm,
            self.cost_evaluations,
            self.jacobian_evaluations
        )
    }
}

/// Status of an optimization process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizationStatus {
    /// Nothing to optimize, or the initial point is already stationary
    Converged,
    /// Maximum number of iterations reached
    MaxIterationsReached,
    /// Cost function tolerance reached
    CostToleranceReached,
    /// Parameter tolerance reached
    ParameterToleranceReached,
    /// Gradient tolerance reached
    GradientToleranceReached,
    /// No step along the Gauss-Newton direction decreased the cost
    TrustRegionRadiusTooSmall,
    /// NaN or Inf detected in cost or gradient
    InvalidNumericalValues,
    /// The normal equations stayed singular under the largest damping tried
    SingularSystem,
}

impl OptimizationStatus {
    /// Whether a convergence criterion (rather than a limit or a failure) ended the run.
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            OptimizationStatus::Converged
                | OptimizationStatus::CostToleranceReached
                | OptimizationStatus::ParameterToleranceReached
                | OptimizationStatus::GradientToleranceReached
        )
    }
}

impl Display for OptimizationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::Converged => write!(f, "Converged"),
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizationStatus::CostToleranceReached => write!(f, "Cost tolerance reached"),
            OptimizationStatus::ParameterToleranceReached => {
                write!(f, "Parameter tolerance reached")
            }
            OptimizationStatus::GradientToleranceReached => write!(f, "Gradient tolerance reached"),
            OptimizationStatus::TrustRegionRadiusTooSmall => {
                write!(f, "Trust region radius too small")
            }
            OptimizationStatus::InvalidNumericalValues => {
                write!(f, "Invalid numerical values (NaN/Inf) detected")
            }
            OptimizationStatus::SingularSystem => {
                write!(f, "Normal equations singular despite damping")
            }
        }
    }
}

/// Result of a solver execution. Optimized values are written back into the problem.
#[derive(Debug, Clone)]
pub struct SolverResult {
    /// Final optimization status
    pub status: OptimizationStatus,
    /// Initial cost value
    pub initial_cost: f64,
    /// Final cost value
    pub final_cost: f64,
    /// Number of iterations performed
    pub iterations: usize,
    /// Total time elapsed
    pub elapsed_time: time::Duration,
    /// Convergence statistics
    pub convergence_info: Option<ConvergenceInfo>,
}

impl SolverResult {
    /// Result for a problem without columns or residuals.
    pub fn trivial(cost: f64, elapsed_time: time::Duration) -> Self {
        Self {
            status: OptimizationStatus::Converged,
            initial_cost: cost,
            final_cost: cost,
            iterations: 0,
            elapsed_time,
            convergence_info: None,
        }
    }
}

/// Settings the estimator pushes into its solver before every run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverSettings {
    pub max_iterations: usize,
    /// Gradient and relative step tolerance
    pub norm_tol: f64,
    pub linear_solver: LinearSolverType,
    pub min_diagonal: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            norm_tol: 1e-8,
            linear_solver: LinearSolverType::default(),
            min_diagonal: 1e-10,
        }
    }
}

/// Core trait for the nonlinear solver behind an estimator.
pub trait Solver {
    /// Apply iteration limits and linear solver selection.
    fn configure(&mut self, settings: &SolverSettings);

    /// Minimize the problem's cost in place.
    ///
    /// Hitting the iteration limit is reported through [`SolverResult::status`], not as an error.
    fn optimize(&mut self, problem: &mut AccumulatedProblem) -> CalibrationResult<SolverResult>;

    /// Linearize at the current values and factor the trailing column block given by the
    /// problem's layout. Returns the full sparse Jacobian alongside the factor.
    fn rank_revealing_factor(
        &mut self,
        problem: &AccumulatedProblem,
        params: &MarginalizationParams,
    ) -> CalibrationResult<(SparseColMat<usize, f64>, RankRevealingFactor)> {
        let (_, jacobian) = problem.linearize()?;
        let factor = factor_marginal_block(&jacobian, problem.layout().marginal_start(), params)?;
        Ok((jacobian, factor))
    }
}

pub fn compute_cost(residual: &Mat<f64>) -> f64 {
    let cost = residual.norm_l2();
    0.5 * cost * cost
}
