//! Trust-region Gauss-Newton optimization.
//!
//! Each iteration solves the regularized normal equations
//!
//! ```text
//! (J^T·J + μI)·h = -J^T·r
//! ```
//!
//! and then tries the step. The shift `μ` is `min_diagonal` times the largest diagonal entry of
//! `J^T·J` (at least 1). When the factorization still reports a singular system, `μ` grows by
//! [`linalg::DAMPING_GROWTH`] for up to [`linalg::MAX_DAMPING_ATTEMPTS`] attempts before the run
//! stops with [`OptimizationStatus::SingularSystem`].
//!
//! A step that does not decrease the cost is undone and halved, which
//! shrinks the trust region along the Gauss-Newton direction; after `max_step_halvings` failed
//! attempts the run stops with [`OptimizationStatus::TrustRegionRadiusTooSmall`].
//!
//! The run terminates when any of these holds:
//!
//! - **Gradient**: `||J^T·r|| < gradient_tolerance`
//! - **Parameter change**: `||h|| ≤ parameter_tolerance · (||x|| + parameter_tolerance)`
//! - **Cost change**: `|ΔF| / F < cost_tolerance`
//! - **Iterations**: `iteration ≥ max_iterations`
//!
//! None of these is an error. Only failures of the linear algebra or of an error term surface
//! through the `Err` channel.
//!
//! # Example
//!
//! ```
//! use incremental_calibration::core::{batch::Batch, error_term::ErrorTerm, problem::AccumulatedProblem};
//! use incremental_calibration::core::variable::DesignVariable;
//! use incremental_calibration::factors::PriorFactor;
//! use incremental_calibration::optimizer::{GaussNewton, Solver};
//! use nalgebra::dvector;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//!
//! let batch = Batch::new()
//!     .with_design_variable(DesignVariable::new("x", 0, dvector![0.0, 0.0]))
//!     .with_error_term(ErrorTerm::new(&["x"], Box::new(PriorFactor::new(dvector![1.0, 2.0]))));
//! let mut problem = AccumulatedProblem::new();
//! problem.append(batch.into_handle())?;
//!
//! let result = GaussNewton::new().optimize(&mut problem)?;
//! assert!(result.final_cost < 1e-12);
//! # Ok(())
//! # }
//! ```

use crate::{
    core::problem::AccumulatedProblem,
    error::CalibrationResult,
    linalg::{self, LinAlgError, LinAlgResult},
    optimizer::{
        self, ConvergenceInfo, OptimizationStatus, OptimizerError, Solver, SolverResult,
        SolverSettings,
    },
};

use faer::{Mat, sparse::SparseColMat};
use std::{fmt, ops::Mul};
use tracing::{debug, warn};
use web_time as time;

/// Per-iteration statistics for detailed logging (Ceres-style output).
#[derive(Debug, Clone)]
pub struct IterationStats {
    /// Iteration number (0-indexed)
    pub iteration: usize,
    /// Cost after this iteration
    pub cost: f64,
    /// Change in cost from the previous iteration
    pub cost_change: f64,
    /// L2 norm of the gradient (||J^T·r||)
    pub gradient_norm: f64,
    /// L2 norm of the applied step (||Δx||)
    pub step_norm: f64,
    /// How many times the step was halved before it was accepted
    pub step_halvings: usize,
    /// Time taken for this iteration in milliseconds
    pub iter_time_ms: f64,
    /// Total elapsed time since optimization started in milliseconds
    pub total_time_ms: f64,
    /// Whether the step was accepted
    pub accepted: bool,
}

impl IterationStats {
    /// Print table header in Ceres-style format
    pub fn print_header() {
        debug!(
            "{:>4}  {:>13}  {:>13}  {:>13}  {:>13}  {:>8}  {:>11}  {:>13}  {:>6}",
            "iter",
            "cost",
            "cost_change",
            "|gradient|",
            "|step|",
            "halvings",
            "iter_time",
            "total_time",
            "status"
        );
    }

    pub fn print_line(&self) {
        let status = if self.accepted { "✓" } else { "✗" };

        debug!(
            "{:>4}  {:>13.6e}  {:>13.2e}  {:>13.2e}  {:>13.2e}  {:>8}  {:>9.2}ms  {:>11.2}ms  {:>6}",
            self.iteration,
            self.cost,
            self.cost_change,
            self.gradient_norm,
            self.step_norm,
            self.step_halvings,
            self.iter_time_ms,
            self.total_time_ms,
            status
        );
    }
}

/// Summary printed at debug level when a run ends.
#[derive(Debug, Clone)]
pub struct GaussNewtonSummary {
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    pub final_gradient_norm: f64,
    pub total_time: time::Duration,
    pub convergence_status: OptimizationStatus,
}

impl fmt::Display for GaussNewtonSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Gauss-Newton Final Result")?;
        if self.convergence_status.is_converged() {
            writeln!(f, "CONVERGED ({:?})", self.convergence_status)?;
        } else {
            writeln!(f, "STOPPED ({:?})", self.convergence_status)?;
        }
        writeln!(f, "Cost:")?;
        writeln!(f, "  Initial:   {:.6e}", self.initial_cost)?;
        writeln!(f, "  Final:     {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "  Reduction: {:.6e} ({:.2}%)",
            self.initial_cost - self.final_cost,
            100.0 * (self.initial_cost - self.final_cost) / self.initial_cost.max(1e-12)
        )?;
        writeln!(f, "Iterations:    {}", self.iterations)?;
        writeln!(f, "Final |g|:     {:.2e}", self.final_gradient_norm)?;
        write!(
            f,
            "Total time:    {:.2}ms",
            self.total_time.as_secs_f64() * 1000.0
        )
    }
}

/// Configuration parameters for the Gauss-Newton optimizer.
///
/// ```
/// use incremental_calibration::optimizer::gauss_newton::GaussNewtonConfig;
/// use incremental_calibration::linalg::LinearSolverType;
///
/// let config = GaussNewtonConfig::new()
///     .with_max_iterations(50)
///     .with_cost_tolerance(1e-12)
///     .with_linear_solver_type(LinearSolverType::SparseQR);
/// ```
#[derive(Debug, Clone)]
pub struct GaussNewtonConfig {
    /// Type of linear solver for the linear systems
    pub linear_solver_type: linalg::LinearSolverType,
    /// Maximum number of iterations
    pub max_iterations: usize,
    /// Convergence tolerance for the relative cost change
    pub cost_tolerance: f64,
    /// Convergence tolerance for parameter updates
    pub parameter_tolerance: f64,
    /// Convergence tolerance for gradient norm
    pub gradient_tolerance: f64,
    /// Failed step attempts tolerated per iteration
    pub max_step_halvings: usize,
    /// Use Jacobi column scaling (preconditioning)
    ///
    /// Scales column `j` by `1 / (1 + ||J_j||)` before the solve and maps the step back.
    pub use_jacobi_scaling: bool,
    /// Diagonal regularization keeping `J^T·J` positive definite, relative to its largest
    /// diagonal entry
    pub min_diagonal: f64,
}

impl Default for GaussNewtonConfig {
    fn default() -> Self {
        Self {
            linear_solver_type: linalg::LinearSolverType::default(),
            max_iterations: 20,
            cost_tolerance: 1e-12,
            parameter_tolerance: 1e-8,
            gradient_tolerance: 1e-8,
            max_step_halvings: 10,
            use_jacobi_scaling: false,
            min_diagonal: 1e-10,
        }
    }
}

impl GaussNewtonConfig {
    /// Create a new Gauss-Newton configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the linear solver type
    pub fn with_linear_solver_type(mut self, linear_solver_type: linalg::LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
        self
    }

    /// Set the maximum number of iterations
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the cost tolerance
    pub fn with_cost_tolerance(mut self, cost_tolerance: f64) -> Self {
        self.cost_tolerance = cost_tolerance;
        self
    }

    /// Set the parameter tolerance
    pub fn with_parameter_tolerance(mut self, parameter_tolerance: f64) -> Self {
        self.parameter_tolerance = parameter_tolerance;
        self
    }

    /// Set the gradient tolerance
    pub fn with_gradient_tolerance(mut self, gradient_tolerance: f64) -> Self {
        self.gradient_tolerance = gradient_tolerance;
        self
    }

    pub fn with_max_step_halvings(mut self, max_step_halvings: usize) -> Self {
        self.max_step_halvings = max_step_halvings;
        self
    }

    /// Enable or disable Jacobi column scaling (preconditioning).
    pub fn with_jacobi_scaling(mut self, use_jacobi_scaling: bool) -> Self {
        self.use_jacobi_scaling = use_jacobi_scaling;
        self
    }

    /// Set the minimum diagonal regularization for numerical stability.
    pub fn with_min_diagonal(mut self, min_diagonal: f64) -> Self {
        self.min_diagonal = min_diagonal;
        self
    }

    /// Print configuration parameters (debug level logging)
    pub fn print_configuration(&self) {
        debug!(
            "\nConfiguration:\n  Solver:        Trust-region Gauss-Newton\n  Linear solver: {}\n  Convergence Criteria:\n  Max iterations:      {}\n  Cost tolerance:      {:.2e}\n  Parameter tolerance: {:.2e}\n  Gradient tolerance:  {:.2e}\n  Numerical Settings:\n  Max step halvings:   {}\n  Jacobi scaling:      {}\n  Min diagonal:        {:.2e}",
            self.linear_solver_type,
            self.max_iterations,
            self.cost_tolerance,
            self.parameter_tolerance,
            self.gradient_tolerance,
            self.max_step_halvings,
            if self.use_jacobi_scaling {
                "enabled"
            } else {
                "disabled"
            },
            self.min_diagonal
        );
    }
}

/// Outcome of trying one step, possibly after several halvings
struct StepTrial {
    new_cost: f64,
    step_norm: f64,
    halvings: usize,
    accepted: bool,
}

/// Trust-region Gauss-Newton solver.
///
/// Optimized values are written back into the [`AccumulatedProblem`]; the returned
/// [`SolverResult`] only carries costs and statistics.
#[derive(Debug, Clone, Default)]
pub struct GaussNewton {
    config: GaussNewtonConfig,
}

impl GaussNewton {
    /// Create a new Gauss-Newton solver with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new Gauss-Newton solver with the given configuration.
    pub fn with_config(config: GaussNewtonConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GaussNewtonConfig {
        &self.config
    }

    /// Check the convergence criteria after an accepted step.
    fn check_convergence(
        &self,
        current_cost: f64,
        new_cost: f64,
        parameter_norm: f64,
        parameter_update_norm: f64,
    ) -> Option<OptimizationStatus> {
        if !new_cost.is_finite() || !parameter_update_norm.is_finite() {
            return Some(OptimizationStatus::InvalidNumericalValues);
        }

        // ||h|| ≤ ε_param · (||x|| + ε_param)
        let relative_step_tolerance =
            self.config.parameter_tolerance * (parameter_norm + self.config.parameter_tolerance);
        if parameter_update_norm <= relative_step_tolerance {
            return Some(OptimizationStatus::ParameterToleranceReached);
        }

        let relative_cost_change = (current_cost - new_cost).abs() / current_cost.max(1e-10);
        if relative_cost_change < self.config.cost_tolerance {
            return Some(OptimizationStatus::CostToleranceReached);
        }

        None
    }

    /// Jacobi scaling factors `1 / (1 + ||J_j||)`
    fn jacobi_scaling(jacobian: &SparseColMat<usize, f64>) -> Vec<f64> {
        linalg::column_norms(jacobian)
            .into_iter()
            .map(|norm| 1.0 / (1.0 + norm))
            .collect()
    }

    /// Solve the regularized normal equations for the Gauss-Newton step.
    fn compute_gauss_newton_step(
        &self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        linear_solver: &mut Box<dyn linalg::SparseLinearSolver>,
    ) -> LinAlgResult<Mat<f64>> {
        if !self.config.use_jacobi_scaling {
            return self.solve_damped(residuals, jacobian, linear_solver);
        }

        // J_s = J·D, so the step in the original coordinates is D·h_s
        let scaling = Self::jacobi_scaling(jacobian);
        let scaled_jacobian = linalg::scale_columns(jacobian, &scaling)?;
        let mut step = self.solve_damped(residuals, &scaled_jacobian, linear_solver)?;
        for (i, s) in scaling.iter().enumerate() {
            step[(i, 0)] *= s;
        }
        Ok(step)
    }

    /// Solve `(J^T·J + μI)·h = -J^T·r`, growing `μ` while the system is singular.
    fn solve_damped(
        &self,
        residuals: &Mat<f64>,
        jacobian: &SparseColMat<usize, f64>,
        linear_solver: &mut Box<dyn linalg::SparseLinearSolver>,
    ) -> LinAlgResult<Mat<f64>> {
        let lambda = linalg::relative_damping(jacobian, self.config.min_diagonal);
        let (step, used) = linalg::solve_with_damping(lambda, |lambda| {
            linear_solver.solve_augmented_equation(residuals, jacobian, lambda)
        })?;
        if used > lambda {
            debug!("Normal equations needed damping {used:.2e} (base {lambda:.2e})");
        }
        Ok(step)
    }

    /// Apply the step, halving it until the cost does not increase.
    ///
    /// A rejected trial leaves the problem at its values from before the call.
    fn try_step(
        &self,
        problem: &mut AccumulatedProblem,
        mut step: Mat<f64>,
        current_cost: f64,
    ) -> CalibrationResult<StepTrial> {
        let snapshot = problem.values();
        let mut halvings = 0;
        loop {
            let step_norm = problem.apply_step(step.as_ref());
            let new_cost = optimizer::compute_cost(&problem.compute_residual()?);
            if new_cost.is_finite() && new_cost <= current_cost {
                return Ok(StepTrial {
                    new_cost,
                    step_norm,
                    halvings,
                    accepted: true,
                });
            }

            problem.set_values(&snapshot)?;
            if halvings == self.config.max_step_halvings {
                return Ok(StepTrial {
                    new_cost: current_cost,
                    step_norm: 0.0,
                    halvings,
                    accepted: false,
                });
            }
            for i in 0..step.nrows() {
                step[(i, 0)] *= 0.5;
            }
            halvings += 1;
        }
    }

    pub fn optimize(&mut self, problem: &mut AccumulatedProblem) -> CalibrationResult<SolverResult> {
        let start_time = time::Instant::now();

        let initial_residual = problem.compute_residual()?;
        let initial_cost = optimizer::compute_cost(&initial_residual);
        if problem.layout().total_dof() == 0 || problem.total_residual_dimension() == 0 {
            return Ok(SolverResult::trivial(initial_cost, start_time.elapsed()));
        }

        let symbolic_structure = problem.build_symbolic_structure()?;
        let mut linear_solver = linalg::create_linear_solver(self.config.linear_solver_type);

        let mut current_cost = initial_cost;
        let mut iteration = 0;
        let mut cost_evaluations = 1;
        let mut jacobian_evaluations = 0;
        let mut final_gradient_norm = 0.0;
        let mut final_parameter_update_norm = 0.0;

        if tracing::enabled!(tracing::Level::DEBUG) {
            self.config.print_configuration();
            IterationStats::print_header();
        }

        let status = loop {
            if iteration >= self.config.max_iterations {
                break OptimizationStatus::MaxIterationsReached;
            }
            let iter_start = time::Instant::now();

            let (residuals, jacobian) =
                problem.compute_residual_and_jacobian(&symbolic_structure)?;
            jacobian_evaluations += 1;

            let gradient_norm = jacobian.as_ref().transpose().mul(&residuals).norm_l2();
            final_gradient_norm = gradient_norm;
            if !gradient_norm.is_finite() {
                break OptimizationStatus::InvalidNumericalValues;
            }
            if gradient_norm < self.config.gradient_tolerance {
                break OptimizationStatus::GradientToleranceReached;
            }

            let step =
                match self.compute_gauss_newton_step(&residuals, &jacobian, &mut linear_solver) {
                    Ok(step) => step,
                    Err(LinAlgError::SingularMatrix) => {
                        warn!(
                            "Normal equations singular at iteration {iteration} after {} damping attempts",
                            linalg::MAX_DAMPING_ATTEMPTS
                        );
                        break OptimizationStatus::SingularSystem;
                    }
                    Err(e) => return Err(OptimizerError::from(e).into()),
                };
            if !(0..step.nrows()).all(|i| step[(i, 0)].is_finite()) {
                return Err(OptimizerError::NonFiniteStep { iteration }.log().into());
            }

            let trial = self.try_step(problem, step, current_cost)?;
            cost_evaluations += trial.halvings + 1;
            final_parameter_update_norm = trial.step_norm;

            if tracing::enabled!(tracing::Level::DEBUG) {
                IterationStats {
                    iteration,
                    cost: trial.new_cost,
                    cost_change: current_cost - trial.new_cost,
                    gradient_norm,
                    step_norm: trial.step_norm,
                    step_halvings: trial.halvings,
                    iter_time_ms: iter_start.elapsed().as_secs_f64() * 1000.0,
                    total_time_ms: start_time.elapsed().as_secs_f64() * 1000.0,
                    accepted: trial.accepted,
                }
                .print_line();
            }
            iteration += 1;

            if !trial.accepted {
                break OptimizationStatus::TrustRegionRadiusTooSmall;
            }

            let previous_cost = current_cost;
            current_cost = trial.new_cost;
            if let Some(status) = self.check_convergence(
                previous_cost,
                trial.new_cost,
                problem.parameter_norm(),
                trial.step_norm,
            ) {
                break status;
            }
        };

        let elapsed = start_time.elapsed();
        if tracing::enabled!(tracing::Level::DEBUG) {
            let summary = GaussNewtonSummary {
                initial_cost,
                final_cost: current_cost,
                iterations: iteration,
                final_gradient_norm,
                total_time: elapsed,
                convergence_status: status.clone(),
            };
            debug!("{}", summary);
        }

        Ok(SolverResult {
            status,
            initial_cost,
            final_cost: current_cost,
            iterations: iteration,
            elapsed_time: elapsed,
            convergence_info: Some(ConvergenceInfo {
                final_gradient_norm,
                final_parameter_update_norm,
                cost_evaluations,
                jacobian_evaluations,
            }),
        })
    }
}

impl Solver for GaussNewton {
    fn configure(&mut self, settings: &SolverSettings) {
        self.config.max_iterations = settings.max_iterations;
        self.config.gradient_tolerance = settings.norm_tol;
        self.config.parameter_tolerance = settings.norm_tol;
        self.config.linear_solver_type = settings.linear_solver;
        self.config.min_diagonal = settings.min_diagonal;
    }

    fn optimize(&mut self, problem: &mut AccumulatedProblem) -> CalibrationResult<SolverResult> {
        GaussNewton::optimize(self, problem)
    }
}
