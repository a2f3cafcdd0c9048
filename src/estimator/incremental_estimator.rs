//! Incremental estimator with mutual-information gated batch admission.
//!
//! # Admission
//!
//! `add_batch` appends the batch tentatively, re-optimizes the whole problem and factors the
//! marginalized block at the new optimum. With `Ω` the marginal information matrix and
//! `σ_i` the observable singular values of its square root,
//!
//! ```text
//! log det⁺ Ω = Σ_i ln σ_i²
//! MI         = ½ (log det⁺ Ω_new − log det⁺ Ω_persisted)
//! ```
//!
//! The batch is kept when `force` is set or `MI ≥ mi_tol`. Otherwise the problem is rolled
//! back to the checkpoint taken before the append, which restores batches, variable values and
//! column layout exactly, and the persisted statistics are left untouched.
//!
//! # Persisted state
//!
//! Mutual information, `log det⁺ Ω`, ranks, QR tolerance, marginal matrices and the Jacobian
//! change only on an accepted `add_batch` and on `reoptimize`. After `remove_batch` they are
//! stale until the next `reoptimize`.
//!
//! # Example
//!
//! ```
//! use incremental_calibration::core::{batch::Batch, error_term::ErrorTerm, variable::DesignVariable};
//! use incremental_calibration::estimator::{IncrementalEstimator, Options};
//! use incremental_calibration::factors::PriorFactor;
//! use nalgebra::dvector;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//!
//! let mut estimator = IncrementalEstimator::new(0, Options::default().with_verbose(false));
//!
//! let batch = Batch::new()
//!     .with_design_variable(DesignVariable::new("scale", 0, dvector![1.0]))
//!     .with_error_term(ErrorTerm::new(
//!         &["scale"],
//!         Box::new(PriorFactor::with_weight(dvector![1.1], 10.0)),
//!     ));
//! let result = estimator.add_batch(batch.into_handle(), false)?;
//!
//! assert!(result.accepted);
//! assert_eq!(estimator.num_batches(), 1);
//! assert_eq!(estimator.rank(), 1);
//! # Ok(())
//! # }
//! ```

use faer::sparse::SparseColMat;
use nalgebra::DMatrix;
use tracing::{debug, info};
use web_time::Instant;

use crate::core::batch::BatchHandle;
use crate::core::problem::AccumulatedProblem;
use crate::error::CalibrationResult;
use crate::estimator::{EstimatorConfig, EstimatorError, Options, ReturnValue};
use crate::linalg::marginal::{MarginalizationParams, RankRevealingFactor};
use crate::optimizer::{GaussNewton, Solver, SolverResult, SolverSettings};

/// Output of one optimize-and-factor pass, before the admission decision.
struct Evaluation {
    solver_result: SolverResult,
    jacobian: Option<SparseColMat<usize, f64>>,
    factor: RankRevealingFactor,
}

pub struct IncrementalEstimator<S: Solver = GaussNewton> {
    marg_group_id: usize,
    options: Options,
    problem: AccumulatedProblem,
    solver: S,
    marginal: RankRevealingFactor,
    mutual_information: f64,
    jacobian: Option<SparseColMat<usize, f64>>,
}

impl IncrementalEstimator<GaussNewton> {
    /// Estimator tracking `marg_group_id`, backed by the trust-region Gauss-Newton solver.
    pub fn new(marg_group_id: usize, options: Options) -> Self {
        Self::with_solver(marg_group_id, options, GaussNewton::new())
    }

    pub fn from_config(config: &EstimatorConfig) -> Self {
        Self::new(config.marg_group_id, config.options.clone())
    }
}

impl<S: Solver> IncrementalEstimator<S> {
    pub fn with_solver(marg_group_id: usize, options: Options, solver: S) -> Self {
        Self {
            marg_group_id,
            options,
            problem: AccumulatedProblem::new(),
            solver,
            marginal: RankRevealingFactor::empty(),
            mutual_information: 0.0,
            jacobian: None,
        }
    }

    /// Offer a batch to the estimator.
    ///
    /// The returned value describes the tentative computation whether or not the batch was
    /// kept. Empty or malformed batches fail with `InvalidArgument` before the solver runs; any
    /// later failure rolls the problem back before it is returned.
    pub fn add_batch(&mut self, batch: BatchHandle, force: bool) -> CalibrationResult<ReturnValue> {
        let start = Instant::now();

        if batch.is_empty() {
            return Err(EstimatorError::InvalidArgument(
                "Batch has neither design variables nor error terms".to_string(),
            )
            .log()
            .into());
        }
        batch.validate().map_err(|e| {
            EstimatorError::InvalidArgument(format!("Malformed batch: {e}")).log_with_source(e)
        })?;

        let checkpoint = self.problem.checkpoint();
        self.problem.append(batch)?;
        self.problem.order_group_last(self.marg_group_id);

        let evaluation = match self.evaluate() {
            Ok(evaluation) => evaluation,
            Err(e) => {
                self.problem.rollback(checkpoint);
                return Err(e);
            }
        };

        let mutual_information = 0.5 * (evaluation.factor.sv_log_sum - self.marginal.sv_log_sum);
        let accepted = force || mutual_information >= self.options.mi_tol;

        if !accepted {
            self.problem.rollback(checkpoint);
        }
        let result = ReturnValue::new(
            accepted,
            mutual_information,
            &evaluation.solver_result,
            &evaluation.factor,
            start.elapsed(),
        );
        if accepted {
            self.persist(evaluation, mutual_information);
        }

        self.report("add_batch", &result);
        Ok(result)
    }

    /// Remove the accepted batch at `index`; later batches shift down by one.
    ///
    /// Statistics are not refreshed; call [`IncrementalEstimator::reoptimize`] afterwards.
    pub fn remove_batch(&mut self, index: usize) -> CalibrationResult<()> {
        let num_batches = self.problem.num_batches();
        if index >= num_batches {
            return Err(EstimatorError::BatchIndexOutOfRange { index, num_batches }
                .log()
                .into());
        }
        self.problem.remove(index)?;
        debug!(
            "removed batch {index}, {} batches remain",
            self.problem.num_batches()
        );
        Ok(())
    }

    /// Remove the accepted batch that `batch` points to.
    pub fn remove_batch_handle(&mut self, batch: &BatchHandle) -> CalibrationResult<()> {
        let index = self
            .problem
            .position_of(batch)
            .ok_or_else(|| EstimatorError::UnknownBatch.log())?;
        self.remove_batch(index)
    }

    /// Re-run the solver over the current problem and persist the result unconditionally.
    pub fn reoptimize(&mut self) -> CalibrationResult<ReturnValue> {
        let start = Instant::now();
        self.problem.order_group_last(self.marg_group_id);

        let evaluation = self.evaluate()?;
        let mutual_information = 0.5 * (evaluation.factor.sv_log_sum - self.marginal.sv_log_sum);
        let result = ReturnValue::new(
            true,
            mutual_information,
            &evaluation.solver_result,
            &evaluation.factor,
            start.elapsed(),
        );
        self.persist(evaluation, mutual_information);

        self.report("reoptimize", &result);
        Ok(result)
    }

    fn evaluate(&mut self) -> CalibrationResult<Evaluation> {
        self.solver.configure(&SolverSettings::from(&self.options));
        let solver_result = self.solver.optimize(&mut self.problem)?;

        if self.problem.is_empty() {
            return Ok(Evaluation {
                solver_result,
                jacobian: None,
                factor: RankRevealingFactor::empty(),
            });
        }

        let params = MarginalizationParams::from(&self.options);
        let (jacobian, factor) = self.solver.rank_revealing_factor(&self.problem, &params)?;
        Ok(Evaluation {
            solver_result,
            jacobian: Some(jacobian),
            factor,
        })
    }

    fn persist(&mut self, evaluation: Evaluation, mutual_information: f64) {
        self.mutual_information = mutual_information;
        self.marginal = evaluation.factor;
        self.jacobian = evaluation.jacobian;
    }

    fn report(&self, operation: &str, result: &ReturnValue) {
        let batches = self.problem.num_batches();
        if self.options.verbose {
            info!("{operation}: {result} | {batches} batches");
        } else {
            debug!("{operation}: {result} | {batches} batches");
        }
    }

    pub fn num_batches(&self) -> usize {
        self.problem.num_batches()
    }

    pub fn marg_group_id(&self) -> usize {
        self.marg_group_id
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Options for subsequent calls; use [`IncrementalEstimator::reoptimize`] to recompute the
    /// statistics under the new values.
    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    pub fn problem(&self) -> &AccumulatedProblem {
        &self.problem
    }

    pub fn solver(&self) -> &S {
        &self.solver
    }

    /// Sparse Jacobian of the last persisted computation.
    pub fn jacobian(&self) -> Option<&SparseColMat<usize, f64>> {
        self.jacobian.as_ref()
    }

    pub fn rank(&self) -> usize {
        self.marginal.rank
    }

    pub fn rank_deficiency(&self) -> usize {
        self.marginal.rank_deficiency
    }

    pub fn marginal_rank(&self) -> usize {
        self.marginal.marginal_rank
    }

    pub fn marginal_rank_deficiency(&self) -> usize {
        self.marginal.marginal_rank_deficiency
    }

    pub fn qr_tol(&self) -> f64 {
        self.marginal.qr_tol
    }

    pub fn memory_usage(&self) -> usize {
        self.marginal.memory_usage
    }

    pub fn mutual_information(&self) -> f64 {
        self.mutual_information
    }

    /// Log pseudo-determinant of the persisted marginal information matrix.
    pub fn singular_value_log_sum(&self) -> f64 {
        self.marginal.sv_log_sum
    }

    pub fn marginalized_null_space(&self) -> &DMatrix<f64> {
        &self.marginal.null_space
    }

    pub fn marginalized_column_space(&self) -> &DMatrix<f64> {
        &self.marginal.column_space
    }

    pub fn marginalized_covariance(&self) -> &DMatrix<f64> {
        &self.marginal.covariance
    }

    pub fn projected_marginalized_covariance(&self) -> &DMatrix<f64> {
        &self.marginal.projected_covariance
    }

    pub fn marginalized_information_matrix(&self) -> &DMatrix<f64> {
        &self.marginal.information_matrix
    }
}
