use nalgebra::DMatrix;
use std::fmt;
use web_time::Duration;

use crate::linalg::marginal::RankRevealingFactor;
use crate::optimizer::{OptimizationStatus, SolverResult};

/// Snapshot of one `add_batch` or `reoptimize` computation.
///
/// For a rejected batch this describes the tentative computation, so the caller can still see
/// how much information the batch would have contributed.
#[derive(Debug, Clone)]
pub struct ReturnValue {
    pub accepted: bool,
    /// Mutual information gained about the marginalized group, in nats
    pub mutual_information: f64,
    pub rank: usize,
    pub rank_deficiency: usize,
    pub marginal_rank: usize,
    pub marginal_rank_deficiency: usize,
    /// Tolerance used for the QR rank decision
    pub qr_tol: f64,
    pub num_iterations: usize,
    pub cost_initial: f64,
    pub cost_final: f64,
    pub status: OptimizationStatus,
    pub elapsed_time: Duration,
    /// Bytes held by the Jacobian and the dense marginal blocks
    pub memory_usage: usize,
    pub null_space: DMatrix<f64>,
    pub column_space: DMatrix<f64>,
    pub covariance: DMatrix<f64>,
    pub projected_covariance: DMatrix<f64>,
    pub information_matrix: DMatrix<f64>,
}

impl ReturnValue {
    pub(crate) fn new(
        accepted: bool,
        mutual_information: f64,
        solver_result: &SolverResult,
        factor: &RankRevealingFactor,
        elapsed_time: Duration,
    ) -> Self {
        Self {
            accepted,
            mutual_information,
            rank: factor.rank,
            rank_deficiency: factor.rank_deficiency,
            marginal_rank: factor.marginal_rank,
            marginal_rank_deficiency: factor.marginal_rank_deficiency,
            qr_tol: factor.qr_tol,
            num_iterations: solver_result.iterations,
            cost_initial: solver_result.initial_cost,
            cost_final: solver_result.final_cost,
            status: solver_result.status.clone(),
            elapsed_time,
            memory_usage: factor.memory_usage,
            null_space: factor.null_space.clone(),
            column_space: factor.column_space.clone(),
            covariance: factor.covariance.clone(),
            projected_covariance: factor.projected_covariance.clone(),
            information_matrix: factor.information_matrix.clone(),
        }
    }
}

impl fmt::Display for ReturnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | MI {:.4} | rank {}/{} (qr_tol {:.2e}) | marginal rank {} | iters {} | cost {:.6e} -> {:.6e} | {:.2}ms | {} bytes",
            if self.accepted { "accepted" } else { "rejected" },
            self.mutual_information,
            self.rank,
            self.rank + self.rank_deficiency,
            self.qr_tol,
            self.marginal_rank,
            self.num_iterations,
            self.cost_initial,
            self.cost_final,
            self.elapsed_time.as_secs_f64() * 1000.0,
            self.memory_usage
        )
    }
}
