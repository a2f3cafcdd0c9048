//! Rank-revealing factorization of the trailing (marginalized) column block of a Jacobian.
//!
//! With the columns split as `J = [J_n | J_m]` (`k` trailing columns), the nuisance block is
//! eliminated through the Schur complement
//!
//! ```text
//! X = (J_n^T J_n + μI)^-1 J_n^T J_m
//! B = J_m - J_n X
//! Ω = B^T B = R^T R
//! ```
//!
//! `R` (k×k upper triangular) is the square-root information of the marginal block. Two ranks are
//! reported:
//!
//! - the QR rank, from a column-pivoted QR of the (optionally column-normalized) `B`, compared
//!   against a fixed or adaptive tolerance;
//! - the SVD rank, from the singular values of `R` against `k · eps_tol_svd · s`, where `s` is
//!   the larger of `σ_max(R)` and the largest column norm of `J_m` before elimination. The SVD
//!   also splits the marginal space into its observable (column) and unobservable (null) parts.
//!
//! When the marginal block lies in the span of `J_n`, `B` holds only the `O(μ)` residue of the
//! regularized elimination. Measured against `J_m` that residue has rank zero. The same
//! reference decides which columns of `B` are too small to normalize.

use faer::{Mat, sparse::SparseColMat};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::ops::Mul;

use crate::linalg::{
    LinAlgError, LinAlgResult, LinearSolverType, add_diagonal, create_linear_solver,
    normal_matrix, relative_damping, solve_with_damping, sparse_memory_bytes, split_columns,
};

/// Numerical knobs for [`factor_marginal_block`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarginalizationParams {
    /// Fixed QR rank tolerance; `<= 0` selects the adaptive tolerance.
    pub qr_tol: f64,
    /// Scale marginal columns to unit norm before the rank-revealing QR.
    pub col_norm: bool,
    /// Columns of `B` with a norm at or below this value times `max(1, ||J_m column||)` are
    /// left unscaled.
    pub norm_tol: f64,
    /// Relative singular value threshold for the SVD rank.
    pub eps_tol_svd: f64,
    /// Tikhonov term added to `J_n^T J_n` before elimination, relative to its largest diagonal
    /// entry.
    pub min_diagonal: f64,
    pub linear_solver: LinearSolverType,
}

impl Default for MarginalizationParams {
    fn default() -> Self {
        Self {
            qr_tol: 0.02,
            col_norm: true,
            norm_tol: 1e-8,
            eps_tol_svd: 1e-4,
            min_diagonal: 1e-10,
            linear_solver: LinearSolverType::default(),
        }
    }
}

/// Everything derived from one factorization of the marginal block.
///
/// All matrices are expressed in the marginal block's own `k`-dimensional coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct RankRevealingFactor {
    /// Number of marginalized columns `k`
    pub dimension: usize,
    /// Numerical rank from the pivoted QR
    pub rank: usize,
    pub rank_deficiency: usize,
    /// Tolerance actually used for the QR rank decision
    pub qr_tol: f64,
    /// Numerical rank from the SVD of `R`
    pub marginal_rank: usize,
    pub marginal_rank_deficiency: usize,
    /// Upper-triangular square-root information `R` (k×k)
    pub r_factor: DMatrix<f64>,
    /// Singular values of `R`, descending
    pub singular_values: DVector<f64>,
    /// Unobservable directions, k×(k - marginal_rank)
    pub null_space: DMatrix<f64>,
    /// Observable directions, k×marginal_rank
    pub column_space: DMatrix<f64>,
    pub covariance: DMatrix<f64>,
    /// Covariance restricted to the column space
    pub projected_covariance: DMatrix<f64>,
    pub information_matrix: DMatrix<f64>,
    /// `Σ ln σ_i²` over the observable singular values (log pseudo-determinant of Ω)
    pub sv_log_sum: f64,
    /// Bytes held by the Jacobian and the dense marginal blocks
    pub memory_usage: usize,
}

impl RankRevealingFactor {
    /// Result for an empty marginal block.
    pub fn empty() -> Self {
        Self {
            dimension: 0,
            rank: 0,
            rank_deficiency: 0,
            qr_tol: 0.0,
            marginal_rank: 0,
            marginal_rank_deficiency: 0,
            r_factor: DMatrix::zeros(0, 0),
            singular_values: DVector::zeros(0),
            null_space: DMatrix::zeros(0, 0),
            column_space: DMatrix::zeros(0, 0),
            covariance: DMatrix::zeros(0, 0),
            projected_covariance: DMatrix::zeros(0, 0),
            information_matrix: DMatrix::zeros(0, 0),
            sv_log_sum: 0.0,
            memory_usage: 0,
        }
    }
}

impl Default for RankRevealingFactor {
    fn default() -> Self {
        Self::empty()
    }
}

/// Factor the columns `marginal_start..` of `jacobian`.
///
/// # Errors
/// Fails when `marginal_start` exceeds the column count, the nuisance system cannot be
/// factorized, or the SVD of `R` does not converge.
pub fn factor_marginal_block(
    jacobian: &SparseColMat<usize, f64>,
    marginal_start: usize,
    params: &MarginalizationParams,
) -> LinAlgResult<RankRevealingFactor> {
    let (j_n, j_m) = split_columns(jacobian, marginal_start)?;
    let rows = jacobian.nrows();
    let k = j_m.ncols();

    let mut memory_usage = sparse_memory_bytes(jacobian);
    if k == 0 {
        return Ok(RankRevealingFactor {
            memory_usage,
            ..RankRevealingFactor::empty()
        });
    }

    let column_scales: Vec<f64> = (0..k).map(|j| j_m.col(j).norm_l2()).collect();

    // Schur complement of the nuisance block
    let schur = if marginal_start > 0 {
        let normal = normal_matrix(&j_n)?;
        let rhs = j_n.as_ref().transpose().mul(&j_m);
        let mut solver = create_linear_solver(params.linear_solver);
        let lambda = relative_damping(&j_n, params.min_diagonal);
        let (x, _) = solve_with_damping(lambda, |lambda| {
            solver.solve_symmetric(&add_diagonal(&normal, lambda)?, &rhs)
        })
        .map_err(LinAlgError::log)?;
        let projected = j_n.as_ref().mul(&x);
        memory_usage += x.nrows() * x.ncols() * std::mem::size_of::<f64>();
        &j_m - &projected
    } else {
        j_m
    };
    let b = to_dmatrix(&schur);
    memory_usage += (rows * k + k * k) * std::mem::size_of::<f64>();

    let r_factor = square_root_information(&b);
    let (rank, qr_tol) = qr_rank(&b, &column_scales, params);

    let svd = r_factor
        .clone()
        .try_svd(false, true, f64::EPSILON, 0)
        .ok_or_else(|| {
            LinAlgError::FactorizationFailed("SVD of the marginal factor did not converge".into())
                .log()
        })?;
    let v_t = svd.v_t.ok_or_else(|| {
        LinAlgError::FactorizationFailed("SVD did not return right singular vectors".into()).log()
    })?;
    let (singular_values, v) = sorted_spectrum(&svd.singular_values, &v_t.transpose());

    let reference = column_scales
        .iter()
        .copied()
        .chain(singular_values.iter().copied())
        .fold(0.0, f64::max);
    let svd_tol = k as f64 * reference * params.eps_tol_svd;
    let marginal_rank = singular_values.iter().filter(|&&s| s > svd_tol).count();

    let column_space = v.columns(0, marginal_rank).into_owned();
    let null_space = v.columns(marginal_rank, k - marginal_rank).into_owned();

    let mut projected_covariance = DMatrix::zeros(k, k);
    let mut sv_log_sum = 0.0;
    for i in 0..marginal_rank {
        let sigma_sq = singular_values[i] * singular_values[i];
        let vi = v.column(i);
        projected_covariance += (vi * vi.transpose()) / sigma_sq;
        sv_log_sum += sigma_sq.ln();
    }

    let covariance = if rank == k {
        r_factor
            .solve_upper_triangular(&DMatrix::identity(k, k))
            .map(|r_inv| &r_inv * r_inv.transpose())
            .unwrap_or_else(|| projected_covariance.clone())
    } else {
        projected_covariance.clone()
    };

    Ok(RankRevealingFactor {
        dimension: k,
        rank,
        rank_deficiency: k - rank,
        qr_tol,
        marginal_rank,
        marginal_rank_deficiency: k - marginal_rank,
        information_matrix: r_factor.transpose() * &r_factor,
        r_factor,
        singular_values,
        null_space,
        column_space,
        covariance,
        projected_covariance,
        sv_log_sum,
        memory_usage,
    })
}

fn to_dmatrix(mat: &Mat<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(mat.nrows(), mat.ncols(), |i, j| mat[(i, j)])
}

/// k×k `R` with `R^T R = B^T B`; zero rows pad short blocks.
fn square_root_information(b: &DMatrix<f64>) -> DMatrix<f64> {
    let k = b.ncols();
    let mut r = DMatrix::zeros(k, k);
    if b.nrows() == 0 {
        return r;
    }
    let qr_r = b.clone().qr().r();
    r.rows_mut(0, qr_r.nrows()).copy_from(&qr_r);
    r
}

/// Rank from the diagonal of a column-pivoted QR, with the tolerance used.
///
/// `column_scales` are the norms of the marginal columns before elimination.
fn qr_rank(
    b: &DMatrix<f64>,
    column_scales: &[f64],
    params: &MarginalizationParams,
) -> (usize, f64) {
    let (rows, k) = b.shape();
    let mut scaled = b.clone();
    if params.col_norm {
        for (mut column, scale) in scaled.column_iter_mut().zip(column_scales) {
            let norm = column.norm();
            if norm > params.norm_tol * scale.max(1.0) {
                column /= norm;
            }
        }
    }

    let tol = if params.qr_tol > 0.0 {
        params.qr_tol
    } else {
        let max_norm = scaled.column_iter().map(|c| c.norm()).fold(0.0, f64::max);
        20.0 * (rows + k) as f64 * f64::EPSILON * max_norm
    };

    if rows == 0 {
        return (0, tol);
    }
    let r = scaled.col_piv_qr().r();
    let rank = r.diagonal().iter().filter(|d| d.abs() > tol).count();
    (rank, tol)
}

/// Singular values sorted descending with the matching columns of `v`.
fn sorted_spectrum(values: &DVector<f64>, v: &DMatrix<f64>) -> (DVector<f64>, DMatrix<f64>) {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
    let sorted = DVector::from_iterator(order.len(), order.iter().map(|&i| values[i]));
    let mut v_sorted = DMatrix::zeros(v.nrows(), order.len());
    for (dst, &src) in order.iter().enumerate() {
        v_sorted.set_column(dst, &v.column(src));
    }
    (sorted, v_sorted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::sparse::Triplet;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn sparse(rows: usize, cols: usize, dense: &[f64]) -> LinAlgResult<SparseColMat<usize, f64>> {
        let triplets: Vec<Triplet<usize, usize, f64>> = (0..rows)
            .flat_map(|i| (0..cols).map(move |j| (i, j)))
            .filter(|&(i, j)| dense[i * cols + j] != 0.0)
            .map(|(i, j)| Triplet::new(i, j, dense[i * cols + j]))
            .collect();
        SparseColMat::try_new_from_triplets(rows, cols, &triplets).map_err(|e| {
            LinAlgError::SparseMatrixCreation(format!("{e:?}"))
        })
    }

    #[test]
    fn test_empty_marginal_block() -> TestResult {
        let jacobian = sparse(2, 2, &[1.0, 0.0, 0.0, 1.0])?;
        let factor = factor_marginal_block(&jacobian, 2, &MarginalizationParams::default())?;

        assert_eq!(factor.dimension, 0);
        assert_eq!(factor.rank, 0);
        assert_eq!(factor.sv_log_sum, 0.0);
        assert_eq!(factor.covariance.shape(), (0, 0));
        assert!(factor.memory_usage > 0);
        Ok(())
    }

    #[test]
    fn test_split_past_end_fails() -> TestResult {
        let jacobian = sparse(1, 1, &[1.0])?;
        assert!(factor_marginal_block(&jacobian, 2, &MarginalizationParams::default()).is_err());
        Ok(())
    }

    #[test]
    fn test_schur_complement_eliminates_nuisance() -> TestResult {
        // J_n = [1 0; 0 1; 0 0], J_m = [1; 1; 2] -> B = [0; 0; 2]
        let jacobian = sparse(3, 3, &[1.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 0.0, 2.0])?;
        let factor = factor_marginal_block(&jacobian, 2, &MarginalizationParams::default())?;

        assert_eq!(factor.dimension, 1);
        assert_eq!(factor.rank, 1);
        assert_eq!(factor.marginal_rank, 1);
        assert!((factor.information_matrix[(0, 0)] - 4.0).abs() < 1e-8);
        assert!((factor.covariance[(0, 0)] - 0.25).abs() < 1e-8);
        assert!((factor.sv_log_sum - 4.0_f64.ln()).abs() < 1e-8);
        Ok(())
    }

    #[test]
    fn test_marginal_block_in_nuisance_span_has_no_rank() -> TestResult {
        // every row constrains n + c only: B is the regularization residue of J_m
        for weight in [1.0, 1e4] {
            let jacobian = sparse(3, 2, &[weight, weight, weight, weight, weight, weight])?;
            let factor = factor_marginal_block(&jacobian, 1, &MarginalizationParams::default())?;

            assert_eq!(factor.dimension, 1);
            assert_eq!(factor.marginal_rank, 0);
            assert_eq!(factor.marginal_rank_deficiency, 1);
            assert_eq!(factor.rank, 0);
            assert_eq!(factor.sv_log_sum, 0.0);
            assert_eq!(factor.null_space.shape(), (1, 1));
            assert_eq!(factor.covariance, DMatrix::zeros(1, 1));
            assert!(factor.singular_values[0] < 1e-6 * weight);
        }
        Ok(())
    }

    #[test]
    fn test_covariance_matches_dense_inverse() -> TestResult {
        let dense = [
            2.0, 0.5, 0.0, 1.0, //
            0.0, 1.0, 0.3, 0.0, //
            1.0, 0.0, 1.5, -0.5, //
            0.0, 0.2, 0.0, 2.0, //
            0.4, 0.0, 1.0, 0.7,
        ];
        let jacobian = sparse(5, 4, &dense)?;
        let factor = factor_marginal_block(&jacobian, 2, &MarginalizationParams::default())?;

        let j = DMatrix::from_row_slice(5, 4, &dense);
        let full_cov = (j.transpose() * &j)
            .try_inverse()
            .ok_or("normal matrix not invertible")?;
        let block = full_cov.view((2, 2), (2, 2));

        for r in 0..2 {
            for c in 0..2 {
                assert!((factor.covariance[(r, c)] - block[(r, c)]).abs() < 1e-6);
                assert!(
                    (factor.projected_covariance[(r, c)] - factor.covariance[(r, c)]).abs() < 1e-6
                );
            }
        }
        Ok(())
    }

    #[test]
    fn test_rank_deficient_block() -> TestResult {
        // Two identical marginal columns: only their sum is observable
        let jacobian = sparse(2, 2, &[1.0, 1.0, 2.0, 2.0])?;
        let factor = factor_marginal_block(&jacobian, 0, &MarginalizationParams::default())?;

        assert_eq!(factor.rank, 1);
        assert_eq!(factor.rank + factor.rank_deficiency, 2);
        assert_eq!(factor.marginal_rank, 1);
        assert_eq!(factor.null_space.shape(), (2, 1));
        assert_eq!(factor.column_space.shape(), (2, 1));

        let n = factor.null_space.column(0);
        assert!((n[0] + n[1]).abs() < 1e-8);
        assert!((&factor.information_matrix * n).norm() < 1e-8);

        // Σ_P = v v^T / 10 with v = [1, 1] / sqrt(2)
        for r in 0..2 {
            for c in 0..2 {
                assert!((factor.projected_covariance[(r, c)] - 0.05).abs() < 1e-8);
            }
        }
        assert_eq!(factor.covariance, factor.projected_covariance);
        assert!((factor.sv_log_sum - 10.0_f64.ln()).abs() < 1e-8);
        Ok(())
    }

    #[test]
    fn test_column_normalization_and_adaptive_tolerance() -> TestResult {
        let jacobian = sparse(2, 2, &[1.0, 0.0, 0.0, 1e-3])?;

        let fixed = MarginalizationParams {
            col_norm: false,
            ..MarginalizationParams::default()
        };
        let factor = factor_marginal_block(&jacobian, 0, &fixed)?;
        assert_eq!(factor.rank, 1);
        assert_eq!(factor.qr_tol, 0.02);

        let adaptive = MarginalizationParams {
            qr_tol: 0.0,
            ..fixed
        };
        let factor = factor_marginal_block(&jacobian, 0, &adaptive)?;
        assert_eq!(factor.rank, 2);
        assert!(factor.qr_tol > 0.0 && factor.qr_tol < 1e-12);

        let normalized = MarginalizationParams::default();
        let factor = factor_marginal_block(&jacobian, 0, &normalized)?;
        assert_eq!(factor.rank, 2);
        Ok(())
    }

    #[test]
    fn test_singular_values_sorted() {
        let values = DVector::from_vec(vec![1.0, 3.0, 2.0]);
        let v = DMatrix::identity(3, 3);
        let (sorted, v_sorted) = sorted_spectrum(&values, &v);
        assert_eq!(sorted, DVector::from_vec(vec![3.0, 2.0, 1.0]));
        assert_eq!(v_sorted[(1, 0)], 1.0);
        assert_eq!(v_sorted[(2, 1)], 1.0);
        assert_eq!(v_sorted[(0, 2)], 1.0);
    }
}
