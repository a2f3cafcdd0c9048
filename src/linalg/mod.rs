//! Sparse linear algebra: normal-equation solvers and the marginal-block factorization.

pub mod cholesky;
pub mod marginal;
pub mod qr;

use faer::{
    Mat,
    sparse::{SparseColMat, Triplet},
};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fmt::{Display, Formatter},
    ops::Mul,
};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinearSolverType {
    #[default]
    SparseCholesky,
    SparseQR,
}

impl Display for LinearSolverType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverType::SparseCholesky => write!(f, "Sparse Cholesky"),
            LinearSolverType::SparseQR => write!(f, "Sparse QR"),
        }
    }
}

/// Linear algebra specific error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Matrix factorization failed (Cholesky, QR, SVD)
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// Singular or near-singular matrix detected
    #[error("Singular matrix detected (matrix is not invertible)")]
    SingularMatrix,

    /// Failed to create sparse matrix from triplets
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),

    /// Matrix format conversion failed
    #[error("Matrix conversion failed: {0}")]
    MatrixConversion(String),

    /// Operand shapes do not agree
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    ///
    /// # Example
    /// ```ignore
    /// SymbolicLlt::try_new(matrix.symbolic(), Side::Lower)
    ///     .map_err(|e| {
    ///         LinAlgError::FactorizationFailed(
    ///             "Symbolic Cholesky decomposition failed".to_string()
    ///         )
    ///         .log_with_source(e)
    ///     })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Trait for sparse solvers of symmetric positive (semi-)definite systems.
pub trait SparseLinearSolver {
    /// Solve the augmented equation: (J^T * J + λI) * dx = -J^T * r
    ///
    /// # Errors
    /// Returns `LinAlgError` if factorization fails or the matrix is singular.
    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
        lambda: f64,
    ) -> LinAlgResult<Mat<f64>>;

    /// Solve `A X = B` for a symmetric sparse `A` and a dense right-hand side with any number
    /// of columns. Does not touch the cached symbolic factorization.
    fn solve_symmetric(
        &mut self,
        matrix: &SparseColMat<usize, f64>,
        rhs: &Mat<f64>,
    ) -> LinAlgResult<Mat<f64>>;
}

/// Factor by which [`solve_with_damping`] grows the diagonal shift after a singular attempt.
pub const DAMPING_GROWTH: f64 = 1e3;

/// Number of shifts [`solve_with_damping`] tries before reporting a singular system.
pub const MAX_DAMPING_ATTEMPTS: usize = 5;

/// Diagonal shift `min_diagonal · max(1, max_j ||J_j||²)`.
///
/// Scaling by the largest diagonal entry of `J^T J` keeps the shift above the rounding error of
/// heavily weighted systems, where a fixed shift would be absorbed.
pub fn relative_damping(jacobian: &SparseColMat<usize, f64>, min_diagonal: f64) -> f64 {
    let largest = column_norms(jacobian)
        .into_iter()
        .fold(1.0_f64, |acc, norm| acc.max(norm * norm));
    min_diagonal.max(f64::EPSILON) * largest
}

/// Run `solve` with the shift `lambda`, multiplying the shift by [`DAMPING_GROWTH`] after every
/// [`LinAlgError::SingularMatrix`].
///
/// Returns the solution together with the shift that produced it. Any other error, or a singular
/// system on the last of [`MAX_DAMPING_ATTEMPTS`] attempts, is returned as is.
pub fn solve_with_damping<T>(
    lambda: f64,
    mut solve: impl FnMut(f64) -> LinAlgResult<T>,
) -> LinAlgResult<(T, f64)> {
    let mut lambda = lambda;
    let mut attempt = 1;
    loop {
        match solve(lambda) {
            Err(LinAlgError::SingularMatrix) if attempt < MAX_DAMPING_ATTEMPTS => {
                debug!("Shifted system singular at λ = {lambda:.2e}, retrying");
                lambda *= DAMPING_GROWTH;
                attempt += 1;
            }
            result => return result.map(|value| (value, lambda)),
        }
    }
}

pub use cholesky::SparseCholeskySolver;
pub use qr::SparseQRSolver;

/// Construct the solver matching `solver_type`.
pub fn create_linear_solver(solver_type: LinearSolverType) -> Box<dyn SparseLinearSolver> {
    match solver_type {
        LinearSolverType::SparseCholesky => Box::new(SparseCholeskySolver::new()),
        LinearSolverType::SparseQR => Box::new(SparseQRSolver::new()),
    }
}

/// Form `J^T * J`.
pub fn normal_matrix(jacobian: &SparseColMat<usize, f64>) -> LinAlgResult<SparseColMat<usize, f64>> {
    let jt = jacobian.as_ref().transpose();
    Ok(jt
        .to_col_major()
        .map_err(|e| {
            LinAlgError::MatrixConversion(
                "Failed to convert transposed Jacobian to column-major format".to_string(),
            )
            .log_with_source(e)
        })?
        .mul(jacobian.as_ref()))
}

/// Return `A + λI` for a square sparse `A`.
pub fn add_diagonal(
    matrix: &SparseColMat<usize, f64>,
    lambda: f64,
) -> LinAlgResult<SparseColMat<usize, f64>> {
    let n = matrix.ncols();
    let triplets: Vec<Triplet<usize, usize, f64>> =
        (0..n).map(|i| Triplet::new(i, i, lambda)).collect();
    let lambda_i = SparseColMat::try_new_from_triplets(n, n, &triplets).map_err(|e| {
        LinAlgError::SparseMatrixCreation("Failed to create lambda*I matrix".to_string())
            .log_with_source(e)
    })?;
    Ok(matrix + lambda_i)
}

/// Reject a right-hand side whose row count does not match the square system.
pub(crate) fn check_rhs(matrix: &SparseColMat<usize, f64>, rhs: &Mat<f64>) -> LinAlgResult<()> {
    if matrix.nrows() != rhs.nrows() {
        return Err(LinAlgError::DimensionMismatch(format!(
            "System of size {} with right-hand side of {} rows",
            matrix.nrows(),
            rhs.nrows()
        ))
        .log());
    }
    Ok(())
}

/// L2 norm of every column.
pub fn column_norms(matrix: &SparseColMat<usize, f64>) -> Vec<f64> {
    let mut squared = vec![0.0; matrix.ncols()];
    for t in matrix.triplet_iter() {
        squared[t.col] += t.val * t.val;
    }
    squared.into_iter().map(f64::sqrt).collect()
}

/// Return `A * diag(scales)`.
pub fn scale_columns(
    matrix: &SparseColMat<usize, f64>,
    scales: &[f64],
) -> LinAlgResult<SparseColMat<usize, f64>> {
    if scales.len() != matrix.ncols() {
        return Err(LinAlgError::DimensionMismatch(format!(
            "{} column scales for a matrix with {} columns",
            scales.len(),
            matrix.ncols()
        ))
        .log());
    }
    let triplets: Vec<Triplet<usize, usize, f64>> = matrix
        .triplet_iter()
        .map(|t| Triplet::new(t.row, t.col, t.val * scales[t.col]))
        .collect();
    SparseColMat::try_new_from_triplets(matrix.nrows(), matrix.ncols(), &triplets).map_err(|e| {
        LinAlgError::SparseMatrixCreation("Failed to create column-scaled matrix".to_string())
            .log_with_source(e)
    })
}

/// Split `A = [A_left | A_right]` at column `at`, keeping the left block sparse and
/// densifying the right block.
pub fn split_columns(
    matrix: &SparseColMat<usize, f64>,
    at: usize,
) -> LinAlgResult<(SparseColMat<usize, f64>, Mat<f64>)> {
    if at > matrix.ncols() {
        return Err(LinAlgError::DimensionMismatch(format!(
            "Cannot split {} columns at {}",
            matrix.ncols(),
            at
        ))
        .log());
    }
    let mut left = Vec::new();
    let mut right = Mat::zeros(matrix.nrows(), matrix.ncols() - at);
    for t in matrix.triplet_iter() {
        if t.col < at {
            left.push(Triplet::new(t.row, t.col, *t.val));
        } else {
            right[(t.row, t.col - at)] += *t.val;
        }
    }
    let left = SparseColMat::try_new_from_triplets(matrix.nrows(), at, &left).map_err(|e| {
        LinAlgError::SparseMatrixCreation("Failed to create left column block".to_string())
            .log_with_source(e)
    })?;
    Ok((left, right))
}

/// Bytes held by a compressed sparse column matrix (values, row indices, column pointers).
pub fn sparse_memory_bytes(matrix: &SparseColMat<usize, f64>) -> usize {
    let nnz = matrix.symbolic().compute_nnz();
    nnz * (std::mem::size_of::<f64>() + std::mem::size_of::<usize>())
        + (matrix.ncols() + 1) * std::mem::size_of::<usize>()
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn sample() -> Result<SparseColMat<usize, f64>, faer::sparse::CreationError> {
        let triplets = vec![
            Triplet::new(0, 0, 3.0),
            Triplet::new(1, 0, 4.0),
            Triplet::new(1, 1, 2.0),
            Triplet::new(2, 2, -1.0),
            Triplet::new(0, 2, 1.0),
        ];
        SparseColMat::try_new_from_triplets(3, 3, &triplets)
    }

    #[test]
    fn test_column_norms() -> TestResult {
        let norms = column_norms(&sample()?);
        assert!((norms[0] - 5.0).abs() < 1e-12);
        assert!((norms[1] - 2.0).abs() < 1e-12);
        assert!((norms[2] - 2.0_f64.sqrt()).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_scale_columns() -> TestResult {
        let scaled = scale_columns(&sample()?, &[0.2, 0.5, 1.0])?.to_dense();
        assert!((scaled[(0, 0)] - 0.6).abs() < 1e-12);
        assert!((scaled[(1, 0)] - 0.8).abs() < 1e-12);
        assert!((scaled[(1, 1)] - 1.0).abs() < 1e-12);
        assert!((scaled[(2, 2)] + 1.0).abs() < 1e-12);

        assert!(scale_columns(&sample()?, &[1.0]).is_err());
        Ok(())
    }

    #[test]
    fn test_split_columns() -> TestResult {
        let (left, right) = split_columns(&sample()?, 2)?;
        assert_eq!(left.ncols(), 2);
        assert_eq!(right.ncols(), 1);
        assert_eq!(right[(0, 0)], 1.0);
        assert_eq!(right[(2, 0)], -1.0);
        assert_eq!(left.to_dense()[(1, 1)], 2.0);

        let (all, none) = split_columns(&sample()?, 3)?;
        assert_eq!(all.ncols(), 3);
        assert_eq!(none.ncols(), 0);
        Ok(())
    }

    #[test]
    fn test_normal_matrix_and_diagonal() -> TestResult {
        let h = add_diagonal(&normal_matrix(&sample()?)?, 0.5)?.to_dense();
        // column 0 = [3, 4, 0] -> 25 + 0.5
        assert!((h[(0, 0)] - 25.5).abs() < 1e-12);
        // col0 . col1 = 4 * 2
        assert!((h[(0, 1)] - 8.0).abs() < 1e-12);
        assert!((h[(1, 0)] - 8.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_relative_damping_follows_largest_column() -> TestResult {
        // largest column norm is 5
        let lambda = relative_damping(&sample()?, 1e-10);
        assert!((lambda - 25e-10).abs() < 1e-20);

        let small = SparseColMat::try_new_from_triplets(1, 1, &[Triplet::new(0, 0, 1e-3)])?;
        assert_eq!(relative_damping(&small, 1e-10), 1e-10);
        assert_eq!(relative_damping(&small, 0.0), f64::EPSILON);
        Ok(())
    }

    #[test]
    fn test_damping_grows_until_solvable() -> TestResult {
        let mut tried = Vec::new();
        let (value, lambda) = solve_with_damping(1e-10, |lambda| {
            tried.push(lambda);
            if lambda < 1e-5 {
                Err(LinAlgError::SingularMatrix)
            } else {
                Ok(lambda * 2.0)
            }
        })?;

        assert_eq!(tried.len(), 3);
        assert!((lambda - 1e-4).abs() < 1e-16);
        assert_eq!(value, lambda * 2.0);
        Ok(())
    }

    #[test]
    fn test_damping_gives_up_after_last_attempt() {
        let mut attempts = 0;
        let result: LinAlgResult<(f64, f64)> = solve_with_damping(1.0, |_| {
            attempts += 1;
            Err(LinAlgError::SingularMatrix)
        });
        assert!(matches!(result, Err(LinAlgError::SingularMatrix)));
        assert_eq!(attempts, MAX_DAMPING_ATTEMPTS);

        // only singular systems are retried
        let mut attempts = 0;
        let result: LinAlgResult<(f64, f64)> = solve_with_damping(1.0, |_| {
            attempts += 1;
            Err(LinAlgError::DimensionMismatch("rhs".into()))
        });
        assert!(matches!(result, Err(LinAlgError::DimensionMismatch(_))));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_sparse_memory_bytes() -> TestResult {
        let bytes = sparse_memory_bytes(&sample()?);
        assert_eq!(bytes, 5 * 16 + 4 * 8);
        Ok(())
    }
}
