use faer::{
    Mat,
    linalg::solvers::Solve,
    sparse::SparseColMat,
    sparse::linalg::solvers::{Qr, SymbolicQr},
};
use std::ops::Mul;
use tracing::debug;

use crate::linalg::{
    LinAlgError, LinAlgResult, SparseLinearSolver, add_diagonal, check_rhs, normal_matrix,
};

/// Solves the normal equations through a sparse QR factorization of `J^T J (+ λI)`.
///
/// Slower than [`SparseCholeskySolver`](super::SparseCholeskySolver) but tolerates
/// numerically semi-definite systems.
#[derive(Debug, Clone, Default)]
pub struct SparseQRSolver {
    /// Symbolic structure of the first system solved; the diagonal shift keeps the pattern.
    symbolic_factorization: Option<SymbolicQr<usize>>,
}

impl SparseQRSolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn factorize(&mut self, matrix: &SparseColMat<usize, f64>) -> LinAlgResult<Qr<usize, f64>> {
        let symbolic = match &self.symbolic_factorization {
            Some(cached) => cached.clone(),
            None => {
                let fresh = symbolic_qr(matrix)?;
                self.symbolic_factorization = Some(fresh.clone());
                fresh
            }
        };
        numeric_qr(symbolic, matrix)
    }
}

fn symbolic_qr(matrix: &SparseColMat<usize, f64>) -> LinAlgResult<SymbolicQr<usize>> {
    SymbolicQr::try_new(matrix.symbolic()).map_err(|e| {
        LinAlgError::FactorizationFailed("Symbolic QR analysis failed".to_string())
            .log_with_source(e)
    })
}

fn numeric_qr(
    symbolic: SymbolicQr<usize>,
    matrix: &SparseColMat<usize, f64>,
) -> LinAlgResult<Qr<usize, f64>> {
    Qr::try_new_with_symbolic(symbolic, matrix.as_ref()).map_err(|e| {
        debug!("Numeric QR factorization failed: {e:?}");
        LinAlgError::SingularMatrix
    })
}

impl SparseLinearSolver for SparseQRSolver {
    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
        lambda: f64,
    ) -> LinAlgResult<Mat<f64>> {
        let jtj = normal_matrix(jacobians)?;
        let jtr = jacobians.as_ref().transpose().mul(residuals);
        let shifted = add_diagonal(&jtj, lambda)?;

        Ok(self.factorize(&shifted)?.solve(-&jtr))
    }

    fn solve_symmetric(
        &mut self,
        matrix: &SparseColMat<usize, f64>,
        rhs: &Mat<f64>,
    ) -> LinAlgResult<Mat<f64>> {
        check_rhs(matrix, rhs)?;
        let qr = numeric_qr(symbolic_qr(matrix)?, matrix)?;
        Ok(qr.solve(rhs))
    }
}
