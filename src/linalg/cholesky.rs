use faer::{
    Mat, Side,
    linalg::solvers::Solve,
    sparse::SparseColMat,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
};
use std::ops::Mul;
use tracing::debug;

use crate::linalg::{
    LinAlgError, LinAlgResult, SparseLinearSolver, add_diagonal, check_rhs, normal_matrix,
};

#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver {
    /// Cached symbolic factorization, reused while the sparsity pattern is unchanged.
    ///
    /// A solver instance is created per optimization run, so the pattern is fixed for its
    /// whole lifetime.
    symbolic_factorization: Option<SymbolicLlt<usize>>,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn factorize(&mut self, matrix: &SparseColMat<usize, f64>) -> LinAlgResult<Llt<usize, f64>> {
        let symbolic = match &self.symbolic_factorization {
            Some(cached) => cached.clone(),
            None => {
                let fresh = symbolic_llt(matrix)?;
                self.symbolic_factorization = Some(fresh.clone());
                fresh
            }
        };
        numeric_llt(symbolic, matrix)
    }
}

fn symbolic_llt(matrix: &SparseColMat<usize, f64>) -> LinAlgResult<SymbolicLlt<usize>> {
    SymbolicLlt::try_new(matrix.symbolic(), Side::Lower).map_err(|e| {
        LinAlgError::FactorizationFailed("Symbolic Cholesky analysis failed".to_string())
            .log_with_source(e)
    })
}

fn numeric_llt(
    symbolic: SymbolicLlt<usize>,
    matrix: &SparseColMat<usize, f64>,
) -> LinAlgResult<Llt<usize, f64>> {
    // callers decide whether a singular system is an error
    Llt::try_new_with_symbolic(symbolic, matrix.as_ref(), Side::Lower).map_err(|e| {
        debug!("Numeric Cholesky factorization failed: {e:?}");
        LinAlgError::SingularMatrix
    })
}

impl SparseLinearSolver for SparseCholeskySolver {
    /// Solves `(J^T J + λI) dx = -J^T r`.
    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
        lambda: f64,
    ) -> LinAlgResult<Mat<f64>> {
        let jtj = normal_matrix(jacobians)?;
        let jtr = jacobians.as_ref().transpose().mul(residuals);
        // the diagonal is always stored so the cached symbolic pattern fits every λ
        let shifted = add_diagonal(&jtj, lambda)?;

        Ok(self.factorize(&shifted)?.solve(-&jtr))
    }

    fn solve_symmetric(
        &mut self,
        matrix: &SparseColMat<usize, f64>,
        rhs: &Mat<f64>,
    ) -> LinAlgResult<Mat<f64>> {
        check_rhs(matrix, rhs)?;
        let llt = numeric_llt(symbolic_llt(matrix)?, matrix)?;
        Ok(llt.solve(rhs))
    }
}
