//! Accumulated problem: the union of all accepted batches and its sparse linearization.
//!
//! The `AccumulatedProblem` owns every design variable referenced by an accepted batch and
//! exposes the stacked residual vector and sparse Jacobian to the solver.
//!
//! # Storage
//!
//! Variables live in an arena of slots addressed by stable [`VariableId`]s. A name→id map
//! resolves the keys used by error terms, and each slot carries a reference count: the number of
//! accepted batches that declare or reference the variable. A variable shared by several batches
//! is stored once; removing a batch releases only the slots whose count drops to zero. Released
//! ids go on a free list and are handed out again before the arena grows.
//!
//! ```text
//! batches:  [B0] ----- [B1] ----- [B2]
//!             \         |          /
//! slots:   x0(1)     c(3)      x1(1) x2(1)
//! ```
//!
//! # Column layout
//!
//! Columns are assigned by [`ColumnLayout`]: variables outside the trailing group first, the
//! trailing group last, each in slot order. Placing the marginalized group last keeps
//! its Jacobian columns contiguous, so its Schur complement can be formed from `[J_n | J_m]`.
//!
//! # Rollback
//!
//! [`AccumulatedProblem::checkpoint`] captures slots, the free list, batches and layout;
//! [`AccumulatedProblem::rollback`] restores them exactly. The estimator uses this pair to
//! undo a tentatively appended batch that it decided to reject.
//!
//! # Example
//!
//! ```
//! use incremental_calibration::core::batch::Batch;
//! use incremental_calibration::core::error_term::ErrorTerm;
//! use incremental_calibration::core::problem::AccumulatedProblem;
//! use incremental_calibration::core::variable::DesignVariable;
//! use incremental_calibration::factors::PriorFactor;
//! use nalgebra::dvector;
//! # use incremental_calibration::error::CalibrationResult;
//! # fn example() -> CalibrationResult<()> {
//!
//! let batch = Batch::new()
//!     .with_design_variable(DesignVariable::new("c", 0, dvector![0.0]))
//!     .with_design_variable(DesignVariable::new("x0", 1, dvector![0.0]))
//!     .with_error_term(ErrorTerm::new(&["c"], Box::new(PriorFactor::new(dvector![1.0]))))
//!     .with_error_term(ErrorTerm::new(&["x0"], Box::new(PriorFactor::new(dvector![2.0]))));
//!
//! let mut problem = AccumulatedProblem::new();
//! let index = problem.append(batch.into_handle())?;
//! problem.order_group_last(0);
//!
//! assert_eq!(index, 0);
//! assert_eq!(problem.layout().marginal_start(), 1);
//! assert_eq!(problem.layout().marginal_dim(), 1);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use faer::{
    Mat, MatRef,
    sparse::{Argsort, Pair, SparseColMat, SymbolicSparseColMat},
};
use nalgebra::DVector;
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::core::{
    CoreError, CoreResult,
    batch::{Batch, BatchHandle},
    error_term::ErrorTerm,
    variable::DesignVariable,
};

/// Stable index of a variable slot in the arena.
pub type VariableId = usize;

/// Symbolic structure for sparse Jacobian assembly.
///
/// Contains the sparsity pattern and the argsort order mapping the linearization's value stream
/// onto the compressed column storage. Valid for one column layout and one set of batches.
pub struct SymbolicStructure {
    pub pattern: SymbolicSparseColMat<usize>,
    pub order: Argsort<usize>,
}

#[derive(Debug, Clone)]
struct VariableSlot {
    variable: DesignVariable,
    ref_count: usize,
}

/// Column assignment of the stored variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnLayout {
    order: Vec<VariableId>,
    offsets: Vec<Option<usize>>,
    total_dof: usize,
    trailing_group: Option<usize>,
    marginal_start: usize,
}

impl ColumnLayout {
    /// Variable ids in column order.
    pub fn order(&self) -> &[VariableId] {
        &self.order
    }

    /// First column of the variable, if it is stored.
    pub fn offset_of(&self, id: VariableId) -> Option<usize> {
        self.offsets.get(id).copied().flatten()
    }

    /// Total number of Jacobian columns.
    pub fn total_dof(&self) -> usize {
        self.total_dof
    }

    /// Group currently placed at the end of the layout.
    pub fn trailing_group(&self) -> Option<usize> {
        self.trailing_group
    }

    /// First column of the trailing group block.
    pub fn marginal_start(&self) -> usize {
        self.marginal_start
    }

    /// Number of columns in the trailing group block.
    pub fn marginal_dim(&self) -> usize {
        self.total_dof - self.marginal_start
    }
}

/// Exact snapshot of the problem used to undo a tentative append.
#[derive(Debug, Clone)]
pub struct ProblemCheckpoint {
    batches: Vec<BatchHandle>,
    slots: Vec<Option<VariableSlot>>,
    free_slots: Vec<VariableId>,
    layout: ColumnLayout,
}

impl ProblemCheckpoint {
    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }
}

/// Ordered, append/remove-capable collection of accepted batches.
#[derive(Debug, Default)]
pub struct AccumulatedProblem {
    batches: Vec<BatchHandle>,
    slots: Vec<Option<VariableSlot>>,
    /// Released slot ids, reused last-in first-out.
    free_slots: Vec<VariableId>,
    variable_ids: HashMap<String, VariableId>,
    layout: ColumnLayout,
    total_residual_dimension: usize,
}

impl AccumulatedProblem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn batches(&self) -> &[BatchHandle] {
        &self.batches
    }

    pub fn batch(&self, index: usize) -> Option<&BatchHandle> {
        self.batches.get(index)
    }

    /// Index of the batch sharing the handle's allocation, if it is accumulated.
    pub fn position_of(&self, handle: &BatchHandle) -> Option<usize> {
        self.batches.iter().position(|b| Arc::ptr_eq(b, handle))
    }

    /// Number of live design variables.
    pub fn num_variables(&self) -> usize {
        self.variable_ids.len()
    }

    /// Number of allocated slots, live or free.
    pub fn slot_capacity(&self) -> usize {
        self.slots.len()
    }

    /// Total dimension of the stacked residual vector.
    pub fn total_residual_dimension(&self) -> usize {
        self.total_residual_dimension
    }

    pub fn layout(&self) -> &ColumnLayout {
        &self.layout
    }

    pub fn variable(&self, name: &str) -> Option<&DesignVariable> {
        self.variable_ids
            .get(name)
            .and_then(|&id| self.slots.get(id))
            .and_then(|slot| slot.as_ref())
            .map(|slot| &slot.variable)
    }

    /// Reference count of a stored variable (number of accepted batches using it).
    pub fn reference_count(&self, name: &str) -> Option<usize> {
        self.variable_ids
            .get(name)
            .and_then(|&id| self.slots.get(id))
            .and_then(|slot| slot.as_ref())
            .map(|slot| slot.ref_count)
    }

    /// All live design variables in slot order.
    pub fn design_variables(&self) -> Vec<&DesignVariable> {
        self.slots
            .iter()
            .flatten()
            .map(|slot| &slot.variable)
            .collect()
    }

    /// Live design variables belonging to `group_id`, in slot order.
    pub fn design_variables_in_group(&self, group_id: usize) -> Vec<&DesignVariable> {
        self.slots
            .iter()
            .flatten()
            .map(|slot| &slot.variable)
            .filter(|v| v.group_id == group_id)
            .collect()
    }

    /// Number of columns occupied by `group_id`.
    pub fn group_dimension(&self, group_id: usize) -> usize {
        self.design_variables_in_group(group_id)
            .iter()
            .map(|v| v.get_size())
            .sum()
    }

    /// All error terms, batch by batch, in insertion order.
    pub fn error_terms(&self) -> Vec<&ErrorTerm> {
        self.batches
            .iter()
            .flat_map(|b| b.error_terms().iter())
            .collect()
    }

    /// Append a batch and return its index.
    ///
    /// The batch is validated against itself and against the stored variables before anything
    /// is mutated, so a failed append leaves the problem untouched.
    pub fn append(&mut self, batch: BatchHandle) -> CoreResult<usize> {
        batch.validate()?;

        for variable in batch.design_variables() {
            if let Some(stored) = self.variable(&variable.name)
                && !stored.is_compatible_with(variable)
            {
                return Err(CoreError::Variable(format!(
                    "Design variable '{}' redeclared with group {} and size {}, stored with group {} and size {}",
                    variable.name,
                    variable.group_id,
                    variable.get_size(),
                    stored.group_id,
                    stored.get_size()
                ))
                .log());
            }
        }

        let declared: HashMap<&str, usize> = batch
            .design_variables()
            .iter()
            .map(|v| (v.name.as_str(), v.get_size()))
            .collect();
        for term in batch.error_terms() {
            let sizes = term
                .variable_key_list
                .iter()
                .map(|key| {
                    declared
                        .get(key.as_str())
                        .copied()
                        .or_else(|| self.variable(key).map(|v| v.get_size()))
                        .ok_or_else(|| CoreError::UnknownVariable(key.clone()).log())
                })
                .collect::<CoreResult<Vec<usize>>>()?;
            term.check_variable_sizes(&sizes)?;
        }

        for name in Self::referenced_names(&batch) {
            match self.variable_ids.get(name) {
                Some(&id) => {
                    if let Some(slot) = self.slots[id].as_mut() {
                        slot.ref_count += 1;
                    }
                }
                None => {
                    if let Some(variable) =
                        batch.design_variables().iter().find(|v| v.name == name)
                    {
                        let slot = Some(VariableSlot {
                            variable: variable.clone(),
                            ref_count: 1,
                        });
                        let id = match self.free_slots.pop() {
                            Some(id) => {
                                self.slots[id] = slot;
                                id
                            }
                            None => {
                                self.slots.push(slot);
                                self.slots.len() - 1
                            }
                        };
                        self.variable_ids.insert(name.to_string(), id);
                    }
                }
            }
        }

        self.batches.push(batch);
        self.refresh();
        Ok(self.batches.len() - 1)
    }

    /// Remove the batch at `index`; later batches shift down by one.
    ///
    /// Variables no longer referenced by any accumulated batch are released.
    pub fn remove(&mut self, index: usize) -> CoreResult<BatchHandle> {
        if index >= self.batches.len() {
            return Err(CoreError::BatchIndex {
                index,
                num_batches: self.batches.len(),
            }
            .log());
        }

        let batch = self.batches.remove(index);
        for name in Self::referenced_names(&batch) {
            if let Some(&id) = self.variable_ids.get(name) {
                let released = match self.slots[id].as_mut() {
                    Some(slot) => {
                        slot.ref_count = slot.ref_count.saturating_sub(1);
                        slot.ref_count == 0
                    }
                    None => false,
                };
                if released {
                    self.slots[id] = None;
                    self.free_slots.push(id);
                    self.variable_ids.remove(name);
                }
            }
        }

        self.refresh();
        Ok(batch)
    }

    /// Place the variables of `group_id` at the end of the column layout.
    pub fn order_group_last(&mut self, group_id: usize) {
        self.layout.trailing_group = Some(group_id);
        self.rebuild_layout();
    }

    pub fn checkpoint(&self) -> ProblemCheckpoint {
        ProblemCheckpoint {
            batches: self.batches.clone(),
            slots: self.slots.clone(),
            free_slots: self.free_slots.clone(),
            layout: self.layout.clone(),
        }
    }

    /// Restore batches, variable values, reference counts and layout from a checkpoint.
    pub fn rollback(&mut self, checkpoint: ProblemCheckpoint) {
        self.batches = checkpoint.batches;
        self.slots = checkpoint.slots;
        self.free_slots = checkpoint.free_slots;
        self.layout = checkpoint.layout;
        self.variable_ids = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|s| (s.variable.name.clone(), id)))
            .collect();
        self.total_residual_dimension = self.batches.iter().map(|b| b.residual_dimension()).sum();
    }

    /// Current values in column order.
    pub fn values(&self) -> Vec<DVector<f64>> {
        self.layout
            .order
            .iter()
            .filter_map(|&id| self.slots[id].as_ref())
            .map(|slot| slot.variable.to_vector())
            .collect()
    }

    /// Overwrite values in column order, as produced by [`AccumulatedProblem::values`].
    pub fn set_values(&mut self, values: &[DVector<f64>]) -> CoreResult<()> {
        if values.len() != self.layout.order.len() {
            return Err(CoreError::DimensionMismatch(format!(
                "Expected {} variable values, got {}",
                self.layout.order.len(),
                values.len()
            ))
            .log());
        }
        for (&id, value) in self.layout.order.iter().zip(values) {
            if let Some(slot) = self.slots[id].as_mut() {
                slot.variable.set_value(value.clone());
            }
        }
        Ok(())
    }

    /// Add a stacked step (one block per variable, in column order) to the stored values.
    ///
    /// Returns the L2 norm of the step.
    pub fn apply_step(&mut self, step: MatRef<f64>) -> f64 {
        for &id in &self.layout.order {
            if let (Some(offset), Some(slot)) = (self.layout.offset_of(id), self.slots[id].as_mut())
            {
                let size = slot.variable.get_size();
                slot.variable.apply_step(step.subrows(offset, size));
            }
        }
        step.norm_l2()
    }

    /// L2 norm of the stacked parameter vector.
    pub fn parameter_norm(&self) -> f64 {
        self.slots
            .iter()
            .flatten()
            .map(|slot| slot.variable.value.norm_squared())
            .sum::<f64>()
            .sqrt()
    }

    /// Build the Jacobian sparsity pattern for the current layout.
    ///
    /// Every error term contributes a dense `dim × size` block per connected variable, at the
    /// term's row offset and the variable's column offset.
    pub fn build_symbolic_structure(&self) -> CoreResult<SymbolicStructure> {
        let mut indices = Vec::<Pair<usize, usize>>::new();

        for (term, row_start) in self.term_rows() {
            for key in &term.variable_key_list {
                let (offset, size) = self.column_block(key)?;
                for row in 0..term.get_dimension() {
                    for col in 0..size {
                        indices.push(Pair::new(row_start + row, offset + col));
                    }
                }
            }
        }

        let (pattern, order) = SymbolicSparseColMat::try_new_from_indices(
            self.total_residual_dimension,
            self.layout.total_dof,
            &indices,
        )
        .map_err(|e| {
            CoreError::SymbolicStructure(
                "Failed to build symbolic sparse matrix structure".to_string(),
            )
            .log_with_source(e)
        })?;

        Ok(SymbolicStructure { pattern, order })
    }

    /// Stacked residual vector at the current values.
    pub fn compute_residual(&self) -> CoreResult<Mat<f64>> {
        let terms = self.term_rows();

        #[cfg(feature = "parallel")]
        let blocks: CoreResult<Vec<DVector<f64>>> = terms
            .par_iter()
            .map(|(term, _)| term.residual(&self.term_params(term)?))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let blocks: CoreResult<Vec<DVector<f64>>> = terms
            .iter()
            .map(|(term, _)| term.residual(&self.term_params(term)?))
            .collect();

        let mut residual = Mat::zeros(self.total_residual_dimension, 1);
        for ((_, row_start), block) in terms.iter().zip(blocks?) {
            for (i, value) in block.iter().enumerate() {
                residual[(row_start + i, 0)] = *value;
            }
        }
        Ok(residual)
    }

    /// Stacked residual vector and sparse Jacobian at the current values.
    ///
    /// Error terms are evaluated independently (in parallel with the `parallel` feature) and
    /// assembled in a fixed order, so the result does not depend on scheduling.
    pub fn compute_residual_and_jacobian(
        &self,
        symbolic_structure: &SymbolicStructure,
    ) -> CoreResult<(Mat<f64>, SparseColMat<usize, f64>)> {
        let terms = self.term_rows();

        #[cfg(feature = "parallel")]
        let blocks: CoreResult<Vec<(DVector<f64>, Vec<f64>)>> = terms
            .par_iter()
            .map(|(term, _)| self.linearize_term(term))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let blocks: CoreResult<Vec<(DVector<f64>, Vec<f64>)>> = terms
            .iter()
            .map(|(term, _)| self.linearize_term(term))
            .collect();

        let mut residual = Mat::zeros(self.total_residual_dimension, 1);
        let mut jacobian_values = Vec::with_capacity(symbolic_structure.pattern.compute_nnz());
        for ((_, row_start), (block_residual, mut block_values)) in terms.iter().zip(blocks?) {
            for (i, value) in block_residual.iter().enumerate() {
                residual[(row_start + i, 0)] = *value;
            }
            jacobian_values.append(&mut block_values);
        }

        let jacobian = SparseColMat::new_from_argsort(
            symbolic_structure.pattern.clone(),
            &symbolic_structure.order,
            jacobian_values.as_slice(),
        )
        .map_err(|e| {
            CoreError::SymbolicStructure(
                "Failed to create sparse Jacobian from argsort".to_string(),
            )
            .log_with_source(e)
        })?;

        Ok((residual, jacobian))
    }

    /// Build the structure and linearize in one call.
    pub fn linearize(&self) -> CoreResult<(Mat<f64>, SparseColMat<usize, f64>)> {
        let structure = self.build_symbolic_structure()?;
        self.compute_residual_and_jacobian(&structure)
    }

    /// Names a batch keeps alive: its declared variables, then any further keys its terms use.
    fn referenced_names(batch: &Batch) -> Vec<&str> {
        let mut seen = HashSet::new();
        let declared = batch.design_variables().iter().map(|v| v.name.as_str());
        let referenced = batch
            .error_terms()
            .iter()
            .flat_map(|t| t.variable_key_list.iter().map(|k| k.as_str()));
        declared
            .chain(referenced)
            .filter(|name| seen.insert(*name))
            .collect()
    }

    fn refresh(&mut self) {
        self.total_residual_dimension = self.batches.iter().map(|b| b.residual_dimension()).sum();
        self.rebuild_layout();
    }

    fn rebuild_layout(&mut self) {
        let group = self.layout.trailing_group;
        let mut head = Vec::new();
        let mut tail = Vec::new();
        for (id, slot) in self.slots.iter().enumerate() {
            if let Some(slot) = slot {
                if Some(slot.variable.group_id) == group {
                    tail.push(id);
                } else {
                    head.push(id);
                }
            }
        }

        let mut offsets = vec![None; self.slots.len()];
        let mut column = 0;
        let mut marginal_start = 0;
        for (position, &id) in head.iter().chain(tail.iter()).enumerate() {
            if position == head.len() {
                marginal_start = column;
            }
            offsets[id] = Some(column);
            if let Some(slot) = &self.slots[id] {
                column += slot.variable.get_size();
            }
        }
        if tail.is_empty() {
            marginal_start = column;
        }

        head.extend(tail);
        self.layout = ColumnLayout {
            order: head,
            offsets,
            total_dof: column,
            trailing_group: group,
            marginal_start,
        };
    }

    /// Error terms paired with their first residual row.
    fn term_rows(&self) -> Vec<(&ErrorTerm, usize)> {
        let mut row = 0;
        let mut rows = Vec::new();
        for term in self.batches.iter().flat_map(|b| b.error_terms().iter()) {
            rows.push((term, row));
            row += term.get_dimension();
        }
        rows
    }

    fn column_block(&self, key: &str) -> CoreResult<(usize, usize)> {
        let id = *self
            .variable_ids
            .get(key)
            .ok_or_else(|| CoreError::UnknownVariable(key.to_string()).log())?;
        let size = self.slots[id]
            .as_ref()
            .map(|slot| slot.variable.get_size())
            .ok_or_else(|| CoreError::UnknownVariable(key.to_string()).log())?;
        let offset = self.layout.offset_of(id).ok_or_else(|| {
            CoreError::Variable(format!("Missing key {key} in variable-to-column mapping")).log()
        })?;
        Ok((offset, size))
    }

    fn term_params(&self, term: &ErrorTerm) -> CoreResult<Vec<DVector<f64>>> {
        term.variable_key_list
            .iter()
            .map(|key| {
                self.variable(key)
                    .map(|v| v.to_vector())
                    .ok_or_else(|| CoreError::UnknownVariable(key.clone()).log())
            })
            .collect()
    }

    /// Residual and row-major-per-variable Jacobian values of one term, in pattern order.
    fn linearize_term(&self, term: &ErrorTerm) -> CoreResult<(DVector<f64>, Vec<f64>)> {
        let params = self.term_params(term)?;
        let (residual, jacobian) = term.residual_and_jacobian(&params)?;

        let mut values = Vec::with_capacity(jacobian.nrows() * jacobian.ncols());
        let mut local_col = 0;
        for param in &params {
            let size = param.len();
            for row in 0..jacobian.nrows() {
                for col in 0..size {
                    values.push(jacobian[(row, local_col + col)]);
                }
            }
            local_col += size;
        }
        Ok((residual, values))
    }
}
