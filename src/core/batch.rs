//! Batches: atomic bundles of design variables and error terms.
//!
//! A batch is built by the caller and submitted once to the estimator. If it is accepted, the
//! accumulated problem keeps a shared handle to it until it is explicitly removed; if it is
//! rejected, every trace of it is dropped.
//!
//! Error terms may reference variables declared by the batch itself or variables already
//! stored in the accumulated problem (for example the calibration parameters shared by every
//! batch). A batch that re-declares an existing variable shares it: the stored value wins.
//!
//! # Example
//!
//! ```
//! use incremental_calibration::core::batch::Batch;
//! use incremental_calibration::core::error_term::ErrorTerm;
//! use incremental_calibration::core::variable::DesignVariable;
//! use incremental_calibration::factors::PriorFactor;
//! use nalgebra::dvector;
//!
//! let mut batch = Batch::new();
//! batch.add_design_variable(DesignVariable::new("x0", 1, dvector![0.0, 0.0]));
//! batch.add_error_term(ErrorTerm::new(&["x0"], Box::new(PriorFactor::new(dvector![1.0, 2.0]))));
//!
//! assert_eq!(batch.num_design_variables(), 1);
//! assert_eq!(batch.num_error_terms(), 1);
//! assert!(!batch.is_empty());
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use crate::core::{CoreError, CoreResult, error_term::ErrorTerm, variable::DesignVariable};

/// Shared handle to an accepted batch; identity is pointer identity.
pub type BatchHandle = Arc<Batch>;

#[derive(Debug, Default)]
pub struct Batch {
    design_variables: Vec<DesignVariable>,
    error_terms: Vec<ErrorTerm>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_design_variable(&mut self, variable: DesignVariable) {
        self.design_variables.push(variable);
    }

    pub fn add_error_term(&mut self, error_term: ErrorTerm) {
        self.error_terms.push(error_term);
    }

    /// Builder-style variant of [`Batch::add_design_variable`].
    pub fn with_design_variable(mut self, variable: DesignVariable) -> Self {
        self.add_design_variable(variable);
        self
    }

    /// Builder-style variant of [`Batch::add_error_term`].
    pub fn with_error_term(mut self, error_term: ErrorTerm) -> Self {
        self.add_error_term(error_term);
        self
    }

    pub fn design_variables(&self) -> &[DesignVariable] {
        &self.design_variables
    }

    pub fn error_terms(&self) -> &[ErrorTerm] {
        &self.error_terms
    }

    pub fn num_design_variables(&self) -> usize {
        self.design_variables.len()
    }

    pub fn num_error_terms(&self) -> usize {
        self.error_terms.len()
    }

    /// True when the batch carries neither design variables nor error terms.
    pub fn is_empty(&self) -> bool {
        self.design_variables.is_empty() && self.error_terms.is_empty()
    }

    /// Total residual dimension contributed by the batch.
    pub fn residual_dimension(&self) -> usize {
        self.error_terms.iter().map(|t| t.get_dimension()).sum()
    }

    pub fn into_handle(self) -> BatchHandle {
        Arc::new(self)
    }

    /// Checks that only need the batch itself: unique variable names and non-empty term arity.
    pub fn validate(&self) -> CoreResult<()> {
        let mut seen = HashSet::new();
        for variable in &self.design_variables {
            if !seen.insert(variable.name.as_str()) {
                return Err(CoreError::Variable(format!(
                    "Design variable '{}' declared twice in one batch",
                    variable.name
                ))
                .log());
            }
        }

        for term in &self.error_terms {
            if term.variable_key_list.is_empty() {
                return Err(CoreError::ErrorTerm(
                    "Error term does not reference any design variable".to_string(),
                )
                .log());
            }
        }

        Ok(())
    }
}
