//! Design variables: named Euclidean parameter blocks tagged with a group id.
//!
//! Every design variable belongs to exactly one integer group. The estimator designates one
//! group as the marginalized group; its columns are kept trailing in the Jacobian so their
//! marginal statistics can be extracted cheaply.
//!
//! Updates are additive:
//!
//! ```text
//! x_new = x_old + δx
//! ```
//!
//! # Example
//!
//! ```
//! use incremental_calibration::core::variable::DesignVariable;
//! use nalgebra::dvector;
//!
//! let mut scale = DesignVariable::new("odometry_scale", 0, dvector![1.0, 0.0]);
//! assert_eq!(scale.get_size(), 2);
//!
//! scale.update_variable(&dvector![0.1, -0.2]);
//! assert!((scale.value[0] - 1.1).abs() < 1e-12);
//! ```

use faer::MatRef;
use nalgebra::DVector;

/// A named parameter block owned by the accumulated problem once its batch is accepted.
#[derive(Clone, Debug, PartialEq)]
pub struct DesignVariable {
    /// Unique key used by error terms to reference this variable
    pub name: String,
    /// Group the variable belongs to
    pub group_id: usize,
    /// Current estimate
    pub value: DVector<f64>,
}

impl DesignVariable {
    /// Create a new design variable.
    pub fn new(name: impl Into<String>, group_id: usize, value: DVector<f64>) -> Self {
        Self {
            name: name.into(),
            group_id,
            value,
        }
    }

    /// Degrees of freedom (number of Jacobian columns) of the variable.
    pub fn get_size(&self) -> usize {
        self.value.len()
    }

    pub fn set_value(&mut self, value: DVector<f64>) {
        self.value = value;
    }

    pub fn to_vector(&self) -> DVector<f64> {
        self.value.clone()
    }

    /// Add a perturbation given as a nalgebra vector.
    pub fn update_variable(&mut self, delta: &DVector<f64>) {
        self.value += delta;
    }

    /// Add the slice of a stacked faer step vector that belongs to this variable.
    pub fn apply_step(&mut self, step_slice: MatRef<f64>) {
        for i in 0..self.value.len() {
            self.value[i] += step_slice[(i, 0)];
        }
    }

    /// Whether the variable carries the same shape and group as `other`.
    ///
    /// Two batches may both declare a shared variable; the declarations must agree on
    /// everything except the value, which is owned by the problem once stored.
    pub fn is_compatible_with(&self, other: &DesignVariable) -> bool {
        self.name == other.name
            && self.group_id == other.group_id
            && self.get_size() == other.get_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::Mat;
    use nalgebra::dvector;

    #[test]
    fn test_design_variable_creation() {
        let var = DesignVariable::new("x0", 3, dvector![1.0, 2.0, 3.0]);
        assert_eq!(var.name, "x0");
        assert_eq!(var.group_id, 3);
        assert_eq!(var.get_size(), 3);
        assert_eq!(var.to_vector(), dvector![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_apply_step_slice() {
        let mut var = DesignVariable::new("x0", 0, dvector![1.0, 2.0]);
        let step = Mat::from_fn(4, 1, |i, _| i as f64);

        var.apply_step(step.as_ref().subrows(2, 2));
        assert_eq!(var.value, dvector![3.0, 5.0]);
    }

    #[test]
    fn test_compatibility_ignores_value() {
        let a = DesignVariable::new("c", 0, dvector![0.0, 0.0]);
        let b = DesignVariable::new("c", 0, dvector![5.0, 1.0]);
        let c = DesignVariable::new("c", 1, dvector![0.0, 0.0]);
        let d = DesignVariable::new("c", 0, dvector![0.0]);

        assert!(a.is_compatible_with(&b));
        assert!(!a.is_compatible_with(&c));
        assert!(!a.is_compatible_with(&d));
    }
}
