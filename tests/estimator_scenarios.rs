//! End-to-end behaviour of the incremental estimator.
//!
//! The scenarios calibrate a wheel-odometry model `d = scale · w + offset + bias_k`, where the
//! calibration `[scale, offset]` is group 0 and every batch carries its own reference bias
//! `bias_k` (group 1) with a prior. Driving batches (varying `w`) observe both calibration
//! parameters; standing batches (constant `w = 1`) only observe `scale + offset`.

use incremental_calibration::core::batch::{Batch, BatchHandle};
use incremental_calibration::core::error_term::ErrorTerm;
use incremental_calibration::core::variable::DesignVariable;
use incremental_calibration::error::CalibrationError;
use incremental_calibration::estimator::{EstimatorError, IncrementalEstimator, Options};
use incremental_calibration::factors::{LinearFactor, PriorFactor};
use incremental_calibration::linalg::LinearSolverType;
use nalgebra::{DMatrix, dmatrix, dvector};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const SCALE: f64 = 1.05;
const OFFSET: f64 = -0.2;

fn quiet() -> Options {
    Options::default().with_verbose(false)
}

/// One batch of wheel readings `wheels`, each observed with the given weight.
fn odometry_batch(
    tag: &str,
    wheels: &[f64],
    weight: f64,
) -> Result<BatchHandle, Box<dyn std::error::Error>> {
    let bias = format!("bias_{tag}");
    let mut batch = Batch::new()
        .with_design_variable(DesignVariable::new("calibration", 0, dvector![1.0, 0.0]))
        .with_design_variable(DesignVariable::new(bias.as_str(), 1, dvector![0.0]))
        .with_error_term(ErrorTerm::new(
            &[bias.as_str()],
            Box::new(PriorFactor::with_weight(dvector![0.0], 20.0)),
        ));

    for (t, &wheel) in wheels.iter().enumerate() {
        let noise = 1e-3 * (1.3 * t as f64 + wheel).sin();
        let reference = SCALE * wheel + OFFSET + noise;
        let factor =
            LinearFactor::new(vec![dmatrix![wheel, 1.0], dmatrix![1.0]], dvector![reference])?
                .with_weight(weight)?;
        batch.add_error_term(ErrorTerm::new(
            &["calibration", bias.as_str()],
            Box::new(factor),
        ));
    }
    Ok(batch.into_handle())
}

fn driving(tag: &str) -> Result<BatchHandle, Box<dyn std::error::Error>> {
    odometry_batch(tag, &[0.5, 1.25, 2.0, 2.75, 3.5, 4.25], 100.0)
}

fn standing(tag: &str, weight: f64) -> Result<BatchHandle, Box<dyn std::error::Error>> {
    odometry_batch(tag, &[1.0; 6], weight)
}

fn assert_matrix_close(a: &DMatrix<f64>, b: &DMatrix<f64>, tol: f64) {
    assert_eq!(a.shape(), b.shape());
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() <= tol * (1.0 + x.abs().max(y.abs())), "{x} vs {y}");
    }
}

/// Everything the estimator persists between calls, captured for exact comparison.
#[derive(Debug, PartialEq)]
struct Persisted {
    num_batches: usize,
    rank: usize,
    rank_deficiency: usize,
    marginal_rank: usize,
    marginal_rank_deficiency: usize,
    qr_tol: f64,
    memory_usage: usize,
    mutual_information: f64,
    sv_log_sum: f64,
    null_space: DMatrix<f64>,
    column_space: DMatrix<f64>,
    covariance: DMatrix<f64>,
    projected_covariance: DMatrix<f64>,
    information_matrix: DMatrix<f64>,
    jacobian_shape: Option<(usize, usize)>,
    values: Vec<nalgebra::DVector<f64>>,
}

fn snapshot(estimator: &IncrementalEstimator) -> Persisted {
    Persisted {
        num_batches: estimator.num_batches(),
        rank: estimator.rank(),
        rank_deficiency: estimator.rank_deficiency(),
        marginal_rank: estimator.marginal_rank(),
        marginal_rank_deficiency: estimator.marginal_rank_deficiency(),
        qr_tol: estimator.qr_tol(),
        memory_usage: estimator.memory_usage(),
        mutual_information: estimator.mutual_information(),
        sv_log_sum: estimator.singular_value_log_sum(),
        null_space: estimator.marginalized_null_space().clone(),
        column_space: estimator.marginalized_column_space().clone(),
        covariance: estimator.marginalized_covariance().clone(),
        projected_covariance: estimator.projected_marginalized_covariance().clone(),
        information_matrix: estimator.marginalized_information_matrix().clone(),
        jacobian_shape: estimator.jacobian().map(|j| (j.nrows(), j.ncols())),
        values: estimator.problem().values(),
    }
}

#[test]
fn test_forced_first_batch_is_accepted() -> TestResult {
    let mut estimator = IncrementalEstimator::new(0, quiet());
    let result = estimator.add_batch(driving("0")?, true)?;

    assert!(result.accepted);
    assert_eq!(estimator.num_batches(), 1);
    assert_eq!(estimator.marg_group_id(), 0);
    assert!(result.mutual_information > 0.0);
    assert!(result.cost_final <= result.cost_initial);
    assert_eq!(result.covariance.shape(), (2, 2));

    let calibration = estimator
        .problem()
        .variable("calibration")
        .ok_or("calibration missing")?;
    assert!((calibration.value[0] - SCALE).abs() < 1e-2);
    assert!((calibration.value[1] - OFFSET).abs() < 0.2);
    Ok(())
}

#[test]
fn test_uninformative_batch_is_rejected_without_trace() -> TestResult {
    let mut estimator = IncrementalEstimator::new(0, quiet());
    estimator.add_batch(driving("0")?, true)?;
    let before = snapshot(&estimator);

    let result = estimator.add_batch(standing("1", 0.01)?, false)?;

    assert!(!result.accepted);
    assert!(result.mutual_information.abs() < 1e-3);
    assert_eq!(snapshot(&estimator), before);
    assert!(estimator.problem().variable("bias_1").is_none());
    assert_eq!(estimator.problem().reference_count("calibration"), Some(1));
    Ok(())
}

#[test]
fn test_remove_middle_batch_then_reoptimize() -> TestResult {
    let mut estimator = IncrementalEstimator::new(0, quiet());
    estimator.add_batch(driving("0")?, true)?;
    estimator.add_batch(standing("1", 100.0)?, true)?;
    estimator.add_batch(driving("2")?, true)?;

    estimator.remove_batch(1)?;
    assert_eq!(estimator.num_batches(), 2);
    assert!(estimator.problem().variable("bias_1").is_none());

    let result = estimator.reoptimize()?;
    assert!(result.accepted);
    assert_eq!(estimator.num_batches(), 2);
    assert_eq!(result.rank + result.rank_deficiency, 2);
    Ok(())
}

#[test]
fn test_empty_batch_fails_before_solving() {
    let mut estimator = IncrementalEstimator::new(0, quiet());
    let result = estimator.add_batch(Batch::new().into_handle(), true);

    assert!(matches!(
        result,
        Err(CalibrationError::Estimator(EstimatorError::InvalidArgument(_)))
    ));
    assert_eq!(estimator.num_batches(), 0);
    assert!(estimator.jacobian().is_none());
}

#[test]
fn test_batch_count_tracks_accepted_additions() -> TestResult {
    let mut estimator = IncrementalEstimator::new(0, quiet());
    let offered = [
        driving("0")?,
        standing("1", 100.0)?,
        standing("2", 0.01)?,
        driving("3")?,
        standing("4", 0.01)?,
        driving("5")?,
    ];

    let mut accepted = 0;
    for batch in offered {
        let result = estimator.add_batch(batch, false)?;
        if result.accepted {
            accepted += 1;
        }
        let columns = estimator.problem().group_dimension(0);
        assert_eq!(columns, 2);
        assert_eq!(estimator.num_batches(), accepted);
        assert_eq!(estimator.rank() + estimator.rank_deficiency(), columns);
        assert_eq!(
            estimator.marginal_rank() + estimator.marginal_rank_deficiency(),
            columns
        );
    }
    assert!(accepted >= 1);
    assert!(accepted < 6);
    Ok(())
}

#[test]
fn test_force_only_changes_the_decision() -> TestResult {
    let build = || -> Result<IncrementalEstimator, Box<dyn std::error::Error>> {
        let mut estimator = IncrementalEstimator::new(0, quiet());
        estimator.add_batch(driving("0")?, true)?;
        Ok(estimator)
    };
    let mut forced = build()?;
    let mut gated = build()?;

    let with_force = forced.add_batch(standing("1", 0.01)?, true)?;
    let without_force = gated.add_batch(standing("1", 0.01)?, false)?;

    assert!(with_force.accepted);
    assert!(!without_force.accepted);
    assert_eq!(with_force.mutual_information, without_force.mutual_information);
    assert_eq!(with_force.rank, without_force.rank);
    assert_eq!(with_force.covariance, without_force.covariance);
    Ok(())
}

#[test]
fn test_removal_matches_never_seen() -> TestResult {
    let mut pruned = IncrementalEstimator::new(0, quiet());
    pruned.add_batch(driving("0")?, true)?;
    let extra = standing("1", 100.0)?;
    pruned.add_batch(extra.clone(), true)?;
    pruned.add_batch(driving("2")?, true)?;
    pruned.remove_batch_handle(&extra)?;
    pruned.reoptimize()?;

    let mut fresh = IncrementalEstimator::new(0, quiet());
    fresh.add_batch(driving("0")?, true)?;
    fresh.add_batch(driving("2")?, true)?;

    assert_eq!(pruned.num_batches(), fresh.num_batches());
    assert_eq!(pruned.rank(), fresh.rank());
    assert_eq!(pruned.marginal_rank(), fresh.marginal_rank());
    assert!((pruned.singular_value_log_sum() - fresh.singular_value_log_sum()).abs() < 1e-8);
    assert_matrix_close(
        pruned.marginalized_covariance(),
        fresh.marginalized_covariance(),
        1e-8,
    );
    assert_matrix_close(
        pruned.marginalized_information_matrix(),
        fresh.marginalized_information_matrix(),
        1e-8,
    );

    assert!(matches!(
        pruned.remove_batch_handle(&extra),
        Err(CalibrationError::Estimator(EstimatorError::UnknownBatch))
    ));
    Ok(())
}

#[test]
fn test_standing_still_leaves_scale_offset_unobservable() -> TestResult {
    let mut estimator = IncrementalEstimator::new(0, quiet());
    let weak_prior = Batch::new()
        .with_design_variable(DesignVariable::new("calibration", 0, dvector![1.0, 0.0]))
        .with_error_term(ErrorTerm::new(
            &["calibration"],
            Box::new(PriorFactor::with_weight(dvector![1.0, 0.0], 1e-3)),
        ))
        .into_handle();
    estimator.add_batch(weak_prior, true)?;
    estimator.add_batch(standing("0", 100.0)?, true)?;

    assert_eq!(estimator.rank(), 1);
    assert_eq!(estimator.rank_deficiency(), 1);
    assert_eq!(estimator.marginal_rank(), 1);

    let null_space = estimator.marginalized_null_space();
    assert_eq!(null_space.shape(), (2, 1));
    // scale and offset trade off one to one
    assert!((null_space[(0, 0)].abs() - null_space[(1, 0)].abs()).abs() < 1e-6);
    assert!(null_space[(0, 0)] * null_space[(1, 0)] < 0.0);

    let column_space = estimator.marginalized_column_space();
    assert_eq!(column_space.shape(), (2, 1));
    assert!((column_space[(0, 0)] - column_space[(1, 0)]).abs() < 1e-6);

    let leak = estimator.projected_marginalized_covariance() * null_space;
    assert!(leak.norm() < 1e-9);
    assert_eq!(
        estimator.marginalized_covariance(),
        estimator.projected_marginalized_covariance()
    );

    // a driving batch resolves the ambiguity
    let result = estimator.add_batch(driving("1")?, false)?;
    assert!(result.accepted);
    assert_eq!(estimator.rank(), 2);
    assert_eq!(estimator.marginalized_null_space().ncols(), 0);
    Ok(())
}

#[test]
fn test_reoptimize_under_changed_options() -> TestResult {
    let mut estimator = IncrementalEstimator::new(0, quiet());
    estimator.add_batch(driving("0")?, true)?;
    assert_eq!(estimator.qr_tol(), 0.02);
    let information = estimator.marginalized_information_matrix().clone();

    estimator.options_mut().qr_tol = 0.0;
    estimator.options_mut().linear_solver = LinearSolverType::SparseQR;
    let result = estimator.reoptimize()?;

    assert!(result.accepted);
    assert!(result.qr_tol > 0.0);
    assert!(result.qr_tol < 0.02);
    assert_eq!(estimator.qr_tol(), result.qr_tol);
    // same data, so no new information
    assert!(result.mutual_information.abs() < 1e-6);
    assert_matrix_close(estimator.marginalized_information_matrix(), &information, 1e-6);
    Ok(())
}

/// `c + n = 1` between the scalar calibration `c` and a nuisance `n`, observed with `weight`.
fn sum_constraint(weight: f64) -> Result<BatchHandle, Box<dyn std::error::Error>> {
    let factor =
        LinearFactor::new(vec![dmatrix![1.0], dmatrix![1.0]], dvector![1.0])?.with_weight(weight)?;
    Ok(Batch::new()
        .with_design_variable(DesignVariable::new("c", 0, dvector![0.0]))
        .with_design_variable(DesignVariable::new("n", 1, dvector![0.0]))
        .with_error_term(ErrorTerm::new(&["c", "n"], Box::new(factor)))
        .into_handle())
}

#[test]
fn test_heavily_weighted_ambiguity_is_reported_as_rank_deficiency() -> TestResult {
    for linear_solver in [LinearSolverType::SparseCholesky, LinearSolverType::SparseQR] {
        let mut estimator = IncrementalEstimator::new(0, quiet().with_linear_solver(linear_solver));
        let mut batch = Batch::new().with_design_variable(DesignVariable::new(
            "calibration",
            0,
            dvector![1.0, 0.0],
        ));
        // standing still at w = 1 observes scale + offset only
        for _ in 0..6 {
            let factor =
                LinearFactor::new(vec![dmatrix![1.0, 1.0]], dvector![SCALE + OFFSET])?
                    .with_weight(1e4)?;
            batch.add_error_term(ErrorTerm::new(&["calibration"], Box::new(factor)));
        }

        let result = estimator.add_batch(batch.into_handle(), true)?;
        assert!(result.accepted);
        assert_eq!(result.rank, 1);
        assert_eq!(result.rank_deficiency, 1);
        assert_eq!(estimator.marginal_rank(), 1);

        let null_space = estimator.marginalized_null_space();
        assert_eq!(null_space.shape(), (2, 1));
        assert!((null_space[(0, 0)] + null_space[(1, 0)]).abs() < 1e-6);

        let calibration = &estimator
            .problem()
            .variable("calibration")
            .ok_or("calibration missing")?
            .value;
        assert!((calibration[0] + calibration[1] - (SCALE + OFFSET)).abs() < 1e-6);
    }
    Ok(())
}

#[test]
fn test_marginal_block_without_own_information_has_zero_rank() -> TestResult {
    for weight in [1.0, 1e4] {
        let mut estimator = IncrementalEstimator::new(0, quiet());
        let result = estimator.add_batch(sum_constraint(weight)?, true)?;

        assert!(result.accepted);
        assert_eq!(result.rank, 0);
        assert_eq!(result.rank_deficiency, 1);
        assert_eq!(estimator.marginal_rank(), 0);
        assert_eq!(estimator.marginal_rank_deficiency(), 1);
        assert_eq!(estimator.singular_value_log_sum(), 0.0);
        assert_eq!(result.mutual_information, 0.0);
        assert_eq!(estimator.marginalized_covariance(), &DMatrix::zeros(1, 1));
        assert_eq!(estimator.marginalized_null_space().shape(), (1, 1));
    }
    Ok(())
}

#[test]
fn test_first_real_information_is_measured_from_zero() -> TestResult {
    let mut estimator = IncrementalEstimator::new(0, quiet());
    estimator.add_batch(sum_constraint(1.0)?, true)?;
    let before = snapshot(&estimator);

    // an uninformative prior gains nothing and is rejected without trace
    let weak = Batch::new()
        .with_design_variable(DesignVariable::new("c", 0, dvector![0.0]))
        .with_error_term(ErrorTerm::new(
            &["c"],
            Box::new(PriorFactor::with_weight(dvector![0.5], 0.1)),
        ))
        .into_handle();
    let result = estimator.add_batch(weak, false)?;
    assert!(!result.accepted);
    assert!(result.mutual_information < 0.0);
    assert_eq!(snapshot(&estimator), before);

    // square-root information 10 on c is worth ½ ln 10² = ln 10 nats
    let prior = Batch::new()
        .with_design_variable(DesignVariable::new("c", 0, dvector![0.0]))
        .with_error_term(ErrorTerm::new(
            &["c"],
            Box::new(PriorFactor::with_weight(dvector![0.5], 10.0)),
        ))
        .into_handle();
    let result = estimator.add_batch(prior, false)?;

    assert!(result.accepted);
    assert!((result.mutual_information - 10.0_f64.ln()).abs() < 1e-9);
    assert_eq!(estimator.marginal_rank(), 1);
    assert_eq!(estimator.rank(), 1);
    assert!((estimator.singular_value_log_sum() - 100.0_f64.ln()).abs() < 1e-9);
    Ok(())
}
