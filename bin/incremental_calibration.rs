//! Streams synthetic odometry batches through the incremental estimator.
//!
//! The calibration is a wheel-odometry scale and offset `c = [scale, offset]`. Every batch holds
//! a short run of wheel readings `w_t` and reference displacements
//!
//! ```text
//! d_t = scale · w_t + offset + bias_k + noise
//! ```
//!
//! where `bias_k` is a per-batch reference bias with a prior. Batches alternate between driving
//! (varying `w_t`, informative about both parameters) and standing still (constant `w_t`, which
//! only says something about the offset), so later stationary batches get rejected.

use clap::Parser;
use incremental_calibration::{
    Batch, BatchHandle, CalibrationResult, DesignVariable, ErrorTerm, IncrementalEstimator,
    LinearFactor, LinearSolverType, Options, PriorFactor, init_logger_for,
};
use nalgebra::{dmatrix, dvector};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "incremental_calibration")]
#[command(about = "Information-gated incremental calibration of a synthetic odometry model")]
struct Args {
    /// Number of batches to offer
    #[arg(short, long, default_value = "12")]
    batches: usize,

    /// Measurements per batch
    #[arg(short, long, default_value = "8")]
    samples: usize,

    /// Minimum mutual information (nats) to accept a batch
    #[arg(long, default_value = "0.5")]
    mi_tol: f64,

    /// QR rank tolerance (0 selects the adaptive tolerance)
    #[arg(long, default_value = "0.02")]
    qr_tol: f64,

    /// Amplitude of the deterministic measurement noise
    #[arg(long, default_value = "0.01")]
    noise: f64,

    /// Use sparse QR instead of sparse Cholesky for the normal equations
    #[arg(long)]
    qr: bool,

    /// Remove the first accepted batch at the end and reoptimize
    #[arg(long)]
    drop_first: bool,

    /// Log every decision at INFO
    #[arg(short, long)]
    verbose: bool,
}

const TRUE_SCALE: f64 = 1.05;
const TRUE_OFFSET: f64 = -0.2;

fn make_batch(index: usize, samples: usize, noise: f64) -> BatchHandle {
    let moving = index % 3 == 0;
    let bias_name = format!("bias_{index}");

    let mut batch = Batch::new()
        .with_design_variable(DesignVariable::new("calibration", 0, dvector![1.0, 0.0]))
        .with_design_variable(DesignVariable::new(bias_name.as_str(), 1, dvector![0.0]))
        .with_error_term(ErrorTerm::new(
            &[bias_name.as_str()],
            Box::new(PriorFactor::with_weight(dvector![0.0], 20.0)),
        ));

    for t in 0..samples {
        let wheel = if moving {
            0.5 + t as f64 * 0.75
        } else {
            1.0
        };
        let phase = (index * samples + t) as f64;
        let reference = TRUE_SCALE * wheel + TRUE_OFFSET + noise * (1.7 * phase).sin();

        match LinearFactor::new(vec![dmatrix![wheel, 1.0], dmatrix![1.0]], dvector![reference])
            .and_then(|factor| factor.with_weight(1.0 / noise.max(1e-6)))
        {
            Ok(factor) => batch.add_error_term(ErrorTerm::new(
                &["calibration", bias_name.as_str()],
                Box::new(factor),
            )),
            Err(e) => warn!("skipping sample {t} of batch {index}: {e}"),
        }
    }
    batch.into_handle()
}

fn main() -> CalibrationResult<()> {
    let args = Args::parse();
    init_logger_for(true);

    let options = Options::new()
        .with_mi_tol(args.mi_tol)
        .with_qr_tol(args.qr_tol)
        .with_verbose(args.verbose)
        .with_linear_solver(if args.qr {
            LinearSolverType::SparseQR
        } else {
            LinearSolverType::SparseCholesky
        });
    let mut estimator = IncrementalEstimator::new(0, options);

    let mut accepted = Vec::new();
    for index in 0..args.batches {
        let batch = make_batch(index, args.samples, args.noise);
        let result = estimator.add_batch(batch.clone(), false)?;
        info!(
            "batch {:>3}: {} MI {:>8.4} rank {}/{}",
            index,
            if result.accepted { "kept    " } else { "rejected" },
            result.mutual_information,
            result.rank,
            result.rank + result.rank_deficiency
        );
        if result.accepted {
            accepted.push(batch);
        }
    }

    if args.drop_first {
        if let Some(first) = accepted.first() {
            estimator.remove_batch_handle(first)?;
            let result = estimator.reoptimize()?;
            info!(
                "dropped first batch: MI {:.4}, {} batches remain",
                result.mutual_information,
                estimator.num_batches()
            );
        }
    }

    let calibration = estimator
        .problem()
        .variable("calibration")
        .map(|v| v.value.clone());
    info!(
        "kept {}/{} batches, rank {}, log det {:.4}",
        estimator.num_batches(),
        args.batches,
        estimator.rank(),
        estimator.singular_value_log_sum()
    );
    if let Some(value) = calibration {
        info!(
            "scale {:.5} (true {TRUE_SCALE}), offset {:.5} (true {TRUE_OFFSET})",
            value[0], value[1]
        );
    }
    info!("marginal covariance:{}", estimator.marginalized_covariance());
    Ok(())
}
