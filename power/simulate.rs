//! The Monte Carlo loop: generate a censored response, refit, record significance.
//!
//! Replicates are independent and statistically exchangeable, so the serial and
//! parallel strategies differ only in scheduling. Each replicate draws from its own
//! random stream derived from the run seed and the replicate index, which keeps the
//! streams distinct across workers and makes a run reproducible in either mode.

use crate::fit::{FitError, SurvivalFitter};
use crate::progress::{self, ProgressObserver};
use crate::response::{ResponseError, ResponseGenerator};
use crate::types::{CensoringRule, Distribution};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("nsim must be at least 1")]
    NoReplicates,
    #[error("alpha must lie strictly between 0 and 1, got {0}")]
    InvalidAlpha(f64),
    #[error("expected {expected} anticipated coefficients (one per model matrix column), got {actual}")]
    CoefficientMismatch { expected: usize, actual: usize },
    #[error("replicate {replicate}: {source}")]
    Response {
        replicate: usize,
        #[source]
        source: ResponseError,
    },
    #[error("replicate {replicate}: fit failed: {source}")]
    Fit {
        replicate: usize,
        #[source]
        source: FitError,
    },
    #[error("replicate {replicate}: fitter returned {actual} estimates for {expected} parameters")]
    FitShape {
        replicate: usize,
        expected: usize,
        actual: usize,
    },
    #[error("could not start a worker pool with {workers} threads: {source}")]
    WorkerPool {
        workers: usize,
        #[source]
        source: rayon::ThreadPoolBuildError,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    Serial,
    Parallel { workers: usize },
}

impl ExecutionMode {
    fn describe(self) -> String {
        match self {
            Self::Serial => "serial".to_string(),
            Self::Parallel { workers } => format!("parallel ({workers} workers)"),
        }
    }
}

/// Read-only inputs shared by every replicate.
#[derive(Clone, Debug)]
pub struct SimulationPlan<'a> {
    pub model_matrix: ArrayView2<'a, f64>,
    pub coefficients: ArrayView1<'a, f64>,
    pub generator: &'a ResponseGenerator,
    pub distribution: Distribution,
    pub censoring: CensoringRule,
    pub alpha: f64,
    pub nsim: usize,
    pub seed: u64,
}

impl SimulationPlan<'_> {
    fn validate(&self) -> Result<(), SimulationError> {
        if self.nsim == 0 {
            return Err(SimulationError::NoReplicates);
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(SimulationError::InvalidAlpha(self.alpha));
        }
        if self.coefficients.len() != self.model_matrix.ncols() {
            return Err(SimulationError::CoefficientMismatch {
                expected: self.model_matrix.ncols(),
                actual: self.coefficients.len(),
            });
        }
        Ok(())
    }

    #[inline]
    fn num_parameters(&self) -> usize {
        self.model_matrix.ncols()
    }
}

/// What one replicate contributes to the final reduction.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicateRecord {
    pub significant: Vec<bool>,
    pub coefficients: Array1<f64>,
    pub pvalues: Array1<f64>,
}

#[derive(Clone, Debug)]
pub struct SimulationOutput {
    pub significant_counts: Vec<usize>,
    pub power: Array1<f64>,
    /// `nsim x parameters`, one row per replicate.
    pub estimates: Array2<f64>,
    pub pvalues: Array2<f64>,
}

/// Independent random stream for one replicate.
pub fn replicate_rng(seed: u64, replicate: usize) -> StdRng {
    StdRng::seed_from_u64(splitmix64(seed ^ splitmix64(replicate as u64 + 1)))
}

#[inline]
fn splitmix64(value: u64) -> u64 {
    let mut z = value.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Generate → fit → extract significance for a single replicate.
pub fn run_replicate<F: SurvivalFitter + ?Sized>(
    plan: &SimulationPlan<'_>,
    fitter: &F,
    replicate: usize,
) -> Result<ReplicateRecord, SimulationError> {
    let mut rng = replicate_rng(plan.seed, replicate);
    let response = plan
        .generator
        .generate(plan.model_matrix, plan.coefficients, &plan.censoring, &mut rng)
        .map_err(|source| SimulationError::Response { replicate, source })?;
    let record = fitter
        .fit(
            plan.model_matrix,
            &response,
            plan.censoring.censor_type(),
            plan.distribution,
        )
        .map_err(|source| SimulationError::Fit { replicate, source })?;

    let expected = plan.num_parameters();
    if record.coefficients.len() != expected || record.pvalues.len() != expected {
        return Err(SimulationError::FitShape {
            replicate,
            expected,
            actual: record.coefficients.len().min(record.pvalues.len()),
        });
    }
    let significant = record.pvalues.iter().map(|&p| p < plan.alpha).collect();
    Ok(ReplicateRecord {
        significant,
        coefficients: record.coefficients,
        pvalues: record.pvalues,
    })
}

/// Runs `plan.nsim` replicates and reduces them into per-parameter power.
pub fn run_simulation<F: SurvivalFitter + ?Sized>(
    plan: &SimulationPlan<'_>,
    fitter: &F,
    mode: ExecutionMode,
    progress: &mut dyn ProgressObserver,
) -> Result<SimulationOutput, SimulationError> {
    plan.validate()?;
    let start = Instant::now();
    log::info!(
        "Simulating {} replicates of {} parameters ({}, {}, {})",
        plan.nsim,
        plan.num_parameters(),
        plan.distribution,
        plan.censoring
            .threshold()
            .map_or_else(|| "uncensored".to_string(), |t| format!("{} censored at {t}", plan.censoring.censor_type())),
        mode.describe()
    );

    let output = match mode {
        ExecutionMode::Serial => run_serial(plan, fitter, progress)?,
        ExecutionMode::Parallel { workers } => run_parallel(plan, fitter, workers, progress)?,
    };

    log::info!(
        "Finished {} replicates in {:.2?}",
        plan.nsim,
        start.elapsed()
    );
    Ok(output)
}

fn run_serial<F: SurvivalFitter + ?Sized>(
    plan: &SimulationPlan<'_>,
    fitter: &F,
    progress: &mut dyn ProgressObserver,
) -> Result<SimulationOutput, SimulationError> {
    let p = plan.num_parameters();
    let mut significant_counts = vec![0usize; p];
    let mut estimates = Array2::<f64>::zeros((plan.nsim, p));
    let mut pvalues = Array2::<f64>::zeros((plan.nsim, p));

    progress.on_start(plan.nsim);
    let checkpoints = progress::checkpoints(plan.nsim);
    let mut next_checkpoint = 0;
    let mut reported = 0;
    for j in 0..plan.nsim {
        let record = run_replicate(plan, fitter, j)?;
        for (count, &significant) in significant_counts.iter_mut().zip(&record.significant) {
            if significant {
                *count += 1;
            }
        }
        estimates.row_mut(j).assign(&record.coefficients);
        pvalues.row_mut(j).assign(&record.pvalues);

        let done = j + 1;
        if checkpoints.get(next_checkpoint) == Some(&done) {
            progress.on_advance((done - reported) as f64 / plan.nsim as f64);
            reported = done;
            next_checkpoint += 1;
        }
    }
    progress.on_finish();

    Ok(finish(plan.nsim, significant_counts, estimates, pvalues))
}

fn run_parallel<F: SurvivalFitter + ?Sized>(
    plan: &SimulationPlan<'_>,
    fitter: &F,
    workers: usize,
    progress: &mut dyn ProgressObserver,
) -> Result<SimulationOutput, SimulationError> {
    let workers = workers.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|index| format!("survpower-worker-{index}"))
        .build()
        .map_err(|source| SimulationError::WorkerPool { workers, source })?;

    progress.on_start(plan.nsim);
    let outcome: Result<Vec<ReplicateRecord>, SimulationError> = pool.install(|| {
        (0..plan.nsim)
            .into_par_iter()
            .map(|j| run_replicate(plan, fitter, j))
            .collect()
    });
    // The pool is released before any failure propagates to the caller.
    drop(pool);
    let records = outcome?;
    progress.on_finish();

    Ok(combine(plan.nsim, plan.num_parameters(), records))
}

/// Concatenates per-replicate records; completion order does not matter.
pub fn combine(nsim: usize, parameters: usize, records: Vec<ReplicateRecord>) -> SimulationOutput {
    let mut significant_counts = vec![0usize; parameters];
    let mut estimates = Array2::<f64>::zeros((records.len(), parameters));
    let mut pvalues = Array2::<f64>::zeros((records.len(), parameters));
    for (j, record) in records.into_iter().enumerate() {
        for (count, significant) in significant_counts.iter_mut().zip(record.significant) {
            *count += usize::from(significant);
        }
        estimates.row_mut(j).assign(&record.coefficients);
        pvalues.row_mut(j).assign(&record.pvalues);
    }
    finish(nsim, significant_counts, estimates, pvalues)
}

fn finish(
    nsim: usize,
    significant_counts: Vec<usize>,
    estimates: Array2<f64>,
    pvalues: Array2<f64>,
) -> SimulationOutput {
    let power = significant_counts
        .iter()
        .map(|&count| count as f64 / nsim as f64)
        .collect();
    SimulationOutput {
        significant_counts,
        power,
        estimates,
        pvalues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::{AftFitter, FitRecord};
    use crate::progress::{FnProgress, NoopProgress};
    use crate::types::{CensorType, SimulatedObservation};
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn design(n: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { 1.0 } else if i % 2 == 0 { 1.0 } else { -1.0 })
    }

    struct FailingFitter {
        fail_on: usize,
        calls: AtomicUsize,
    }

    impl SurvivalFitter for FailingFitter {
        fn fit(
            &self,
            model_matrix: ArrayView2<'_, f64>,
            response: &[SimulatedObservation],
            censor_type: CensorType,
            distribution: Distribution,
        ) -> Result<FitRecord, FitError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == self.fail_on {
                return Err(FitError::NonFiniteLikelihood { iteration: 0 });
            }
            AftFitter::default().fit(model_matrix, response, censor_type, distribution)
        }
    }

    #[test]
    fn serial_run_fills_one_row_per_replicate() {
        let x = design(12);
        let beta = array![0.0, 1.0];
        let generator = ResponseGenerator::Gaussian;
        let plan = SimulationPlan {
            model_matrix: x.view(),
            coefficients: beta.view(),
            generator: &generator,
            distribution: Distribution::Gaussian,
            censoring: CensoringRule::none(),
            alpha: 0.05,
            nsim: 40,
            seed: 7,
        };
        let mut fractions = Vec::new();
        let output = run_simulation(
            &plan,
            &AftFitter::default(),
            ExecutionMode::Serial,
            &mut FnProgress(|f| fractions.push(f)),
        )
        .expect("simulate");
        assert_eq!(output.estimates.dim(), (40, 2));
        assert_eq!(output.pvalues.dim(), (40, 2));
        assert!(output.power.iter().all(|p| (0.0..=1.0).contains(p)));
        for (count, power) in output.significant_counts.iter().zip(output.power.iter()) {
            assert_abs_diff_eq!(*count as f64 / 40.0, *power);
        }
        assert_eq!(fractions.len(), 40);
        assert_abs_diff_eq!(fractions.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn parallel_and_serial_runs_agree_for_a_shared_seed() {
        let x = design(16);
        let beta = array![1.0, 0.4];
        let generator = ResponseGenerator::Exponential;
        let plan = SimulationPlan {
            model_matrix: x.view(),
            coefficients: beta.view(),
            generator: &generator,
            distribution: Distribution::Exponential,
            censoring: CensoringRule::right(8.0),
            alpha: 0.1,
            nsim: 60,
            seed: 2024,
        };
        let fitter = AftFitter::default();
        let serial = run_simulation(&plan, &fitter, ExecutionMode::Serial, &mut NoopProgress)
            .expect("serial");
        let parallel = run_simulation(
            &plan,
            &fitter,
            ExecutionMode::Parallel { workers: 3 },
            &mut NoopProgress,
        )
        .expect("parallel");
        assert_eq!(serial.significant_counts, parallel.significant_counts);
        assert_eq!(serial.estimates, parallel.estimates);
    }

    #[test]
    fn a_single_fit_failure_aborts_the_run_in_both_modes() {
        let x = design(10);
        let beta = array![0.0, 0.5];
        let generator = ResponseGenerator::Gaussian;
        let plan = SimulationPlan {
            model_matrix: x.view(),
            coefficients: beta.view(),
            generator: &generator,
            distribution: Distribution::Gaussian,
            censoring: CensoringRule::none(),
            alpha: 0.05,
            nsim: 25,
            seed: 1,
        };
        let serial_fitter = FailingFitter {
            fail_on: 3,
            calls: AtomicUsize::new(0),
        };
        let err = run_simulation(&plan, &serial_fitter, ExecutionMode::Serial, &mut NoopProgress)
            .unwrap_err();
        assert!(matches!(err, SimulationError::Fit { replicate: 3, .. }));
        assert_eq!(serial_fitter.calls.load(Ordering::SeqCst), 4);

        let parallel_fitter = FailingFitter {
            fail_on: 0,
            calls: AtomicUsize::new(0),
        };
        let err = run_simulation(
            &plan,
            &parallel_fitter,
            ExecutionMode::Parallel { workers: 2 },
            &mut NoopProgress,
        )
        .unwrap_err();
        assert!(matches!(err, SimulationError::Fit { .. }));
    }

    #[test]
    fn invalid_plans_are_rejected_before_any_replicate() {
        let x = design(6);
        let beta = array![0.0, 0.5, 1.0];
        let generator = ResponseGenerator::Gaussian;
        let fitter = FailingFitter {
            fail_on: usize::MAX,
            calls: AtomicUsize::new(0),
        };
        let mut plan = SimulationPlan {
            model_matrix: x.view(),
            coefficients: beta.view(),
            generator: &generator,
            distribution: Distribution::Gaussian,
            censoring: CensoringRule::none(),
            alpha: 0.05,
            nsim: 5,
            seed: 1,
        };
        assert!(matches!(
            run_simulation(&plan, &fitter, ExecutionMode::Serial, &mut NoopProgress),
            Err(SimulationError::CoefficientMismatch { expected: 2, actual: 3 })
        ));
        let short = array![0.0, 0.5];
        plan.coefficients = short.view();
        plan.alpha = 1.0;
        assert!(matches!(
            run_simulation(&plan, &fitter, ExecutionMode::Serial, &mut NoopProgress),
            Err(SimulationError::InvalidAlpha(_))
        ));
        plan.alpha = 0.05;
        plan.nsim = 0;
        assert!(matches!(
            run_simulation(&plan, &fitter, ExecutionMode::Serial, &mut NoopProgress),
            Err(SimulationError::NoReplicates)
        ));
        assert_eq!(fitter.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn replicate_streams_differ_across_indices() {
        use rand::Rng;
        let a: u64 = replicate_rng(5, 0).r#gen();
        let b: u64 = replicate_rng(5, 1).r#gen();
        let c: u64 = replicate_rng(6, 0).r#gen();
        assert_ne!(a, b);
        assert_ne!(a, c);
        let again: u64 = replicate_rng(5, 0).r#gen();
        assert_eq!(a, again);
    }

    #[test]
    fn combine_ignores_completion_order() {
        let records = vec![
            ReplicateRecord {
                significant: vec![true, false],
                coefficients: array![1.0, 2.0],
                pvalues: array![0.01, 0.5],
            },
            ReplicateRecord {
                significant: vec![true, true],
                coefficients: array![3.0, 4.0],
                pvalues: array![0.02, 0.03],
            },
        ];
        let mut reversed = records.clone();
        reversed.reverse();
        let forward = combine(2, 2, records);
        let backward = combine(2, 2, reversed);
        assert_eq!(forward.significant_counts, vec![2, 1]);
        assert_eq!(forward.power, backward.power);
        assert_eq!(forward.power.to_vec(), vec![1.0, 0.5]);
    }
}
