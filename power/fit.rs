//! Parametric accelerated-failure-time regression for censored responses.
//!
//! The fitter maximizes the censored log-likelihood of `y = Xβ + σW`, where `y` is
//! the observed time (gaussian) or its logarithm (lognormal, exponential), `W` is
//! standard normal or a standard minimum extreme-value variate, and the scale `σ`
//! is estimated except for the exponential model where it is fixed at one.
//! Coefficient p-values are two-sided Wald tests from the observed information.

use crate::faer_ndarray::{FaerCholesky, FaerCholeskyFactor, FaerLinalgError};
use crate::types::{CensorType, Distribution, SimulatedObservation};
use faer::Side;
use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use std::f64::consts::{FRAC_1_SQRT_2, PI};
use thiserror::Error;

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;
/// Beyond this standardized residual the normal tail is evaluated asymptotically.
const NORMAL_TAIL_SWITCH: f64 = 35.0;
/// `exp(z)` above this value makes the extreme-value left tail numerically one.
const EXTREME_VALUE_SATURATION: f64 = 700.0;
const RIDGE_ATTEMPTS: usize = 30;
/// Squared pivots below this fraction of the largest diagonal entry count as zero.
const RELATIVE_PIVOT_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FitterOptions {
    pub max_iterations: usize,
    /// Relative change in log-likelihood that counts as converged.
    pub tolerance: f64,
    pub max_step_halvings: usize,
    /// Treat hitting `max_iterations` as a fit failure instead of a warning.
    pub strict_convergence: bool,
}

impl Default for FitterOptions {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            tolerance: 1e-9,
            max_step_halvings: 20,
            strict_convergence: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum FitError {
    #[error("the model matrix has {expected} rows but {found} observations were supplied")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("observation {index} has non-positive time {value}; the {distribution} model needs positive times")]
    NonPositiveTime {
        index: usize,
        value: f64,
        distribution: Distribution,
    },
    #[error("observation {index} is not finite")]
    NonFiniteObservation { index: usize },
    #[error("the log-likelihood became non-finite at iteration {iteration}")]
    NonFiniteLikelihood { iteration: usize },
    #[error("the information matrix is singular: {0}")]
    SingularInformation(#[source] FaerLinalgError),
    #[error("every observation is censored; at least one event is needed to fit the model")]
    NoEvents,
    #[error("no convergence within {max_iterations} iterations (last relative change {last_change:.3e})")]
    NonConvergence {
        max_iterations: usize,
        last_change: f64,
    },
}

/// Estimates and Wald p-values for one fitted replicate, in model matrix column order.
#[derive(Debug, Clone, PartialEq)]
pub struct FitRecord {
    pub coefficients: Array1<f64>,
    pub std_errors: Array1<f64>,
    pub pvalues: Array1<f64>,
    pub scale: f64,
    pub log_likelihood: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// The regression routine refit to every synthetic dataset.
pub trait SurvivalFitter: Send + Sync {
    fn fit(
        &self,
        model_matrix: ArrayView2<'_, f64>,
        response: &[SimulatedObservation],
        censor_type: CensorType,
        distribution: Distribution,
    ) -> Result<FitRecord, FitError>;
}

/// Newton-Raphson maximum likelihood for gaussian, lognormal and exponential AFT models.
#[derive(Debug, Clone, Default)]
pub struct AftFitter {
    options: FitterOptions,
}

impl AftFitter {
    pub fn new(options: FitterOptions) -> Self {
        Self { options }
    }

    #[inline]
    pub fn options(&self) -> &FitterOptions {
        &self.options
    }
}

impl SurvivalFitter for AftFitter {
    fn fit(
        &self,
        model_matrix: ArrayView2<'_, f64>,
        response: &[SimulatedObservation],
        censor_type: CensorType,
        distribution: Distribution,
    ) -> Result<FitRecord, FitError> {
        let problem = AftProblem::new(model_matrix, response, censor_type, distribution)?;
        problem.maximize(&self.options)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ErrorFamily {
    Normal,
    ExtremeValue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Event,
    RightCensored,
    LeftCensored,
}

/// Log-density (or log-survival/log-cdf) of the standardized residual and its first
/// two derivatives with respect to `z`.
#[derive(Clone, Copy, Debug)]
struct Contribution {
    log_value: f64,
    first: f64,
    second: f64,
}

impl ErrorFamily {
    fn contribution(self, z: f64, status: Status) -> Contribution {
        match (self, status) {
            (Self::Normal, Status::Event) => Contribution {
                log_value: -0.5 * z * z - LN_SQRT_2PI,
                first: -z,
                second: -1.0,
            },
            (Self::Normal, Status::RightCensored) => {
                let (log_tail, ratio) = normal_upper_tail(z);
                Contribution {
                    log_value: log_tail,
                    first: -ratio,
                    second: -ratio * (ratio - z),
                }
            }
            (Self::Normal, Status::LeftCensored) => {
                let (log_cdf, ratio) = normal_upper_tail(-z);
                Contribution {
                    log_value: log_cdf,
                    first: ratio,
                    second: -ratio * (ratio + z),
                }
            }
            (Self::ExtremeValue, Status::Event) => {
                let w = z.exp();
                Contribution {
                    log_value: z - w,
                    first: 1.0 - w,
                    second: -w,
                }
            }
            (Self::ExtremeValue, Status::RightCensored) => {
                let w = z.exp();
                Contribution {
                    log_value: -w,
                    first: -w,
                    second: -w,
                }
            }
            (Self::ExtremeValue, Status::LeftCensored) => {
                let w = z.exp();
                if w > EXTREME_VALUE_SATURATION {
                    return Contribution {
                        log_value: 0.0,
                        first: 0.0,
                        second: 0.0,
                    };
                }
                if w < 1e-12 {
                    return Contribution {
                        log_value: z - 0.5 * w,
                        first: 1.0 - 0.5 * w,
                        second: -0.5 * w,
                    };
                }
                let cdf = -(-w).exp_m1();
                let first = w / w.exp_m1();
                Contribution {
                    log_value: cdf.ln(),
                    first,
                    second: first * (1.0 - w / cdf),
                }
            }
        }
    }
}

/// `ln Φ(-z)` and the inverse Mills ratio `φ(z) / Φ(-z)`.
fn normal_upper_tail(z: f64) -> (f64, f64) {
    if z > NORMAL_TAIL_SWITCH {
        let inv = 1.0 / (z * z);
        let log_density = -0.5 * z * z - LN_SQRT_2PI;
        let series = 1.0 - inv + 3.0 * inv * inv;
        let log_tail = log_density - z.ln() + series.ln();
        let ratio = z / series;
        return (log_tail, ratio);
    }
    let tail = 0.5 * erfc(z * FRAC_1_SQRT_2);
    let density = (-0.5 * z * z).exp() / (2.0 * PI).sqrt();
    (tail.ln(), density / tail)
}

/// Two-sided Wald p-value for `estimate / std_error`. NaN when the standard error is
/// degenerate, which never counts as significant.
pub fn wald_pvalue(estimate: f64, std_error: f64) -> f64 {
    if !(std_error.is_finite() && std_error > 0.0) {
        return f64::NAN;
    }
    let z = (estimate / std_error).abs();
    erfc(z * FRAC_1_SQRT_2)
}

struct WorkingState {
    log_likelihood: f64,
    gradient: Array1<f64>,
    hessian: Array2<f64>,
}

struct AftProblem<'a> {
    x: ArrayView2<'a, f64>,
    y: Array1<f64>,
    status: Vec<Status>,
    family: ErrorFamily,
    estimate_scale: bool,
    jacobian: f64,
}

impl<'a> AftProblem<'a> {
    fn new(
        x: ArrayView2<'a, f64>,
        response: &[SimulatedObservation],
        censor_type: CensorType,
        distribution: Distribution,
    ) -> Result<Self, FitError> {
        if response.len() != x.nrows() {
            return Err(FitError::DimensionMismatch {
                expected: x.nrows(),
                found: response.len(),
            });
        }
        let mut y = Array1::<f64>::zeros(response.len());
        let mut jacobian = 0.0;
        let mut status = Vec::with_capacity(response.len());
        for (index, obs) in response.iter().enumerate() {
            if !obs.value.is_finite() {
                return Err(FitError::NonFiniteObservation { index });
            }
            y[index] = if distribution.is_log_scale() {
                if obs.value <= 0.0 {
                    return Err(FitError::NonPositiveTime {
                        index,
                        value: obs.value,
                        distribution,
                    });
                }
                let log_time = obs.value.ln();
                if obs.event {
                    jacobian -= log_time;
                }
                log_time
            } else {
                obs.value
            };
            status.push(match (obs.event, censor_type) {
                (true, _) => Status::Event,
                (false, CensorType::Right) => Status::RightCensored,
                (false, CensorType::Left) => Status::LeftCensored,
            });
        }
        if !status.contains(&Status::Event) {
            return Err(FitError::NoEvents);
        }
        let (family, estimate_scale) = match distribution {
            Distribution::Gaussian | Distribution::Lognormal => (ErrorFamily::Normal, true),
            Distribution::Exponential => (ErrorFamily::ExtremeValue, false),
        };
        Ok(Self {
            x,
            y,
            status,
            family,
            estimate_scale,
            jacobian,
        })
    }

    #[inline]
    fn num_coefficients(&self) -> usize {
        self.x.ncols()
    }

    #[inline]
    fn num_parameters(&self) -> usize {
        self.num_coefficients() + usize::from(self.estimate_scale)
    }

    /// Least-squares coefficients with the residual spread as the starting scale.
    fn start(&self) -> Result<Array1<f64>, FitError> {
        let p = self.num_coefficients();
        let gram = self.x.t().dot(&self.x);
        let rhs = self.x.t().dot(&self.y);
        let beta = factor_information(&gram)
            .map_err(FitError::SingularInformation)?
            .solve_vec(&rhs);
        let mut theta = Array1::<f64>::zeros(self.num_parameters());
        theta.slice_mut(s![..p]).assign(&beta);
        if self.estimate_scale {
            let residuals = &self.y - &self.x.dot(&beta);
            let n = residuals.len() as f64;
            let sd = (residuals.mapv(|r| r * r).sum() / n).sqrt();
            theta[p] = if sd.is_finite() && sd > 1e-8 { sd.ln() } else { 0.0 };
        }
        Ok(theta)
    }

    fn evaluate(&self, theta: &Array1<f64>) -> WorkingState {
        let p = self.num_coefficients();
        let k = self.num_parameters();
        let log_sigma = if self.estimate_scale { theta[p] } else { 0.0 };
        let sigma = log_sigma.exp();
        let eta = self.x.dot(&theta.slice(s![..p]));

        let mut log_likelihood = self.jacobian;
        let mut d_eta = Array1::<f64>::zeros(self.y.len());
        let mut d2_eta = Array1::<f64>::zeros(self.y.len());
        let mut gradient = Array1::<f64>::zeros(k);
        let mut hessian = Array2::<f64>::zeros((k, k));
        let mut cross = Array1::<f64>::zeros(p);

        for (i, &status) in self.status.iter().enumerate() {
            let z = (self.y[i] - eta[i]) / sigma;
            let c = self.family.contribution(z, status);
            let is_event = status == Status::Event;
            log_likelihood += c.log_value;
            if is_event {
                log_likelihood -= log_sigma;
            }
            d_eta[i] = -c.first / sigma;
            d2_eta[i] = c.second / (sigma * sigma);
            if self.estimate_scale {
                let mixed = (c.second * z + c.first) / sigma;
                cross.scaled_add(mixed, &self.x.row(i));
                gradient[p] += -c.first * z - if is_event { 1.0 } else { 0.0 };
                hessian[[p, p]] += c.second * z * z + c.first * z;
            }
        }

        gradient.slice_mut(s![..p]).assign(&self.x.t().dot(&d_eta));
        let weighted = &self.x * &d2_eta.view().insert_axis(Axis(1));
        hessian
            .slice_mut(s![..p, ..p])
            .assign(&self.x.t().dot(&weighted));
        if self.estimate_scale {
            hessian.slice_mut(s![..p, p]).assign(&cross);
            hessian.slice_mut(s![p, ..p]).assign(&cross);
        }

        WorkingState {
            log_likelihood,
            gradient,
            hessian,
        }
    }

    /// Solves `(-H + μI) δ = g`, raising `μ` until the system is positive definite.
    fn newton_step(&self, state: &WorkingState) -> Result<Array1<f64>, FitError> {
        let information = state.hessian.mapv(|v| -v);
        let first_error = match factor_information(&information) {
            Ok(chol) => return Ok(chol.solve_vec(&state.gradient)),
            Err(e) => e,
        };
        let scale = information
            .diag()
            .iter()
            .fold(0.0_f64, |acc, &v| acc.max(v.abs()))
            .max(1.0);
        let mut ridge = scale * 1e-8;
        for attempt in 0..RIDGE_ATTEMPTS {
            let mut damped = information.clone();
            damped.diag_mut().mapv_inplace(|v| v + ridge);
            if let Ok(chol) = factor_information(&damped) {
                log::debug!("Ridge {ridge:.3e} applied to the Newton step after {attempt} attempts");
                return Ok(chol.solve_vec(&state.gradient));
            }
            ridge *= 10.0;
        }
        Err(FitError::SingularInformation(first_error))
    }

    fn maximize(&self, options: &FitterOptions) -> Result<FitRecord, FitError> {
        let mut theta = self.start()?;
        let mut state = self.evaluate(&theta);
        if !state.log_likelihood.is_finite() {
            return Err(FitError::NonFiniteLikelihood { iteration: 0 });
        }

        let mut converged = false;
        let mut iterations = 0;
        let mut last_change = f64::INFINITY;
        while iterations < options.max_iterations {
            iterations += 1;
            let mut step = self.newton_step(&state)?;
            let mut trial = &theta + &step;
            let mut trial_state = self.evaluate(&trial);
            let mut halvings = 0;
            while !(trial_state.log_likelihood.is_finite()
                && trial_state.log_likelihood >= state.log_likelihood)
                && halvings < options.max_step_halvings
            {
                step *= 0.5;
                trial = &theta + &step;
                trial_state = self.evaluate(&trial);
                halvings += 1;
            }
            if halvings > 0 {
                log::debug!("Step halved {halvings} times at iteration {iterations}");
            }
            if !trial_state.log_likelihood.is_finite() {
                return Err(FitError::NonFiniteLikelihood {
                    iteration: iterations,
                });
            }
            if trial_state.log_likelihood < state.log_likelihood {
                // No ascent along the Newton direction: the current point is the optimum
                // to working precision.
                converged = true;
                break;
            }

            last_change = relative_change(state.log_likelihood, trial_state.log_likelihood);
            theta = trial;
            state = trial_state;
            if last_change <= options.tolerance {
                converged = true;
                break;
            }
        }

        if !converged {
            if options.strict_convergence {
                return Err(FitError::NonConvergence {
                    max_iterations: options.max_iterations,
                    last_change,
                });
            }
            log::warn!(
                "Fit stopped after {} iterations without converging (last relative change {:.3e})",
                iterations,
                last_change
            );
        }

        let information = state.hessian.mapv(|v| -v);
        let covariance = factor_information(&information)
            .map_err(FitError::SingularInformation)?
            .inverse();

        let p = self.num_coefficients();
        let coefficients = theta.slice(s![..p]).to_owned();
        let std_errors = covariance.diag().slice(s![..p]).mapv(f64::sqrt);
        let pvalues = coefficients
            .iter()
            .zip(std_errors.iter())
            .map(|(&b, &se)| wald_pvalue(b, se))
            .collect();
        let scale = if self.estimate_scale { theta[p].exp() } else { 1.0 };

        Ok(FitRecord {
            coefficients,
            std_errors,
            pvalues,
            scale,
            log_likelihood: state.log_likelihood,
            iterations,
            converged,
        })
    }
}

/// Cholesky factor of a symmetric information matrix, rejecting pivots that are zero
/// relative to its largest diagonal entry.
fn factor_information(matrix: &Array2<f64>) -> Result<FaerCholeskyFactor, FaerLinalgError> {
    let factor = matrix.cholesky(Side::Lower)?;
    let largest = matrix
        .diag()
        .iter()
        .fold(0.0_f64, |acc, &v| acc.max(v.abs()));
    let tolerance = RELATIVE_PIVOT_TOLERANCE * largest.max(f64::MIN_POSITIVE);
    let roots = factor.diag();
    // Negated so that NaN pivots are rejected too.
    if let Some((pivot, value)) = roots
        .iter()
        .map(|root| root * root)
        .enumerate()
        .find(|&(_, value)| !(value > tolerance))
    {
        return Err(FaerLinalgError::NearlySingular { pivot, value });
    }
    Ok(factor)
}

#[inline]
fn relative_change(previous: f64, current: f64) -> f64 {
    if previous == 0.0 {
        (current - previous).abs()
    } else {
        (1.0 - current / previous).abs()
    }
}
