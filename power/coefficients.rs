use crate::design::ModelMatrix;
use crate::types::Distribution;
use ndarray::{Array1, ArrayView1, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_EFFECT_SIZE: EffectSize = EffectSize::Scalar(2.0);

/// Anticipated effect: a single signal-to-noise value, or the `(low, high)` pair of
/// responses the design should be able to distinguish.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EffectSize {
    Scalar(f64),
    Range(f64, f64),
}

#[derive(Debug, Error, PartialEq)]
pub enum CoefficientError {
    #[error("expected {expected} anticipated coefficients (one per model matrix column), got {actual}")]
    InvalidCount { expected: usize, actual: usize },
    #[error("effect size {0:?} contains a non-finite value")]
    NonFiniteEffect(EffectSize),
    #[error("effect size bounds must be positive for the {distribution} distribution, got ({low}, {high})")]
    NonPositiveEffect {
        distribution: Distribution,
        low: f64,
        high: f64,
    },
    #[error("anticipated coefficient {index} is not finite")]
    NonFiniteCoefficient { index: usize },
}

/// Turns an effect size into anticipated coefficients.
///
/// `baseline` always starts with the intercept slot, whether or not the model matrix
/// carries an intercept column; the slot is dropped from the result when
/// `has_intercept` is false.
pub fn derive_anticoef(
    baseline: ArrayView1<'_, f64>,
    effect: EffectSize,
    distribution: Distribution,
    has_intercept: bool,
) -> Result<Array1<f64>, CoefficientError> {
    let mut coefficients = match effect {
        EffectSize::Scalar(size) => {
            if !size.is_finite() {
                return Err(CoefficientError::NonFiniteEffect(effect));
            }
            baseline.mapv(|b| b * size / 2.0)
        }
        EffectSize::Range(low, high) => {
            if !low.is_finite() || !high.is_finite() {
                return Err(CoefficientError::NonFiniteEffect(effect));
            }
            match distribution {
                Distribution::Gaussian => baseline.mapv(|b| b * (high - low) / 2.0),
                Distribution::Exponential | Distribution::Lognormal => {
                    if low <= 0.0 || high <= 0.0 {
                        return Err(CoefficientError::NonPositiveEffect {
                            distribution,
                            low,
                            high,
                        });
                    }
                    let mut coefficients = baseline.mapv(|b| b * (high.ln() - low.ln()) / 2.0);
                    if !coefficients.is_empty() {
                        coefficients[0] = 0.5 * (high.ln() + low.ln());
                    }
                    coefficients
                }
            }
        }
    };
    if !has_intercept && !coefficients.is_empty() {
        coefficients = coefficients.slice(s![1..]).to_owned();
    }
    Ok(coefficients)
}

/// Picks the coefficients used for simulation: an explicit vector wins over the
/// effect size, which is then ignored with a warning.
pub fn resolve_anticoef(
    model_matrix: &ModelMatrix,
    explicit: Option<&[f64]>,
    effect: Option<EffectSize>,
    distribution: Distribution,
) -> Result<Array1<f64>, CoefficientError> {
    match explicit {
        Some(values) => {
            if effect.is_some() {
                log::warn!(
                    "Both anticipated coefficients and an effect size were supplied; ignoring the effect size."
                );
            }
            if values.len() != model_matrix.ncols() {
                return Err(CoefficientError::InvalidCount {
                    expected: model_matrix.ncols(),
                    actual: values.len(),
                });
            }
            if let Some(index) = values.iter().position(|v| !v.is_finite()) {
                return Err(CoefficientError::NonFiniteCoefficient { index });
            }
            Ok(Array1::from_vec(values.to_vec()))
        }
        None => derive_anticoef(
            model_matrix.baseline_with_intercept().view(),
            effect.unwrap_or(DEFAULT_EFFECT_SIZE),
            distribution,
            model_matrix.has_intercept(),
        ),
    }
}
