use crate::types::{CensoringRule, Distribution, SimulatedObservation};
use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::{Rng, RngCore};
use rand_distr::{Exp1, StandardNormal};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Signature shared by every response generator: model matrix, coefficients, censoring
/// rule and a random source in, one observation per design run out.
pub type GeneratorFn = dyn Fn(ArrayView2<'_, f64>, ArrayView1<'_, f64>, &CensoringRule, &mut dyn RngCore) -> Vec<SimulatedObservation>
    + Send
    + Sync;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResponseError {
    #[error("response generator returned {actual} observations for {expected} design runs")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Draws censored synthetic responses for one replicate.
#[derive(Clone)]
pub enum ResponseGenerator {
    /// `Normal(η, 1)`.
    Gaussian,
    /// `Exponential(rate = exp(-η))`, i.e. mean `exp(η)`.
    Exponential,
    /// `LogNormal(meanlog = η, sdlog = 1)`.
    Lognormal,
    Custom(Arc<GeneratorFn>),
}

impl fmt::Debug for ResponseGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gaussian => f.write_str("Gaussian"),
            Self::Exponential => f.write_str("Exponential"),
            Self::Lognormal => f.write_str("Lognormal"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl ResponseGenerator {
    pub fn for_distribution(distribution: Distribution) -> Self {
        match distribution {
            Distribution::Gaussian => Self::Gaussian,
            Distribution::Exponential => Self::Exponential,
            Distribution::Lognormal => Self::Lognormal,
        }
    }

    pub fn custom<F>(generator: F) -> Self
    where
        F: Fn(ArrayView2<'_, f64>, ArrayView1<'_, f64>, &CensoringRule, &mut dyn RngCore) -> Vec<SimulatedObservation>
            + Send
            + Sync
            + 'static,
    {
        Self::Custom(Arc::new(generator))
    }

    pub fn generate<R: RngCore>(
        &self,
        model_matrix: ArrayView2<'_, f64>,
        coefficients: ArrayView1<'_, f64>,
        rule: &CensoringRule,
        rng: &mut R,
    ) -> Result<Vec<SimulatedObservation>, ResponseError> {
        let observations = match self {
            Self::Gaussian => draw_gaussian(model_matrix, coefficients, rule, rng),
            Self::Exponential => draw_exponential(model_matrix, coefficients, rule, rng),
            Self::Lognormal => draw_lognormal(model_matrix, coefficients, rule, rng),
            Self::Custom(generator) => generator(model_matrix, coefficients, rule, rng),
        };
        if observations.len() != model_matrix.nrows() {
            return Err(ResponseError::LengthMismatch {
                expected: model_matrix.nrows(),
                actual: observations.len(),
            });
        }
        Ok(observations)
    }
}

#[inline]
fn linear_predictor(model_matrix: ArrayView2<'_, f64>, coefficients: ArrayView1<'_, f64>) -> Array1<f64> {
    model_matrix.dot(&coefficients)
}

pub fn draw_gaussian<R: Rng + ?Sized>(
    model_matrix: ArrayView2<'_, f64>,
    coefficients: ArrayView1<'_, f64>,
    rule: &CensoringRule,
    rng: &mut R,
) -> Vec<SimulatedObservation> {
    linear_predictor(model_matrix, coefficients)
        .iter()
        .map(|&eta| {
            let noise: f64 = rng.sample(StandardNormal);
            rule.apply(eta + noise)
        })
        .collect()
}

pub fn draw_exponential<R: Rng + ?Sized>(
    model_matrix: ArrayView2<'_, f64>,
    coefficients: ArrayView1<'_, f64>,
    rule: &CensoringRule,
    rng: &mut R,
) -> Vec<SimulatedObservation> {
    linear_predictor(model_matrix, coefficients)
        .iter()
        .map(|&eta| {
            let unit: f64 = rng.sample(Exp1);
            rule.apply(eta.exp() * unit)
        })
        .collect()
}

pub fn draw_lognormal<R: Rng + ?Sized>(
    model_matrix: ArrayView2<'_, f64>,
    coefficients: ArrayView1<'_, f64>,
    rule: &CensoringRule,
    rng: &mut R,
) -> Vec<SimulatedObservation> {
    linear_predictor(model_matrix, coefficients)
        .iter()
        .map(|&eta| {
            let noise: f64 = rng.sample(StandardNormal);
            rule.apply((eta + noise).exp())
        })
        .collect()
}
