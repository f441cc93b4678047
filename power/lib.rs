#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

//! Monte Carlo power estimation for designs with censored time-to-event responses.
//!
//! Anticipated coefficients are derived from an effect size, synthetic censored
//! responses are drawn from the assumed model, a parametric survival regression is
//! refit to every replicate, and the fraction of replicates in which each parameter
//! is significant at `alpha` is reported as that parameter's power.

pub mod aggregate;
pub mod coefficients;
pub mod config;
pub mod design;
pub mod evaluate;
pub mod faer_ndarray;
pub mod fit;
pub mod progress;
pub mod response;
pub mod simulate;
pub mod types;

pub use aggregate::{POWER_TYPE, PowerRow, PowerTable};
pub use coefficients::EffectSize;
pub use config::SurvivalPowerOptions;
pub use design::{Contrasts, DesignTable, ModelFormula, ModelMatrix};
pub use evaluate::{SurvivalPowerError, SurvivalPowerStudy, evaluate_survival_power};
pub use fit::{AftFitter, FitRecord, FitterOptions, SurvivalFitter};
pub use response::ResponseGenerator;
pub use types::{CensorType, CensoringRule, Distribution, SimulatedObservation};
