use crate::coefficients::EffectSize;
use crate::fit::FitterOptions;
use crate::types::{CensorType, Distribution};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Parameter names that were renamed; supplying one is an error naming the replacement.
pub const DEPRECATED_PARAMETERS: &[(&str, &str)] = &[
    ("RunMatrix", "design"),
    ("run_matrix", "design"),
    ("delta", "effect_size"),
    ("effectsize", "effect_size"),
    ("censorpoint", "censor_point"),
    ("censortype", "censor_type"),
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("toml serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("the '{name}' parameter is deprecated; use '{replacement}' instead")]
    Deprecated {
        name: String,
        replacement: &'static str,
    },
    #[error("invalid value for '{name}': {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Every knob of a survival power evaluation. Loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SurvivalPowerOptions {
    pub alpha: f64,
    pub nsim: usize,
    pub distribution: Distribution,
    pub censor_point: Option<f64>,
    pub censor_type: CensorType,
    /// Explicit anticipated coefficients, one per model matrix column.
    pub anticoef: Option<Vec<f64>>,
    /// Used when `anticoef` is absent; defaults to a scalar effect of 2.
    pub effect_size: Option<EffectSize>,
    pub parallel: bool,
    /// Worker pool size in parallel mode; defaults to the number of logical CPUs.
    pub workers: Option<usize>,
    pub detailed_output: bool,
    /// Base seed for the replicate streams; drawn from OS entropy when absent.
    pub seed: Option<u64>,
    /// Rescale numeric design columns to `[-1, 1]` before building the model matrix.
    pub normalize: bool,
    pub fitter: FitterOptions,
}

impl Default for SurvivalPowerOptions {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            nsim: 1000,
            distribution: Distribution::Gaussian,
            censor_point: None,
            censor_type: CensorType::Right,
            anticoef: None,
            effect_size: None,
            parallel: false,
            workers: None,
            detailed_output: false,
            seed: None,
            normalize: true,
            fitter: FitterOptions::default(),
        }
    }
}

impl SurvivalPowerOptions {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = text.parse()?;
        reject_deprecated(table.keys().map(String::as_str))?;
        let options: Self = toml::Value::Table(table).try_into()?;
        Ok(options)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Worker count for parallel mode.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(ConfigError::Invalid {
                name: "alpha",
                reason: format!("must lie strictly between 0 and 1, got {}", self.alpha),
            });
        }
        if self.nsim == 0 {
            return Err(ConfigError::Invalid {
                name: "nsim",
                reason: "at least one replicate is required".to_string(),
            });
        }
        if let Some(point) = self.censor_point {
            if !point.is_finite() {
                return Err(ConfigError::Invalid {
                    name: "censor_point",
                    reason: format!("must be finite, got {point}"),
                });
            }
            if self.distribution.is_log_scale() && point <= 0.0 {
                return Err(ConfigError::Invalid {
                    name: "censor_point",
                    reason: format!(
                        "must be positive for the {} distribution, got {point}",
                        self.distribution
                    ),
                });
            }
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid {
                name: "workers",
                reason: "the worker pool needs at least one thread".to_string(),
            });
        }
        if self.fitter.max_iterations == 0 {
            return Err(ConfigError::Invalid {
                name: "fitter.max_iterations",
                reason: "at least one iteration is required".to_string(),
            });
        }
        Ok(())
    }
}

/// Fails on the first deprecated parameter name among `names`.
pub fn reject_deprecated<'a, I>(names: I) -> Result<(), ConfigError>
where
    I: IntoIterator<Item = &'a str>,
{
    for name in names {
        if let Some(&(_, replacement)) = DEPRECATED_PARAMETERS.iter().find(|(old, _)| *old == name) {
            return Err(ConfigError::Deprecated {
                name: name.to_string(),
                replacement,
            });
        }
    }
    Ok(())
}
