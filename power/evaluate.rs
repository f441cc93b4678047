use crate::aggregate::{PowerTable, RunDetails, aggregate};
use crate::coefficients::{CoefficientError, resolve_anticoef};
use crate::config::{ConfigError, SurvivalPowerOptions};
use crate::design::{DesignError, DesignTable, ModelFormula, ModelMatrix, ModelMatrixBuilder};
use crate::fit::{AftFitter, FitError, SurvivalFitter};
use crate::progress::{NoopProgress, ProgressObserver};
use crate::response::{ResponseError, ResponseGenerator};
use crate::simulate::{ExecutionMode, SimulationError, SimulationPlan, run_simulation};
use crate::types::CensoringRule;
use ndarray::Array1;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SurvivalPowerError {
    #[error("invalid argument '{argument}': {reason}")]
    InvalidArgument { argument: String, reason: String },
    #[error("design error: {0}")]
    Design(#[from] DesignError),
    #[error("configuration error: {0}")]
    Config(ConfigError),
    #[error("fit failure in replicate {replicate}: {source}")]
    Fit {
        replicate: usize,
        #[source]
        source: FitError,
    },
    #[error("response generation failed in replicate {replicate}: {source}")]
    Response {
        replicate: usize,
        #[source]
        source: ResponseError,
    },
    #[error("simulation error: {0}")]
    Simulation(SimulationError),
}

impl From<ConfigError> for SurvivalPowerError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Deprecated { name, replacement } => Self::InvalidArgument {
                reason: format!("this parameter is deprecated; use '{replacement}' instead"),
                argument: name,
            },
            ConfigError::Invalid { name, reason } => Self::InvalidArgument {
                argument: name.to_string(),
                reason,
            },
            other => Self::Config(other),
        }
    }
}

impl From<CoefficientError> for SurvivalPowerError {
    fn from(err: CoefficientError) -> Self {
        let argument = match err {
            CoefficientError::InvalidCount { .. } | CoefficientError::NonFiniteCoefficient { .. } => "anticoef",
            CoefficientError::NonFiniteEffect(_) | CoefficientError::NonPositiveEffect { .. } => "effect_size",
        };
        Self::InvalidArgument {
            argument: argument.to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<SimulationError> for SurvivalPowerError {
    fn from(err: SimulationError) -> Self {
        match err {
            SimulationError::Fit { replicate, source } => Self::Fit { replicate, source },
            SimulationError::Response { replicate, source } => Self::Response { replicate, source },
            SimulationError::CoefficientMismatch { .. } => Self::InvalidArgument {
                argument: "anticoef".to_string(),
                reason: err.to_string(),
            },
            SimulationError::InvalidAlpha(_) => Self::InvalidArgument {
                argument: "alpha".to_string(),
                reason: err.to_string(),
            },
            SimulationError::NoReplicates => Self::InvalidArgument {
                argument: "nsim".to_string(),
                reason: err.to_string(),
            },
            other => Self::Simulation(other),
        }
    }
}

/// A validated evaluation: model matrix, anticipated coefficients and options, ready
/// to simulate. Every argument check happens when the study is built.
#[derive(Debug, Clone)]
pub struct SurvivalPowerStudy {
    model_matrix: ModelMatrix,
    anticoef: Array1<f64>,
    options: SurvivalPowerOptions,
    generator: ResponseGenerator,
}

impl SurvivalPowerStudy {
    pub fn new(
        design: &DesignTable,
        formula: &str,
        options: SurvivalPowerOptions,
    ) -> Result<Self, SurvivalPowerError> {
        options.validate()?;
        let formula = ModelFormula::parse(formula)?;
        let model_matrix = ModelMatrixBuilder::new(options.normalize).build(design, &formula)?;
        Self::from_model_matrix(model_matrix, options)
    }

    /// Starts from a model matrix built elsewhere.
    pub fn from_model_matrix(
        model_matrix: ModelMatrix,
        options: SurvivalPowerOptions,
    ) -> Result<Self, SurvivalPowerError> {
        options.validate()?;
        let anticoef = resolve_anticoef(
            &model_matrix,
            options.anticoef.as_deref(),
            options.effect_size,
            options.distribution,
        )?;
        log::debug!(
            "Anticipated coefficients: {}",
            model_matrix
                .column_names()
                .iter()
                .zip(anticoef.iter())
                .map(|(name, coef)| format!("{name}={coef:.4}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let generator = ResponseGenerator::for_distribution(options.distribution);
        Ok(Self {
            model_matrix,
            anticoef,
            options,
            generator,
        })
    }

    /// Replaces the built-in draw for the configured distribution.
    pub fn with_response_generator(mut self, generator: ResponseGenerator) -> Self {
        self.generator = generator;
        self
    }

    #[inline]
    pub fn model_matrix(&self) -> &ModelMatrix {
        &self.model_matrix
    }

    #[inline]
    pub fn anticoef(&self) -> &Array1<f64> {
        &self.anticoef
    }

    #[inline]
    pub fn options(&self) -> &SurvivalPowerOptions {
        &self.options
    }

    pub fn run(&self, progress: &mut dyn ProgressObserver) -> Result<PowerTable, SurvivalPowerError> {
        let fitter = AftFitter::new(self.options.fitter.clone());
        self.run_with_fitter(&fitter, progress)
    }

    pub fn run_with_fitter<F: SurvivalFitter + ?Sized>(
        &self,
        fitter: &F,
        progress: &mut dyn ProgressObserver,
    ) -> Result<PowerTable, SurvivalPowerError> {
        let options = &self.options;
        let seed = options.seed.unwrap_or_else(rand::random);
        let plan = SimulationPlan {
            model_matrix: self.model_matrix.view(),
            coefficients: self.anticoef.view(),
            generator: &self.generator,
            distribution: options.distribution,
            censoring: CensoringRule::new(options.censor_point, options.censor_type),
            alpha: options.alpha,
            nsim: options.nsim,
            seed,
        };
        let mode = if options.parallel {
            ExecutionMode::Parallel {
                workers: options.worker_count(),
            }
        } else {
            ExecutionMode::Serial
        };
        log::debug!("Replicate streams derived from seed {seed}");

        let output = run_simulation(&plan, fitter, mode, progress)?;
        let details = options.detailed_output.then(|| RunDetails {
            alpha: options.alpha,
            distribution: options.distribution,
            trials: self.model_matrix.nrows(),
            nsim: options.nsim,
        });
        Ok(aggregate(
            self.model_matrix.clone(),
            output.power.view(),
            output.estimates,
            output.pvalues,
            self.anticoef.clone(),
            details,
        ))
    }
}

/// Estimates per-parameter power for `formula` over `design` with the built-in
/// response generator and fitter.
pub fn evaluate_survival_power(
    design: &DesignTable,
    formula: &str,
    options: SurvivalPowerOptions,
) -> Result<PowerTable, SurvivalPowerError> {
    SurvivalPowerStudy::new(design, formula, options)?.run(&mut NoopProgress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::DesignColumn;

    fn design() -> DesignTable {
        DesignTable::from_columns([(
            "a",
            DesignColumn::Categorical(
                (0..10).map(|i| if i % 2 == 0 { "x" } else { "y" }.to_string()).collect(),
            ),
        )])
        .expect("design")
    }

    #[test]
    fn coefficient_count_mismatch_is_an_invalid_argument() {
        let options = SurvivalPowerOptions {
            anticoef: Some(vec![1.0, 2.0, 3.0]),
            ..SurvivalPowerOptions::default()
        };
        let err = SurvivalPowerStudy::new(&design(), "~ a", options).unwrap_err();
        match err {
            SurvivalPowerError::InvalidArgument { argument, reason } => {
                assert_eq!(argument, "anticoef");
                assert!(reason.contains("expected 2"), "{reason}");
                assert!(reason.contains("got 3"), "{reason}");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn invalid_options_fail_before_the_model_matrix_is_built() {
        let options = SurvivalPowerOptions {
            alpha: 0.0,
            ..SurvivalPowerOptions::default()
        };
        let err = SurvivalPowerStudy::new(&design(), "~ nonexistent", options).unwrap_err();
        assert!(matches!(err, SurvivalPowerError::InvalidArgument { ref argument, .. } if argument == "alpha"));
    }

    #[test]
    fn detailed_output_embeds_run_settings() {
        let options = SurvivalPowerOptions {
            nsim: 20,
            seed: Some(8),
            detailed_output: true,
            ..SurvivalPowerOptions::default()
        };
        let table = evaluate_survival_power(&design(), "~ a", options).expect("evaluate");
        assert!(table.is_detailed());
        for row in table.rows() {
            assert_eq!(row.trials, Some(10));
            assert_eq!(row.nsim, Some(20));
            assert_eq!(row.alpha, Some(0.05));
        }
        assert_eq!(table.anticoef().to_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn deprecated_config_keys_surface_as_invalid_arguments() {
        let err: SurvivalPowerError = SurvivalPowerOptions::from_toml_str("run_matrix = 1")
            .unwrap_err()
            .into();
        assert!(matches!(err, SurvivalPowerError::InvalidArgument { ref argument, .. } if argument == "run_matrix"));
        assert!(err.to_string().contains("'design'"));
    }
}
