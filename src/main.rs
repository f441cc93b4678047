#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fs::File;
use std::io::{self, BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process;
use survpower::config::reject_deprecated;
use survpower::progress::{NoopProgress, ProgressObserver};
use survpower::{
    CensorType, Contrasts, DesignTable, Distribution, EffectSize, PowerTable, SurvivalPowerError,
    SurvivalPowerOptions, SurvivalPowerStudy,
};
use thiserror::Error;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DistributionCli {
    Gaussian,
    Exponential,
    Lognormal,
}

impl From<DistributionCli> for Distribution {
    fn from(value: DistributionCli) -> Self {
        match value {
            DistributionCli::Gaussian => Distribution::Gaussian,
            DistributionCli::Exponential => Distribution::Exponential,
            DistributionCli::Lognormal => Distribution::Lognormal,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CensorTypeCli {
    Left,
    Right,
}

impl From<CensorTypeCli> for CensorType {
    fn from(value: CensorTypeCli) -> Self {
        match value {
            CensorTypeCli::Left => CensorType::Left,
            CensorTypeCli::Right => CensorType::Right,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "survpower",
    version,
    about = "Monte Carlo power for designed experiments with censored time-to-event responses."
)]
struct Cli {
    /// Design table (CSV with a header row), one row per run
    #[arg(value_name = "DESIGN_CSV")]
    design: PathBuf,

    /// Model formula, e.g. "~ a + b + a:b"
    #[arg(long, default_value = "~ .")]
    model: String,

    /// TOML file with evaluation options; flags given here take precedence
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Significance level
    #[arg(long)]
    alpha: Option<f64>,

    /// Number of Monte Carlo replicates
    #[arg(long)]
    nsim: Option<usize>,

    #[arg(long, value_enum)]
    distribution: Option<DistributionCli>,

    /// Censoring threshold; omit for no censoring
    #[arg(long, allow_hyphen_values = true)]
    censor_point: Option<f64>,

    #[arg(long, value_enum)]
    censor_type: Option<CensorTypeCli>,

    /// Effect size: a single value, or "LOW,HIGH"
    #[arg(long, value_parser = parse_effect_size, allow_hyphen_values = true)]
    effect_size: Option<EffectSize>,

    /// Anticipated coefficients, one per model matrix column
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true, num_args = 1..)]
    anticoef: Option<Vec<f64>>,

    /// Fit replicates on a worker pool
    #[arg(long)]
    parallel: bool,

    /// Worker pool size (defaults to the number of logical CPUs)
    #[arg(long, value_name = "N")]
    threads: Option<usize>,

    /// Add the run settings to every output row
    #[arg(long)]
    detailed: bool,

    #[arg(long)]
    seed: Option<u64>,

    /// Keep numeric design columns on their original scale
    #[arg(long)]
    no_normalize: bool,

    /// Categorical columns coded with treatment contrasts instead of sum contrasts
    #[arg(long, value_name = "COLUMN", value_delimiter = ',')]
    treatment_contrasts: Vec<String>,

    /// Write the power table here instead of stdout
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Write the per-replicate coefficient estimates as CSV
    #[arg(long, value_name = "PATH")]
    estimates_out: Option<PathBuf>,

    /// Write the per-replicate p-values as CSV
    #[arg(long, value_name = "PATH")]
    pvalues_out: Option<PathBuf>,

    /// Save the effective options as TOML
    #[arg(long, value_name = "PATH")]
    save_config: Option<PathBuf>,

    #[arg(long)]
    no_progress: bool,

    #[arg(long, hide = true)]
    run_matrix: Option<String>,

    #[arg(long, hide = true)]
    delta: Option<String>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Power(#[from] SurvivalPowerError),
    #[error("could not write '{}': {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not write CSV output: {0}")]
    Csv(#[from] csv::Error),
}

fn parse_effect_size(text: &str) -> Result<EffectSize, String> {
    let parts: Vec<&str> = text.split(',').map(str::trim).collect();
    let parse = |s: &str| s.parse::<f64>().map_err(|e| format!("'{s}' is not a number: {e}"));
    match parts.as_slice() {
        [single] => Ok(EffectSize::Scalar(parse(single)?)),
        [low, high] => Ok(EffectSize::Range(parse(low)?, parse(high)?)),
        _ => Err("expected a single value or LOW,HIGH".to_string()),
    }
}

/// Progress bar over the replicates; fractions accumulate into a position.
struct BarProgress {
    bar: ProgressBar,
    total: u64,
    completed: f64,
}

impl BarProgress {
    fn new() -> Self {
        let draw_target = if io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(None, draw_target);
        if let Ok(style) =
            ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} replicates ({eta})")
        {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        Self {
            bar,
            total: 0,
            completed: 0.0,
        }
    }
}

impl ProgressObserver for BarProgress {
    fn on_start(&mut self, total_replicates: usize) {
        self.total = total_replicates as u64;
        self.completed = 0.0;
        self.bar.set_length(self.total);
        self.bar.set_position(0);
    }

    fn on_advance(&mut self, fraction: f64) {
        self.completed += fraction;
        let position = (self.completed * self.total as f64).round() as u64;
        self.bar.set_position(position.min(self.total));
    }

    fn on_finish(&mut self) {
        self.bar.set_position(self.total);
        self.bar.finish_and_clear();
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let deprecated = [
        cli.run_matrix.as_ref().map(|_| "run_matrix"),
        cli.delta.as_ref().map(|_| "delta"),
    ];
    reject_deprecated(deprecated.into_iter().flatten()).map_err(SurvivalPowerError::from)?;

    let options = resolve_options(&cli)?;
    if let Some(path) = &cli.save_config {
        options.save(path).map_err(SurvivalPowerError::from)?;
        log::info!("Saved options to {}", path.display());
    }

    let mut design = DesignTable::from_csv_path(&cli.design).map_err(SurvivalPowerError::from)?;
    for column in &cli.treatment_contrasts {
        design
            .set_contrasts(column, Contrasts::Treatment)
            .map_err(SurvivalPowerError::from)?;
    }
    log::info!(
        "Loaded design '{}': {} runs, columns [{}]",
        cli.design.display(),
        design.nrows(),
        design.names().join(", ")
    );

    let study = SurvivalPowerStudy::new(&design, &cli.model, options)?;
    log::info!(
        "Model matrix columns: {}",
        study.model_matrix().column_names().join(", ")
    );
    let table = if cli.no_progress {
        study.run(&mut NoopProgress)?
    } else {
        study.run(&mut BarProgress::new())?
    };

    write_outputs(&cli, &table)
}

fn resolve_options(cli: &Cli) -> Result<SurvivalPowerOptions, SurvivalPowerError> {
    let mut options = match &cli.config {
        Some(path) => SurvivalPowerOptions::load(path)?,
        None => SurvivalPowerOptions::default(),
    };
    if let Some(alpha) = cli.alpha {
        options.alpha = alpha;
    }
    if let Some(nsim) = cli.nsim {
        options.nsim = nsim;
    }
    if let Some(distribution) = cli.distribution {
        options.distribution = distribution.into();
    }
    if let Some(point) = cli.censor_point {
        options.censor_point = Some(point);
    }
    if let Some(censor_type) = cli.censor_type {
        options.censor_type = censor_type.into();
    }
    if let Some(effect) = cli.effect_size {
        options.effect_size = Some(effect);
    }
    if let Some(anticoef) = &cli.anticoef {
        options.anticoef = Some(anticoef.clone());
    }
    if cli.parallel {
        options.parallel = true;
    }
    if let Some(threads) = cli.threads {
        options.workers = Some(threads);
    }
    if cli.detailed {
        options.detailed_output = true;
    }
    if let Some(seed) = cli.seed {
        options.seed = Some(seed);
    }
    if cli.no_normalize {
        options.normalize = false;
    }
    options.validate()?;
    Ok(options)
}

fn write_outputs(cli: &Cli, table: &PowerTable) -> Result<(), CliError> {
    match &cli.output {
        Some(path) => table.write_csv(create_output(path)?)?,
        None => table.write_csv(io::stdout().lock())?,
    }
    if let Some(path) = &cli.estimates_out {
        table.write_estimates_csv(create_output(path)?)?;
    }
    if let Some(path) = &cli.pvalues_out {
        table.write_pvalues_csv(create_output(path)?)?;
    }
    Ok(())
}

fn create_output(path: &Path) -> Result<impl Write, CliError> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|source| CliError::Output {
            path: path.to_path_buf(),
            source,
        })
}
