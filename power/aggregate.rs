use crate::design::ModelMatrix;
use crate::types::Distribution;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::Serialize;
use std::io::Write;

pub const POWER_TYPE: &str = "parameter.power.mc";

/// Run-level values repeated on every row when detailed output is requested.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunDetails {
    pub alpha: f64,
    pub distribution: Distribution,
    pub trials: usize,
    pub nsim: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PowerRow {
    pub parameter: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub power: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anticoef: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alpha: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution: Option<Distribution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trials: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nsim: Option<usize>,
}

/// Per-parameter power plus the replicate-level matrices it was computed from.
#[derive(Clone, Debug)]
pub struct PowerTable {
    rows: Vec<PowerRow>,
    estimates: Array2<f64>,
    pvalues: Array2<f64>,
    anticoef: Array1<f64>,
    model_matrix: ModelMatrix,
    detailed: bool,
}

/// Builds the power table. `details` embeds the run settings into every row.
pub fn aggregate(
    model_matrix: ModelMatrix,
    power: ArrayView1<'_, f64>,
    estimates: Array2<f64>,
    pvalues: Array2<f64>,
    anticoef: Array1<f64>,
    details: Option<RunDetails>,
) -> PowerTable {
    let rows = model_matrix
        .column_names()
        .iter()
        .zip(power.iter())
        .zip(anticoef.iter())
        .map(|((name, &power), &coef)| PowerRow {
            parameter: name.clone(),
            kind: POWER_TYPE.to_string(),
            power,
            anticoef: details.map(|_| coef),
            alpha: details.map(|d| d.alpha),
            distribution: details.map(|d| d.distribution),
            trials: details.map(|d| d.trials),
            nsim: details.map(|d| d.nsim),
        })
        .collect();
    PowerTable {
        rows,
        estimates,
        pvalues,
        anticoef,
        model_matrix,
        detailed: details.is_some(),
    }
}

impl PowerTable {
    #[inline]
    pub fn rows(&self) -> &[PowerRow] {
        &self.rows
    }

    pub fn power_of(&self, parameter: &str) -> Option<f64> {
        self.rows
            .iter()
            .find(|row| row.parameter == parameter)
            .map(|row| row.power)
    }

    #[inline]
    pub fn estimates(&self) -> ArrayView2<'_, f64> {
        self.estimates.view()
    }

    #[inline]
    pub fn pvalues(&self) -> ArrayView2<'_, f64> {
        self.pvalues.view()
    }

    #[inline]
    pub fn anticoef(&self) -> ArrayView1<'_, f64> {
        self.anticoef.view()
    }

    #[inline]
    pub fn model_matrix(&self) -> &ModelMatrix {
        &self.model_matrix
    }

    #[inline]
    pub fn is_detailed(&self) -> bool {
        self.detailed
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut out = csv::Writer::from_writer(writer);
        let mut header = vec!["parameter", "type", "power"];
        if self.detailed {
            header.extend(["anticoef", "alpha", "distribution", "trials", "nsim"]);
        }
        out.write_record(&header)?;
        for row in &self.rows {
            let mut record = vec![row.parameter.clone(), row.kind.clone(), row.power.to_string()];
            if self.detailed {
                record.push(format_option(row.anticoef));
                record.push(format_option(row.alpha));
                record.push(format_option(row.distribution));
                record.push(format_option(row.trials));
                record.push(format_option(row.nsim));
            }
            out.write_record(&record)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Writes the replicate estimates, one row per replicate and one column per parameter.
    pub fn write_estimates_csv<W: Write>(&self, writer: W) -> Result<(), csv::Error> {
        write_matrix_csv(writer, self.model_matrix.column_names(), self.estimates.view())
    }

    pub fn write_pvalues_csv<W: Write>(&self, writer: W) -> Result<(), csv::Error> {
        write_matrix_csv(writer, self.model_matrix.column_names(), self.pvalues.view())
    }
}

fn format_option<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn write_matrix_csv<W: Write>(
    writer: W,
    names: &[String],
    matrix: ArrayView2<'_, f64>,
) -> Result<(), csv::Error> {
    let mut out = csv::Writer::from_writer(writer);
    out.write_record(names)?;
    for row in matrix.rows() {
        out.write_record(row.iter().map(|v| v.to_string()))?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn table(details: Option<RunDetails>) -> PowerTable {
        let mm = ModelMatrix::new(
            array![[1.0, 1.0], [1.0, -1.0]],
            vec!["(Intercept)".to_string(), "a1".to_string()],
            true,
            array![1.0, 1.0],
        )
        .expect("model matrix");
        aggregate(
            mm,
            array![0.25, 0.75].view(),
            array![[0.1, 0.9], [0.2, 1.1], [0.3, 1.0], [0.0, 0.8]],
            array![[0.5, 0.01], [0.2, 0.02], [0.01, 0.3], [0.6, 0.04]],
            array![0.0, 1.0],
            details,
        )
    }

    #[test]
    fn one_row_per_parameter_with_the_monte_carlo_type() {
        let t = table(None);
        assert_eq!(t.rows().len(), 2);
        assert!(t.rows().iter().all(|r| r.kind == POWER_TYPE));
        assert_eq!(t.power_of("a1"), Some(0.75));
        assert_eq!(t.power_of("b"), None);
        assert_eq!(t.estimates().dim(), (4, 2));
        assert!(t.rows()[0].alpha.is_none());
    }

    #[test]
    fn detailed_rows_repeat_the_run_settings() {
        let details = RunDetails {
            alpha: 0.05,
            distribution: Distribution::Lognormal,
            trials: 2,
            nsim: 4,
        };
        let t = table(Some(details));
        assert!(t.is_detailed());
        assert_eq!(t.rows()[1].anticoef, Some(1.0));
        assert!(t.rows().iter().all(|r| r.nsim == Some(4) && r.trials == Some(2)));

        let mut buffer = Vec::new();
        t.write_csv(&mut buffer).expect("write");
        let text = String::from_utf8(buffer).expect("utf8");
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("parameter,type,power,anticoef,alpha,distribution,trials,nsim")
        );
        assert_eq!(
            lines.next(),
            Some("(Intercept),parameter.power.mc,0.25,0,0.05,lognormal,2,4")
        );
    }

    #[test]
    fn matrices_are_written_with_parameter_headers() {
        let mut buffer = Vec::new();
        table(None).write_estimates_csv(&mut buffer).expect("write");
        let text = String::from_utf8(buffer).expect("utf8");
        assert_eq!(text.lines().count(), 5);
        assert!(text.starts_with("(Intercept),a1\n0.1,0.9\n"));
    }
}
