//! Design tables, model formulas, and the numeric model matrix used for both
//! generating synthetic responses and refitting them.
//!
//! Categorical columns are encoded with sum-to-zero contrasts unless a column carries
//! its own [`Contrasts`] override, and numeric columns are rescaled to `[-1, 1]`.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

pub const INTERCEPT_NAME: &str = "(Intercept)";

#[derive(Error, Debug)]
pub enum DesignError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("the design table has no runs")]
    Empty,
    #[error("column '{column}' has {found} values but the design has {expected} runs")]
    RaggedColumn {
        column: String,
        expected: usize,
        found: usize,
    },
    #[error("column '{0}' appears more than once")]
    DuplicateColumn(String),
    #[error("column '{column}' has a missing value in run {row}")]
    MissingValue { column: String, row: usize },
    #[error("column '{column}' contains a non-finite value in run {row}")]
    NonFinite { column: String, row: usize },
    #[error("categorical column '{0}' has a single level and cannot be encoded")]
    SingleLevelFactor(String),
    #[error("model term '{0}' does not name a design column")]
    UnknownTerm(String),
    #[error("cannot parse model formula '{formula}': {reason}")]
    InvalidFormula { formula: String, reason: String },
    #[error("model matrix has {columns} columns but {names} column names")]
    NameCountMismatch { columns: usize, names: usize },
    #[error("model matrix has {columns} columns but a baseline vector of length {baseline}")]
    BaselineLengthMismatch { columns: usize, baseline: usize },
    #[error("model matrix has no columns")]
    NoParameters,
}

/// Encoding applied to a categorical column.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Contrasts {
    /// Sum-to-zero coding; the last level is coded `-1` in every column.
    #[default]
    Sum,
    /// Dummy coding against the first level.
    Treatment,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DesignColumn {
    Numeric(Vec<f64>),
    Categorical(Vec<String>),
}

impl DesignColumn {
    fn len(&self) -> usize {
        match self {
            Self::Numeric(values) => values.len(),
            Self::Categorical(values) => values.len(),
        }
    }
}

/// A run table: one row per design run, named numeric or categorical columns.
#[derive(Clone, Debug, Default)]
pub struct DesignTable {
    names: Vec<String>,
    columns: Vec<DesignColumn>,
    contrasts: HashMap<String, Contrasts>,
}

impl DesignTable {
    pub fn from_columns<I, S>(columns: I) -> Result<Self, DesignError>
    where
        I: IntoIterator<Item = (S, DesignColumn)>,
        S: Into<String>,
    {
        let mut table = Self::default();
        for (name, column) in columns {
            table.push_column(name.into(), column)?;
        }
        if table.nrows() == 0 {
            return Err(DesignError::Empty);
        }
        Ok(table)
    }

    /// Reads a comma-separated run table with a header row. A column whose every
    /// cell parses as a number is numeric; anything else is categorical.
    pub fn from_csv_path(path: &Path) -> Result<Self, DesignError> {
        let file = File::open(path)?;
        Self::from_csv_reader(file)
    }

    pub fn from_csv_reader<R: std::io::Read>(reader: R) -> Result<Self, DesignError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers: Vec<String> = csv_reader.headers()?.iter().map(str::to_string).collect();
        let mut cells: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
        for record in csv_reader.records() {
            let record = record?;
            for (idx, cell) in record.iter().enumerate() {
                cells[idx].push(cell.to_string());
            }
        }

        let mut columns = Vec::with_capacity(headers.len());
        for (name, raw) in headers.into_iter().zip(cells) {
            if let Some(row) = raw.iter().position(|cell| cell.is_empty()) {
                return Err(DesignError::MissingValue { column: name, row });
            }
            let parsed: Option<Vec<f64>> =
                raw.iter().map(|cell| cell.parse::<f64>().ok()).collect();
            let column = match parsed {
                Some(values) => DesignColumn::Numeric(values),
                None => DesignColumn::Categorical(raw),
            };
            columns.push((name, column));
        }
        Self::from_columns(columns)
    }

    fn push_column(&mut self, name: String, column: DesignColumn) -> Result<(), DesignError> {
        if self.names.contains(&name) {
            return Err(DesignError::DuplicateColumn(name));
        }
        if let Some(first) = self.columns.first() {
            if first.len() != column.len() {
                return Err(DesignError::RaggedColumn {
                    column: name,
                    expected: first.len(),
                    found: column.len(),
                });
            }
        }
        if let DesignColumn::Numeric(values) = &column {
            if let Some(row) = values.iter().position(|v| !v.is_finite()) {
                return Err(DesignError::NonFinite { column: name, row });
            }
        }
        self.names.push(name);
        self.columns.push(column);
        Ok(())
    }

    /// Attaches a contrast encoding to a categorical column, used in preference to
    /// the default encoder.
    pub fn set_contrasts(&mut self, name: &str, contrasts: Contrasts) -> Result<(), DesignError> {
        match self.column(name) {
            Some(DesignColumn::Categorical(_)) => {
                self.contrasts.insert(name.to_string(), contrasts);
                Ok(())
            }
            Some(DesignColumn::Numeric(_)) | None => Err(DesignError::UnknownTerm(name.to_string())),
        }
    }

    #[inline]
    pub fn nrows(&self) -> usize {
        self.columns.first().map_or(0, DesignColumn::len)
    }

    #[inline]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn column(&self, name: &str) -> Option<&DesignColumn> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|idx| &self.columns[idx])
    }

    fn contrasts_for(&self, name: &str) -> Contrasts {
        self.contrasts.get(name).copied().unwrap_or_default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum FormulaTerm {
    Variables(Vec<String>),
    AllColumns,
}

/// Right-hand side of a model formula such as `~ a + b + a:b`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelFormula {
    terms: Vec<FormulaTerm>,
    intercept: bool,
}

impl ModelFormula {
    pub fn parse(formula: &str) -> Result<Self, DesignError> {
        let invalid = |reason: &str| DesignError::InvalidFormula {
            formula: formula.to_string(),
            reason: reason.to_string(),
        };
        let rhs = match formula.split_once('~') {
            Some((_, rhs)) => rhs,
            None => formula,
        };
        if rhs.contains('~') {
            return Err(invalid("more than one '~'"));
        }

        let mut terms = Vec::new();
        let mut intercept = true;
        for (negated, piece) in split_signed(rhs) {
            let piece = piece.trim();
            if piece.is_empty() {
                return Err(invalid("empty term"));
            }
            match (negated, piece) {
                (false, "1") => intercept = true,
                (true, "1") | (false, "0") => intercept = false,
                (true, _) => return Err(invalid("only the intercept can be removed with '-'")),
                (false, ".") => terms.push(FormulaTerm::AllColumns),
                (false, _) if piece.contains('*') => {
                    let factors = split_factors(piece, '*').ok_or_else(|| invalid("empty factor in '*' term"))?;
                    for subset in nonempty_subsets(&factors) {
                        terms.push(FormulaTerm::Variables(subset));
                    }
                }
                (false, _) => {
                    let factors = split_factors(piece, ':').ok_or_else(|| invalid("empty factor in ':' term"))?;
                    terms.push(FormulaTerm::Variables(factors));
                }
            }
        }
        Ok(Self { terms, intercept })
    }

    #[inline]
    pub fn has_intercept(&self) -> bool {
        self.intercept
    }

    /// Expands the formula against a design into unique terms ordered by interaction degree.
    fn resolve(&self, table: &DesignTable) -> Result<Vec<Vec<String>>, DesignError> {
        let mut resolved: Vec<Vec<String>> = Vec::new();
        let mut seen: Vec<BTreeSet<String>> = Vec::new();
        let mut push = |term: Vec<String>| {
            let key: BTreeSet<String> = term.iter().cloned().collect();
            if key.len() == term.len() && !seen.contains(&key) {
                seen.push(key);
                resolved.push(term);
            }
        };
        for term in &self.terms {
            match term {
                FormulaTerm::AllColumns => {
                    for name in table.names() {
                        push(vec![name.clone()]);
                    }
                }
                FormulaTerm::Variables(vars) => {
                    for var in vars {
                        if var == "." {
                            return Err(DesignError::InvalidFormula {
                                formula: vars.join(":"),
                                reason: "'.' cannot appear inside an interaction".to_string(),
                            });
                        }
                        if table.column(var).is_none() {
                            return Err(DesignError::UnknownTerm(var.clone()));
                        }
                    }
                    push(vars.clone());
                }
            }
        }
        resolved.sort_by_key(Vec::len);
        Ok(resolved)
    }
}

fn split_signed(rhs: &str) -> Vec<(bool, &str)> {
    let mut pieces = Vec::new();
    let mut negated = false;
    let mut start = 0;
    for (idx, ch) in rhs.char_indices() {
        if ch == '+' || ch == '-' {
            pieces.push((negated, &rhs[start..idx]));
            negated = ch == '-';
            start = idx + 1;
        }
    }
    pieces.push((negated, &rhs[start..]));
    // A leading sign produces an empty first piece that carries no term.
    if let Some((false, first)) = pieces.first() {
        if first.trim().is_empty() && pieces.len() > 1 {
            pieces.remove(0);
        }
    }
    pieces
}

fn split_factors(piece: &str, separator: char) -> Option<Vec<String>> {
    piece
        .split(separator)
        .map(|f| {
            let f = f.trim();
            (!f.is_empty()).then(|| f.to_string())
        })
        .collect()
}

fn nonempty_subsets(factors: &[String]) -> Vec<Vec<String>> {
    let mut subsets = Vec::new();
    for mask in 1usize..(1 << factors.len()) {
        let subset: Vec<String> = factors
            .iter()
            .enumerate()
            .filter(|(idx, _)| mask & (1 << idx) != 0)
            .map(|(_, f)| f.clone())
            .collect();
        subsets.push(subset);
    }
    subsets.sort_by_key(Vec::len);
    subsets
}

/// Numeric model matrix with its column names and the baseline contrast pattern
/// used to derive anticipated coefficients.
#[derive(Clone, Debug)]
pub struct ModelMatrix {
    matrix: Array2<f64>,
    column_names: Vec<String>,
    has_intercept: bool,
    baseline: Array1<f64>,
}

impl ModelMatrix {
    /// Wraps a matrix produced elsewhere. `baseline` holds one entry per column.
    pub fn new(
        matrix: Array2<f64>,
        column_names: Vec<String>,
        has_intercept: bool,
        baseline: Array1<f64>,
    ) -> Result<Self, DesignError> {
        let columns = matrix.ncols();
        if columns == 0 {
            return Err(DesignError::NoParameters);
        }
        if matrix.nrows() == 0 {
            return Err(DesignError::Empty);
        }
        if column_names.len() != columns {
            return Err(DesignError::NameCountMismatch {
                columns,
                names: column_names.len(),
            });
        }
        if baseline.len() != columns {
            return Err(DesignError::BaselineLengthMismatch {
                columns,
                baseline: baseline.len(),
            });
        }
        Ok(Self {
            matrix,
            column_names,
            has_intercept,
            baseline,
        })
    }

    #[inline]
    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.matrix.view()
    }

    #[inline]
    pub fn nrows(&self) -> usize {
        self.matrix.nrows()
    }

    #[inline]
    pub fn ncols(&self) -> usize {
        self.matrix.ncols()
    }

    #[inline]
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    #[inline]
    pub fn has_intercept(&self) -> bool {
        self.has_intercept
    }

    #[inline]
    pub fn baseline(&self) -> ArrayView1<'_, f64> {
        self.baseline.view()
    }

    /// Baseline pattern with a leading intercept slot, present even when the matrix
    /// itself has no intercept column.
    pub fn baseline_with_intercept(&self) -> Array1<f64> {
        if self.has_intercept {
            self.baseline.clone()
        } else {
            let mut full = Array1::<f64>::ones(self.baseline.len() + 1);
            full.slice_mut(ndarray::s![1..]).assign(&self.baseline);
            full
        }
    }
}

struct EncodedColumn {
    name: String,
    values: Vec<f64>,
    baseline: f64,
}

/// Builds model matrices from a design table and a formula.
#[derive(Clone, Copy, Debug)]
pub struct ModelMatrixBuilder {
    normalize: bool,
}

impl Default for ModelMatrixBuilder {
    fn default() -> Self {
        Self { normalize: true }
    }
}

impl ModelMatrixBuilder {
    pub fn new(normalize: bool) -> Self {
        Self { normalize }
    }

    pub fn build(
        &self,
        table: &DesignTable,
        formula: &ModelFormula,
    ) -> Result<ModelMatrix, DesignError> {
        let n = table.nrows();
        if n == 0 {
            return Err(DesignError::Empty);
        }
        let terms = formula.resolve(table)?;

        let mut blocks: HashMap<String, Vec<EncodedColumn>> = HashMap::new();
        for term in &terms {
            for var in term {
                if !blocks.contains_key(var) {
                    blocks.insert(var.clone(), self.encode(table, var)?);
                }
            }
        }

        let mut encoded: Vec<EncodedColumn> = Vec::new();
        if formula.has_intercept() {
            encoded.push(EncodedColumn {
                name: INTERCEPT_NAME.to_string(),
                values: vec![1.0; n],
                baseline: 1.0,
            });
        }
        for term in &terms {
            let mut product: Vec<EncodedColumn> = vec![EncodedColumn {
                name: String::new(),
                values: vec![1.0; n],
                baseline: 1.0,
            }];
            for var in term {
                let block = blocks
                    .get(var)
                    .ok_or_else(|| DesignError::UnknownTerm(var.clone()))?;
                let mut next = Vec::with_capacity(product.len() * block.len());
                for column in block {
                    for partial in &product {
                        let name = if partial.name.is_empty() {
                            column.name.clone()
                        } else {
                            format!("{}:{}", partial.name, column.name)
                        };
                        let values = partial
                            .values
                            .iter()
                            .zip(&column.values)
                            .map(|(a, b)| a * b)
                            .collect();
                        next.push(EncodedColumn {
                            name,
                            values,
                            baseline: partial.baseline * column.baseline,
                        });
                    }
                }
                product = next;
            }
            encoded.extend(product);
        }

        let p = encoded.len();
        if p == 0 {
            return Err(DesignError::NoParameters);
        }
        let mut matrix = Array2::<f64>::zeros((n, p));
        for (j, column) in encoded.iter().enumerate() {
            for (i, &v) in column.values.iter().enumerate() {
                matrix[[i, j]] = v;
            }
        }
        let names = encoded.iter().map(|c| c.name.clone()).collect();
        let baseline = encoded.iter().map(|c| c.baseline).collect();
        log::debug!(
            "Built {}x{} model matrix (intercept: {})",
            n,
            p,
            formula.has_intercept()
        );
        ModelMatrix::new(matrix, names, formula.has_intercept(), baseline)
    }

    fn encode(&self, table: &DesignTable, name: &str) -> Result<Vec<EncodedColumn>, DesignError> {
        match table.column(name) {
            None => Err(DesignError::UnknownTerm(name.to_string())),
            Some(DesignColumn::Numeric(values)) => {
                let values = if self.normalize {
                    rescale_to_unit_range(values)
                } else {
                    values.clone()
                };
                Ok(vec![EncodedColumn {
                    name: name.to_string(),
                    values,
                    baseline: 1.0,
                }])
            }
            Some(DesignColumn::Categorical(cells)) => {
                let levels: Vec<&str> = cells
                    .iter()
                    .map(String::as_str)
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                if levels.len() < 2 {
                    return Err(DesignError::SingleLevelFactor(name.to_string()));
                }
                let k = levels.len();
                let codes: Vec<usize> = cells
                    .iter()
                    .map(|cell| levels.iter().position(|l| l == cell).unwrap_or(0))
                    .collect();
                let contrasts = table.contrasts_for(name);
                let mut columns = Vec::with_capacity(k - 1);
                for j in 0..(k - 1) {
                    let (column_name, values) = match contrasts {
                        Contrasts::Sum => (
                            format!("{name}{}", j + 1),
                            codes
                                .iter()
                                .map(|&level| {
                                    if level == j {
                                        1.0
                                    } else if level == k - 1 {
                                        -1.0
                                    } else {
                                        0.0
                                    }
                                })
                                .collect(),
                        ),
                        Contrasts::Treatment => (
                            format!("{name}{}", levels[j + 1]),
                            codes
                                .iter()
                                .map(|&level| if level == j + 1 { 1.0 } else { 0.0 })
                                .collect(),
                        ),
                    };
                    let baseline = if j % 2 == 0 { 1.0 } else { -1.0 };
                    columns.push(EncodedColumn {
                        name: column_name,
                        values,
                        baseline,
                    });
                }
                Ok(columns)
            }
        }
    }
}

/// Min-max rescaling onto `[-1, 1]`. Constant columns are returned unchanged.
pub fn rescale_to_unit_range(values: &[f64]) -> Vec<f64> {
    let (lo, hi) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let half_range = (hi - lo) / 2.0;
    if !(half_range > 0.0) {
        return values.to_vec();
    }
    let mid = (hi + lo) / 2.0;
    values.iter().map(|&v| (v - mid) / half_range).collect()
}
