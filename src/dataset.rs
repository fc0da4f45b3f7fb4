use crate::error::{PlotError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A single column of the dataset.
///
/// Numeric columns store missing values as NaN. `integral` records that every
/// value was read as an integer, which only affects how values stringify.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub enum Column {
    Numeric { values: Vec<f64>, integral: bool },
    Text(Vec<Option<String>>),
}

impl Column {
    pub fn numeric(values: Vec<f64>) -> Self {
        Column::Numeric {
            values,
            integral: false,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Column::Numeric { values, .. } => values.len(),
            Column::Text(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Column::Numeric { .. })
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match self {
            Column::Numeric { values, .. } => Some(values),
            Column::Text(_) => None,
        }
    }

    /// String form of one cell, matching how the values print when exported.
    pub fn value_string(&self, row: usize) -> String {
        match self {
            Column::Numeric { values, integral } => {
                let v = values[row];
                if *integral && v.is_finite() {
                    format!("{}", v as i64)
                } else {
                    format_float(v)
                }
            }
            Column::Text(values) => match &values[row] {
                Some(s) => s.clone(),
                None => "nan".to_string(),
            },
        }
    }

    /// `true` when the cell holds no value (NaN or missing text).
    pub fn is_missing(&self, row: usize) -> bool {
        match self {
            Column::Numeric { values, .. } => values[row].is_nan(),
            Column::Text(values) => values[row].is_none(),
        }
    }
}

/// Format a float the way a dataframe prints it: integral values keep a
/// trailing `.0`, very large or tiny magnitudes switch to exponent form.
pub fn format_float(v: f64) -> String {
    if v.is_nan() {
        return "nan".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let abs = v.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        // `{:e}` gives 1.5e-7; pad the exponent to at least two digits.
        let s = format!("{:e}", v);
        if let Some((mantissa, exp)) = s.split_once('e') {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            return format!("{}e{}{:0>2}", mantissa, sign, digits);
        }
        return s;
    }
    if v.fract() == 0.0 {
        format!("{:.1}", v)
    } else {
        format!("{}", v)
    }
}

/// An in-memory, columnar table owned by one session worker.
///
/// Rows are never removed; the only mutation is adding (or replacing) a
/// column, which is how math variables land in the table.
#[derive(Clone, Debug, Default)]
pub struct Dataset {
    rows: usize,
    names: Vec<String>,
    columns: Vec<Column>,
    index: HashMap<String, usize>,
    col_labels: Option<Value>,
}

impl Dataset {
    pub fn new(rows: usize) -> Self {
        Dataset {
            rows,
            ..Default::default()
        }
    }

    /// Build a dataset from named columns. All columns must be the same length.
    pub fn from_columns(columns: Vec<(String, Column)>) -> Result<Self> {
        let rows = columns.first().map(|(_, c)| c.len()).unwrap_or(0);
        let mut ds = Dataset::new(rows);
        for (name, col) in columns {
            ds.set_column(&name, col)?;
        }
        Ok(ds)
    }

    pub fn row_count(&self) -> usize {
        self.rows
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Insert a column, replacing any existing column with the same name.
    pub fn set_column(&mut self, name: &str, column: Column) -> Result<()> {
        if column.len() != self.rows {
            return Err(PlotError::invalid_request(format!(
                "Column \"{}\" has {} rows, expected {}.",
                name,
                column.len(),
                self.rows
            )));
        }
        match self.index.get(name) {
            Some(&i) => self.columns[i] = column,
            None => {
                self.index.insert(name.to_string(), self.columns.len());
                self.names.push(name.to_string());
                self.columns.push(column);
            }
        }
        Ok(())
    }

    pub fn column(&self, name: &str) -> Result<&Column> {
        self.index
            .get(name)
            .map(|&i| &self.columns[i])
            .ok_or_else(|| PlotError::UnknownColumn(name.to_string()))
    }

    /// Numeric view of a column; text columns cannot be plotted.
    pub fn numeric(&self, name: &str) -> Result<&[f64]> {
        self.column(name)?.as_f64().ok_or_else(|| {
            PlotError::invalid_request(format!("Column \"{}\" is not numeric.", name))
        })
    }

    pub fn set_col_labels(&mut self, labels: Option<Value>) {
        self.col_labels = labels;
    }

    pub fn col_labels(&self) -> Option<&Value> {
        self.col_labels.as_ref()
    }

    /// Numeric column names, sorted case-insensitively.
    pub fn numeric_columns(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .names
            .iter()
            .zip(&self.columns)
            .filter(|(_, c)| c.is_numeric())
            .map(|(n, _)| n.clone())
            .collect();
        out.sort_by_key(|s| s.to_lowercase());
        out
    }

    /// Non-numeric column names, sorted case-insensitively.
    pub fn non_numeric_columns(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .names
            .iter()
            .zip(&self.columns)
            .filter(|(_, c)| !c.is_numeric())
            .map(|(n, _)| n.clone())
            .collect();
        out.sort_by_key(|s| s.to_lowercase());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dataset {
        Dataset::from_columns(vec![
            ("b".to_string(), Column::numeric(vec![1.0, 2.5, f64::NAN])),
            (
                "Name".to_string(),
                Column::Text(vec![Some("x".into()), None, Some("z".into())]),
            ),
            (
                "a".to_string(),
                Column::Numeric {
                    values: vec![1.0, 2.0, 3.0],
                    integral: true,
                },
            ),
        ])
        .unwrap()
    }

    #[test]
    fn catalog_is_sorted_case_insensitively() {
        let ds = sample();
        assert_eq!(ds.numeric_columns(), vec!["a", "b"]);
        assert_eq!(ds.non_numeric_columns(), vec!["Name"]);
    }

    #[test]
    fn stringification_matches_export_format() {
        let ds = sample();
        let b = ds.column("b").unwrap();
        assert_eq!(b.value_string(0), "1.0");
        assert_eq!(b.value_string(1), "2.5");
        assert_eq!(b.value_string(2), "nan");
        assert_eq!(ds.column("a").unwrap().value_string(2), "3");
        assert_eq!(ds.column("Name").unwrap().value_string(1), "nan");
        assert_eq!(format_float(1.5e-7), "1.5e-07");
        assert_eq!(format_float(2e20), "2e+20");
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut ds = sample();
        assert!(ds.set_column("c", Column::numeric(vec![1.0])).is_err());
        assert!(matches!(
            ds.column("missing"),
            Err(PlotError::UnknownColumn(_))
        ));
    }

    #[test]
    fn replacing_a_column_keeps_position() {
        let mut ds = sample();
        ds.set_column("b", Column::numeric(vec![0.0; 3])).unwrap();
        assert_eq!(ds.column_names()[0], "b");
        assert_eq!(ds.numeric("b").unwrap(), &[0.0, 0.0, 0.0]);
    }
}
