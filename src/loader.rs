use crate::dataset::{Column, Dataset};
use crate::error::{PlotError, Result};
use log::{debug, info};
use serde::Serialize;
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Rows parsed between progress reports.
pub const PROGRESS_EVERY: usize = 8192;

/// Cell texts read as missing values.
const NA_VALUES: &[&str] = &[
    "", "#N/A", "#N/A N/A", "#NA", "-NaN", "-nan", "<NA>", "N/A", "NA", "NULL", "NaN", "None",
    "n/a", "nan", "null",
];

/// Snapshot of how far a session's load has got.
///
/// Polled by `processing_progress`; an `error` marks a failed load.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Progress {
    pub progress: f64,
    pub rows_loaded: Option<usize>,
    pub total_rows: Option<usize>,
    pub math_vars_loaded: Option<usize>,
    pub math_vars_total: Option<usize>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Progress {
    /// The state before any bytes have been read.
    pub fn opening() -> Self {
        Progress {
            progress: 0.0,
            rows_loaded: Some(0),
            total_rows: Some(0),
            math_vars_loaded: None,
            math_vars_total: None,
            text: "Opening file...".to_string(),
            error: None,
        }
    }

    pub fn rows(text: &str, rows_loaded: usize, total_rows: usize) -> Self {
        let progress = if total_rows == 0 {
            0.0
        } else {
            rows_loaded as f64 / total_rows as f64
        };
        Progress {
            progress,
            rows_loaded: Some(rows_loaded),
            total_rows: Some(total_rows),
            text: text.to_string(),
            ..Progress::opening()
        }
    }

    /// Mid-parse report; the row total is unknown until the file ends.
    pub fn parsing(rows_loaded: usize, bytes_read: u64, total_bytes: u64) -> Self {
        let progress = if total_bytes == 0 {
            0.0
        } else {
            (bytes_read as f64 / total_bytes as f64).min(1.0)
        };
        Progress {
            progress,
            rows_loaded: Some(rows_loaded),
            total_rows: None,
            text: "Parsing CSV...".to_string(),
            ..Progress::opening()
        }
    }

    pub fn math_vars(loaded: usize, total: usize) -> Self {
        Progress {
            progress: 1.0,
            rows_loaded: None,
            total_rows: None,
            math_vars_loaded: Some(loaded),
            math_vars_total: Some(total),
            text: "Restoring math variables...".to_string(),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Progress {
            error: Some(message.into()),
            text: "Error loading file.".to_string(),
            ..Progress::opening()
        }
    }
}

/// A freshly loaded table and its optional column grouping.
#[derive(Debug)]
pub struct Loaded {
    pub dataset: Dataset,
    pub col_labels: Option<Value>,
}

/// Reads a dataset file into memory, reporting progress as it goes.
pub trait DatasetLoader: Send + Sync {
    fn load(&self, path: &Path, progress: &mut dyn FnMut(Progress)) -> Result<Loaded>;
}

/// Loader for comma-separated files with a header row.
///
/// Records are streamed through the `csv` reader, so quoted fields may hold
/// commas, doubled quotes and newlines. A column is numeric when every
/// non-missing cell parses as a float.
#[derive(Clone, Copy, Debug, Default)]
pub struct CsvLoader;

impl DatasetLoader for CsvLoader {
    fn load(&self, path: &Path, progress: &mut dyn FnMut(Progress)) -> Result<Loaded> {
        info!("Loading {}", path.display());
        progress(Progress::rows("Loading file data...", 0, 0));

        let file = File::open(path)?;
        let total_bytes = file.metadata()?.len();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            // Short rows are padded with missing values; long rows are rejected below.
            .flexible(true)
            .from_reader(BufReader::new(file));

        let header = reader.headers()?.clone();
        if header.is_empty() {
            return Err(PlotError::Load("CSV file is empty".to_string()));
        }
        let names = dedupe_headers(
            header
                .iter()
                .map(|h| h.trim_start_matches('\u{feff}').to_string())
                .collect(),
        );
        let cols = names.len();

        let mut cells: Vec<Vec<Option<String>>> = vec![Vec::new(); cols];
        let mut record = csv::StringRecord::new();
        let mut rows = 0;
        while reader.read_record(&mut record)? {
            if cols > 1 && record.len() == 1 && record[0].trim().is_empty() {
                continue;
            }
            if record.len() > cols {
                let line = record.position().map_or(0, |p| p.line());
                return Err(PlotError::Load(format!(
                    "Expected {} fields in line {}, saw {}",
                    cols,
                    line,
                    record.len()
                )));
            }
            for (i, column) in cells.iter_mut().enumerate() {
                let cell = record.get(i).filter(|f| !NA_VALUES.contains(f));
                column.push(cell.map(str::to_string));
            }
            rows += 1;
            if rows % PROGRESS_EVERY == 0 {
                progress(Progress::parsing(rows, reader.position().byte(), total_bytes));
            }
        }

        let columns = names
            .into_iter()
            .zip(cells)
            .map(|(name, raw)| (name, infer_column(raw)))
            .collect();
        let dataset = Dataset::from_columns(columns)?;
        debug!(
            "Loaded {} rows and {} columns from {}",
            dataset.row_count(),
            cols,
            path.display()
        );
        progress(Progress::rows("Parsing CSV...", rows, rows));
        Ok(Loaded {
            dataset,
            col_labels: None,
        })
    }
}

fn infer_column(raw: Vec<Option<String>>) -> Column {
    let parsed: Option<Vec<f64>> = raw
        .iter()
        .map(|cell| match cell {
            Some(s) => s.trim().parse::<f64>().ok(),
            None => Some(f64::NAN),
        })
        .collect();
    match parsed {
        Some(values) => {
            let integral = raw
                .iter()
                .all(|cell| cell.as_deref().is_some_and(|s| s.trim().parse::<i64>().is_ok()));
            Column::Numeric { values, integral }
        }
        None => Column::Text(raw),
    }
}

// Repeated header names get `.1`, `.2`, ... appended.
fn dedupe_headers(names: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let mut candidate = name.clone();
        let mut n = 1;
        while out.contains(&candidate) {
            candidate = format!("{}.{}", name, n);
            n += 1;
        }
        out.push(candidate);
    }
    out
}
