use crate::args;
use crate::dataset::Dataset;
use crate::error::{PlotError, Result};
use crate::subset::{Mask, SubsetStore};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

lazy_static! {
    static ref UNSAFE_FILENAME_CHARS: Regex = Regex::new(r"[^A-Za-z0-9_.-]").unwrap();
}

/// Display name of a subset, as held in the client's state.
#[derive(Clone, Debug, Deserialize)]
pub struct SubsetLabel {
    pub name: String,
}

/// Arguments of `download_subset`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExportRequest {
    #[serde(deserialize_with = "args::opt_id")]
    pub subset_id: Option<u32>,
    #[serde(rename = "numericCols")]
    pub numeric_cols: BTreeMap<String, bool>,
    #[serde(rename = "nonNumericCols")]
    pub non_numeric_cols: BTreeMap<String, bool>,
    #[serde(rename = "jupyterFilename", deserialize_with = "args::opt_string")]
    pub jupyter_filename: Option<String>,
    /// Subset names keyed by the id as a string.
    pub subsets: Option<HashMap<String, SubsetLabel>>,
}

impl ExportRequest {
    /// Columns ticked in either map, in dataset order.
    pub fn columns(&self, ds: &Dataset) -> Vec<String> {
        let ticked = |name: &String| {
            self.numeric_cols.get(name).copied().unwrap_or(false)
                || self.non_numeric_cols.get(name).copied().unwrap_or(false)
        };
        ds.column_names().iter().filter(|n| ticked(n)).cloned().collect()
    }
}

/// Render the rows of `mask` as CSV
///
/// # Arguments
/// * `ds` - The dataset to read from
/// * `mask` - Rows to write
/// * `columns` - Dataset columns to include, in output order
/// * `flags` - Extra boolean columns appended after `columns`
///
/// # Returns
/// * `Result<String>` - CSV text with a header row, or `UnknownColumn`
pub fn to_csv(
    ds: &Dataset,
    mask: &Mask,
    columns: &[String],
    flags: &[(String, &Mask)],
) -> Result<String> {
    let cols = columns
        .iter()
        .map(|c| ds.column(c))
        .collect::<Result<Vec<_>>>()?;

    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(columns.iter().chain(flags.iter().map(|(name, _)| name)))?;

    let mut fields: Vec<String> = Vec::with_capacity(cols.len() + flags.len());
    for r in mask.iter_ones() {
        fields.clear();
        for col in &cols {
            if col.is_missing(r) {
                fields.push(String::new());
            } else {
                fields.push(col.value_string(r));
            }
        }
        for (_, flag) in flags {
            fields.push(if flag.get(r) { "True" } else { "False" }.to_string());
        }
        writer.write_record(&fields)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| PlotError::Io(e.into_error()))?;
    String::from_utf8(bytes).map_err(|e| PlotError::Encoding(e.to_string()))
}

/// Reduce a user-supplied filename to a safe basename.
///
/// ```
/// use plotplot::downloader::secure_filename;
///
/// assert_eq!(secure_filename("../../etc/passwd"), "etc_passwd");
/// assert_eq!(secure_filename("My cells.csv"), "My_cells.csv");
/// ```
pub fn secure_filename(name: &str) -> String {
    let ascii: String = name
        .chars()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = ascii.split_whitespace().collect::<Vec<_>>().join("_");
    UNSAFE_FILENAME_CHARS
        .replace_all(&joined, "")
        .trim_matches(|c| c == '.' || c == '_')
        .to_string()
}

/// Write the subset to the notebook export directory.
///
/// Exporting subset 0 also appends one `plotplot_<name>` column per subset
/// marking membership.
pub fn write_jupyter(
    ds: &Dataset,
    store: &SubsetStore,
    req: &ExportRequest,
    subset_id: u32,
    filename: &str,
    export_dir: &Path,
) -> Result<PathBuf> {
    let safe = secure_filename(filename);
    if safe.is_empty() {
        return Err(PlotError::invalid_request("jupyterFilename is invalid."));
    }
    let path = export_dir.join(safe);
    let columns = req.columns(ds);

    let subsets = store.export_all();
    let mut flags: Vec<(String, &Mask)> = Vec::new();
    if subset_id == crate::subset::ALL_ROWS {
        let labels = req.subsets.as_ref();
        for id in subsets.keys() {
            let name = labels
                .and_then(|l| l.get(&id.to_string()))
                .map(|l| l.name.as_str())
                .ok_or_else(|| {
                    PlotError::invalid_request(format!("Missing name for subset {}.", id))
                })?;
            let base = format!("plotplot_{}", name);
            let mut candidate = base.clone();
            let mut i = 1;
            while ds.has_column(&candidate) || flags.iter().any(|(n, _)| *n == candidate) {
                candidate = format!("{}_{}", base, i);
                i += 1;
            }
            flags.push((candidate, store.mask(*id)?));
        }
    }

    let csv = to_csv(ds, store.mask(subset_id)?, &columns, &flags)?;
    fs::create_dir_all(export_dir)?;
    fs::write(&path, csv)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Column;

    fn dataset() -> Dataset {
        Dataset::from_columns(vec![
            ("b".into(), Column::numeric(vec![1.0, f64::NAN, 2.5])),
            (
                "label".into(),
                Column::Text(vec![Some("x, y".into()), Some("say \"hi\"".into()), None]),
            ),
            ("plotplot_all".into(), Column::numeric(vec![0.0; 3])),
        ])
        .unwrap()
    }

    fn request(json: &str) -> ExportRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn columns_follow_dataset_order() {
        let ds = dataset();
        let req = request(r#"{"subset_id": 0, "numericCols": {"b": true, "plotplot_all": false}, "nonNumericCols": {"label": true}}"#);
        assert_eq!(req.columns(&ds), vec!["b", "label"]);
    }

    #[test]
    fn csv_escapes_and_blanks_missing_values() {
        let ds = dataset();
        let cols = vec!["label".to_string(), "b".to_string()];
        let csv = to_csv(&ds, &Mask::full(3), &cols, &[]).unwrap();
        assert_eq!(csv, "label,b\n\"x, y\",1.0\n\"say \"\"hi\"\"\",\n,2.5\n");

        let csv = to_csv(&ds, &Mask::from_bools(&[false, false, true]), &cols, &[]).unwrap();
        assert_eq!(csv, "label,b\n,2.5\n");
    }

    #[test]
    fn exported_newlines_load_back_as_one_row() {
        use crate::loader::{CsvLoader, DatasetLoader};

        let ds = Dataset::from_columns(vec![
            (
                "note".into(),
                Column::Text(vec![Some("two\nlines".into()), Some("cr\rhere".into())]),
            ),
            ("v".into(), Column::numeric(vec![1.5, 2.5])),
        ])
        .unwrap();
        let cols = vec!["note".to_string(), "v".to_string()];
        let csv = to_csv(&ds, &Mask::full(2), &cols, &[]).unwrap();
        assert_eq!(csv, "note,v\n\"two\nlines\",1.5\n\"cr\rhere\",2.5\n");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.csv");
        fs::write(&path, &csv).unwrap();
        let back = CsvLoader.load(&path, &mut |_| {}).unwrap().dataset;
        assert_eq!(back.row_count(), 2);
        assert_eq!(back.column("note").unwrap().value_string(0), "two\nlines");
        assert_eq!(back.column("note").unwrap().value_string(1), "cr\rhere");
        assert_eq!(back.numeric("v").unwrap(), &[1.5, 2.5]);
    }

    #[test]
    fn jupyter_export_adds_membership_columns() {
        let ds = dataset();
        let mut store = SubsetStore::new("s", 3, BTreeMap::new());
        store.create(Mask::from_bools(&[true, false, false])).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let req = request(
            r#"{"subset_id": 0, "numericCols": {"b": true}, "nonNumericCols": {},
                "subsets": {"0": {"name": "all"}, "1": {"name": "picked"}}}"#,
        );

        let path = write_jupyter(&ds, &store, &req, 0, "out/../cells.csv", dir.path()).unwrap();
        assert_eq!(path, dir.path().join("out_.._cells.csv"));
        let written = fs::read_to_string(path).unwrap();
        let mut lines = written.lines();
        assert_eq!(lines.next(), Some("b,plotplot_all_1,plotplot_picked"));
        assert_eq!(lines.next(), Some("1.0,True,True"));
        assert_eq!(lines.next(), Some(",True,False"));

        let no_names = request(r#"{"subset_id": 0, "numericCols": {"b": true}}"#);
        assert!(write_jupyter(&ds, &store, &no_names, 0, "a.csv", dir.path()).is_err());
    }
}
