//! Text filters over a column's string form.
//!
//! Patterns use a small glob language: `*` matches any run, `?` any single
//! character and `[...]` is a character class. Matching ignores case.

use crate::dataset::{Column, Dataset};
use crate::error::{PlotError, Result};
use crate::subset::Mask;
use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const MAX_FILTERS: usize = 99;
pub const MAX_UNIQUE_LISTED: usize = 100;

lazy_static! {
    static ref BLANK_LINE: Regex = Regex::new(r"^\s*$").unwrap();
}

/// Translate a glob pattern into a regular expression body.
///
/// ```
/// use plotplot::filter::glob_to_regex;
///
/// assert_eq!(glob_to_regex("A*C?"), "A.*C.");
/// assert_eq!(glob_to_regex("x.[ab]"), r"x\.[ab]");
/// ```
pub fn glob_to_regex(pattern: &str) -> String {
    regex::escape(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".")
        .replace(r"\[", "[")
        .replace(r"\]", "]")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchMode {
    /// Case-insensitive string equality, no glob
    Exact,
    /// The glob must cover the whole value
    FullMatch,
    /// The glob may match anywhere in the value
    Contains,
}

impl MatchMode {
    pub fn from_flags(exact_match: bool, use_contains: bool) -> Result<Self> {
        match (exact_match, use_contains) {
            (true, true) => Err(PlotError::filter_config(
                "Cannot set exact_match = true and use_contains = true.",
            )),
            (true, false) => Ok(MatchMode::Exact),
            (false, true) => Ok(MatchMode::Contains),
            (false, false) => Ok(MatchMode::FullMatch),
        }
    }
}

/// A compiled pattern.
pub enum Matcher {
    Exact(String),
    Glob(Regex),
}

impl Matcher {
    pub fn new(pattern: &str, mode: MatchMode) -> Result<Self> {
        let body = glob_to_regex(pattern);
        let source = match mode {
            MatchMode::Exact => return Ok(Matcher::Exact(pattern.to_uppercase())),
            MatchMode::FullMatch => format!("^(?:{})$", body),
            MatchMode::Contains => body,
        };
        RegexBuilder::new(&source)
            .case_insensitive(true)
            .build()
            .map(Matcher::Glob)
            .map_err(|e| PlotError::filter_config(format!("Invalid filter \"{}\": {}", pattern, e)))
    }

    pub fn is_match(&self, value: &str) -> bool {
        match self {
            Matcher::Exact(target) => value.to_uppercase() == *target,
            Matcher::Glob(re) => re.is_match(value),
        }
    }

    /// Rows of `within` whose value matches.
    pub fn mask(&self, column: &Column, within: &Mask) -> Mask {
        let mut out = Mask::empty(within.len());
        for r in within.iter_ones() {
            if self.is_match(&column.value_string(r)) {
                out.set(r, true);
            }
        }
        out
    }
}

/// One pattern from the filter dialog. `key` is echoed back untouched.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FilterSpec {
    pub filter: String,
    #[serde(default)]
    pub key: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FilterResult {
    pub filter: String,
    /// `None` for an empty pattern, which is skipped.
    pub rows: Option<usize>,
    pub key: Value,
}

pub struct FilterOutcome {
    pub results: Vec<FilterResult>,
    /// Pattern and matched rows, for every non-empty pattern.
    pub matches: Vec<(String, Mask)>,
    /// Union of all matches.
    pub combined: Mask,
}

/// Match each pattern against `column` within `subset`.
pub fn glob_filter(
    ds: &Dataset,
    subset: &Mask,
    column: &str,
    filters: &[FilterSpec],
    mode: MatchMode,
) -> Result<FilterOutcome> {
    if filters.is_empty() {
        return Err(PlotError::filter_config("must supply at least one filter."));
    }
    if filters.len() > MAX_FILTERS {
        return Err(PlotError::filter_config("too many filters"));
    }
    let col = ds.column(column)?;

    let mut results = Vec::with_capacity(filters.len());
    let mut matches = Vec::new();
    let mut combined = Mask::empty(ds.row_count());
    for spec in filters {
        if spec.filter.is_empty() {
            results.push(FilterResult {
                filter: spec.filter.clone(),
                rows: None,
                key: spec.key.clone(),
            });
            continue;
        }
        let m = Matcher::new(&spec.filter, mode)?.mask(col, subset);
        results.push(FilterResult {
            filter: spec.filter.clone(),
            rows: Some(m.count()),
            key: spec.key.clone(),
        });
        combined.or_assign(&m);
        matches.push((spec.filter.clone(), m));
    }
    Ok(FilterOutcome {
        results,
        matches,
        combined,
    })
}

/// One parsed line of a bulk import.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BulkRow {
    pub name: String,
    pub pattern: Option<String>,
    pub size: Option<String>,
    pub color: Option<String>,
}

/// Parse tab-separated `name, pattern[, size[, color]]` lines. Empty
/// fields are absent.
pub fn parse_bulk(text: &str) -> Result<Vec<BulkRow>> {
    let lines: Vec<&str> = text
        .lines()
        .filter(|l| !BLANK_LINE.is_match(l))
        .collect();
    let Some(first) = lines.first() else {
        return Err(PlotError::filter_config("No input, did you paste anything in?"));
    };

    let columns = first.split('\t').count();
    if !(2..=4).contains(&columns) {
        return Err(PlotError::filter_config(format!(
            "Incorrect number of columns.  There should be 2, 3, or 4 columns.  Found: {} column(s).",
            columns
        )));
    }

    let present = |s: Option<&str>| s.filter(|v| !v.is_empty()).map(str::to_string);
    let mut rows = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() > columns {
            return Err(PlotError::filter_config(format!(
                "Expected {} fields in line {}, saw {}",
                columns,
                i + 1,
                fields.len()
            )));
        }
        let name = present(fields.first().copied()).ok_or_else(|| {
            PlotError::filter_config(
                "Subset name is empty.  Blank subset names are not allowed, are you sure you set a name for each row?",
            )
        })?;
        rows.push(BulkRow {
            name,
            pattern: present(fields.get(1).copied()),
            size: present(fields.get(2).copied()),
            color: present(fields.get(3).copied()),
        });
    }
    Ok(rows)
}

/// A subset to create from a bulk import.
#[derive(Clone, Debug)]
pub struct BulkGroup {
    pub name: String,
    pub mask: Mask,
    pub size: Option<i64>,
    pub color: Option<String>,
}

/// Group rows by name and union each group's matches within `subset`.
///
/// Either every group is valid and all are returned, or the first invalid
/// group fails the whole import.
pub fn bulk_filter(
    ds: &Dataset,
    subset: &Mask,
    column: &str,
    rows: &[BulkRow],
    mode: MatchMode,
) -> Result<Vec<BulkGroup>> {
    let col = ds.column(column)?;
    let everything = Mask::full(ds.row_count());

    let mut order: Vec<&str> = Vec::new();
    let mut by_name: HashMap<&str, Vec<&BulkRow>> = HashMap::new();
    for row in rows {
        by_name
            .entry(row.name.as_str())
            .or_insert_with(|| {
                order.push(row.name.as_str());
                Vec::new()
            })
            .push(row);
    }

    let mut groups = Vec::with_capacity(order.len());
    for name in order {
        let members = &by_name[name];
        let mut mask = Mask::empty(ds.row_count());
        let mut any_valid = false;
        for pattern in members.iter().filter_map(|r| r.pattern.as_deref()) {
            any_valid = true;
            mask.or_assign(&Matcher::new(pattern, mode)?.mask(col, &everything));
        }
        if !any_valid {
            return Err(PlotError::filter_config(format!(
                "Subset \"{}\" had no valid rows.",
                name
            )));
        }
        mask.and_assign(subset);

        let size = match members.iter().rev().find_map(|r| r.size.as_deref()) {
            Some(raw) => Some(parse_size(name, raw)?),
            None => None,
        };
        let color = members.iter().rev().find_map(|r| r.color.clone());
        groups.push(BulkGroup {
            name: name.to_string(),
            mask,
            size,
            color,
        });
    }
    Ok(groups)
}

fn parse_size(name: &str, raw: &str) -> Result<i64> {
    let not_int = || {
        PlotError::filter_config(format!(
            "Subset \"{}\" has size set to \"{}\" which is not an integer.",
            name, raw
        ))
    };
    let v = raw.trim().parse::<f64>().map_err(|_| not_int())?;
    if !v.is_finite() {
        return Err(not_int());
    }
    Ok((v.trunc() as i64).max(1))
}

/// Edit distance between `a` and `b`, or `limit + 1` once it is known to
/// exceed `limit`.
pub fn bounded_levenshtein(a: &str, b: &str, limit: usize) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > limit {
        return limit + 1;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        let mut row_min = cur[0];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
            row_min = row_min.min(cur[j + 1]);
        }
        if row_min > limit {
            return limit + 1;
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()].min(limit + 1)
}

/// Rows of `subset` whose upper-cased value is within `max_distance` edits
/// of `target`.
pub fn edit_distance_filter(
    ds: &Dataset,
    subset: &Mask,
    column: &str,
    target: &str,
    max_distance: usize,
) -> Result<Mask> {
    if max_distance < 1 {
        return Err(PlotError::filter_config("levenshtein_n is invalid."));
    }
    let col = ds.column(column)?;
    let target = target.to_uppercase();
    let mut out = Mask::empty(ds.row_count());
    for r in subset.iter_ones() {
        let value = col.value_string(r).to_uppercase();
        if bounded_levenshtein(&value, &target, max_distance) <= max_distance {
            out.set(r, true);
        }
    }
    Ok(out)
}

/// Distinct string values in `subset` with their counts, most frequent
/// first. `None` when there are more than [`MAX_UNIQUE_LISTED`].
pub fn unique_strings(
    ds: &Dataset,
    subset: &Mask,
    column: &str,
) -> Result<(usize, Option<Vec<(String, usize)>>)> {
    let col = ds.column(column)?;
    let mut counts: HashMap<String, usize> = HashMap::new();
    for r in subset.iter_ones() {
        *counts.entry(col.value_string(r)).or_insert(0) += 1;
    }
    let num_unique = counts.len();
    if num_unique > MAX_UNIQUE_LISTED {
        return Ok((num_unique, None));
    }
    let mut sorted: Vec<(String, usize)> = counts.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    Ok((num_unique, Some(sorted)))
}
