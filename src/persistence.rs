//! Persistence descriptors and the durable store interface.
//!
//! The session worker never writes to storage itself. Handlers return an
//! [`Effects`] value alongside their JSON result and the dispatch layer
//! replays those writes against a [`Store`].

use crate::error::{PlotError, Result};
use crate::expr::MathVar;
use crate::saving::{decode_mask, encode_mask};
use crate::subset::Mask;
use chrono::Utc;
use log::warn;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;

pub const INSERT_SUBSET: &str =
    "INSERT INTO subsets (session, id_in_session, name, mask_blob) VALUES (?, ?, ?, ?)";
pub const DELETE_SUBSET: &str = "DELETE FROM subsets WHERE session = ? AND id_in_session = ?";
pub const UPDATE_MATH_VARS: &str = "UPDATE sessions SET math_vars = ?, updated = ? WHERE id = ?";
pub const UPSERT_SESSION: &str = "INSERT INTO sessions (id, updated, filename, email, json_state) VALUES (?, ?, ?, ?, ?) ON CONFLICT(id) DO UPDATE SET json_state = ?, updated = ?";
pub const SELECT_SUBSETS: &str = "SELECT id_in_session, mask_blob FROM subsets WHERE session = ?";
pub const SELECT_MATH_VARS: &str = "SELECT math_vars FROM sessions WHERE id = ?";
pub const SELECT_SESSION: &str =
    "SELECT id, filename, email, json_state, math_vars FROM sessions WHERE id = ?";

/// A bound SQL parameter.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum DbValue {
    Null,
    Int(i64),
    Text(String),
    Blob(Vec<u8>),
}

impl DbValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            DbValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            DbValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            DbValue::Blob(b) => Some(b),
            _ => None,
        }
    }
}

/// One write the caller must perform on the worker's behalf.
#[derive(Clone, Debug, PartialEq)]
pub struct DbWrite {
    pub sql: String,
    pub params: Vec<DbValue>,
}

/// Persistence side-effects attached to a handler result.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Effects {
    #[default]
    None,
    Single(DbWrite),
    Batch(Vec<DbWrite>),
}

impl Effects {
    pub fn writes(&self) -> &[DbWrite] {
        match self {
            Effects::None => &[],
            Effects::Single(w) => std::slice::from_ref(w),
            Effects::Batch(ws) => ws,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.writes().is_empty()
    }
}

pub type Row = BTreeMap<String, DbValue>;

/// The durable store the dispatch layer persists into.
pub trait Store: Send + Sync {
    fn insert(&self, sql: &str, params: &[DbValue]) -> Result<()>;
    fn query(&self, sql: &str, params: &[DbValue]) -> Result<Vec<Row>>;
}

fn now_string() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn insert_subset(session_id: &str, id: u32, mask: &Mask) -> Result<DbWrite> {
    Ok(DbWrite {
        sql: INSERT_SUBSET.to_string(),
        // Subset names only live in the client's UI state.
        params: vec![
            DbValue::Text(session_id.to_string()),
            DbValue::Int(id as i64),
            DbValue::Text("-".to_string()),
            DbValue::Blob(encode_mask(mask)?),
        ],
    })
}

pub fn delete_subset(session_id: &str, id: u32) -> DbWrite {
    DbWrite {
        sql: DELETE_SUBSET.to_string(),
        params: vec![
            DbValue::Text(session_id.to_string()),
            DbValue::Int(id as i64),
        ],
    }
}

pub fn update_math_vars(session_id: &str, vars: &[MathVar]) -> Result<DbWrite> {
    Ok(DbWrite {
        sql: UPDATE_MATH_VARS.to_string(),
        params: vec![
            DbValue::Text(serde_json::to_string(vars)?),
            DbValue::Text(now_string()),
            DbValue::Text(session_id.to_string()),
        ],
    })
}

/// Upsert of the client's UI state for a session.
pub fn save_state(session_id: &str, filename: &str, owner: &str, json_state: &str) -> DbWrite {
    let now = now_string();
    DbWrite {
        sql: UPSERT_SESSION.to_string(),
        params: vec![
            DbValue::Text(session_id.to_string()),
            DbValue::Text(now.clone()),
            DbValue::Text(filename.to_string()),
            DbValue::Text(owner.to_string()),
            DbValue::Text(json_state.to_string()),
            DbValue::Text(json_state.to_string()),
            DbValue::Text(now),
        ],
    }
}

/// Subsets stored for a session, keyed by their id within the session.
pub fn load_subsets(store: &dyn Store, session_id: &str) -> Result<BTreeMap<u32, Mask>> {
    let rows = store.query(SELECT_SUBSETS, &[DbValue::Text(session_id.to_string())])?;
    let mut out = BTreeMap::new();
    for row in rows {
        let id = row.get("id_in_session").and_then(DbValue::as_int);
        let blob = row.get("mask_blob").and_then(DbValue::as_blob);
        match (id, blob) {
            (Some(id), Some(blob)) => match decode_mask(blob) {
                Ok(mask) => {
                    out.insert(id as u32, mask);
                }
                Err(e) => warn!("Session {}: subset {} unreadable: {}", session_id, id, e),
            },
            _ => warn!("Session {}: malformed subset row", session_id),
        }
    }
    Ok(out)
}

pub fn load_math_vars(store: &dyn Store, session_id: &str) -> Result<Vec<MathVar>> {
    let rows = store.query(SELECT_MATH_VARS, &[DbValue::Text(session_id.to_string())])?;
    let json = rows
        .first()
        .and_then(|r| r.get("math_vars"))
        .and_then(DbValue::as_text);
    match json {
        Some(s) => Ok(serde_json::from_str(s)?),
        None => Ok(Vec::new()),
    }
}

#[derive(Clone, Debug, Default)]
struct SessionRow {
    updated: String,
    filename: String,
    email: String,
    json_state: String,
    math_vars: Option<String>,
}

#[derive(Default)]
struct Tables {
    sessions: BTreeMap<String, SessionRow>,
    subsets: Vec<(String, i64, Vec<u8>)>,
}

/// In-process [`Store`] that understands the statements this crate emits.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subset_count(&self, session_id: &str) -> usize {
        self.tables
            .lock()
            .subsets
            .iter()
            .filter(|(s, _, _)| s == session_id)
            .count()
    }
}

fn text(params: &[DbValue], i: usize) -> Result<String> {
    params
        .get(i)
        .and_then(DbValue::as_text)
        .map(str::to_string)
        .ok_or_else(|| PlotError::invalid_request(format!("parameter {} must be text", i)))
}

fn int(params: &[DbValue], i: usize) -> Result<i64> {
    params
        .get(i)
        .and_then(DbValue::as_int)
        .ok_or_else(|| PlotError::invalid_request(format!("parameter {} must be an integer", i)))
}

impl Store for MemoryStore {
    fn insert(&self, sql: &str, params: &[DbValue]) -> Result<()> {
        let mut t = self.tables.lock();
        match sql {
            INSERT_SUBSET => {
                let blob = params
                    .get(3)
                    .and_then(DbValue::as_blob)
                    .ok_or_else(|| PlotError::invalid_request("mask_blob must be a blob"))?;
                t.subsets
                    .push((text(params, 0)?, int(params, 1)?, blob.to_vec()));
            }
            DELETE_SUBSET => {
                let (session, id) = (text(params, 0)?, int(params, 1)?);
                t.subsets.retain(|(s, i, _)| !(s == &session && *i == id));
            }
            UPDATE_MATH_VARS => {
                let id = text(params, 2)?;
                if let Some(row) = t.sessions.get_mut(&id) {
                    row.math_vars = Some(text(params, 0)?);
                    row.updated = text(params, 1)?;
                } else {
                    // Math can be done before the UI state is first saved.
                    t.sessions.insert(
                        id,
                        SessionRow {
                            updated: text(params, 1)?,
                            math_vars: Some(text(params, 0)?),
                            ..Default::default()
                        },
                    );
                }
            }
            UPSERT_SESSION => {
                let id = text(params, 0)?;
                let row = t.sessions.entry(id).or_default();
                row.updated = text(params, 1)?;
                if row.filename.is_empty() {
                    row.filename = text(params, 2)?;
                    row.email = text(params, 3)?;
                }
                row.json_state = text(params, 4)?;
            }
            other => {
                return Err(PlotError::invalid_request(format!(
                    "unsupported statement: {}",
                    other
                )));
            }
        }
        Ok(())
    }

    fn query(&self, sql: &str, params: &[DbValue]) -> Result<Vec<Row>> {
        let t = self.tables.lock();
        let key = text(params, 0)?;
        let rows: Vec<Row> = match sql {
            SELECT_SUBSETS => t
                .subsets
                .iter()
                .filter(|(s, _, _)| *s == key)
                .map(|(_, id, blob)| {
                    let mut row = Row::new();
                    row.insert("id_in_session".into(), DbValue::Int(*id));
                    row.insert("mask_blob".into(), DbValue::Blob(blob.clone()));
                    row
                })
                .collect(),
            SELECT_MATH_VARS | SELECT_SESSION => t
                .sessions
                .get(&key)
                .map(|s| {
                    let mut row = Row::new();
                    let math_vars = s.math_vars.clone().map_or(DbValue::Null, DbValue::Text);
                    row.insert("math_vars".into(), math_vars);
                    if sql == SELECT_SESSION {
                        row.insert("id".into(), DbValue::Text(key.clone()));
                        row.insert("filename".into(), DbValue::Text(s.filename.clone()));
                        row.insert("email".into(), DbValue::Text(s.email.clone()));
                        row.insert("json_state".into(), DbValue::Text(s.json_state.clone()));
                    }
                    row
                })
                .into_iter()
                .collect(),
            other => {
                return Err(PlotError::invalid_request(format!(
                    "unsupported query: {}",
                    other
                )));
            }
        };
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsets_survive_a_store_round_trip() {
        let store = MemoryStore::new();
        let mask = Mask::from_bools(&[true, false, true]);
        let w = insert_subset("s1", 3, &mask).unwrap();
        store.insert(&w.sql, &w.params).unwrap();
        let w = insert_subset("s2", 1, &Mask::full(3)).unwrap();
        store.insert(&w.sql, &w.params).unwrap();

        let loaded = load_subsets(&store, "s1").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[&3], mask);

        let d = delete_subset("s1", 3);
        store.insert(&d.sql, &d.params).unwrap();
        assert!(load_subsets(&store, "s1").unwrap().is_empty());
        assert_eq!(store.subset_count("s2"), 1);
    }

    #[test]
    fn math_vars_are_stored_as_json_triples() {
        let store = MemoryStore::new();
        let vars = vec![MathVar::new("<mathvar>a</mathvar>*2")];
        let w = update_math_vars("s1", &vars).unwrap();
        assert_eq!(
            w.params[0],
            DbValue::Text(r#"[["<mathvar>a</mathvar>*2","",true]]"#.to_string())
        );
        store.insert(&w.sql, &w.params).unwrap();
        assert_eq!(load_math_vars(&store, "s1").unwrap(), vars);
        assert!(load_math_vars(&store, "other").unwrap().is_empty());
    }

    #[test]
    fn effects_expose_their_writes() {
        let w = delete_subset("s", 1);
        assert!(Effects::None.is_empty());
        assert_eq!(Effects::Single(w.clone()).writes().len(), 1);
        assert_eq!(Effects::Batch(vec![w.clone(), w]).writes().len(), 2);
    }
}
