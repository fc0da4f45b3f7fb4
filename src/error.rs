use serde_json::{Value, json};
use thiserror::Error;

/// Errors produced by the session engine.
///
/// Every variant is returned to callers as a value (see [`PlotError::to_json`]);
/// nothing here is meant to become a transport-level failure.
#[derive(Debug, Error)]
pub enum PlotError {
    #[error("Unknown subset: {0}")]
    UnknownSubset(u32),

    #[error("Cannot delete (all) subset.")]
    ProtectedSubset,

    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("{0}")]
    Expression(String),

    #[error("{0}")]
    InvalidFilterConfig(String),

    #[error("Data not yet loaded.")]
    DataNotLoaded,

    #[error("Session has timed out, you need to reload the page.")]
    SessionExpired,

    #[error(
        "Invalid session ID. The server may have restarted; you can try reloading the page but your session may not still be running."
    )]
    InvalidSession,

    #[error("Remote fetch failed: {0}")]
    RemoteFetch(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Load failed: {0}")]
    Load(String),

    #[error("Mask encoding error: {0}")]
    Encoding(String),

    /// The worker applied a request but not all of its writes were stored.
    #[error("Saving the result failed after {applied} of {total} writes: {reason}")]
    Persist {
        applied: usize,
        total: usize,
        reason: String,
        result: Value,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PlotError>;

impl PlotError {
    /// Render the error the way the worker protocol reports failures.
    pub fn to_json(&self) -> Value {
        match self {
            PlotError::SessionExpired => json!({
                "error": self.to_string(),
                "session_timeout": true,
            }),
            PlotError::Persist { applied, result, .. } => json!({
                "error": self.to_string(),
                "writes_applied": applied,
                "result": result,
            }),
            _ => json!({ "error": self.to_string() }),
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        PlotError::InvalidRequest(msg.into())
    }

    pub fn filter_config(msg: impl Into<String>) -> Self {
        PlotError::InvalidFilterConfig(msg.into())
    }
}

impl From<bincode::Error> for PlotError {
    fn from(e: bincode::Error) -> Self {
        PlotError::Encoding(e.to_string())
    }
}

impl From<csv::Error> for PlotError {
    fn from(e: csv::Error) -> Self {
        let line = e.position().map(|p| p.line());
        let reason = e.to_string();
        match e.into_kind() {
            csv::ErrorKind::Io(io) => PlotError::Io(io),
            _ => match line {
                Some(line) => PlotError::Load(format!("line {}: {}", line, reason)),
                None => PlotError::Load(reason),
            },
        }
    }
}
