//! Error taxonomy for the DAG execution engine.
//!
//! Parse errors fail a DAG before it is ever scheduled, per-op backend
//! errors are captured on the owning [`crate::run_info::RunInfo`] and
//! short-circuit later ops, and persist errors taint an otherwise-successful
//! DAG after the fact.

use thiserror::Error;

/// All ways a DAG submission can fail.
///
/// "an input isn't ready yet" is deliberately not a variant here: it is an
/// internal scheduling signal (see [`crate::scheduler`]), never an error a
/// client can observe.
#[derive(Debug, Clone, Error)]
pub enum DagError {
    #[error("ERR {0}")]
    Parse(String),

    #[error("ERR model or script not found: {0}")]
    UnknownModelOrScript(String),

    #[error("ERR type mismatch: {0}")]
    TypeMismatch(String),

    #[error("ERR backend not loaded: {0}")]
    BackendNotLoaded(String),

    #[error("ERR {0}")]
    BackendRuntime(String),

    #[error("ERR could not persist key(s): {0}")]
    PersistFailed(String),

    /// Rendered as the bare simple string `"TIMEDOUT"`, never prefixed `ERR `.
    #[error("TIMEDOUT")]
    Timeout,

    #[error("ERR client disconnected")]
    Cancelled,

    #[error("ERR {0}")]
    BudgetExceeded(String),
}

impl DagError {
    /// The exact text placed on the wire for this error: a single-line
    /// string prefixed `ERR `, except for the bare `TIMEDOUT` case.
    pub fn wire_text(&self) -> String {
        match self {
            DagError::Timeout => "TIMEDOUT".to_string(),
            other => other.to_string(),
        }
    }
}

pub type DagResult<T> = Result<T, DagError>;
