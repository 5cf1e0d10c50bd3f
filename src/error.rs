//! Error types for loading, windowing and batching

use chrono::NaiveDateTime;
use std::path::PathBuf;
use thiserror::Error;

use crate::data::timestamp::format_key;

/// Errors raised by the batching engine
#[derive(Error, Debug)]
pub enum TecError {
    /// Archive content missing or unreadable during bulk load. Fatal for the run.
    #[error("failed to load {path:?}: {reason}")]
    DataLoad { path: PathBuf, reason: String },

    /// A timestamp absent from an otherwise loaded TEC index
    #[error("no TEC map for {}", format_key(.0))]
    MissingMap(NaiveDateTime),

    /// A tick absent from the loaded exogenous table
    #[error("no exogenous record for {}", format_key(.0))]
    MissingExogenous(NaiveDateTime),

    /// A batch was requested for an anchor that fails validation
    #[error("invalid anchor {}: {reason}", format_key(.anchor))]
    InvalidAnchor {
        anchor: NaiveDateTime,
        reason: String,
    },

    /// Map shapes disagree while stacking a batch
    #[error("shape mismatch at {}: expected {expected:?}, got {actual:?}", format_key(.timestamp))]
    ShapeMismatch {
        timestamp: NaiveDateTime,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    /// A batch tensor disagrees with the tensors it is stacked with
    #[error("tensor `{slot}` has shape {actual:?}, expected {expected:?}")]
    TensorShape {
        slot: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A tensor slot was requested that the batch does not carry
    #[error("tensor slot `{0}` is not present in this batch")]
    MissingSlot(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("normalization error: {0}")]
    Normalization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("npy read error: {0}")]
    NpyRead(#[from] ndarray_npy::ReadNpyError),

    #[error("npy write error: {0}")]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML write error: {0}")]
    TomlWrite(#[from] toml::ser::Error),
}

impl TecError {
    /// Shorthand for a load failure at `path`
    pub fn load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::DataLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for the per-timestamp gaps that schedule construction resolves by exclusion
    pub fn is_missing_data(&self) -> bool {
        matches!(self, Self::MissingMap(_) | Self::MissingExogenous(_))
    }
}

/// Result type alias for batching operations
pub type TecResult<T> = Result<T, TecError>;
