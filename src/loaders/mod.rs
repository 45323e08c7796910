//! Loaders for trainer-native model formats.
//!
//! Each submodule parses one serialized format into the model IR and applies
//! that trainer's missing-value convention (the mapping is format-local
//! policy, not a property of the IR). Every loader validates the structural
//! invariants of [`Model`](crate::Model) before returning.

pub mod lightgbm;
pub mod xgboost;

use std::path::Path;

use crate::model::{Model, ModelError};

/// Error type for model parsing.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown model format {0:?} (expected \"lightgbm\" or \"xgboost_json\")")]
    UnknownFormat(String),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
    #[error("array size mismatch for {field}: expected {expected}, got {actual}")]
    ArraySizeMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("tree {tree}: invalid child reference {child}")]
    InvalidChildRef { tree: usize, child: i64 },
    #[error("tree {tree}: negative category {category}")]
    NegativeCategory { tree: usize, category: i64 },
    #[error("unexpected end of input while parsing {context}")]
    UnexpectedEnd { context: String },
    #[error("invalid model structure: {0}")]
    Structure(#[from] ModelError),
}

/// Parse a model file in the named format.
///
/// `format` is an explicit tag naming the producing library: `"lightgbm"`
/// for LightGBM text models, `"xgboost_json"` (or `"xgboost"`) for XGBoost
/// JSON models.
pub fn load(path: impl AsRef<Path>, format: &str) -> Result<Model, ParseError> {
    let path = path.as_ref();
    log::debug!("loading {format} model from {}", path.display());
    match format {
        "lightgbm" => lightgbm::load_file(path),
        "xgboost" | "xgboost_json" => xgboost::load_file(path),
        other => Err(ParseError::UnknownFormat(other.to_owned())),
    }
}
