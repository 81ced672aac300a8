//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Frame is not valid JSON, or a variant body has the wrong shape
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// Top-level value is not a JSON object
    #[error("envelope is not an object")]
    NotObject,

    /// Top-level object has no keys
    #[error("empty envelope")]
    Empty,

    /// Top-level object has more than one key
    #[error("ambiguous envelope with {0} keys")]
    Ambiguous(usize),

    /// Top-level key is not a known variant
    #[error("unknown envelope variant {0:?}")]
    UnknownVariant(String),

    /// Binary frame does not contain UTF-8 text
    #[error("frame is not utf-8 text")]
    NotText,
}
