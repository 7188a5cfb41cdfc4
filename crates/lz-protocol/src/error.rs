//! Protocol error types

use thiserror::Error;

/// Errors that can occur while decoding or encoding envelopes
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The payload was not a valid envelope
    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// A required field was present but empty
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// A field had the wrong shape
    #[error("Invalid field '{field}': {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
}
