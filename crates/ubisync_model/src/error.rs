//! Error types for the model crate.

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors that can occur while building or encoding model types.
#[derive(Error, Debug)]
pub enum ModelError {
    /// CBOR encoding failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// CBOR decoding failed (malformed or truncated payload).
    #[error("decode error: {0}")]
    Decode(String),

    /// A change set cannot be sealed from an empty change queue.
    #[error("change set sealed from an empty change queue")]
    EmptyChangeSet,
}
