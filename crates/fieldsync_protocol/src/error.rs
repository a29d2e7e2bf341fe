//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding protocol values.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization to CBOR failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// The bytes were not a valid encoding of the expected type.
    #[error("decode error: {0}")]
    Decode(String),

    /// A resource key string was not of the form `type:id`.
    #[error("invalid resource key: {0:?}")]
    InvalidKey(String),
}
