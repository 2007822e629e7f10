//! Payload codecs
//!
//! Turns in-memory state into the string stored under a key and back:
//!
//! ```text
//! state ──serialize──▶ envelope JSON ──compress──▶ "COMPRESSED:<base64>"
//!                                                 "UNCOMPRESSED:<json>"
//! ```
//!
//! Every decoder here tolerates data written before the envelope and the
//! compression markers existed.

pub mod compression;
pub mod envelope;
pub mod migration;

use serde_json::Value;
use thiserror::Error;

pub use compression::{Compressor, COMPRESSED_PREFIX, UNCOMPRESSED_PREFIX};
pub use envelope::{deserialize, deserialize_into, serialize, Envelope, DEFAULT_VERSION};
pub use migration::{MigrationFn, Migrations};

/// Errors raised while encoding or decoding payloads
#[derive(Error, Debug)]
pub enum CodecError {
    /// Payload could not be parsed
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// Value could not be turned into a payload
    #[error("Failed to encode payload: {0}")]
    Encode(String),

    /// A compressed payload could not be restored
    #[error("Failed to decompress payload: {0}")]
    Decompression(String),

    /// Native compression is not compiled in
    #[error("Native compression is unavailable")]
    CompressionUnavailable,
}

/// Turns a JSON value into a string and back
pub trait Codec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<String, CodecError>;

    fn decode(&self, raw: &str) -> Result<Value, CodecError>;
}

/// Plain JSON text
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<String, CodecError> {
        serde_json::to_string(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, raw: &str) -> Result<Value, CodecError> {
        serde_json::from_str(raw).map_err(|e| CodecError::Malformed(e.to_string()))
    }
}
