//! Compression codec
//!
//! Payloads are marked with the path used to produce them:
//!
//! - `COMPRESSED:<base64>`: LZ4 block with prepended size, base64 encoded
//! - `UNCOMPRESSED:<original>`: native compression missing or failed
//! - no marker: data written before compression existed, returned as is
//!
//! Decoding never fails. A compressed payload that cannot be restored is
//! logged and returned with its marker stripped.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{error, warn};

use super::CodecError;

pub const COMPRESSED_PREFIX: &str = "COMPRESSED:";
pub const UNCOMPRESSED_PREFIX: &str = "UNCOMPRESSED:";

/// Two-tier compressor
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    native: bool,
}

impl Default for Compressor {
    fn default() -> Self {
        Self::native()
    }
}

impl Compressor {
    /// Use native compression when it is compiled in
    pub fn native() -> Self {
        Self {
            native: cfg!(feature = "lz4"),
        }
    }

    /// Always take the uncompressed path
    pub fn fallback_only() -> Self {
        Self { native: false }
    }

    /// Whether `compress` will attempt native compression
    pub fn has_native(&self) -> bool {
        self.native
    }

    pub fn compress(&self, input: &str) -> String {
        if self.native {
            match native_compress(input) {
                Ok(encoded) => return format!("{}{}", COMPRESSED_PREFIX, encoded),
                Err(e) => warn!("Native compression failed, storing uncompressed: {}", e),
            }
        }
        format!("{}{}", UNCOMPRESSED_PREFIX, input)
    }

    pub fn decompress(&self, input: &str) -> String {
        decompress(input)
    }
}

/// Whether `input` went through native compression
pub fn is_compressed(input: &str) -> bool {
    input.starts_with(COMPRESSED_PREFIX)
}

/// Restore a payload produced by [`Compressor::compress`]
///
/// Works regardless of how the reading side is configured, so data written
/// compressed stays readable by a fallback-only compressor.
pub fn decompress(input: &str) -> String {
    if let Some(original) = input.strip_prefix(UNCOMPRESSED_PREFIX) {
        return original.to_string();
    }

    if let Some(payload) = input.strip_prefix(COMPRESSED_PREFIX) {
        return match native_decompress(payload) {
            Ok(original) => original,
            Err(e) => {
                error!("Returning raw payload, {}", e);
                payload.to_string()
            }
        };
    }

    input.to_string()
}

#[cfg(feature = "lz4")]
fn native_compress(input: &str) -> Result<String, CodecError> {
    let block = lz4_flex::compress_prepend_size(input.as_bytes());
    Ok(STANDARD.encode(block))
}

#[cfg(not(feature = "lz4"))]
fn native_compress(_input: &str) -> Result<String, CodecError> {
    Err(CodecError::CompressionUnavailable)
}

fn native_decompress(payload: &str) -> Result<String, CodecError> {
    let block = STANDARD
        .decode(payload)
        .map_err(|e| CodecError::Decompression(e.to_string()))?;
    let bytes = decompress_block(&block)?;
    String::from_utf8(bytes).map_err(|e| CodecError::Decompression(e.to_string()))
}

#[cfg(feature = "lz4")]
fn decompress_block(block: &[u8]) -> Result<Vec<u8>, CodecError> {
    lz4_flex::decompress_size_prepended(block).map_err(|e| CodecError::Decompression(e.to_string()))
}

#[cfg(not(feature = "lz4"))]
fn decompress_block(_block: &[u8]) -> Result<Vec<u8>, CodecError> {
    Err(CodecError::CompressionUnavailable)
}
