//! Self-delimiting record codec and framed batches.
//!
//! Every batch that crosses the wire or lands on the blob store is a
//! sequence of VInt length-prefixed records in one of five shapes,
//! terminated by a sentinel row of per-field EOF markers, and wrapped in a
//! frame that carries an optional zstd block-compression layer and a
//! trailing crc32c checksum.

pub mod frame;
pub mod records;
pub mod vint;

pub use frame::{open_frame, seal_frame, SealedFrame};
pub use records::{RecordReader, RecordShape, RecordWriter, EOF_MARKER};

use crate::error::CodecError;
use crate::Key;

/// Serialize a key field. Keys travel as fixed eight-byte big-endian
/// integers.
pub fn encode_key(key: Key) -> [u8; 8] {
    key.to_be_bytes()
}

/// Deserialize a key field.
pub fn decode_key(field: &[u8]) -> Result<Key, CodecError> {
    let bytes: [u8; 8] = field
        .try_into()
        .map_err(|_| CodecError::BadField { what: "key" })?;
    Ok(Key::from_be_bytes(bytes))
}

/// Serialize a priority field (eight-byte big-endian float).
pub fn encode_priority(priority: f64) -> [u8; 8] {
    priority.to_be_bytes()
}

/// Deserialize a priority field.
pub fn decode_priority(field: &[u8]) -> Result<f64, CodecError> {
    let bytes: [u8; 8] = field
        .try_into()
        .map_err(|_| CodecError::BadField { what: "priority" })?;
    Ok(f64::from_be_bytes(bytes))
}
