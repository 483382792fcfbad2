//! Error taxonomy for the runtime.
//!
//! Codec and exchange failures are typed so callers can tell a corrupted
//! record (escalates to a rollback) from a transport hiccup (retried with
//! backoff) from a logical fault (fatal to the task).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// A failure while encoding or decoding framed records.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A record length field was negative without forming the EOF sentinel
    /// row.
    #[error("rec# {record}: negative field length: {length}")]
    NegativeLength { record: u64, length: i64 },

    /// The stream ended inside a record body.
    #[error("rec# {record}: truncated record, wanted {wanted} more bytes")]
    Truncated { record: u64, wanted: usize },

    /// A read past the EOF sentinel row.
    #[error("read past end of stream after {bytes_read} bytes")]
    PastEof { bytes_read: u64 },

    /// The trailing checksum segment did not match the payload.
    #[error("frame crc32c mismatch: expected {expected:#x}, got {got:#x}")]
    ChecksumMismatch { expected: u32, got: u32 },

    /// The frame was shorter than its checksum trailer.
    #[error("frame too short for checksum trailer: {len} bytes")]
    ShortFrame { len: usize },

    /// A fixed-width field with the wrong length.
    #[error("bad {what} field")]
    BadField { what: &'static str },

    /// Block decompression failed.
    #[error("decompress: {0}")]
    Decompress(std::io::Error),
}

/// A failure on the buffer-exchange plane.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// An enum byte outside the protocol's range.
    #[error("protocol error: unexpected {what} value {value}")]
    BadEnum { what: &'static str, value: u8 },

    /// The preamble was neither the data sentinel nor the close marker.
    #[error("protocol error: unexpected preamble {0:#x}")]
    BadPreamble(i32),

    /// A header shorter than its type requires.
    #[error("protocol error: truncated header")]
    TruncatedHeader,

    /// The remote told this source to stop permanently.
    #[error("remote terminated transfer to task {destination}")]
    Terminated { destination: u32 },

    /// The remote refused the connection because its handler pool is full.
    #[error("destination task {destination} has no free connections")]
    ConnectionsFull { destination: u32 },

    /// The retry budget for one batch was spent without a success.
    #[error("transfer to task {destination} failed after {attempts} attempts")]
    RetriesExhausted { destination: u32, attempts: u32 },

    /// A cursor moved backwards without a rollback in flight.
    #[error("cursor regression from {have} to {got} for source {source_task}")]
    CursorRegression { source_task: u32, have: i64, got: i64 },
}

/// Top-level error for the runtime.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Blob-store access failure.
    #[error("blob store: {0}")]
    Blob(String),

    /// Bad or inconsistent job configuration.
    #[error("config: {0}")]
    Config(String),

    /// Anything the task cannot recover from.
    #[error("task failed: {0}")]
    Fatal(String),
}
