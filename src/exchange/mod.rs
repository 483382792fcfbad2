//! The buffer-exchange plane.
//!
//! Symmetric endpoints stream typed record batches between every map and
//! reduce task: a [`Sink`] listens on an ephemeral TCP port and demuxes
//! incoming connections by [`BufferType`] into a typed handler; a
//! [`Source`] holds one lazily-connected socket per destination and pushes
//! header+payload frames, honoring the cursor the sink feeds back.
//!
//! Delivery is at-least-once: a sink deduplicates by per-source cursor and
//! answers stale frames with [`Transfer::Ignore`].

pub mod headers;
pub mod sink;
pub mod source;

pub use headers::{FileHeader, Header, PkvBufferHeader, SnapshotHeader, StreamHeader};
pub use sink::{InputCollector, Sink, SinkConfig, SinkEvent, SinkHandle};
pub use source::{BufferRequest, OutBatch, Source};

use std::time::Duration;

use crate::error::ExchangeError;

/// Preamble announcing a frame on the socket; `0` announces an orderly
/// close instead.
pub const DATA_SENTINEL: i32 = 0x7fff_ffff;

/// First byte a sink writes on every new connection.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Connect {
    Open = 0,
    BufferComplete = 1,
    ConnectionsFull = 2,
    Error = 3,
    Closed = 4,
}

impl TryFrom<u8> for Connect {
    type Error = ExchangeError;

    fn try_from(value: u8) -> Result<Self, ExchangeError> {
        match value {
            0 => Ok(Connect::Open),
            1 => Ok(Connect::BufferComplete),
            2 => Ok(Connect::ConnectionsFull),
            3 => Ok(Connect::Error),
            4 => Ok(Connect::Closed),
            other => Err(ExchangeError::BadEnum {
                what: "connect",
                value: other,
            }),
        }
    }
}

/// The typed channel a connection carries, written by the source right
/// after [`Connect::Open`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum BufferType {
    File = 0,
    Snapshot = 1,
    Stream = 2,
    PkvBuf = 3,
}

impl TryFrom<u8> for BufferType {
    type Error = ExchangeError;

    fn try_from(value: u8) -> Result<Self, ExchangeError> {
        match value {
            0 => Ok(BufferType::File),
            1 => Ok(BufferType::Snapshot),
            2 => Ok(BufferType::Stream),
            3 => Ok(BufferType::PkvBuf),
            other => Err(ExchangeError::BadEnum {
                what: "buffer type",
                value: other,
            }),
        }
    }
}

/// Per-frame response from the sink, and the source-side outcome of a
/// transfer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Transfer {
    Ready = 0,
    Ignore = 1,
    Success = 2,
    Retry = 3,
    Terminate = 4,
    Closed = 5,
}

impl TryFrom<u8> for Transfer {
    type Error = ExchangeError;

    fn try_from(value: u8) -> Result<Self, ExchangeError> {
        match value {
            0 => Ok(Transfer::Ready),
            1 => Ok(Transfer::Ignore),
            2 => Ok(Transfer::Success),
            3 => Ok(Transfer::Retry),
            4 => Ok(Transfer::Terminate),
            5 => Ok(Transfer::Closed),
            other => Err(ExchangeError::BadEnum {
                what: "transfer",
                value: other,
            }),
        }
    }
}

/// The monotone identifier denoting the next expected frame from a source.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Cursor {
    /// Spill ids, stream sequences and iteration numbers. `-1` means
    /// nothing received yet.
    Int(i64),
    /// Snapshot progress.
    Float(f32),
}

/// How a reduce task's STREAM handlers decide when the reducer fires.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum SyncRegime {
    /// Fire only after all expected inputs at the current iteration
    /// arrived.
    Strict,
    /// Fire when the handler has been idle past `threshold` with at least
    /// one buffered input, or when a full window arrived.
    AsyncTime { threshold: Duration },
    /// Fire when the input from this reducer's own partition arrives;
    /// the first round waits for the full set once.
    AsyncSelf,
}
