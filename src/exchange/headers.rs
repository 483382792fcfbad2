//! Typed transport headers, one kind per [`BufferType`].
//!
//! Headers travel length-prefixed (`u32` big-endian) so a handler can read
//! the whole header before parsing. All integers on the wire are
//! big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{Error, ExchangeError, Result};
use crate::exchange::BufferType;

/// Ordered, resumable spill-file shipping.
#[derive(Clone, PartialEq, Debug)]
pub struct FileHeader {
    pub owner: u32,
    pub run: Uuid,
    /// First spill id carried by this frame.
    pub first: i64,
    /// Last spill id carried by this frame.
    pub last: i64,
    pub compressed: u64,
    pub decompressed: u64,
    pub progress: f32,
    pub eof: bool,
}

/// Idempotent snapshot shipping, keyed by progress.
#[derive(Clone, PartialEq, Debug)]
pub struct SnapshotHeader {
    pub owner: u32,
    pub progress: f32,
    pub eof: bool,
    pub bytes: u64,
}

/// Strictly sequenced delta streams (map to reduce).
#[derive(Clone, PartialEq, Debug)]
pub struct StreamHeader {
    pub owner: u32,
    pub sequence: i64,
    pub bytes: u64,
}

/// One activation buffer per iteration per source (reduce to map).
#[derive(Clone, PartialEq, Debug)]
pub struct PkvBufferHeader {
    pub owner: u32,
    pub iteration: i64,
    pub bytes: u64,
    /// Set on the final buffer so the map side exits cleanly.
    pub stop: bool,
}

#[derive(Clone, PartialEq, Debug)]
pub enum Header {
    File(FileHeader),
    Snapshot(SnapshotHeader),
    Stream(StreamHeader),
    Pkv(PkvBufferHeader),
}

impl Header {
    pub fn buffer_type(&self) -> BufferType {
        match self {
            Header::File(_) => BufferType::File,
            Header::Snapshot(_) => BufferType::Snapshot,
            Header::Stream(_) => BufferType::Stream,
            Header::Pkv(_) => BufferType::PkvBuf,
        }
    }

    /// The task that produced this frame.
    pub fn owner(&self) -> u32 {
        match self {
            Header::File(h) => h.owner,
            Header::Snapshot(h) => h.owner,
            Header::Stream(h) => h.owner,
            Header::Pkv(h) => h.owner,
        }
    }

    /// Payload bytes following the header on the wire.
    pub fn payload_len(&self) -> u64 {
        match self {
            Header::File(h) => h.compressed,
            Header::Snapshot(h) => h.bytes,
            Header::Stream(h) => h.bytes,
            Header::Pkv(h) => h.bytes,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.buffer_type() as u8);
        match self {
            Header::File(h) => {
                buf.put_u32(h.owner);
                buf.put_slice(h.run.as_bytes());
                buf.put_i64(h.first);
                buf.put_i64(h.last);
                buf.put_u64(h.compressed);
                buf.put_u64(h.decompressed);
                buf.put_f32(h.progress);
                buf.put_u8(h.eof as u8);
            }
            Header::Snapshot(h) => {
                buf.put_u32(h.owner);
                buf.put_f32(h.progress);
                buf.put_u8(h.eof as u8);
                buf.put_u64(h.bytes);
            }
            Header::Stream(h) => {
                buf.put_u32(h.owner);
                buf.put_i64(h.sequence);
                buf.put_u64(h.bytes);
            }
            Header::Pkv(h) => {
                buf.put_u32(h.owner);
                buf.put_i64(h.iteration);
                buf.put_u64(h.bytes);
                buf.put_u8(h.stop as u8);
            }
        }
        buf.freeze()
    }

    pub fn decode(mut body: &[u8]) -> Result<Header> {
        fn need(body: &[u8], len: usize) -> Result<()> {
            if body.remaining() < len {
                Err(Error::Exchange(ExchangeError::TruncatedHeader))
            } else {
                Ok(())
            }
        }

        need(body, 1)?;
        let tag = BufferType::try_from(body.get_u8())?;
        let header = match tag {
            BufferType::File => {
                need(body, 4 + 16 + 8 + 8 + 8 + 8 + 4 + 1)?;
                let owner = body.get_u32();
                let mut run = [0u8; 16];
                body.copy_to_slice(&mut run);
                Header::File(FileHeader {
                    owner,
                    run: Uuid::from_bytes(run),
                    first: body.get_i64(),
                    last: body.get_i64(),
                    compressed: body.get_u64(),
                    decompressed: body.get_u64(),
                    progress: body.get_f32(),
                    eof: body.get_u8() != 0,
                })
            }
            BufferType::Snapshot => {
                need(body, 4 + 4 + 1 + 8)?;
                Header::Snapshot(SnapshotHeader {
                    owner: body.get_u32(),
                    progress: body.get_f32(),
                    eof: body.get_u8() != 0,
                    bytes: body.get_u64(),
                })
            }
            BufferType::Stream => {
                need(body, 4 + 8 + 8)?;
                Header::Stream(StreamHeader {
                    owner: body.get_u32(),
                    sequence: body.get_i64(),
                    bytes: body.get_u64(),
                })
            }
            BufferType::PkvBuf => {
                need(body, 4 + 8 + 8 + 1)?;
                Header::Pkv(PkvBufferHeader {
                    owner: body.get_u32(),
                    iteration: body.get_i64(),
                    bytes: body.get_u64(),
                    stop: body.get_u8() != 0,
                })
            }
        };
        Ok(header)
    }

    /// Read one length-prefixed header off a socket.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Header> {
        let len = reader.read_u32().await? as usize;
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        Header::decode(&body)
    }

    /// Write this header, length-prefixed, to a socket.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let body = self.encode();
        writer.write_u32(body.len() as u32).await?;
        writer.write_all(&body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_round_trip() {
        let headers = [
            Header::File(FileHeader {
                owner: 3,
                run: Uuid::new_v4(),
                first: 5,
                last: 9,
                compressed: 1024,
                decompressed: 4096,
                progress: 0.5,
                eof: true,
            }),
            Header::Snapshot(SnapshotHeader {
                owner: 1,
                progress: 0.75,
                eof: false,
                bytes: 99,
            }),
            Header::Stream(StreamHeader {
                owner: 0,
                sequence: 42,
                bytes: 7,
            }),
            Header::Pkv(PkvBufferHeader {
                owner: 2,
                iteration: 6,
                bytes: 0,
                stop: true,
            }),
        ];
        for header in headers {
            let decoded = Header::decode(&header.encode()).unwrap();
            assert_eq!(decoded, header);
        }
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        assert!(Header::decode(&[9u8, 0, 0]).is_err());
    }
}
