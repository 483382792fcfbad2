//! Framing (flags + optional zstd block + trailing crc32c).
//!
//! Layout: one flags byte, the (possibly compressed) record stream, and a
//! four-byte big-endian crc32c over everything before the trailer. The
//! flags byte records whether the body is compressed, so a reader needs no
//! out-of-band signal.

use std::path::Path;

use bytes::{BufMut, Bytes, BytesMut};
use crc32c::crc32c;
use tracing::warn;

use crate::error::{CodecError, Result};

const FLAG_COMPRESSED: u8 = 0b0000_0001;
const TRAILER_LEN: usize = 5; // flags byte is up front, crc32 behind

/// A sealed frame plus the byte totals its transport header advertises.
pub struct SealedFrame {
    pub bytes: Bytes,
    /// Length of the record stream before compression.
    pub decompressed: u64,
    /// Length on the wire, flags and checksum included.
    pub compressed: u64,
}

/// Wrap a finished record stream for the wire or the blob store.
pub fn seal_frame(payload: Bytes, compress: bool) -> Result<SealedFrame> {
    let decompressed = payload.len() as u64;
    let body = if compress {
        Bytes::from(zstd::stream::encode_all(&payload[..], 0).map_err(CodecError::Decompress)?)
    } else {
        payload
    };

    let mut out = BytesMut::with_capacity(body.len() + TRAILER_LEN);
    out.put_u8(if compress { FLAG_COMPRESSED } else { 0 });
    out.put_slice(&body);
    let crc = crc32c(&out);
    out.put_u32(crc);

    let bytes = out.freeze();
    Ok(SealedFrame {
        compressed: bytes.len() as u64,
        decompressed,
        bytes,
    })
}

/// Unwrap a frame, verifying the checksum and undoing compression.
///
/// When `spill_dir` is given and the frame fails verification, the raw
/// bytes are dumped there for post-mortem before the error is returned.
pub fn open_frame(frame: Bytes, spill_dir: Option<&Path>) -> Result<Bytes> {
    match try_open(&frame) {
        Ok(payload) => Ok(payload),
        Err(err) => {
            if let Some(dir) = spill_dir {
                dump_corrupt(&frame, dir);
            }
            Err(err)
        }
    }
}

fn try_open(frame: &Bytes) -> Result<Bytes> {
    if frame.len() < TRAILER_LEN {
        return Err(CodecError::ShortFrame { len: frame.len() }.into());
    }
    let (body, trailer) = frame.split_at(frame.len() - 4);
    let expected = u32::from_be_bytes(trailer.try_into().expect("four trailer bytes"));
    let got = crc32c(body);
    if expected != got {
        return Err(CodecError::ChecksumMismatch { expected, got }.into());
    }

    let flags = body[0];
    let body = frame.slice(1..frame.len() - 4);
    if flags & FLAG_COMPRESSED != 0 {
        let payload = zstd::stream::decode_all(&body[..]).map_err(CodecError::Decompress)?;
        Ok(Bytes::from(payload))
    } else {
        Ok(body)
    }
}

fn dump_corrupt(frame: &Bytes, dir: &Path) {
    let path = dir.join(format!("corrupt-{}.bin", uuid::Uuid::new_v4()));
    if let Err(err) = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, frame)) {
        warn!("failed to dump corrupt frame to {}: {err}", path.display());
    } else {
        warn!("dumped corrupt frame to {}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn plain_frame_round_trip() {
        let payload = Bytes::from_static(b"some record stream bytes");
        let sealed = seal_frame(payload.clone(), false).unwrap();
        assert_eq!(sealed.decompressed, payload.len() as u64);
        assert_eq!(sealed.compressed, sealed.bytes.len() as u64);
        assert_eq!(open_frame(sealed.bytes, None).unwrap(), payload);
    }

    #[test]
    fn compressed_frame_round_trip() {
        let payload = Bytes::from(vec![7u8; 32 * 1024]);
        let sealed = seal_frame(payload.clone(), true).unwrap();
        assert!(sealed.bytes.len() < payload.len());
        assert_eq!(open_frame(sealed.bytes, None).unwrap(), payload);
    }

    #[test]
    fn corruption_fails_the_checksum() {
        let sealed = seal_frame(Bytes::from_static(b"payload"), false).unwrap();
        let mut bytes = sealed.bytes.to_vec();
        bytes[2] ^= 0xff;
        let err = open_frame(Bytes::from(bytes), None).unwrap_err();
        assert!(matches!(
            err,
            Error::Codec(CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn corrupt_frame_is_dumped_for_post_mortem() {
        let dir = tempfile::tempdir().unwrap();
        let sealed = seal_frame(Bytes::from_static(b"payload"), false).unwrap();
        let mut bytes = sealed.bytes.to_vec();
        bytes[1] ^= 0x01;
        let _ = open_frame(Bytes::from(bytes), Some(dir.path())).unwrap_err();
        let dumped: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(dumped.len(), 1);
    }
}
