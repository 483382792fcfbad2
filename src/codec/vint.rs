//! Signed variable-length integer encoding.
//!
//! Identical to the standard writable VInt layout: values in `[-112, 127]`
//! are a single literal byte; anything else is one header byte encoding the
//! sign and magnitude byte-count (1..=8), followed by the big-endian
//! magnitude bytes.

use bytes::BufMut;

/// Upper bound on an encoded vint, in bytes.
pub const MAX_VINT_SIZE: usize = 9;

/// Append `value` to `buf` in vint form.
pub fn write_vint(buf: &mut impl BufMut, value: i64) {
    if (-112..=127).contains(&value) {
        buf.put_i8(value as i8);
        return;
    }

    let mut len: i32 = -112;
    let mut magnitude = value;
    if value < 0 {
        magnitude = !magnitude;
        len = -120;
    }

    let mut tmp = magnitude;
    while tmp != 0 {
        tmp >>= 8;
        len -= 1;
    }
    buf.put_i8(len as i8);

    let bytes = if len < -120 { -(len + 120) } else { -(len + 112) };
    for idx in (1..=bytes).rev() {
        let shift = (idx - 1) * 8;
        buf.put_u8((magnitude >> shift) as u8);
    }
}

/// The encoded size of `value`, in bytes.
pub fn vint_size(value: i64) -> usize {
    if (-112..=127).contains(&value) {
        return 1;
    }
    let magnitude = if value < 0 { !value } else { value };
    let data_bits = 64 - magnitude.leading_zeros() as usize;
    1 + data_bits.div_ceil(8)
}

/// Decode one vint from the front of `data`, returning the value and the
/// number of bytes consumed. Returns `None` when `data` holds fewer bytes
/// than the encoding needs.
pub fn read_vint(data: &[u8]) -> Option<(i64, usize)> {
    let first = *data.first()? as i8;
    if first >= -112 {
        return Some((first as i64, 1));
    }

    let negative = first < -120;
    let bytes = if negative {
        (-120 - first as i32) as usize
    } else {
        (-112 - first as i32) as usize
    };
    if data.len() < 1 + bytes {
        return None;
    }

    let mut magnitude: i64 = 0;
    for &b in &data[1..=bytes] {
        magnitude = (magnitude << 8) | b as i64;
    }
    let value = if negative { !magnitude } else { magnitude };
    Some((value, 1 + bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn round_trip(value: i64) {
        let mut buf = BytesMut::new();
        write_vint(&mut buf, value);
        assert_eq!(buf.len(), vint_size(value), "size of {value}");
        let (decoded, consumed) = read_vint(&buf).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn single_byte_range() {
        for value in -112..=127 {
            let mut buf = BytesMut::new();
            write_vint(&mut buf, value);
            assert_eq!(buf.len(), 1);
            round_trip(value);
        }
    }

    #[test]
    fn multi_byte_values() {
        for value in [
            128,
            -113,
            255,
            256,
            u16::MAX as i64,
            1 << 24,
            -(1 << 24),
            i32::MAX as i64,
            i32::MIN as i64,
            i64::MAX,
            i64::MIN,
        ] {
            round_trip(value);
        }
    }

    #[test]
    fn eof_marker_is_one_byte() {
        let mut buf = BytesMut::new();
        write_vint(&mut buf, -1);
        assert_eq!(&buf[..], &[0xffu8]);
    }

    #[test]
    fn short_input_is_incomplete() {
        let mut buf = BytesMut::new();
        write_vint(&mut buf, i64::MAX);
        assert!(read_vint(&buf[..buf.len() - 1]).is_none());
        assert!(read_vint(&[]).is_none());
    }
}
