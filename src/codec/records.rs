//! Length-prefixed record streams in the five wire shapes.
//!
//! A stream is a sequence of records, each field written as a VInt length
//! followed by the raw bytes, terminated by one EOF marker per field slot.
//! Readers detect end-of-stream only when *every* length field of a record
//! equals the marker; a lone negative length is a hard error.

use std::io::Read;

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::vint::{read_vint, vint_size, write_vint, MAX_VINT_SIZE};
use crate::codec::{decode_key, decode_priority, encode_key, encode_priority};
use crate::conf::DEFAULT_READ_BUFFER;
use crate::error::{CodecError, Result};
use crate::Key;

/// Length value marking the end of a record stream.
pub const EOF_MARKER: i64 = -1;

/// The five record shapes carried by the runtime.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RecordShape {
    /// `(key, value)` - generic payload frame.
    Kv,
    /// `(priority, key, value)` - activation messages ordered by priority.
    Pkv,
    /// `(key, iState, cState)` - per-key dual state.
    State,
    /// `(key, iState, staticData)` - priority-queue entry with per-key
    /// static context.
    PriorityQueue,
    /// `(key, staticData)` - loaded once per task, never mutated.
    StaticData,
}

impl RecordShape {
    /// Field slots per record; also the width of the EOF sentinel row.
    pub fn fields(self) -> usize {
        match self {
            RecordShape::Kv | RecordShape::StaticData => 2,
            RecordShape::Pkv | RecordShape::State | RecordShape::PriorityQueue => 3,
        }
    }
}

/// Writes one record stream into memory.
pub struct RecordWriter {
    shape: RecordShape,
    buf: BytesMut,
    raw_bytes: u64,
    records: u64,
}

impl RecordWriter {
    pub fn new(shape: RecordShape) -> Self {
        Self {
            shape,
            buf: BytesMut::new(),
            raw_bytes: 0,
            records: 0,
        }
    }

    fn put_record(&mut self, fields: &[&[u8]]) {
        debug_assert_eq!(fields.len(), self.shape.fields());
        for field in fields {
            write_vint(&mut self.buf, field.len() as i64);
        }
        for field in fields {
            self.buf.put_slice(field);
        }
        self.raw_bytes += fields
            .iter()
            .map(|f| f.len() as u64 + vint_size(f.len() as i64) as u64)
            .sum::<u64>();
        self.records += 1;
    }

    pub fn append_kv(&mut self, key: Key, value: &[u8]) {
        assert_eq!(self.shape, RecordShape::Kv);
        self.put_record(&[&encode_key(key), value]);
    }

    pub fn append_pkv(&mut self, priority: f64, key: Key, value: &[u8]) {
        assert_eq!(self.shape, RecordShape::Pkv);
        self.put_record(&[&encode_priority(priority), &encode_key(key), value]);
    }

    pub fn append_state(&mut self, key: Key, istate: &[u8], cstate: &[u8]) {
        assert_eq!(self.shape, RecordShape::State);
        self.put_record(&[&encode_key(key), istate, cstate]);
    }

    pub fn append_priority_queue(&mut self, key: Key, istate: &[u8], data: &[u8]) {
        assert_eq!(self.shape, RecordShape::PriorityQueue);
        self.put_record(&[&encode_key(key), istate, data]);
    }

    pub fn append_static(&mut self, key: Key, data: &[u8]) {
        assert_eq!(self.shape, RecordShape::StaticData);
        self.put_record(&[&encode_key(key), data]);
    }

    /// Records appended so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Decompressed bytes written so far, sentinel row excluded.
    pub fn raw_len(&self) -> u64 {
        self.raw_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Write the EOF sentinel row and hand back the finished stream.
    pub fn close(mut self) -> Bytes {
        for _ in 0..self.shape.fields() {
            write_vint(&mut self.buf, EOF_MARKER);
        }
        self.buf.freeze()
    }
}

/// Reads one record stream from any byte source, growing an internal window
/// as records demand it.
pub struct RecordReader<R: Read> {
    shape: RecordShape,
    input: R,
    window: Vec<u8>,
    start: usize,
    end: usize,
    buffer_size: usize,
    eof: bool,
    bytes_read: u64,
    records_read: u64,
}

impl<R: Read> RecordReader<R> {
    pub fn new(shape: RecordShape, input: R) -> Self {
        Self::with_buffer(shape, input, DEFAULT_READ_BUFFER)
    }

    /// `buffer_size` is the initial window (`io.file.buffer.size`); the
    /// window grows to twice the record size whenever a record crosses it.
    pub fn with_buffer(shape: RecordShape, input: R, buffer_size: usize) -> Self {
        Self {
            shape,
            input,
            window: Vec::new(),
            start: 0,
            end: 0,
            buffer_size: buffer_size.max(2 * MAX_VINT_SIZE),
            eof: false,
            bytes_read: 0,
            records_read: 0,
        }
    }

    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    fn available(&self) -> usize {
        self.end - self.start
    }

    /// Slide the unread tail to the front of the window and top it up from
    /// the input, growing the window first when `min_size` does not fit.
    fn fill(&mut self, min_size: usize) -> std::io::Result<()> {
        if self.window.is_empty() {
            self.window = vec![0; self.buffer_size];
        }
        let remaining = self.available();
        if self.window.len() < min_size {
            let mut grown = vec![0; min_size << 1];
            grown[..remaining].copy_from_slice(&self.window[self.start..self.end]);
            self.window = grown;
        } else if self.start > 0 {
            self.window.copy_within(self.start..self.end, 0);
        }
        self.start = 0;
        self.end = remaining;

        while self.end < self.window.len() {
            let n = self.input.read(&mut self.window[self.end..])?;
            if n == 0 {
                break;
            }
            self.end += n;
        }
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<Vec<Bytes>>> {
        if self.eof {
            return Err(CodecError::PastEof {
                bytes_read: self.bytes_read,
            }
            .into());
        }

        let fields = self.shape.fields();
        if self.available() < fields * MAX_VINT_SIZE {
            self.fill(fields * MAX_VINT_SIZE)?;
        }

        let mut lengths = [0i64; 3];
        let mut pos = self.start;
        for slot in lengths.iter_mut().take(fields) {
            let (value, consumed) = read_vint(&self.window[pos..self.end]).ok_or(
                CodecError::Truncated {
                    record: self.records_read + 1,
                    wanted: 1,
                },
            )?;
            *slot = value;
            pos += consumed;
        }
        self.bytes_read += (pos - self.start) as u64;
        self.start = pos;

        if lengths[..fields].iter().all(|&l| l == EOF_MARKER) {
            self.eof = true;
            return Ok(None);
        }
        if let Some(&bad) = lengths[..fields].iter().find(|&&l| l < 0) {
            return Err(CodecError::NegativeLength {
                record: self.records_read + 1,
                length: bad,
            }
            .into());
        }

        let total: usize = lengths[..fields].iter().map(|&l| l as usize).sum();
        if self.available() < total {
            self.fill(total)?;
            if self.available() < total {
                return Err(CodecError::Truncated {
                    record: self.records_read + 1,
                    wanted: total - self.available(),
                }
                .into());
            }
        }

        let mut out = Vec::with_capacity(fields);
        for &len in &lengths[..fields] {
            let len = len as usize;
            out.push(Bytes::copy_from_slice(
                &self.window[self.start..self.start + len],
            ));
            self.start += len;
        }
        self.bytes_read += total as u64;
        self.records_read += 1;
        Ok(Some(out))
    }

    pub fn next_kv(&mut self) -> Result<Option<(Key, Bytes)>> {
        debug_assert_eq!(self.shape, RecordShape::Kv);
        match self.next_record()? {
            None => Ok(None),
            Some(rec) => Ok(Some((decode_key(&rec[0])?, rec[1].clone()))),
        }
    }

    pub fn next_pkv(&mut self) -> Result<Option<(f64, Key, Bytes)>> {
        debug_assert_eq!(self.shape, RecordShape::Pkv);
        match self.next_record()? {
            None => Ok(None),
            Some(rec) => Ok(Some((
                decode_priority(&rec[0])?,
                decode_key(&rec[1])?,
                rec[2].clone(),
            ))),
        }
    }

    pub fn next_state(&mut self) -> Result<Option<(Key, Bytes, Bytes)>> {
        debug_assert_eq!(self.shape, RecordShape::State);
        match self.next_record()? {
            None => Ok(None),
            Some(rec) => Ok(Some((decode_key(&rec[0])?, rec[1].clone(), rec[2].clone()))),
        }
    }

    pub fn next_priority_queue(&mut self) -> Result<Option<(Key, Bytes, Bytes)>> {
        debug_assert_eq!(self.shape, RecordShape::PriorityQueue);
        match self.next_record()? {
            None => Ok(None),
            Some(rec) => Ok(Some((decode_key(&rec[0])?, rec[1].clone(), rec[2].clone()))),
        }
    }

    pub fn next_static(&mut self) -> Result<Option<(Key, Bytes)>> {
        debug_assert_eq!(self.shape, RecordShape::StaticData);
        match self.next_record()? {
            None => Ok(None),
            Some(rec) => Ok(Some((decode_key(&rec[0])?, rec[1].clone()))),
        }
    }
}
