//! The map side's single input channel.
//!
//! A FIFO of `(key, iState)` pairs paired with a monotonic iteration
//! counter. The PKVBUF handler feeds it through [`InputCollector::read`];
//! the activation engine pops with [`InputPkvBuffer::next`] until empty.

use std::collections::{HashSet, VecDeque};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Mutex;

use bytes::Bytes;
use tracing::debug;

use crate::codec::{open_frame, RecordReader, RecordShape};
use crate::error::Result;
use crate::exchange::{Header, InputCollector};
use crate::KeyValue;

struct Inner {
    queue: VecDeque<KeyValue>,
    iteration: i64,
    /// Reduce tasks that sent their stop buffer.
    stops: HashSet<u32>,
}

pub struct InputPkvBuffer {
    inner: Mutex<Inner>,
    /// Stop buffers expected before the map side may exit (one per reduce
    /// task).
    num_reduces: usize,
    read_buffer: usize,
    spill_dir: Option<PathBuf>,
}

impl InputPkvBuffer {
    pub fn new(num_reduces: usize, read_buffer: usize, spill_dir: Option<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                iteration: 0,
                stops: HashSet::new(),
            }),
            num_reduces,
            read_buffer,
            spill_dir,
        }
    }

    /// Seed one record during setup, before any buffer arrives.
    pub fn init(&self, kv: KeyValue) {
        self.lock().queue.push_back(kv);
    }

    /// Pop one record; `None` signals the current map pass is complete.
    pub fn next(&self) -> Option<KeyValue> {
        self.lock().queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    pub fn iteration(&self) -> i64 {
        self.lock().iteration
    }

    /// Every reduce task has sent its stop buffer.
    pub fn stopped(&self) -> bool {
        self.lock().stops.len() >= self.num_reduces
    }

    /// Clear buffered records without closing the channel.
    pub fn free(&self) {
        self.lock().queue.clear();
    }

    /// Rebuild the queue from an execution-queue dump
    /// (`iter \t key \t priority \t cState` TSV lines). The priority
    /// column stands in for the drained iState, which is exact for
    /// scalar-valued algorithms; rows that do not parse are skipped.
    /// Returns how many records were loaded.
    pub fn load_exequeue(&self, dump: &str) -> usize {
        let mut count = 0;
        let mut inner = self.lock();
        for line in dump.lines() {
            let mut fields = line.split('\t');
            let (Some(_iter), Some(key), Some(priority)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let (Ok(key), Ok(priority)) = (key.parse::<i64>(), priority.parse::<f64>()) else {
                continue;
            };
            inner
                .queue
                .push_back(KeyValue::new(key, Bytes::copy_from_slice(&priority.to_be_bytes())));
            count += 1;
        }
        count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("pkv buffer poisoned")
    }
}

impl InputCollector for InputPkvBuffer {
    fn read(&self, payload: Bytes, header: &Header) -> Result<bool> {
        let Header::Pkv(pkv) = header else {
            return Ok(false);
        };
        let mut inner = self.lock();
        // Stops are terminal metadata and count regardless of the
        // iteration gate; a finishing reduce task may sit behind this
        // buffer's iteration.
        if pkv.stop {
            inner.stops.insert(pkv.owner);
        }
        if pkv.iteration < inner.iteration {
            debug!(
                "stale activation buffer at iteration {} (buffer at {})",
                pkv.iteration, inner.iteration
            );
            return Ok(pkv.stop);
        }
        inner.iteration = pkv.iteration;

        let payload = open_frame(payload, self.spill_dir.as_deref())?;
        let mut reader =
            RecordReader::with_buffer(RecordShape::Pkv, Cursor::new(payload), self.read_buffer);
        let mut records = 0usize;
        while let Some((_, key, istate)) = reader.next_pkv()? {
            inner.queue.push_back(KeyValue::new(key, istate));
            records += 1;
        }
        debug!(
            "absorbed {records} activation records at iteration {}",
            pkv.iteration
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{seal_frame, RecordWriter};
    use crate::exchange::PkvBufferHeader;

    fn batch(owner: u32, iteration: i64, stop: bool, keys: &[i64]) -> (Header, Bytes) {
        let mut writer = RecordWriter::new(RecordShape::Pkv);
        for &key in keys {
            writer.append_pkv(1.0, key, b"v");
        }
        let sealed = seal_frame(writer.close(), false).unwrap();
        let header = Header::Pkv(PkvBufferHeader {
            owner,
            iteration,
            bytes: sealed.bytes.len() as u64,
            stop,
        });
        (header, sealed.bytes)
    }

    #[test]
    fn accepts_current_and_future_iterations_only() {
        let buffer = InputPkvBuffer::new(1, 1024, None);
        let (header, payload) = batch(0, 2, false, &[1, 2]);
        assert!(buffer.read(payload, &header).unwrap());
        assert_eq!(buffer.iteration(), 2);
        assert_eq!(buffer.len(), 2);

        // An older buffer is stale and must not be absorbed.
        let (header, payload) = batch(0, 1, false, &[9]);
        assert!(!buffer.read(payload, &header).unwrap());
        assert_eq!(buffer.len(), 2);

        assert_eq!(buffer.next().unwrap().key, 1);
        assert_eq!(buffer.next().unwrap().key, 2);
        assert!(buffer.next().is_none());
    }

    #[test]
    fn stop_requires_every_reduce() {
        let buffer = InputPkvBuffer::new(2, 1024, None);
        let (header, payload) = batch(0, 0, true, &[]);
        buffer.read(payload, &header).unwrap();
        assert!(!buffer.stopped());

        let (header, payload) = batch(1, 0, true, &[]);
        buffer.read(payload, &header).unwrap();
        assert!(buffer.stopped());
    }

    #[test]
    fn exequeue_dump_reloads_scalar_records() {
        let buffer = InputPkvBuffer::new(1, 1024, None);
        let loaded = buffer.load_exequeue("0\t7\t0.25\t0.5\nbad line\n1\t9\t0.125\t1.0\n");
        assert_eq!(loaded, 2);
        let first = buffer.next().unwrap();
        assert_eq!(first.key, 7);
        assert_eq!(first.value, Bytes::copy_from_slice(&0.25f64.to_be_bytes()));
        assert_eq!(buffer.next().unwrap().key, 9);
    }

    #[test]
    fn free_clears_without_closing() {
        let buffer = InputPkvBuffer::new(1, 1024, None);
        buffer.init(KeyValue::new(5, Bytes::from_static(b"x")));
        assert!(!buffer.is_empty());
        buffer.free();
        assert!(buffer.is_empty());
        buffer.init(KeyValue::new(6, Bytes::from_static(b"y")));
        assert_eq!(buffer.next().unwrap().key, 6);
    }
}
