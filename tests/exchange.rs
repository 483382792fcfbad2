//! Exchange-plane behavior over real loopback sockets: cursor replay,
//! connection limits, the asynchronous firing regimes, and cursor resets.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use uuid::Uuid;

use prlite::error::Result;
use prlite::exchange::{
    BufferRequest, BufferType, FileHeader, Header, InputCollector, OutBatch, Sink, SinkConfig,
    SinkEvent, SinkHandle, SnapshotHeader, Source, StreamHeader, SyncRegime, Transfer,
};

/// Records every absorbed payload.
struct Capture {
    batches: Mutex<Vec<(Header, Bytes)>>,
}

impl Capture {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

impl InputCollector for Capture {
    fn read(&self, payload: Bytes, header: &Header) -> Result<bool> {
        self.batches.lock().unwrap().push((header.clone(), payload));
        Ok(true)
    }
}

async fn open_sink(
    num_inputs: usize,
    max_connections: usize,
    regime: SyncRegime,
) -> (SinkHandle, Arc<Capture>, mpsc::UnboundedReceiver<SinkEvent>) {
    let collector = Capture::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = Sink::open(
        SinkConfig {
            owner: 0,
            num_inputs,
            max_connections,
            regime,
            map_sync: false,
        },
        collector.clone(),
        tx,
    )
    .await
    .unwrap()
    .spawn()
    .unwrap();
    (sink, collector, rx)
}

fn stream_batch(owner: u32, sequence: i64) -> OutBatch {
    let payload = Bytes::from(format!("payload-{sequence}"));
    OutBatch::new(
        Header::Stream(StreamHeader {
            owner,
            sequence,
            bytes: payload.len() as u64,
        }),
        payload,
    )
}

fn stream_source(sink: &SinkHandle, budget: u32) -> Source {
    Source::new(
        BufferRequest {
            dest_task: 0,
            dest_addr: sink.local_addr(),
            partition: 0,
            buffer_type: BufferType::Stream,
        },
        budget,
    )
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> Option<SinkEvent> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .ok()
        .flatten()
}

fn drain_spills(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> usize {
    let mut spills = 0;
    while let Ok(event) = rx.try_recv() {
        if event == SinkEvent::SpillIter {
            spills += 1;
        }
    }
    spills
}

#[tokio::test]
async fn duplicate_stream_sequence_is_ignored() {
    let (sink, collector, mut events) = open_sink(1, 100, SyncRegime::Strict).await;
    let mut source = stream_source(&sink, 3);

    for sequence in 0..3 {
        assert_eq!(
            source.send(&stream_batch(0, sequence)).await.unwrap(),
            Transfer::Success
        );
    }
    assert_eq!(collector.count(), 3);

    // A second source has no cursor yet and replays sequence 1 onto the
    // wire; the sink answers IGNORE and absorbs nothing.
    let mut replayer = stream_source(&sink, 3);
    assert_eq!(
        replayer.send(&stream_batch(0, 1)).await.unwrap(),
        Transfer::Ignore
    );
    assert_eq!(collector.count(), 3);

    // The replayer learned the real cursor and can continue the stream.
    assert_eq!(
        replayer.send(&stream_batch(0, 3)).await.unwrap(),
        Transfer::Success
    );
    assert_eq!(collector.count(), 4);

    // Single input: every accepted batch completes an iteration.
    let mut spills = 0;
    while let Some(event) = next_event(&mut events).await {
        if event == SinkEvent::SpillIter {
            spills += 1;
            if spills == 4 {
                break;
            }
        }
    }
    assert_eq!(spills, 4);

    source.close().await;
    replayer.close().await;
}

#[tokio::test]
async fn connections_above_the_bound_are_refused() {
    let (sink, _collector, _events) = open_sink(4, 2, SyncRegime::Strict).await;
    let addr = sink.local_addr();

    // Two peers hold their connections open.
    let mut first = TcpStream::connect(addr).await.unwrap();
    assert_eq!(first.read_u8().await.unwrap(), 0); // Connect::Open
    first.write_u8(BufferType::Stream as u8).await.unwrap();

    let mut second = TcpStream::connect(addr).await.unwrap();
    assert_eq!(second.read_u8().await.unwrap(), 0);
    second.write_u8(BufferType::Stream as u8).await.unwrap();

    // The third concurrent connection is over the bound.
    let mut third = TcpStream::connect(addr).await.unwrap();
    assert_eq!(third.read_u8().await.unwrap(), 2); // Connect::ConnectionsFull

    // The first two proceed normally: a frame over the first connection
    // is accepted and acknowledged with the next expected cursor.
    let payload = Bytes::from_static(b"hello");
    let header = Header::Stream(StreamHeader {
        owner: 1,
        sequence: 0,
        bytes: payload.len() as u64,
    })
    .encode();
    first.write_i32(0x7fff_ffff).await.unwrap();
    first.write_u32(header.len() as u32).await.unwrap();
    first.write_all(&header).await.unwrap();
    assert_eq!(first.read_u8().await.unwrap(), 0); // Transfer::Ready
    first.write_all(&payload).await.unwrap();
    assert_eq!(first.read_i64().await.unwrap(), 1);
}

#[tokio::test]
async fn async_time_regime_fires_once_per_idle_window() {
    let (sink, collector, mut events) = open_sink(
        2,
        100,
        SyncRegime::AsyncTime {
            threshold: Duration::from_millis(100),
        },
    )
    .await;
    let mut source = stream_source(&sink, 3);

    assert_eq!(
        source.send(&stream_batch(0, 0)).await.unwrap(),
        Transfer::Success
    );
    assert_eq!(collector.count(), 1);

    // One buffered input plus an idle window past the threshold: exactly
    // one fire.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(drain_spills(&mut events), 1);

    // Nothing further fires until another frame arrives.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(drain_spills(&mut events), 0);

    assert_eq!(
        source.send(&stream_batch(0, 1)).await.unwrap(),
        Transfer::Success
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(drain_spills(&mut events), 1);

    source.close().await;
}

#[tokio::test]
async fn async_self_regime_waits_for_own_partition() {
    let (sink, _collector, mut events) = open_sink(2, 100, SyncRegime::AsyncSelf).await;

    // Initial round: the full set must arrive once.
    let mut other = stream_source(&sink, 3);
    other.send(&stream_batch(1, 0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(drain_spills(&mut events), 0);
    let mut own = stream_source(&sink, 3);
    own.send(&stream_batch(0, 0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(drain_spills(&mut events), 1);

    // Running phase: only the owner's partition triggers.
    other.send(&stream_batch(1, 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(drain_spills(&mut events), 0);
    own.send(&stream_batch(0, 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(drain_spills(&mut events), 1);

    other.close().await;
    own.close().await;
}

#[tokio::test]
async fn cursor_reset_reopens_an_old_sequence() {
    let (sink, collector, mut events) = open_sink(1, 100, SyncRegime::Strict).await;
    let mut source = stream_source(&sink, 3);
    for sequence in 0..3 {
        source.send(&stream_batch(0, sequence)).await.unwrap();
    }
    assert_eq!(collector.count(), 3);

    sink.reset_cursors(1).await;
    let mut saw_rollback = false;
    while let Ok(event) = events.try_recv() {
        saw_rollback |= event == SinkEvent::Rollback;
    }
    assert!(saw_rollback);

    // Ahead-of-cursor frames are ignored; the sequence matching the
    // reloaded cursor is the next one accepted.
    let mut replayer = stream_source(&sink, 3);
    assert_eq!(
        replayer.send(&stream_batch(0, 5)).await.unwrap(),
        Transfer::Ignore
    );
    assert_eq!(collector.count(), 3);
    assert_eq!(
        replayer.send(&stream_batch(0, 1)).await.unwrap(),
        Transfer::Success
    );
    assert_eq!(collector.count(), 4);

    source.close().await;
    replayer.close().await;
}

#[tokio::test]
async fn file_handler_accepts_contiguous_spill_ranges_only() {
    let (sink, collector, _events) = open_sink(1, 100, SyncRegime::Strict).await;
    let run = Uuid::new_v4();
    let mut source = Source::new(
        BufferRequest {
            dest_task: 0,
            dest_addr: sink.local_addr(),
            partition: 0,
            buffer_type: BufferType::File,
        },
        3,
    );

    let file_batch = |first: i64, last: i64, eof: bool| {
        let payload = Bytes::from(format!("spills-{first}-{last}"));
        OutBatch::new(
            Header::File(FileHeader {
                owner: 0,
                run,
                first,
                last,
                compressed: payload.len() as u64,
                decompressed: payload.len() as u64,
                progress: (last + 1) as f32 / 6.0,
                eof,
            }),
            payload,
        )
    };

    assert_eq!(
        source.send(&file_batch(0, 2, false)).await.unwrap(),
        Transfer::Success
    );
    assert_eq!(
        source.send(&file_batch(3, 5, false)).await.unwrap(),
        Transfer::Success
    );
    assert_eq!(collector.count(), 2);

    // A replay of the first range from a cursorless source is ignored.
    let mut replayer = Source::new(
        BufferRequest {
            dest_task: 0,
            dest_addr: sink.local_addr(),
            partition: 0,
            buffer_type: BufferType::File,
        },
        3,
    );
    assert_eq!(
        replayer.send(&file_batch(0, 2, false)).await.unwrap(),
        Transfer::Ignore
    );
    assert_eq!(collector.count(), 2);

    source.close().await;
    replayer.close().await;
}

#[tokio::test]
async fn snapshot_handler_is_idempotent_by_progress() {
    let (sink, collector, _events) = open_sink(1, 100, SyncRegime::Strict).await;
    let mut source = Source::new(
        BufferRequest {
            dest_task: 0,
            dest_addr: sink.local_addr(),
            partition: 0,
            buffer_type: BufferType::Snapshot,
        },
        3,
    );

    let snapshot_batch = |progress: f32| {
        let payload = Bytes::from(format!("snapshot-{progress}"));
        OutBatch::new(
            Header::Snapshot(SnapshotHeader {
                owner: 0,
                progress,
                eof: false,
                bytes: payload.len() as u64,
            }),
            payload,
        )
    };

    assert_eq!(
        source.send(&snapshot_batch(0.5)).await.unwrap(),
        Transfer::Success
    );
    // The source's own cursor already skips a replay of the same
    // progress.
    assert_eq!(
        source.send(&snapshot_batch(0.5)).await.unwrap(),
        Transfer::Ignore
    );
    assert_eq!(
        source.send(&snapshot_batch(0.8)).await.unwrap(),
        Transfer::Success
    );
    assert_eq!(collector.count(), 2);

    source.close().await;
}
