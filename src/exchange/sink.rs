//! The receiving endpoint of the buffer exchange.
//!
//! A sink binds an ephemeral TCP listener, accepts many concurrent peers,
//! and demultiplexes each connection by its [`BufferType`] into a typed
//! handler. Handlers deduplicate frames by per-source cursor, feed accepted
//! payloads to an [`InputCollector`], and report what happened over a
//! [`SinkEvent`] channel; the owning task drains that channel and never
//! holds a pointer back into the sink.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{ExchangeError, Result};
use crate::exchange::{
    BufferType, Connect, Cursor, Header, SyncRegime, Transfer, DATA_SENTINEL,
};

/// Consumes accepted payloads on behalf of the owning task.
pub trait InputCollector: Send + Sync + 'static {
    /// Absorb one payload. `Ok(false)` marks a batch the collector itself
    /// judged stale; the handler then neither fires events nor advances
    /// its regime state.
    fn read(&self, payload: Bytes, header: &Header) -> Result<bool>;
}

/// What a sink tells its owning task.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum SinkEvent {
    /// A payload was absorbed by the collector.
    BatchReceived { kind: BufferType, owner: u32 },
    /// Every expected input has delivered its final frame.
    AllInputsDone,
    /// The synchronization regime decided the reducer should fire.
    SpillIter,
    /// Cursors were reset to a checkpoint; pending regime state is void.
    Rollback,
}

/// Static configuration of one sink.
#[derive(Clone, Debug)]
pub struct SinkConfig {
    /// Task that owns this sink.
    pub owner: u32,
    /// Number of distinct input tasks expected to connect.
    pub num_inputs: usize,
    /// Bound on concurrent handlers; excess connections are refused with
    /// [`Connect::ConnectionsFull`].
    pub max_connections: usize,
    /// STREAM firing regime.
    pub regime: SyncRegime,
    /// PKVBUF handlers wait for the full set of reduce inputs per
    /// iteration.
    pub map_sync: bool,
}

struct SinkState {
    cursors: HashMap<u32, Cursor>,
    /// Inputs that delivered their final (or current-iteration) frame.
    successful: HashSet<u32>,
    input_progress: HashMap<u32, f32>,
    progress_sum: f32,
    /// Batches buffered inside the current async-time window.
    buffered: usize,
    last_recv: Instant,
    /// Async-self: still collecting the initial full round.
    async_init: bool,
    /// Async-self: inputs seen since the last fire.
    received: usize,
    /// Map-sync: per-iteration PKVBUF arrival counts.
    sync_pos: HashMap<i64, usize>,
}

struct SinkShared {
    config: SinkConfig,
    collector: Arc<dyn InputCollector>,
    events: mpsc::UnboundedSender<SinkEvent>,
    handlers: AtomicUsize,
    state: Mutex<SinkState>,
}

impl SinkShared {
    fn complete(&self, state: &SinkState) -> bool {
        state.successful.len() == self.config.num_inputs
    }
}

/// The listening endpoint. [`Sink::spawn`] turns it into a running
/// acceptor plus a [`SinkHandle`] for the owning task.
pub struct Sink {
    listener: TcpListener,
    shared: Arc<SinkShared>,
}

impl Sink {
    pub async fn open(
        config: SinkConfig,
        collector: Arc<dyn InputCollector>,
        events: mpsc::UnboundedSender<SinkEvent>,
    ) -> Result<Sink> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let shared = Arc::new(SinkShared {
            config,
            collector,
            events,
            handlers: AtomicUsize::new(0),
            state: Mutex::new(SinkState {
                cursors: HashMap::new(),
                successful: HashSet::new(),
                input_progress: HashMap::new(),
                progress_sum: 0.0,
                buffered: 0,
                last_recv: Instant::now(),
                async_init: true,
                received: 0,
                sync_pos: HashMap::new(),
            }),
        });
        Ok(Sink { listener, shared })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Start the acceptor (and the async-time ticker when configured) and
    /// hand back the control handle.
    pub fn spawn(self) -> Result<SinkHandle> {
        let addr = self.local_addr()?;
        let shared = self.shared.clone();
        let listener = self.listener;

        let acceptor = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(err) => {
                        debug!("sink {} accept loop closed: {err}", shared.config.owner);
                        return;
                    }
                };
                let active = shared.handlers.fetch_add(1, Ordering::SeqCst) + 1;
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(&shared, stream, active).await {
                        debug!(
                            "sink {} handler for {peer} exited: {err}",
                            shared.config.owner
                        );
                    }
                    shared.handlers.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        let ticker = match self.shared.config.regime {
            SyncRegime::AsyncTime { threshold } => {
                let shared = self.shared.clone();
                Some(tokio::spawn(async move {
                    let period = (threshold / 4).max(std::time::Duration::from_millis(10));
                    let mut tick = tokio::time::interval(period);
                    loop {
                        tick.tick().await;
                        let mut state = shared.state.lock().await;
                        if state.buffered > 0 && state.last_recv.elapsed() > threshold {
                            info!(
                                "threshold elapsed, trigger reduce with {} buffered inputs",
                                state.buffered
                            );
                            state.buffered = 0;
                            let _ = shared.events.send(SinkEvent::SpillIter);
                        }
                    }
                }))
            }
            _ => None,
        };

        Ok(SinkHandle {
            addr,
            shared: self.shared,
            acceptor,
            ticker,
        })
    }
}

/// Control handle held by the owning task.
pub struct SinkHandle {
    addr: SocketAddr,
    shared: Arc<SinkShared>,
    acceptor: JoinHandle<()>,
    ticker: Option<JoinHandle<()>>,
}

impl SinkHandle {
    /// The address to advertise through the out-of-band registry.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// True once every expected input delivered its final frame.
    pub async fn complete(&self) -> bool {
        let state = self.shared.state.lock().await;
        self.shared.complete(&state)
    }

    /// Aggregate copy progress across inputs, in `0..=1`.
    pub async fn progress(&self) -> f32 {
        let state = self.shared.state.lock().await;
        if self.shared.config.num_inputs == 0 {
            return 1.0;
        }
        state.progress_sum / self.shared.config.num_inputs as f32
    }

    /// Roll every cursor back to `checkpoint` and void pending regime
    /// state. Integer cursors land on the checkpoint; snapshot cursors
    /// restart from zero progress.
    pub async fn reset_cursors(&self, checkpoint: i64) {
        let mut state = self.shared.state.lock().await;
        for cursor in state.cursors.values_mut() {
            *cursor = match cursor {
                Cursor::Float(_) => Cursor::Float(0.0),
                Cursor::Int(_) => Cursor::Int(checkpoint),
            };
        }
        state.successful.clear();
        state.sync_pos.clear();
        state.buffered = 0;
        state.received = 0;
        let _ = self.shared.events.send(SinkEvent::Rollback);
    }

    /// Stop accepting connections. Live handlers drain until their peers
    /// close.
    pub fn close(&self) {
        self.acceptor.abort();
        if let Some(ticker) = &self.ticker {
            ticker.abort();
        }
    }
}

impl Drop for SinkHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/////////////////////////////////////////////////////////////////////////////
// Connection handling
/////////////////////////////////////////////////////////////////////////////

async fn handle_connection(
    shared: &Arc<SinkShared>,
    mut stream: TcpStream,
    active: usize,
) -> Result<()> {
    {
        let state = shared.state.lock().await;
        if shared.complete(&state) {
            drop(state);
            stream.write_u8(Connect::BufferComplete as u8).await?;
            stream.flush().await?;
            return Ok(());
        }
    }
    if active > shared.config.max_connections {
        info!(
            "connections full: {active} live, max allowed {}",
            shared.config.max_connections
        );
        stream.write_u8(Connect::ConnectionsFull as u8).await?;
        stream.flush().await?;
        return Ok(());
    }

    stream.write_u8(Connect::Open as u8).await?;
    stream.flush().await?;
    let kind = BufferType::try_from(stream.read_u8().await?)?;
    debug!("sink {} opened a {kind:?} connection", shared.config.owner);

    loop {
        // EOF or an I/O error ends the handler; `0` is an orderly close.
        let preamble = match stream.read_i32().await {
            Ok(value) => value,
            Err(_) => return Ok(()),
        };
        if preamble == 0 {
            return Ok(());
        }
        if preamble != DATA_SENTINEL {
            return Err(ExchangeError::BadPreamble(preamble).into());
        }
        let header = Header::read_from(&mut stream).await?;
        receive(shared, &mut stream, kind, header).await?;
    }
}

async fn read_payload(stream: &mut TcpStream, len: u64) -> Result<Bytes> {
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}

async fn write_transfer(stream: &mut TcpStream, transfer: Transfer) -> Result<()> {
    stream.write_u8(transfer as u8).await?;
    stream.flush().await?;
    Ok(())
}

/// Dispatch one frame to its typed handler. The sink state lock is held
/// across the whole receive, serializing cursor movement and collector
/// mutation exactly once per frame.
async fn receive(
    shared: &Arc<SinkShared>,
    stream: &mut TcpStream,
    kind: BufferType,
    header: Header,
) -> Result<()> {
    match (&header, kind) {
        (Header::File(_), BufferType::File) => receive_file(shared, stream, header).await,
        (Header::Snapshot(_), BufferType::Snapshot) => {
            receive_snapshot(shared, stream, header).await
        }
        (Header::Stream(_), BufferType::Stream) => receive_stream(shared, stream, header).await,
        (Header::Pkv(_), BufferType::PkvBuf) => receive_pkv(shared, stream, header).await,
        _ => Err(ExchangeError::BadEnum {
            what: "header for channel",
            value: header.buffer_type() as u8,
        }
        .into()),
    }
}

fn update_progress(state: &mut SinkState, owner: u32, progress: f32, eof: bool) {
    if let Some(prev) = state.input_progress.insert(owner, progress) {
        state.progress_sum -= prev;
    }
    state.progress_sum += progress;
    if eof {
        state.successful.insert(owner);
    }
}

async fn receive_file(
    shared: &Arc<SinkShared>,
    stream: &mut TcpStream,
    header: Header,
) -> Result<()> {
    let Header::File(ref file) = header else {
        unreachable!()
    };
    let mut state = shared.state.lock().await;
    let cursor = *state.cursors.entry(file.owner).or_insert(Cursor::Int(-1));
    let pos = match cursor {
        Cursor::Int(v) if v >= 0 => v,
        _ => file.first,
    };

    let next = if file.first == pos {
        write_transfer(stream, Transfer::Ready).await?;
        let payload = read_payload(stream, file.compressed).await?;
        let absorbed = shared.collector.read(payload, &header)?;
        if absorbed {
            update_progress(&mut state, file.owner, file.progress, file.eof);
            let _ = shared.events.send(SinkEvent::BatchReceived {
                kind: BufferType::File,
                owner: file.owner,
            });
            if shared.complete(&state) {
                let _ = shared.events.send(SinkEvent::AllInputsDone);
            }
        }
        let next = file.last + 1;
        state.cursors.insert(file.owner, Cursor::Int(next));
        next
    } else {
        debug!("file handler ignoring spill {} (cursor {pos})", file.first);
        write_transfer(stream, Transfer::Ignore).await?;
        pos
    };

    stream.write_i64(next).await?;
    stream.flush().await?;
    Ok(())
}

async fn receive_snapshot(
    shared: &Arc<SinkShared>,
    stream: &mut TcpStream,
    header: Header,
) -> Result<()> {
    let Header::Snapshot(ref snap) = header else {
        unreachable!()
    };
    let mut state = shared.state.lock().await;
    let cursor = *state
        .cursors
        .entry(snap.owner)
        .or_insert(Cursor::Float(0.0));
    let pos = match cursor {
        Cursor::Float(v) => v,
        Cursor::Int(_) => 0.0,
    };

    let next = if snap.progress > pos {
        write_transfer(stream, Transfer::Ready).await?;
        let payload = read_payload(stream, snap.bytes).await?;
        let absorbed = shared.collector.read(payload, &header)?;
        if absorbed {
            update_progress(&mut state, snap.owner, snap.progress, snap.eof);
            let _ = shared.events.send(SinkEvent::BatchReceived {
                kind: BufferType::Snapshot,
                owner: snap.owner,
            });
            if shared.complete(&state) {
                let _ = shared.events.send(SinkEvent::AllInputsDone);
            }
        }
        state.cursors.insert(snap.owner, Cursor::Float(snap.progress));
        snap.progress
    } else {
        // Idempotent replay.
        write_transfer(stream, Transfer::Ignore).await?;
        pos
    };

    stream.write_f32(next).await?;
    stream.flush().await?;
    Ok(())
}

async fn receive_stream(
    shared: &Arc<SinkShared>,
    stream: &mut TcpStream,
    header: Header,
) -> Result<()> {
    match shared.config.regime {
        SyncRegime::Strict => receive_stream_strict(shared, stream, header).await,
        SyncRegime::AsyncTime { .. } => receive_stream_async_time(shared, stream, header).await,
        SyncRegime::AsyncSelf => receive_stream_async_self(shared, stream, header).await,
    }
}

async fn receive_stream_strict(
    shared: &Arc<SinkShared>,
    stream: &mut TcpStream,
    header: Header,
) -> Result<()> {
    let Header::Stream(ref sh) = header else {
        unreachable!()
    };
    let mut state = shared.state.lock().await;
    let cursor = *state.cursors.entry(sh.owner).or_insert(Cursor::Int(-1));
    let pos = match cursor {
        Cursor::Int(v) if v >= 0 => v,
        _ => sh.sequence,
    };

    let next = if pos == sh.sequence {
        write_transfer(stream, Transfer::Ready).await?;
        let payload = read_payload(stream, sh.bytes).await?;
        let absorbed = shared.collector.read(payload, &header)?;
        if absorbed {
            state.cursors.insert(sh.owner, Cursor::Int(sh.sequence + 1));
            state.successful.insert(sh.owner);
            let _ = shared.events.send(SinkEvent::BatchReceived {
                kind: BufferType::Stream,
                owner: sh.owner,
            });
            if shared.complete(&state) {
                let _ = shared.events.send(SinkEvent::SpillIter);
                // Reset the sync checker for the next iteration.
                state.successful.clear();
            }
            sh.sequence + 1
        } else {
            pos
        }
    } else {
        info!("stream handler ignoring seq {} (cursor {pos})", sh.sequence);
        write_transfer(stream, Transfer::Ignore).await?;
        pos
    };

    stream.write_i64(next).await?;
    stream.flush().await?;
    Ok(())
}

async fn receive_stream_async_time(
    shared: &Arc<SinkShared>,
    stream: &mut TcpStream,
    header: Header,
) -> Result<()> {
    let Header::Stream(ref sh) = header else {
        unreachable!()
    };
    let mut state = shared.state.lock().await;
    write_transfer(stream, Transfer::Ready).await?;
    let payload = read_payload(stream, sh.bytes).await?;
    if shared.collector.read(payload, &header)? {
        state.buffered += 1;
        state.last_recv = Instant::now();
        let _ = shared.events.send(SinkEvent::BatchReceived {
            kind: BufferType::Stream,
            owner: sh.owner,
        });
        if state.buffered == shared.config.num_inputs {
            info!("all inputs collected inside the window, trigger reduce");
            state.buffered = 0;
            let _ = shared.events.send(SinkEvent::SpillIter);
        }
    }

    // No cursor in the asynchronous regimes.
    stream.write_i64(-1).await?;
    stream.flush().await?;
    Ok(())
}

async fn receive_stream_async_self(
    shared: &Arc<SinkShared>,
    stream: &mut TcpStream,
    header: Header,
) -> Result<()> {
    let Header::Stream(ref sh) = header else {
        unreachable!()
    };
    let mut state = shared.state.lock().await;
    write_transfer(stream, Transfer::Ready).await?;
    let payload = read_payload(stream, sh.bytes).await?;
    if shared.collector.read(payload, &header)? {
        state.received += 1;
        if state.async_init {
            // Collect the full set once before self-triggering starts.
            if state.received == shared.config.num_inputs {
                info!("initial round complete, trigger reduce");
                state.received = 0;
                state.async_init = false;
                let _ = shared.events.send(SinkEvent::SpillIter);
            }
        } else if sh.owner == shared.config.owner {
            debug!(
                "self input received, trigger reduce with {} buffered inputs",
                state.received
            );
            state.received = 0;
            let _ = shared.events.send(SinkEvent::SpillIter);
        }
        let _ = shared.events.send(SinkEvent::BatchReceived {
            kind: BufferType::Stream,
            owner: sh.owner,
        });
    }

    stream.write_i64(-1).await?;
    stream.flush().await?;
    Ok(())
}

async fn receive_pkv(
    shared: &Arc<SinkShared>,
    stream: &mut TcpStream,
    header: Header,
) -> Result<()> {
    let Header::Pkv(ref pkv) = header else {
        unreachable!()
    };
    let mut state = shared.state.lock().await;
    let cursor = *state.cursors.entry(pkv.owner).or_insert(Cursor::Int(-1));
    let pos = match cursor {
        Cursor::Int(v) if v >= 0 => v,
        _ => pkv.iteration,
    };

    let next = if pos == pkv.iteration {
        write_transfer(stream, Transfer::Ready).await?;
        let payload = read_payload(stream, pkv.bytes).await?;
        if shared.collector.read(payload, &header)? {
            state.cursors.insert(pkv.owner, Cursor::Int(pkv.iteration + 1));
            if shared.config.map_sync {
                let seen = {
                    let entry = state.sync_pos.entry(pkv.iteration).or_insert(0);
                    *entry += 1;
                    *entry
                };
                debug!(
                    "{seen} of {} reduce inputs at iteration {}",
                    shared.config.num_inputs, pkv.iteration
                );
                if seen >= shared.config.num_inputs {
                    state.sync_pos.remove(&pkv.iteration);
                    let _ = shared.events.send(SinkEvent::BatchReceived {
                        kind: BufferType::PkvBuf,
                        owner: pkv.owner,
                    });
                }
            } else {
                let _ = shared.events.send(SinkEvent::BatchReceived {
                    kind: BufferType::PkvBuf,
                    owner: pkv.owner,
                });
            }
            pkv.iteration + 1
        } else {
            debug!("pkv handler ignoring iteration {}", pkv.iteration);
            pos
        }
    } else {
        write_transfer(stream, Transfer::Ignore).await?;
        pos
    };

    stream.write_i64(next).await?;
    stream.flush().await?;
    Ok(())
}
