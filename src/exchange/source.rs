//! The sending endpoint of the buffer exchange.
//!
//! A source owns one lazily-connected socket per destination task. Each
//! batch is offered with its header first; the sink's cursor feedback
//! decides whether the payload follows. Transfers that fail with a
//! transient error are retried with exponential backoff up to the per-job
//! retry budget; a [`Transfer::Terminate`] from the remote aborts the
//! source permanently.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{ExchangeError, Result};
use crate::exchange::{BufferType, Connect, Cursor, Header, Transfer, DATA_SENTINEL};

/// Identifies the destination buffer a source feeds.
#[derive(Clone, Debug)]
pub struct BufferRequest {
    pub dest_task: u32,
    pub dest_addr: SocketAddr,
    pub partition: u32,
    pub buffer_type: BufferType,
}

/// One header+payload frame ready for the wire.
#[derive(Clone, Debug)]
pub struct OutBatch {
    pub header: Header,
    pub payload: Bytes,
}

impl OutBatch {
    pub fn new(header: Header, payload: Bytes) -> Self {
        debug_assert_eq!(header.payload_len(), payload.len() as u64);
        Self { header, payload }
    }
}

pub struct Source {
    request: BufferRequest,
    retry_budget: u32,
    stream: Option<TcpStream>,
    cursor: Option<Cursor>,
    /// Set when the owning task rolled back to a checkpoint; the next
    /// transfer may legally move the cursor backwards.
    pub rollback: bool,
}

impl Source {
    pub fn new(request: BufferRequest, retry_budget: u32) -> Self {
        Self {
            request,
            retry_budget,
            stream: None,
            cursor: None,
            rollback: false,
        }
    }

    pub fn destination(&self) -> u32 {
        self.request.dest_task
    }

    /// Offer one batch, retrying transient failures. Returns the final
    /// transfer outcome: `Success`, `Ignore` (deduplicated at either
    /// end), or an error once the remote terminates or the retry budget
    /// is spent.
    pub async fn send(&mut self, batch: &OutBatch) -> Result<Transfer> {
        if !self.wanted(&batch.header) {
            debug!(
                "transfer to {} ignores stale header {:?}",
                self.request.dest_task, batch.header
            );
            return Ok(Transfer::Ignore);
        }

        let mut backoff = Duration::from_millis(50);
        for attempt in 0..self.retry_budget {
            match self.try_send(batch).await? {
                Transfer::Retry | Transfer::Closed => {
                    debug!(
                        "transfer to {} attempt {attempt} will retry",
                        self.request.dest_task
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(2));
                }
                outcome => return Ok(outcome),
            }
        }
        Err(ExchangeError::RetriesExhausted {
            destination: self.request.dest_task,
            attempts: self.retry_budget,
        }
        .into())
    }

    /// Whether this batch is still ahead of the acknowledged cursor.
    fn wanted(&self, header: &Header) -> bool {
        let Some(cursor) = self.cursor else {
            return true;
        };
        match (header, cursor) {
            (Header::File(h), Cursor::Int(pos)) => h.first == pos,
            (Header::Stream(h), Cursor::Int(pos)) => {
                h.sequence == pos || (self.rollback && pos > h.sequence)
            }
            (Header::Pkv(h), Cursor::Int(pos)) => h.iteration == pos || self.rollback,
            (Header::Snapshot(h), Cursor::Float(pos)) => h.progress > pos,
            _ => true,
        }
    }

    async fn try_send(&mut self, batch: &OutBatch) -> Result<Transfer> {
        match self.open().await? {
            Connect::Open => {}
            Connect::BufferComplete => {
                // The remote has everything it needs from us.
                self.cursor = Some(Cursor::Int(i64::MAX));
                self.close().await;
                return Ok(Transfer::Success);
            }
            Connect::Closed => return Ok(Transfer::Closed),
            Connect::ConnectionsFull | Connect::Error => return Ok(Transfer::Retry),
        }

        match self.transmit(batch).await {
            Ok(Transfer::Terminate) => Err(ExchangeError::Terminated {
                destination: self.request.dest_task,
            }
            .into()),
            Ok(outcome) => {
                if self.rollback && matches!(outcome, Transfer::Success | Transfer::Ignore) {
                    self.rollback = false;
                }
                Ok(outcome)
            }
            Err(err) => {
                // Close so the reconnect can figure out the current state.
                debug!("transfer to {} failed: {err}", self.request.dest_task);
                self.close().await;
                Ok(Transfer::Retry)
            }
        }
    }

    async fn transmit(&mut self, batch: &OutBatch) -> Result<Transfer> {
        let stream = self.stream.as_mut().expect("open before transmit");

        stream.write_i32(DATA_SENTINEL).await?;
        batch.header.write_to(stream).await?;
        stream.flush().await?;

        let response = Transfer::try_from(stream.read_u8().await?)?;
        match response {
            Transfer::Ready => {
                stream.write_all(&batch.payload).await?;
                stream.flush().await?;
                self.read_cursor(&batch.header).await?;
                Ok(Transfer::Success)
            }
            Transfer::Ignore => {
                self.read_cursor(&batch.header).await?;
                Ok(Transfer::Ignore)
            }
            Transfer::Terminate => {
                info!("remote terminated source for task {}", self.request.dest_task);
                self.close().await;
                Ok(Transfer::Terminate)
            }
            other => Ok(other),
        }
    }

    /// Pick up the sink's next-expected cursor after a response.
    async fn read_cursor(&mut self, header: &Header) -> Result<()> {
        let stream = self.stream.as_mut().expect("open before read_cursor");
        let cursor = match header {
            Header::Snapshot(_) => Cursor::Float(stream.read_f32().await?),
            _ => Cursor::Int(stream.read_i64().await?),
        };
        // The asynchronous stream regimes answer with -1: no cursor is
        // kept on either side.
        if matches!(cursor, Cursor::Int(-1)) {
            return Ok(());
        }
        // Backwards movement is only legal while a rollback is in flight.
        if let (Some(Cursor::Int(have)), Cursor::Int(got)) = (self.cursor, cursor) {
            if got < have && !self.rollback {
                return Err(ExchangeError::CursorRegression {
                    source_task: self.request.dest_task,
                    have,
                    got,
                }
                .into());
            }
        }
        self.cursor = Some(cursor);
        Ok(())
    }

    async fn open(&mut self) -> Result<Connect> {
        if let Some(stream) = &self.stream {
            if stream.peer_addr().is_err() {
                self.stream = None;
                return Ok(Connect::Closed);
            }
            return Ok(Connect::Open);
        }

        let mut stream = match TcpStream::connect(self.request.dest_addr).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!("connect to {} failed: {err}", self.request.dest_addr);
                return Ok(Connect::Error);
            }
        };
        let connect = match stream.read_u8().await {
            Ok(byte) => Connect::try_from(byte)?,
            Err(_) => return Ok(Connect::Error),
        };
        if connect == Connect::Open {
            if stream.write_u8(self.request.buffer_type as u8).await.is_err()
                || stream.flush().await.is_err()
            {
                return Ok(Connect::Error);
            }
            self.stream = Some(stream);
        }
        Ok(connect)
    }

    /// Orderly close: announce with a zero preamble, then drop the socket.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.write_i32(0).await;
            let _ = stream.flush().await;
        }
    }
}
