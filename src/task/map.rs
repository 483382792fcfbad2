//! The map-side activation engine.
//!
//! At start the task loads its static subgraph partition, seeds the
//! activation buffer through the algorithm, and then loops: drain the
//! buffer, run `activate` per record against the loaded subgraph, and
//! stream the partitioned deltas to every reduce task. A key with no entry
//! in the loaded subgraph still fans a zero delta out to every partition;
//! that keeps global progress accounting intact and is a policy, not an
//! error.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::blob::BlobStore;
use crate::codec::{seal_frame, RecordShape, RecordWriter};
use crate::conf::JobConf;
use crate::error::{Error, Result};
use crate::exchange::{
    BufferRequest, BufferType, Header, OutBatch, Sink, SinkConfig, SinkEvent, SinkHandle, Source,
    StreamHeader, SyncRegime,
};
use crate::task::{advertise, await_peer, load_subgraph, InputPkvBuffer, TaskStatus, Umbilical};
use crate::workload;
use crate::{partition_for, Algorithm, Key};

/// Without fresh input the engine still emits an (empty) round at this
/// cadence; strictly synchronized reducers elsewhere in the job depend on
/// one batch per map per iteration, even from maps whose own reducer has
/// already terminated.
const TICK: Duration = Duration::from_millis(100);

/// Upper bound on running without hearing anything from any peer;
/// treats the job as lost.
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

pub struct MapTask {
    conf: JobConf,
    id: u32,
    algo: Arc<dyn Algorithm>,
    subgraph: HashMap<Key, Bytes>,
    buffer: Arc<InputPkvBuffer>,
    events: mpsc::UnboundedReceiver<SinkEvent>,
    sink: SinkHandle,
    reduce_sources: Vec<Source>,
    dead_reduces: HashSet<usize>,
    umbilical: Arc<dyn Umbilical>,
    iteration: i64,
    spill_dir: PathBuf,
    activations: u64,
}

impl MapTask {
    /// Load the subgraph, seed the buffer, open the PKVBUF sink and
    /// connect a STREAM source to every reduce task.
    pub async fn open(
        conf: JobConf,
        id: u32,
        store: Arc<dyn BlobStore>,
        umbilical: Arc<dyn Umbilical>,
    ) -> Result<MapTask> {
        conf.validate()?;
        let algo = workload::try_named(&conf.workload)
            .ok_or_else(|| Error::Config(format!("unknown workload {:?}", conf.workload)))?;

        let subgraph = load_subgraph(&store, &conf.input_dir, id).await?;
        info!("map {id} loaded {} subgraph entries", subgraph.len());

        let spill_dir = std::env::temp_dir().join(format!("prlite-{}-map{id}", conf.job_name));
        let buffer = Arc::new(InputPkvBuffer::new(
            conf.partitions as usize,
            conf.read_buffer,
            Some(spill_dir.clone()),
        ));
        {
            let seed_buffer = buffer.clone();
            algo.seed(&subgraph, &mut |key, istate| {
                seed_buffer.init(crate::KeyValue::new(key, istate));
            });
        }
        info!("map {id} seeded {} starter records", buffer.len());

        let (events_tx, events) = mpsc::unbounded_channel();
        let sink = Sink::open(
            SinkConfig {
                owner: id,
                num_inputs: conf.partitions as usize,
                max_connections: conf.max_connections,
                regime: SyncRegime::Strict,
                map_sync: conf.map_sync,
            },
            buffer.clone(),
            events_tx,
        )
        .await?
        .spawn()?;
        advertise(&store, &conf.output_dir, "map", id, sink.local_addr()).await?;

        let mut reduce_sources = Vec::with_capacity(conf.partitions as usize);
        for reduce in 0..conf.partitions {
            let addr = await_peer(&store, &conf.output_dir, "reduce", reduce).await?;
            reduce_sources.push(Source::new(
                BufferRequest {
                    dest_task: reduce,
                    dest_addr: addr,
                    partition: reduce,
                    buffer_type: BufferType::Stream,
                },
                conf.retry_budget,
            ));
        }

        Ok(MapTask {
            conf,
            id,
            algo,
            subgraph,
            buffer,
            events,
            sink,
            reduce_sources,
            dead_reduces: HashSet::new(),
            umbilical,
            iteration: 0,
            spill_dir,
            activations: 0,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        let mut last_event = tokio::time::Instant::now();
        loop {
            if self.buffer.stopped() && self.buffer.is_empty() {
                break;
            }
            self.activate_round().await?;

            if !self.umbilical.ping(self.id) {
                return Err(Error::Fatal(format!("map {} lost its parent", self.id)));
            }

            // Wait for the next activation buffer; on the tick, emit an
            // empty round anyway to keep downstream synchronization live.
            if self.buffer.is_empty() && !self.buffer.stopped() {
                match tokio::time::timeout(TICK, self.events.recv()).await {
                    Ok(Some(_)) => last_event = tokio::time::Instant::now(),
                    Ok(None) => return Err(Error::Fatal("map sink channel closed".into())),
                    Err(_) => {
                        if last_event.elapsed() > IDLE_TIMEOUT {
                            warn!("map {} idle past {IDLE_TIMEOUT:?}, exiting", self.id);
                            break;
                        }
                    }
                }
            }
        }

        info!(
            "map {} done after {} iterations, {} activations",
            self.id, self.iteration, self.activations
        );
        for source in &mut self.reduce_sources {
            source.close().await;
        }
        self.sink.close();
        let _ = tokio::fs::remove_dir_all(&self.spill_dir).await;
        self.umbilical.done(self.id);
        Ok(())
    }

    /// One pass over the buffered activation records: apply the user
    /// function, partition the emitted deltas, and stream one batch to
    /// every reduce task at the current sequence.
    async fn activate_round(&mut self) -> Result<()> {
        let partitions = self.conf.partitions;
        let mut outputs: Vec<RecordWriter> = (0..partitions)
            .map(|_| RecordWriter::new(RecordShape::Kv))
            .collect();

        let mut drained = 0u64;
        while let Some(kv) = self.buffer.next() {
            drained += 1;
            match self.subgraph.get(&kv.key) {
                Some(static_data) => {
                    let algo = &self.algo;
                    algo.activate(kv.key, &kv.value, static_data, &mut |key, delta| {
                        outputs[partition_for(key, partitions) as usize].append_kv(key, &delta);
                    });
                }
                None => {
                    debug!("no subgraph entry for key {}, zero-delta fan-out", kv.key);
                    let unit = self.algo.unit();
                    for (p, output) in outputs.iter_mut().enumerate() {
                        output.append_kv(p as Key, &unit);
                    }
                }
            }
        }
        self.activations += drained;
        if drained == 0 {
            // Keep the exchange live without spinning hot through empty
            // rounds.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for (reduce, writer) in outputs.into_iter().enumerate() {
            if self.dead_reduces.contains(&reduce) {
                continue;
            }
            let records = writer.records();
            let sealed = seal_frame(writer.close(), self.conf.compress)?;
            if !self.conf.transfer_mem {
                self.spill(reduce as u32, &sealed.bytes).await?;
            }
            let header = Header::Stream(StreamHeader {
                owner: self.id,
                sequence: self.iteration,
                bytes: sealed.bytes.len() as u64,
            });
            let batch = OutBatch::new(header, sealed.bytes);
            if let Err(err) = self.reduce_sources[reduce].send(&batch).await {
                // A finished reduce task tears its sink down; stop feeding
                // it and keep the others going.
                warn!("map {} giving up on reduce {reduce}: {err}", self.id);
                self.dead_reduces.insert(reduce);
            } else {
                debug!(
                    "map {} sent {records} deltas to reduce {reduce} at seq {}",
                    self.id, self.iteration
                );
            }
        }

        self.umbilical.status_update(
            self.id,
            TaskStatus {
                phase: "activate".into(),
                progress: 0.0,
            },
        );
        self.iteration += 1;
        Ok(())
    }

    /// Spill one sealed batch to the local working directory before it
    /// goes on the wire.
    async fn spill(&self, reduce: u32, sealed: &Bytes) -> Result<()> {
        let dir = self.spill_dir.clone();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("spill-{}-{reduce}", self.iteration));
        tokio::fs::write(path, sealed).await?;
        Ok(())
    }
}
