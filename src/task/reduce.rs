//! The reduce-side priority state engine and its iteration coordinator.
//!
//! Incoming STREAM batches merge into the state table from the sink's
//! handlers; the coordinator waits for the synchronization regime's spill
//! signal, drains the top of the priority queue, folds the drained iStates
//! into the cumulative state, and ships the activation buffer to the map
//! task holding this partition's subgraph. Snapshots are cut on a
//! wall-clock cadence and double as the convergence probe.

use std::collections::HashSet;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::blob::{exequeue_path, BlobStore};
use crate::codec::{open_frame, seal_frame, RecordReader, RecordShape, RecordWriter};
use crate::conf::JobConf;
use crate::error::{Error, Result};
use crate::exchange::{
    BufferRequest, BufferType, Header, InputCollector, OutBatch, PkvBufferHeader, Sink,
    SinkConfig, SinkEvent, SinkHandle, Source,
};
use crate::state::{select_activation, SnapshotManager, StateTable};
use crate::task::{
    advertise, await_peer, load_subgraph, IterationCompletionEvent, SnapshotCompletionEvent,
    TaskStatus, Umbilical,
};
use crate::workload;
use crate::Algorithm;

/// Waiting on the spill signal is bounded so a dead upstream surfaces as
/// an error instead of a hang.
const SPILL_TIMEOUT: Duration = Duration::from_secs(600);

/// Merges STREAM payloads into the state table from handler context.
struct DeltaCollector {
    table: Arc<StateTable>,
    read_buffer: usize,
    spill_dir: PathBuf,
}

impl InputCollector for DeltaCollector {
    fn read(&self, payload: Bytes, header: &Header) -> Result<bool> {
        let Header::Stream(_) = header else {
            return Ok(false);
        };
        let payload = open_frame(payload, Some(&self.spill_dir))?;
        let mut reader =
            RecordReader::with_buffer(RecordShape::Kv, Cursor::new(payload), self.read_buffer);
        while let Some((key, delta)) = reader.next_kv()? {
            self.table.merge_delta(key, &delta);
        }
        Ok(true)
    }
}

pub struct ReduceTask {
    conf: JobConf,
    id: u32,
    algo: Arc<dyn Algorithm>,
    store: Arc<dyn BlobStore>,
    table: Arc<StateTable>,
    events: mpsc::UnboundedReceiver<SinkEvent>,
    sink: SinkHandle,
    map_sources: Vec<Source>,
    dead_maps: HashSet<usize>,
    snapshots: SnapshotManager,
    umbilical: Arc<dyn Umbilical>,
    iteration: i64,
    started: Instant,
    last_snapshot: Instant,
}

impl ReduceTask {
    /// Load static data, open the STREAM sink under the configured
    /// regime, connect a PKVBUF source to every map task, and apply any
    /// pending rollback.
    pub async fn open(
        conf: JobConf,
        id: u32,
        store: Arc<dyn BlobStore>,
        umbilical: Arc<dyn Umbilical>,
    ) -> Result<ReduceTask> {
        conf.validate()?;
        let algo = workload::try_named(&conf.workload)
            .ok_or_else(|| Error::Config(format!("unknown workload {:?}", conf.workload)))?;

        let table = Arc::new(StateTable::new(algo.clone()));
        let subgraph = load_subgraph(&store, &conf.input_dir, id).await?;
        table.refresh_static(&subgraph);
        info!("reduce {id} loaded {} static entries", table.len());

        let spill_dir = std::env::temp_dir().join(format!("prlite-{}-reduce{id}", conf.job_name));
        let collector = Arc::new(DeltaCollector {
            table: table.clone(),
            read_buffer: conf.read_buffer,
            spill_dir,
        });

        let (events_tx, events) = mpsc::unbounded_channel();
        let sink = Sink::open(
            SinkConfig {
                owner: id,
                num_inputs: conf.partitions as usize,
                max_connections: conf.max_connections,
                regime: conf.sync_regime(),
                map_sync: conf.map_sync,
            },
            collector,
            events_tx,
        )
        .await?
        .spawn()?;
        advertise(&store, &conf.output_dir, "reduce", id, sink.local_addr()).await?;

        let mut map_sources = Vec::with_capacity(conf.partitions as usize);
        for map in 0..conf.partitions {
            let addr = await_peer(&store, &conf.output_dir, "map", map).await?;
            map_sources.push(Source::new(
                BufferRequest {
                    dest_task: map,
                    dest_addr: addr,
                    partition: map,
                    buffer_type: BufferType::PkvBuf,
                },
                conf.retry_budget,
            ));
        }

        let snapshots = SnapshotManager::new(
            store.clone(),
            conf.output_dir.clone(),
            id,
            conf.snapshot_topk,
            conf.compress,
        );

        let mut task = ReduceTask {
            conf,
            id,
            algo,
            store,
            table,
            events,
            sink,
            map_sources,
            dead_maps: HashSet::new(),
            snapshots,
            umbilical,
            iteration: 0,
            started: Instant::now(),
            last_snapshot: Instant::now(),
        };

        if let Some(checkpoint) = task.umbilical.rollback_check(id) {
            task.rollback(checkpoint.snapshot, checkpoint.iteration).await?;
        }
        Ok(task)
    }

    /// Reload state from the newest snapshot at or below the checkpoint
    /// and reset every cursor on both sides of this task.
    pub async fn rollback(&mut self, snapshot: u64, checkpoint: i64) -> Result<()> {
        info!(
            "reduce {} rolling back to snapshot {snapshot}, cursor {checkpoint}",
            self.id
        );
        self.snapshots.reload(&self.table, snapshot).await?;
        self.sink.reset_cursors(checkpoint).await;
        for source in &mut self.map_sources {
            source.rollback = true;
        }
        self.iteration = checkpoint;
        Ok(())
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            // Suspend until the synchronization regime fires.
            match tokio::time::timeout(SPILL_TIMEOUT, self.events.recv()).await {
                Ok(Some(SinkEvent::SpillIter)) => {}
                Ok(Some(SinkEvent::Rollback)) => continue,
                Ok(Some(_)) => continue,
                Ok(None) => return Err(Error::Fatal("reduce sink channel closed".into())),
                Err(_) => {
                    return Err(Error::Fatal(format!(
                        "reduce {} starved past {SPILL_TIMEOUT:?}",
                        self.id
                    )))
                }
            }

            self.iterate().await?;

            if !self.umbilical.ping(self.id) {
                return Err(Error::Fatal(format!("reduce {} lost its parent", self.id)));
            }

            let mut converged = false;
            if self.last_snapshot.elapsed() >= self.conf.snapshot_interval() {
                self.cut_snapshot().await?;
                if let Some(threshold) = self.conf.stop_difference {
                    converged = self.snapshots.converged(threshold);
                }
            }
            let timed_out = self
                .conf
                .stop_max_time()
                .map(|cap| self.started.elapsed() >= cap)
                .unwrap_or(false);

            if converged || timed_out {
                info!(
                    "reduce {} terminating after {} iterations ({})",
                    self.id,
                    self.iteration,
                    if converged { "converged" } else { "timed out" }
                );
                return self.finish().await;
            }
        }
    }

    /// One activation round: a consistent read of the queue's top, the
    /// user update per drained key, the execution-queue dump, and the
    /// PKVBUF emission carrying the iteration marker.
    async fn iterate(&mut self) -> Result<()> {
        let selected = select_activation(
            &self.table,
            self.conf.queue_policy(),
            self.conf.graph_nodes,
            self.conf.partitions,
        );

        let mut writer = RecordWriter::new(RecordShape::Pkv);
        let mut exequeue = String::new();
        for entry in &selected {
            let Some(state) = self.table.get(entry.key) else {
                continue;
            };
            let cstate = self.algo.update(entry.key, &entry.istate, &state.cstate);
            exequeue.push_str(&format!(
                "{}\t{}\t{}\t{}\n",
                self.iteration,
                entry.key,
                entry.priority,
                self.algo.rank(&cstate)
            ));
            self.table.set_cstate(entry.key, cstate);
            writer.append_pkv(entry.priority, entry.key, &entry.istate);
        }
        debug!(
            "reduce {} activated {} keys at iteration {}",
            self.id,
            selected.len(),
            self.iteration
        );
        if !exequeue.is_empty() {
            self.store
                .append(
                    &exequeue_path(&self.conf.output_dir, self.id),
                    exequeue.as_bytes(),
                )
                .await?;
        }
        if selected.is_empty() {
            // Nothing to push; breathe so empty rounds don't spin hot.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // The activation buffer is partition-aligned: this reducer's keys
        // live in the identically numbered map task's subgraph.
        self.send_pkv(self.id as usize, writer.close(), false).await?;
        self.iteration += 1;

        let progress = self.sink.progress().await;
        self.umbilical.status_update(
            self.id,
            TaskStatus {
                phase: "select".into(),
                progress,
            },
        );
        Ok(())
    }

    /// Send one PKVBUF batch to one map task at the current iteration.
    async fn send_pkv(&mut self, map: usize, payload: Bytes, stop: bool) -> Result<()> {
        if self.dead_maps.contains(&map) {
            return Ok(());
        }
        let sealed = seal_frame(payload, self.conf.compress)?;
        let header = Header::Pkv(PkvBufferHeader {
            owner: self.id,
            iteration: self.iteration,
            bytes: sealed.bytes.len() as u64,
            stop,
        });
        let batch = OutBatch::new(header, sealed.bytes);
        if let Err(err) = self.map_sources[map].send(&batch).await {
            warn!("reduce {} giving up on map {map}: {err}", self.id);
            self.dead_maps.insert(map);
        }
        Ok(())
    }

    async fn cut_snapshot(&mut self) -> Result<()> {
        let snapshot_id = self.snapshots.write(&self.table).await?;
        self.last_snapshot = Instant::now();
        self.umbilical.snapshot_commit(SnapshotCompletionEvent {
            snapshot_id,
            task_id: self.id,
            job_id: self.conf.job_name.clone(),
        });
        Ok(())
    }

    /// Orderly termination: a final snapshot, the stop broadcast so map
    /// tasks exit once every reducer has finished, and the
    /// iteration-completion commit.
    async fn finish(mut self) -> Result<()> {
        self.cut_snapshot().await?;
        for map in 0..self.map_sources.len() {
            let stop_payload = RecordWriter::new(RecordShape::Pkv).close();
            self.send_pkv(map, stop_payload, true).await?;
        }

        self.umbilical.after_iter_commit(IterationCompletionEvent {
            iteration: self.iteration,
            task_id: self.id,
            checkpoint: self.iteration,
            snapshot_checkpoint: self.snapshots.next_id().saturating_sub(1),
            job_id: self.conf.job_name.clone(),
        });

        for source in &mut self.map_sources {
            source.close().await;
        }
        self.sink.close();
        self.umbilical.done(self.id);
        info!("reduce {} done after {} iterations", self.id, self.iteration);
        Ok(())
    }
}
