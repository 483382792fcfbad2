//! In-process driver: runs every map and reduce task of a job inside one
//! process over loopback TCP, wiring the umbilical through a channel.
//! The integration tests and the `prl-standalone` binary both drive jobs
//! through this engine.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::blob::{job_conf_path, subgraph_part, BlobStore};
use crate::conf::JobConf;
use crate::error::{Error, Result};
use crate::state::snapshot::read_snapshot;
use crate::task::{
    ChannelUmbilical, DriverEvent, IterationCompletionEvent, MapTask, ReduceTask,
    SnapshotCompletionEvent,
};
use crate::workload;
use crate::{partition_for, Key};

/// What the driver observed while the job ran.
#[derive(Debug, Default)]
pub struct JobOutcome {
    pub iterations: Vec<IterationCompletionEvent>,
    pub snapshots: Vec<SnapshotCompletionEvent>,
    pub failures: Vec<String>,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Partition a text adjacency list (`<in>/graph.txt`, lines of
/// `key \t neighbor ...`) into per-partition subgraph files using the
/// job's partitioner.
pub async fn distribute_subgraph(
    store: &Arc<dyn BlobStore>,
    in_dir: &str,
    partitions: u32,
) -> Result<()> {
    let raw = store.get(&format!("{in_dir}/graph.txt")).await?;
    let text = String::from_utf8_lossy(&raw);

    let mut parts: Vec<String> = vec![String::new(); partitions as usize];
    for line in text.lines() {
        let Some((node, _)) = line.split_once('\t') else {
            continue;
        };
        let Ok(key) = node.trim().parse::<Key>() else {
            continue;
        };
        let partition = partition_for(key, partitions) as usize;
        parts[partition].push_str(line);
        parts[partition].push('\n');
    }

    for (partition, content) in parts.into_iter().enumerate() {
        store
            .put(
                &subgraph_part(in_dir, partition as u32),
                Bytes::from(content),
            )
            .await?;
    }
    Ok(())
}

/// Run one job to completion: spawn all map and reduce tasks, drain the
/// umbilical, and report what happened.
pub async fn run_job(conf: JobConf, store: Arc<dyn BlobStore>) -> Result<JobOutcome> {
    conf.validate()?;
    store
        .put(
            &job_conf_path(&conf.output_dir),
            Bytes::from(serde_json::to_vec_pretty(&conf).map_err(|e| Error::Config(e.to_string()))?),
        )
        .await?;

    let (umbilical, mut events) = ChannelUmbilical::new();
    let umbilical = Arc::new(umbilical);

    let mut tasks = JoinSet::new();
    for id in 0..conf.partitions {
        let conf = conf.clone();
        let store = store.clone();
        let umbilical: Arc<dyn crate::task::Umbilical> = umbilical.clone();
        tasks.spawn(async move {
            ReduceTask::open(conf, id, store, umbilical).await?.run().await
        });
    }
    for id in 0..conf.partitions {
        let conf = conf.clone();
        let store = store.clone();
        let umbilical: Arc<dyn crate::task::Umbilical> = umbilical.clone();
        tasks.spawn(async move {
            MapTask::open(conf, id, store, umbilical).await?.run().await
        });
    }

    let mut outcome = JobOutcome::default();
    loop {
        tokio::select! {
            joined = tasks.join_next() => {
                match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(err))) => {
                        warn!("task failed: {err}");
                        outcome.failures.push(err.to_string());
                    }
                    Some(Err(join_err)) => {
                        warn!("task panicked: {join_err}");
                        outcome.failures.push(join_err.to_string());
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Some(DriverEvent::IterationDone(event)) => {
                        info!(
                            "task {} committed at iteration {} (snapshot {})",
                            event.task_id, event.iteration, event.snapshot_checkpoint
                        );
                        outcome.iterations.push(event);
                    }
                    Some(DriverEvent::SnapshotCommitted(event)) => outcome.snapshots.push(event),
                    Some(DriverEvent::Status { .. }) | Some(DriverEvent::TaskDone(_)) => {}
                    None => {}
                }
            }
        }
    }
    // Tasks are gone; pick up anything still queued on the umbilical.
    while let Ok(event) = events.try_recv() {
        match event {
            DriverEvent::IterationDone(event) => outcome.iterations.push(event),
            DriverEvent::SnapshotCommitted(event) => outcome.snapshots.push(event),
            _ => {}
        }
    }

    Ok(outcome)
}

/// A configured job ready to submit.
///
/// This is the whole surface a driver needs: configure, submit, await the
/// handle.
pub struct IterativeJob {
    conf: JobConf,
    store: Arc<dyn BlobStore>,
}

impl IterativeJob {
    pub fn init(conf: JobConf, store: Arc<dyn BlobStore>) -> Result<IterativeJob> {
        conf.validate()?;
        Ok(IterativeJob { conf, store })
    }

    /// Launch the job in the background and hand back its handle.
    pub fn submit(self) -> JobHandle {
        JobHandle {
            task: tokio::spawn(run_job(self.conf, self.store)),
        }
    }
}

/// A running job.
pub struct JobHandle {
    task: tokio::task::JoinHandle<Result<JobOutcome>>,
}

impl JobHandle {
    /// Wait for every task of the job to finish.
    pub async fn wait(self) -> Result<JobOutcome> {
        self.task
            .await
            .map_err(|e| Error::Fatal(format!("driver task died: {e}")))?
    }
}

/// Merge the newest snapshot of every reduce task into `key -> rank`.
pub async fn latest_snapshot(
    store: &Arc<dyn BlobStore>,
    out_dir: &str,
    partitions: u32,
    workload_name: &str,
) -> Result<HashMap<Key, f64>> {
    let algo = workload::try_named(workload_name)
        .ok_or_else(|| Error::Config(format!("unknown workload {workload_name:?}")))?;

    let mut merged = HashMap::new();
    for reduce in 0..partitions {
        // Snapshot ids are strictly increasing; walk down from the
        // newest one present.
        let keys = store
            .list(&format!("{}/snapshot-", out_dir.trim_start_matches('/')))
            .await?;
        let newest = keys
            .iter()
            .filter(|key| key.ends_with(&format!("/part-{reduce}")))
            .filter_map(|key| {
                let rest = key.split("snapshot-").nth(1)?;
                rest.split('/').next()?.parse::<u64>().ok()
            })
            .max();
        let Some(id) = newest else {
            continue;
        };
        for (key, rank) in read_snapshot(store, out_dir, id, reduce, &algo).await? {
            merged.insert(key, rank);
        }
    }
    Ok(merged)
}
