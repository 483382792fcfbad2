//! Job configuration.
//!
//! A [`JobConf`] is built by the driver, serialized to the blob store as
//! `job.json`, and re-read by the task binaries. String options use the
//! dotted key names recognized by [`JobConf::set`]; unknown keys are kept
//! in an extra map rather than rejected.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::exchange::SyncRegime;
use crate::state::QueuePolicy;

/// Default bound on concurrent sink handlers (`mapred.reduce.parallel.copies`).
pub const DEFAULT_MAX_CONNECTIONS: usize = 20_000;
/// Default record-reader window (`io.file.buffer.size`).
pub const DEFAULT_READ_BUFFER: usize = 128 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobConf {
    /// Human-readable job name.
    pub job_name: String,
    /// Registered workload name, resolved via [`crate::workload::named`].
    pub workload: String,
    /// Input directory on the blob store; the subgraph lives under it.
    pub input_dir: String,
    /// Output directory on the blob store; snapshots, the execution-queue
    /// dumps and the task registry live under it.
    pub output_dir: String,

    /// `priter.job` - enable priority iteration.
    pub priter_job: bool,
    /// `priter.graph.partitions` - partition count for both sides.
    pub partitions: u32,
    /// `priter.graph.nodes` - global key count, sizes the portion regime.
    pub graph_nodes: u64,
    /// `priter.snapshot.interval` - milliseconds between snapshots.
    pub snapshot_interval_ms: u64,
    /// `priter.snapshot.topk` - snapshot row count.
    pub snapshot_topk: usize,
    /// `priter.queue.portion` - activation fraction; positive selects the
    /// portion regime.
    pub queue_portion: Option<f32>,
    /// `priter.queue.uniqlength` - fixed activation queue length, used when
    /// no portion is set.
    pub exec_queue_len: Option<usize>,
    /// `priter.stop.difference` - convergence threshold on consecutive
    /// snapshots.
    pub stop_difference: Option<f64>,
    /// `priter.stop.maxtime` - hard wall-clock cap in milliseconds.
    pub stop_max_time_ms: Option<u64>,
    /// `priter.job.mapsync` - map side waits for all reduce inputs per
    /// iteration.
    pub map_sync: bool,
    /// `priter.job.async.time` - time-triggered asynchronous reduce.
    pub async_time: bool,
    /// `priter.job.async.time.thresh` - idle milliseconds before firing.
    pub async_time_thresh_ms: u64,
    /// `priter.job.async.self` - self-triggered asynchronous reduce.
    pub async_self: bool,
    /// `priter.job.inmem` - keep reduce state in memory only.
    pub in_mem: bool,
    /// `priter.job.syncupdate` - lock-step iteration updates.
    pub sync_update: bool,
    /// `priter.transfer.mem` - keep activation batches in memory instead of
    /// spilling to disk.
    pub transfer_mem: bool,
    /// `mapred.reduce.parallel.copies` - concurrent handler bound.
    pub max_connections: usize,
    /// `io.file.buffer.size` - record reader window in bytes.
    pub read_buffer: usize,

    /// Compress framed batches with zstd.
    pub compress: bool,
    /// Transfer attempts per batch before the source gives up.
    pub retry_budget: u32,

    /// Unrecognized options, preserved verbatim.
    pub extra: HashMap<String, String>,
}

impl JobConf {
    pub fn new(job_name: impl ToString) -> Self {
        Self {
            job_name: job_name.to_string(),
            workload: String::new(),
            input_dir: String::new(),
            output_dir: String::new(),
            priter_job: false,
            partitions: 1,
            graph_nodes: 0,
            snapshot_interval_ms: 20_000,
            snapshot_topk: 1000,
            queue_portion: None,
            exec_queue_len: None,
            stop_difference: None,
            stop_max_time_ms: None,
            map_sync: false,
            async_time: false,
            async_time_thresh_ms: 1000,
            async_self: false,
            in_mem: true,
            sync_update: false,
            transfer_mem: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            read_buffer: DEFAULT_READ_BUFFER,
            compress: false,
            retry_budget: 5,
            extra: HashMap::new(),
        }
    }

    /// Set a dotted option by name, parsing the value into the matching
    /// typed field. Unknown keys land in [`JobConf::extra`].
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .parse()
                .map_err(|_| Error::Config(format!("bad value {value:?} for {key}")))
        }

        match key {
            "priter.job" => self.priter_job = parse(key, value)?,
            "priter.graph.partitions" => self.partitions = parse(key, value)?,
            "priter.graph.nodes" => self.graph_nodes = parse(key, value)?,
            "priter.snapshot.interval" => self.snapshot_interval_ms = parse(key, value)?,
            "priter.snapshot.topk" => self.snapshot_topk = parse(key, value)?,
            "priter.queue.portion" => self.queue_portion = Some(parse(key, value)?),
            "priter.queue.uniqlength" => self.exec_queue_len = Some(parse(key, value)?),
            "priter.stop.difference" => self.stop_difference = Some(parse(key, value)?),
            "priter.stop.maxtime" => self.stop_max_time_ms = Some(parse(key, value)?),
            "priter.job.mapsync" => self.map_sync = parse(key, value)?,
            "priter.job.async.time" => self.async_time = parse(key, value)?,
            "priter.job.async.time.thresh" => self.async_time_thresh_ms = parse(key, value)?,
            "priter.job.async.self" => self.async_self = parse(key, value)?,
            "priter.job.inmem" => self.in_mem = parse(key, value)?,
            "priter.job.syncupdate" => self.sync_update = parse(key, value)?,
            "priter.transfer.mem" => self.transfer_mem = parse(key, value)?,
            "mapred.reduce.parallel.copies" => self.max_connections = parse(key, value)?,
            "io.file.buffer.size" => self.read_buffer = parse(key, value)?,
            _ => {
                self.extra.insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    /// The activation-queue policy the selector runs with. The portion
    /// regime wins when both options are present, matching the precedence
    /// of the original option pair.
    pub fn queue_policy(&self) -> QueuePolicy {
        match self.queue_portion {
            Some(portion) if portion > 0.0 => QueuePolicy::Portion(portion),
            _ => QueuePolicy::FixedLength(self.exec_queue_len.unwrap_or(100)),
        }
    }

    /// The STREAM synchronization regime for reduce sinks.
    pub fn sync_regime(&self) -> SyncRegime {
        if self.async_time {
            SyncRegime::AsyncTime {
                threshold: Duration::from_millis(self.async_time_thresh_ms),
            }
        } else if self.async_self {
            SyncRegime::AsyncSelf
        } else {
            SyncRegime::Strict
        }
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn stop_max_time(&self) -> Option<Duration> {
        self.stop_max_time_ms.map(Duration::from_millis)
    }

    /// Sanity-check the pieces a task needs before it starts.
    pub fn validate(&self) -> Result<()> {
        if !self.priter_job {
            return Err(Error::Config("priter.job is not enabled".into()));
        }
        if self.partitions == 0 {
            return Err(Error::Config("priter.graph.partitions must be positive".into()));
        }
        if let Some(portion) = self.queue_portion {
            if !(0.0..=1.0).contains(&portion) {
                return Err(Error::Config(format!(
                    "priter.queue.portion {portion} outside (0, 1]"
                )));
            }
        }
        if self.stop_difference.is_none() && self.stop_max_time_ms.is_none() {
            return Err(Error::Config(
                "no termination criterion: set priter.stop.difference or priter.stop.maxtime".into(),
            ));
        }
        Ok(())
    }
}
