//! The capability set a task uses to talk to its parent driver.
//!
//! The driver polls these events to track completion; the in-process
//! implementation forwards them over a channel, which is all the
//! standalone engine needs.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

/// Reported by a reduce task when an iteration round (and possibly the
/// whole job) committed.
#[derive(Clone, Debug, PartialEq)]
pub struct IterationCompletionEvent {
    pub iteration: i64,
    pub task_id: u32,
    /// Cursor checkpoint downstream sources can be reset to.
    pub checkpoint: i64,
    /// Newest durable snapshot id at commit time.
    pub snapshot_checkpoint: u64,
    pub job_id: String,
}

/// Reported after a snapshot is durably stored.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotCompletionEvent {
    pub snapshot_id: u64,
    pub task_id: u32,
    pub job_id: String,
}

/// Where a restarted task should resume.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CheckPoint {
    pub iteration: i64,
    pub snapshot: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskStatus {
    pub phase: String,
    pub progress: f32,
}

/// Protocol a task child uses to contact its parent.
pub trait Umbilical: Send + Sync + 'static {
    /// Report progress. Calls should be sparing.
    fn status_update(&self, task_id: u32, status: TaskStatus);

    /// Liveness probe; a `false` answer means the parent no longer knows
    /// this task and it must stop.
    fn ping(&self, task_id: u32) -> bool;

    /// The task finished cleanly. Failure is assumed if the task exits
    /// without calling this.
    fn done(&self, task_id: u32);

    fn snapshot_commit(&self, event: SnapshotCompletionEvent);

    fn after_iter_commit(&self, event: IterationCompletionEvent);

    /// Whether this task should roll back to a checkpoint before serving.
    fn rollback_check(&self, task_id: u32) -> Option<CheckPoint>;
}

/// Everything a driver hears from its tasks.
#[derive(Clone, Debug, PartialEq)]
pub enum DriverEvent {
    Status { task_id: u32, status: TaskStatus },
    SnapshotCommitted(SnapshotCompletionEvent),
    IterationDone(IterationCompletionEvent),
    TaskDone(u32),
}

/// In-process umbilical: events flow over a channel to the driver.
pub struct ChannelUmbilical {
    events: mpsc::UnboundedSender<DriverEvent>,
    rollbacks: Mutex<HashMap<u32, CheckPoint>>,
}

impl ChannelUmbilical {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DriverEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                events: tx,
                rollbacks: Mutex::new(HashMap::new()),
            },
            rx,
        )
    }

    /// Arrange for `task_id` to resume from `checkpoint` on its next
    /// rollback check.
    pub fn schedule_rollback(&self, task_id: u32, checkpoint: CheckPoint) {
        self.rollbacks
            .lock()
            .expect("rollback table poisoned")
            .insert(task_id, checkpoint);
    }
}

impl Umbilical for ChannelUmbilical {
    fn status_update(&self, task_id: u32, status: TaskStatus) {
        let _ = self.events.send(DriverEvent::Status { task_id, status });
    }

    fn ping(&self, _task_id: u32) -> bool {
        // The parent is alive exactly as long as it still listens.
        !self.events.is_closed()
    }

    fn done(&self, task_id: u32) {
        let _ = self.events.send(DriverEvent::TaskDone(task_id));
    }

    fn snapshot_commit(&self, event: SnapshotCompletionEvent) {
        let _ = self.events.send(DriverEvent::SnapshotCommitted(event));
    }

    fn after_iter_commit(&self, event: IterationCompletionEvent) {
        let _ = self.events.send(DriverEvent::IterationDone(event));
    }

    fn rollback_check(&self, task_id: u32) -> Option<CheckPoint> {
        self.rollbacks
            .lock()
            .expect("rollback table poisoned")
            .remove(&task_id)
    }
}
