//! A priority-based iterative MapReduce (lite) runtime.
//!
//! Users plug an [`Algorithm`] into the framework, and the runtime drives it
//! to convergence: every reduce task keeps a long-lived priority queue of
//! per-key state, repeatedly activates the top-k keys, and streams the
//! resulting deltas to the map tasks, which push new deltas back. Top-k
//! snapshots of the cumulative state are written periodically as approximate
//! results. For simplicity, persistent state is kept on a blob store
//! (local filesystem or an S3-compatible system), unlike Hadoop or GFS.

use std::collections::HashMap;
use std::hash::Hasher;

use bytes::Bytes;

pub mod blob;
pub mod cmd;
pub mod codec;
pub mod conf;
pub mod error;
pub mod exchange;
pub mod standalone;
pub mod state;
pub mod task;
pub mod workload;

pub use conf::JobConf;
pub use error::{Error, Result};

/////////////////////////////////////////////////////////////////////////////
// Core types
/////////////////////////////////////////////////////////////////////////////

/// A graph key. Keys are numeric node identifiers; every value attached to a
/// key (iState, cState, static data) is an opaque byte string interpreted
/// only by the [`Algorithm`].
pub type Key = i64;

/// A single key/value pair carried between the map and reduce sides.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct KeyValue {
    /// The key.
    pub key: Key,
    /// The value. Cheaply cloneable, since [`Bytes`] is reference counted.
    pub value: Bytes,
}

impl KeyValue {
    /// Construct a new key-value pair from the given key and value.
    pub fn new(key: Key, value: Bytes) -> Self {
        Self { key, value }
    }
}

/// A user-supplied iterative algorithm.
///
/// The runtime keeps, per key, an *incremental* state (iState, the pending
/// delta that doubles as the activation priority) and a *cumulative* state
/// (cState, the quantity being converged upon). Both are opaque byte
/// strings; the algorithm supplies the operators over them.
///
/// `combine` must be commutative and associative for the convergence
/// guarantee to hold; the framework still processes deltas if it is not,
/// but the result is then order-dependent.
pub trait Algorithm: Send + Sync + 'static {
    /// The unit element of [`combine`](Self::combine). A key whose iState
    /// equals the unit has nothing pending.
    fn unit(&self) -> Bytes;

    /// The cState a key starts with when first observed.
    fn initial_cstate(&self) -> Bytes;

    /// Merge two incremental states.
    fn combine(&self, a: &[u8], b: &[u8]) -> Bytes;

    /// The activation priority of an iState. Selection is by descending
    /// priority.
    fn priority(&self, istate: &[u8]) -> f64;

    /// Fold a drained iState into the cumulative state and return the new
    /// cState.
    fn update(&self, key: Key, istate: &[u8], cstate: &[u8]) -> Bytes;

    /// Scalar projection of a cState, used to order snapshot entries and to
    /// measure the difference between consecutive snapshots.
    fn rank(&self, cstate: &[u8]) -> f64;

    /// Seed the map-side input buffer before the first iteration. Called
    /// once per map task with its loaded subgraph partition.
    fn seed(&self, subgraph: &HashMap<Key, Bytes>, starter: &mut dyn FnMut(Key, Bytes));

    /// Activate one key: consume its drained iState and emit zero or more
    /// `(key, delta)` messages against the key's static data.
    fn activate(
        &self,
        key: Key,
        istate: &[u8],
        static_data: &[u8],
        emit: &mut dyn FnMut(Key, Bytes),
    );
}

/////////////////////////////////////////////////////////////////////////////
// Partitioning
/////////////////////////////////////////////////////////////////////////////

/// Hashes a key's byte representation. Compute the partition for a given
/// key by calculating `ihash(key) % partitions`.
pub fn ihash(key: &[u8]) -> u32 {
    let mut hasher = fnv::FnvHasher::with_key(0);
    hasher.write(key);
    let value = hasher.finish() & 0x7fffffff;
    u32::try_from(value).expect("Failed to compute ihash of value")
}

/// The partition owning `key`, in `0..partitions`.
pub fn partition_for(key: Key, partitions: u32) -> u32 {
    ihash(&key.to_be_bytes()) % partitions
}
