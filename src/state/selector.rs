//! Activation selection.
//!
//! Draws the top keys of the table by iState priority, either a fraction
//! of the key space or a fixed execution-queue length. Ties break by
//! ascending key so a fixed iState snapshot always selects the same set.

use bytes::Bytes;
use itertools::Itertools;

use crate::state::StateTable;
use crate::Key;

/// How many keys one activation round draws. The two policies are
/// mutually exclusive per job.
#[derive(Clone, Copy, Debug)]
pub enum QueuePolicy {
    /// Fraction of the key space, in `(0, 1]`.
    Portion(f32),
    /// Fixed execution-queue length.
    FixedLength(usize),
}

/// One selected key with the priority it was drawn at and the iState that
/// was drained for it.
#[derive(Clone, Debug)]
pub struct ActivationEntry {
    pub priority: f64,
    pub key: Key,
    pub istate: Bytes,
}

/// Select and drain the activation set.
///
/// Keys whose iState equals the unit element have nothing pending and are
/// never drawn. After this returns, every selected key's iState is back at
/// the unit element; a delta arriving after the drain accumulates into a
/// fresh iState.
pub fn select_activation(
    table: &StateTable,
    policy: QueuePolicy,
    graph_nodes: u64,
    partitions: u32,
) -> Vec<ActivationEntry> {
    let algo = table.algorithm().clone();
    let unit = algo.unit();

    let candidates = table
        .entries()
        .into_iter()
        .filter(|(_, state)| state.istate != unit)
        .map(|(key, state)| (algo.priority(&state.istate), key))
        .collect_vec();

    let queue_len = match policy {
        QueuePolicy::Portion(portion) => {
            // Size against the global key count when the job declares one,
            // otherwise against what this reducer actually holds.
            let base = if graph_nodes > 0 {
                (graph_nodes as f64 / partitions.max(1) as f64).ceil()
            } else {
                table.len() as f64
            };
            (portion as f64 * base).ceil() as usize
        }
        QueuePolicy::FixedLength(len) => len,
    };

    candidates
        .into_iter()
        .sorted_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)))
        .take(queue_len.max(1))
        .filter_map(|(priority, key)| {
            // Drain under the entry lock; the live iState may already hold
            // more than the sorted copy did, and all of it must go out.
            table.drain_istate(key).map(|istate| ActivationEntry {
                priority,
                key,
                istate,
            })
        })
        .collect()
}
