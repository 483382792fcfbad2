//! Reduce-side per-key state.
//!
//! Every key maps to a `(iState, cState, staticData)` triple. The triple is
//! created on first observation, mutated by incoming deltas and by
//! activation updates, and destroyed only at task shutdown. The table is
//! sharded ([`DashMap`]) so delta merging scales with cores instead of
//! serializing on one task-wide lock.

pub mod selector;
pub mod snapshot;

pub use selector::{select_activation, ActivationEntry, QueuePolicy};
pub use snapshot::SnapshotManager;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use crate::{Algorithm, Key, KeyValue};

/// The per-key triple.
#[derive(Clone, Debug)]
pub struct KeyState {
    pub istate: Bytes,
    pub cstate: Bytes,
    pub static_data: Option<Bytes>,
}

pub struct StateTable {
    algo: Arc<dyn Algorithm>,
    map: DashMap<Key, KeyState>,
    /// Deltas for keys with no static data yet; re-merged after the next
    /// static-data refresh rather than dropped.
    orphans: Mutex<Vec<KeyValue>>,
}

impl StateTable {
    pub fn new(algo: Arc<dyn Algorithm>) -> Self {
        Self {
            algo,
            map: DashMap::new(),
            orphans: Mutex::new(Vec::new()),
        }
    }

    pub fn algorithm(&self) -> &Arc<dyn Algorithm> {
        &self.algo
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Integrate one incoming delta into `iState(key)`.
    ///
    /// An absent entry is created with unit iState, initial cState and no
    /// static data; its delta is buffered until static data shows up.
    pub fn merge_delta(&self, key: Key, delta: &[u8]) {
        let mut entry = self.map.entry(key).or_insert_with(|| KeyState {
            istate: self.algo.unit(),
            cstate: self.algo.initial_cstate(),
            static_data: None,
        });
        if entry.static_data.is_some() {
            entry.istate = self.algo.combine(&entry.istate, delta);
        } else {
            drop(entry);
            self.orphans
                .lock()
                .expect("orphan buffer poisoned")
                .push(KeyValue::new(key, Bytes::copy_from_slice(delta)));
        }
    }

    /// Attach static data to one key, creating the entry when absent.
    pub fn attach_static(&self, key: Key, data: Bytes) {
        self.map
            .entry(key)
            .and_modify(|state| state.static_data = Some(data.clone()))
            .or_insert_with(|| KeyState {
                istate: self.algo.unit(),
                cstate: self.algo.initial_cstate(),
                static_data: Some(data),
            });
    }

    /// Load (or reload) the static partition and re-merge any orphaned
    /// deltas whose key now has static data.
    pub fn refresh_static(&self, subgraph: &HashMap<Key, Bytes>) {
        for (key, data) in subgraph {
            self.attach_static(*key, data.clone());
        }
        let pending = {
            let mut orphans = self.orphans.lock().expect("orphan buffer poisoned");
            std::mem::take(&mut *orphans)
        };
        if !pending.is_empty() {
            debug!("re-merging {} buffered deltas after static refresh", pending.len());
        }
        for kv in pending {
            self.merge_delta(kv.key, &kv.value);
        }
    }

    pub fn orphaned(&self) -> usize {
        self.orphans.lock().expect("orphan buffer poisoned").len()
    }

    pub fn get(&self, key: Key) -> Option<KeyState> {
        self.map.get(&key).map(|e| e.value().clone())
    }

    /// Swap `iState(key)` back to the unit element, returning what was
    /// drained. The swap happens under the entry's shard lock, so a delta
    /// arriving concurrently lands in the fresh unit, never in the drained
    /// value.
    pub fn drain_istate(&self, key: Key) -> Option<Bytes> {
        self.map.get_mut(&key).map(|mut entry| {
            std::mem::replace(&mut entry.istate, self.algo.unit())
        })
    }

    /// Store the cState produced by an activation update.
    pub fn set_cstate(&self, key: Key, cstate: Bytes) {
        if let Some(mut entry) = self.map.get_mut(&key) {
            entry.cstate = cstate;
        }
    }

    /// Replace iState and cState wholesale, as a rollback reload does.
    pub fn restore(&self, key: Key, istate: Bytes, cstate: Bytes) {
        self.map
            .entry(key)
            .and_modify(|state| {
                state.istate = istate.clone();
                state.cstate = cstate.clone();
            })
            .or_insert_with(|| KeyState {
                istate,
                cstate,
                static_data: None,
            });
    }

    /// Snapshot of all `(key, state)` pairs; consistent per entry, not
    /// across entries.
    pub fn entries(&self) -> Vec<(Key, KeyState)> {
        self.map
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    pub fn clear(&self) {
        self.map.clear();
        self.orphans.lock().expect("orphan buffer poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload;

    fn table() -> StateTable {
        StateTable::new(workload::named("pagerank").unwrap())
    }

    #[test]
    fn deltas_combine_once_static_is_attached() {
        let table = table();
        table.attach_static(1, Bytes::from_static(b"2 3"));
        table.merge_delta(1, &0.5f64.to_be_bytes());
        table.merge_delta(1, &0.25f64.to_be_bytes());

        let state = table.get(1).unwrap();
        let rank = table.algorithm().priority(&state.istate);
        assert!((rank - 0.75).abs() < 1e-9);
    }

    #[test]
    fn orphaned_delta_is_buffered_until_refresh() {
        let table = table();
        table.merge_delta(9, &0.5f64.to_be_bytes());
        assert_eq!(table.orphaned(), 1);
        // The entry exists but holds nothing pending.
        let state = table.get(9).unwrap();
        assert_eq!(state.istate, table.algorithm().unit());

        let mut subgraph = HashMap::new();
        subgraph.insert(9, Bytes::from_static(b""));
        table.refresh_static(&subgraph);
        assert_eq!(table.orphaned(), 0);
        let state = table.get(9).unwrap();
        assert!((table.algorithm().priority(&state.istate) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn drain_resets_to_unit() {
        let table = table();
        table.attach_static(4, Bytes::new());
        table.merge_delta(4, &1.0f64.to_be_bytes());
        let drained = table.drain_istate(4).unwrap();
        assert!((table.algorithm().priority(&drained) - 1.0).abs() < 1e-9);
        assert_eq!(table.get(4).unwrap().istate, table.algorithm().unit());
    }
}
