//! Connected components by min-label propagation.
//!
//! Every key starts as its own component; activation pushes the smallest
//! label seen so far to the neighbors, and `combine`/`update` keep the
//! minimum. Smaller candidate labels carry higher activation priority so
//! component ids spread before noise does.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::workload::parse_links;
use crate::{Algorithm, Key};

pub struct ConnectedComponents;

/// Min-combine identity.
const NO_LABEL: i64 = i64::MAX;

fn value(label: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_i64(label);
    buf.freeze()
}

fn label(mut field: &[u8]) -> i64 {
    if field.len() != 8 {
        return NO_LABEL;
    }
    field.get_i64()
}

impl Algorithm for ConnectedComponents {
    fn unit(&self) -> Bytes {
        value(NO_LABEL)
    }

    fn initial_cstate(&self) -> Bytes {
        value(NO_LABEL)
    }

    fn combine(&self, a: &[u8], b: &[u8]) -> Bytes {
        value(label(a).min(label(b)))
    }

    fn priority(&self, istate: &[u8]) -> f64 {
        // Smaller labels first.
        -(label(istate) as f64)
    }

    fn update(&self, _key: Key, istate: &[u8], cstate: &[u8]) -> Bytes {
        value(label(cstate).min(label(istate)))
    }

    fn rank(&self, cstate: &[u8]) -> f64 {
        label(cstate) as f64
    }

    fn seed(&self, subgraph: &HashMap<Key, Bytes>, starter: &mut dyn FnMut(Key, Bytes)) {
        for key in subgraph.keys() {
            starter(*key, value(*key));
        }
    }

    fn activate(
        &self,
        key: Key,
        istate: &[u8],
        static_data: &[u8],
        emit: &mut dyn FnMut(Key, Bytes),
    ) {
        let candidate = label(istate).min(key);
        for link in parse_links(static_data) {
            emit(link, value(candidate));
        }
    }
}
