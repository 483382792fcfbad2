//! Priority-iteration PageRank.
//!
//! iState is the pending rank mass for a key, cState the accumulated
//! rank. Activation spreads `DAMPING` of the drained mass across the
//! key's out-links; every key is seeded with `RETAIN` so ranks start
//! flowing without an external input pass.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::workload::parse_links;
use crate::{Algorithm, Key};

/// Damping factor.
pub const DAMPING: f64 = 0.8;
/// Rank retained by every key per round.
pub const RETAIN: f64 = 0.2;

pub struct PageRank;

fn value(rank: f64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_f64(rank);
    buf.freeze()
}

fn scalar(mut field: &[u8]) -> f64 {
    if field.len() != 8 {
        return 0.0;
    }
    field.get_f64()
}

impl Algorithm for PageRank {
    fn unit(&self) -> Bytes {
        value(0.0)
    }

    fn initial_cstate(&self) -> Bytes {
        value(0.0)
    }

    fn combine(&self, a: &[u8], b: &[u8]) -> Bytes {
        value(scalar(a) + scalar(b))
    }

    fn priority(&self, istate: &[u8]) -> f64 {
        scalar(istate)
    }

    fn update(&self, _key: Key, istate: &[u8], cstate: &[u8]) -> Bytes {
        value(scalar(cstate) + scalar(istate))
    }

    fn rank(&self, cstate: &[u8]) -> f64 {
        scalar(cstate)
    }

    fn seed(&self, subgraph: &HashMap<Key, Bytes>, starter: &mut dyn FnMut(Key, Bytes)) {
        for key in subgraph.keys() {
            starter(*key, value(RETAIN));
        }
    }

    fn activate(
        &self,
        _key: Key,
        istate: &[u8],
        static_data: &[u8],
        emit: &mut dyn FnMut(Key, Bytes),
    ) {
        let links = parse_links(static_data);
        if links.is_empty() {
            return;
        }
        let delta = scalar(istate) * DAMPING / links.len() as f64;
        for link in links {
            emit(link, value(delta));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mass_splits_across_out_links() {
        let pr = PageRank;
        let mut emitted = Vec::new();
        pr.activate(1, &value(0.5), b"2 3", &mut |key, delta| {
            emitted.push((key, scalar(&delta)));
        });
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].0, 2);
        assert!((emitted[0].1 - 0.2).abs() < 1e-12);
        assert!((emitted[1].1 - 0.2).abs() < 1e-12);
    }

    #[test]
    fn dangling_key_emits_nothing() {
        let pr = PageRank;
        let mut emitted = Vec::new();
        pr.activate(1, &value(0.5), b"", &mut |key, delta| {
            emitted.push((key, delta));
        });
        assert!(emitted.is_empty());
    }

    #[test]
    fn combine_is_addition_with_zero_unit() {
        let pr = PageRank;
        let sum = pr.combine(&pr.unit(), &value(0.3));
        assert!((pr.priority(&sum) - 0.3).abs() < 1e-12);
        let sum = pr.combine(&sum, &value(0.2));
        assert!((pr.priority(&sum) - 0.5).abs() < 1e-12);
    }
}
