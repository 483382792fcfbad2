//! Converts algorithm names to actual algorithm code.
//!
//! # Example
//!
//! To get the PageRank algorithm:
//! ```
//! use prlite::workload;
//! let pr = workload::named("pagerank").unwrap();
//! ```

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::Algorithm;

pub mod conncomp;
pub mod pagerank;

/// Gets the [`Algorithm`] named `name`.
///
/// Returns [`None`] if no algorithm with the given name was found.
pub fn try_named(name: &str) -> Option<Arc<dyn Algorithm>> {
    match name {
        "pagerank" => Some(Arc::new(pagerank::PageRank)),
        "conncomp" => Some(Arc::new(conncomp::ConnectedComponents)),
        _ => None,
    }
}

/// Gets the [`Algorithm`] named `name`.
///
/// Returns an [`anyhow::Error`] if no algorithm with the given name was
/// found.
pub fn named(name: &str) -> Result<Arc<dyn Algorithm>> {
    match try_named(name) {
        Some(algo) => Ok(algo),
        None => bail!("No algorithm named `{}` found.", name),
    }
}

/// Parse a whitespace-separated neighbor list from static data.
pub(crate) fn parse_links(static_data: &[u8]) -> Vec<crate::Key> {
    String::from_utf8_lossy(static_data)
        .split_whitespace()
        .filter_map(|token| token.parse().ok())
        .collect()
}
