//! Command-line argument structs, one module per binary.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod map;
pub mod reduce;

/// Milliseconds since the epoch; stamps generated job names.
pub fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
}
