//! Map and reduce task runtimes.

pub mod input_buffer;
pub mod map;
pub mod reduce;
pub mod umbilical;

pub use input_buffer::InputPkvBuffer;
pub use map::MapTask;
pub use reduce::ReduceTask;
pub use umbilical::{
    ChannelUmbilical, CheckPoint, DriverEvent, IterationCompletionEvent,
    SnapshotCompletionEvent, TaskStatus, Umbilical,
};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::warn;

use crate::blob::{registry_path, subgraph_part, BlobStore};
use crate::error::{Error, Result};
use crate::Key;

/// How long a task waits for a peer's registry entry before giving up.
const REGISTRY_TIMEOUT: Duration = Duration::from_secs(30);

/// Advertise this task's sink address through the out-of-band registry.
pub async fn advertise(
    store: &Arc<dyn BlobStore>,
    out_dir: &str,
    role: &str,
    task_id: u32,
    addr: SocketAddr,
) -> Result<()> {
    store
        .put(
            &registry_path(out_dir, role, task_id),
            Bytes::from(addr.to_string()),
        )
        .await
}

/// Poll the registry until a peer's sink address shows up.
pub async fn await_peer(
    store: &Arc<dyn BlobStore>,
    out_dir: &str,
    role: &str,
    task_id: u32,
) -> Result<SocketAddr> {
    let path = registry_path(out_dir, role, task_id);
    let deadline = tokio::time::Instant::now() + REGISTRY_TIMEOUT;
    loop {
        if store.exists(&path).await? {
            let raw = store.get(&path).await?;
            let text = std::str::from_utf8(&raw)
                .map_err(|e| Error::Fatal(format!("bad registry entry {path}: {e}")))?;
            return text
                .trim()
                .parse()
                .map_err(|e| Error::Fatal(format!("bad registry entry {path}: {e}")));
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Fatal(format!("no registry entry for {role}-{task_id}")));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Load one static subgraph partition: text lines of
/// `key \t neighbor neighbor ...`. Malformed lines are skipped, the way
/// hand-partitioned graph files tend to need.
pub async fn load_subgraph(
    store: &Arc<dyn BlobStore>,
    in_dir: &str,
    partition: u32,
) -> Result<HashMap<Key, Bytes>> {
    let raw = store.get(&subgraph_part(in_dir, partition)).await?;
    let text = String::from_utf8_lossy(&raw);

    let mut subgraph = HashMap::new();
    for line in text.lines() {
        let Some((node, links)) = line.split_once('\t') else {
            continue;
        };
        match node.trim().parse::<Key>() {
            Ok(key) => {
                subgraph.insert(key, Bytes::copy_from_slice(links.trim().as_bytes()));
            }
            Err(_) => warn!("skipping malformed subgraph line: {line:?}"),
        }
    }
    Ok(subgraph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::LocalFsStore;

    #[tokio::test]
    async fn subgraph_loader_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlobStore> = Arc::new(LocalFsStore::new(dir.path()));
        store
            .put(
                &subgraph_part("in", 0),
                Bytes::from_static(b"1\t2 3\nnot-a-key\tx y\nno tab here\n4\t\n"),
            )
            .await
            .unwrap();

        let subgraph = load_subgraph(&store, "in", 0).await.unwrap();
        assert_eq!(subgraph.len(), 2);
        assert_eq!(subgraph.get(&1).unwrap(), &Bytes::from_static(b"2 3"));
        assert_eq!(subgraph.get(&4).unwrap(), &Bytes::new());
    }

    #[tokio::test]
    async fn registry_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlobStore> = Arc::new(LocalFsStore::new(dir.path()));
        let addr: SocketAddr = "127.0.0.1:4567".parse().unwrap();
        advertise(&store, "out", "map", 2, addr).await.unwrap();
        assert_eq!(await_peer(&store, "out", "map", 2).await.unwrap(), addr);
    }
}
