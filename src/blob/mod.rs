//! Blob-store abstraction and the persisted state layout.
//!
//! The runtime treats persistent storage as an opaque byte-addressable
//! store with get/put/list. Jobs usually run against the local filesystem;
//! cluster deployments select an S3-compatible store (MinIO) with an
//! `s3://bucket` URL to keep data off the task machines.

pub mod localfs;
pub mod s3;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub use localfs::LocalFsStore;
pub use s3::S3Store;

/// An opaque byte-addressable blob store.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn get(&self, path: &str) -> Result<Bytes>;
    async fn put(&self, path: &str, data: Bytes) -> Result<()>;
    /// Append to an existing blob, creating it when absent.
    async fn append(&self, path: &str, data: &[u8]) -> Result<()>;
    /// All keys starting with `prefix`, unordered.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn delete(&self, path: &str) -> Result<()>;
}

/// Open a store from a location string: `s3://bucket` selects the
/// S3-compatible store (endpoint and credentials from the environment),
/// anything else is a local filesystem root.
pub async fn open_store(location: &str) -> Result<Arc<dyn BlobStore>> {
    if let Some(bucket) = location.strip_prefix("s3://") {
        Ok(Arc::new(S3Store::from_env(bucket).await?))
    } else {
        Ok(Arc::new(LocalFsStore::new(location)))
    }
}

/////////////////////////////////////////////////////////////////////////////
// Persisted layout
/////////////////////////////////////////////////////////////////////////////

/// Execution-queue dump of one reducer: TSV lines of
/// `(iter, key, priority, cState)`.
pub fn exequeue_path(out_dir: &str, reduce_id: u32) -> String {
    format!("{out_dir}/_ExeQueueTemp/{reduce_id}-exequeue")
}

pub fn snapshot_dir(out_dir: &str, snapshot_id: u64) -> String {
    format!("{out_dir}/snapshot-{snapshot_id}")
}

/// One reducer's top-k projection inside a snapshot.
pub fn snapshot_part(out_dir: &str, snapshot_id: u64, reduce_id: u32) -> String {
    format!("{}/part-{reduce_id}", snapshot_dir(out_dir, snapshot_id))
}

/// Static subgraph partition, text `key \t neighbor ...` lines.
pub fn subgraph_part(in_dir: &str, partition: u32) -> String {
    format!("{in_dir}/subgraph/part{partition}")
}

/// Out-of-band sink-address registry entry for one task.
pub fn registry_path(out_dir: &str, role: &str, task: u32) -> String {
    format!("{out_dir}/_registry/{role}-{task}")
}

/// The serialized job configuration the driver hands to task binaries.
pub fn job_conf_path(out_dir: &str) -> String {
    format!("{out_dir}/job.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        assert_eq!(exequeue_path("/out", 3), "/out/_ExeQueueTemp/3-exequeue");
        assert_eq!(snapshot_part("/out", 7, 1), "/out/snapshot-7/part-1");
        assert_eq!(subgraph_part("/in", 0), "/in/subgraph/part0");
        assert_eq!(registry_path("/out", "reduce", 2), "/out/_registry/reduce-2");
    }
}
