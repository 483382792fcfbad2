//! Local-filesystem blob store, used by the standalone driver and tests.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use crate::blob::BlobStore;
use crate::error::{Error, Result};

pub struct LocalFsStore {
    root: PathBuf,
}

impl LocalFsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl BlobStore for LocalFsStore {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let data = tokio::fs::read(self.resolve(path))
            .await
            .map_err(|e| Error::Blob(format!("get {path}: {e}")))?;
        Ok(Bytes::from(data))
    }

    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, &data)
            .await
            .map_err(|e| Error::Blob(format!("put {path}: {e}")))
    }

    async fn append(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full)
            .await
            .map_err(|e| Error::Blob(format!("append {path}: {e}")))?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // Walk from the deepest existing directory above the prefix; local
        // trees are small enough for a blocking walk.
        let root = self.root.clone();
        let prefix = prefix.trim_start_matches('/').to_string();
        let keys = tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            walk(&root, &root, &mut keys);
            keys.retain(|key: &String| key.starts_with(&prefix));
            keys
        })
        .await
        .map_err(|e| Error::Blob(format!("list walk: {e}")))?;
        Ok(keys)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(path)).await?)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path);
        if full.is_dir() {
            tokio::fs::remove_dir_all(full).await?;
        } else if full.exists() {
            tokio::fs::remove_file(full).await?;
        }
        Ok(())
    }
}

fn walk(root: &Path, dir: &Path, keys: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, keys);
        } else if let Ok(rel) = path.strip_prefix(root) {
            keys.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
}
