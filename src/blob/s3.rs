//! S3-compatible blob store (MinIO in practice).

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::{Builder, Credentials};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};

use crate::blob::BlobStore;
use crate::error::{Error, Result};

pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Connect to an S3-compatible endpoint with static credentials.
    pub async fn connect(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        user: impl Into<String>,
        pw: impl Into<String>,
    ) -> Result<Self> {
        let credentials = Credentials::new(user.into(), pw.into(), None, None, "static");
        let config = Builder::new()
            .region(Region::new("us-east-1"))
            .endpoint_url(endpoint.into())
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        let client = Client::from_conf(config);
        let store = Self {
            client,
            bucket: bucket.into(),
        };
        store.ensure_bucket().await?;
        Ok(store)
    }

    /// Connect using ambient AWS configuration (env vars, profiles).
    pub async fn from_env(bucket: impl Into<String>) -> Result<Self> {
        let config = aws_config::load_from_env().await;
        Ok(Self {
            client: Client::new(&config),
            bucket: bucket.into(),
        })
    }

    async fn ensure_bucket(&self) -> Result<()> {
        let accessible = self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok();
        if !accessible {
            self.client
                .create_bucket()
                .bucket(&self.bucket)
                .send()
                .await
                .map_err(|e| Error::Blob(format!("create bucket {}: {e}", self.bucket)))?;
        }
        Ok(())
    }

    fn key(path: &str) -> &str {
        path.trim_start_matches('/')
    }
}

#[async_trait]
impl BlobStore for S3Store {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(Self::key(path))
            .send()
            .await
            .map_err(|e| Error::Blob(format!("get {path}: {e}")))?;
        let data = object
            .body
            .collect()
            .await
            .map_err(|e| Error::Blob(format!("get {path}: {e}")))?;
        Ok(data.into_bytes())
    }

    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(Self::key(path))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| Error::Blob(format!("put {path}: {e}")))?;
        Ok(())
    }

    // S3 has no append; read-modify-write is fine for the small TSV dumps
    // that use it.
    async fn append(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut combined = match self.get(path).await {
            Ok(existing) => BytesMut::from(&existing[..]),
            Err(_) => BytesMut::new(),
        };
        combined.extend_from_slice(data);
        self.put(path, combined.freeze()).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(Self::key(prefix));
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| Error::Blob(format!("list {prefix}: {e}")))?;
            for object in response.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(Self::key(path))
            .send()
            .await
            .is_ok())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(Self::key(path))
            .send()
            .await
            .map_err(|e| Error::Blob(format!("delete {path}: {e}")))?;
        Ok(())
    }
}
