//! PayloadStore: blob storage for raw tenant payloads.
//!
//! Intake writes each raw body under a fresh payload id; the processor reads
//! it back by that id. Bodies are zstd-compressed.
//!
//! ## Configuration
//!
//! Set the `PAYLOAD_STORE_URL` environment variable:
//!
//! ```text
//! # S3
//! PAYLOAD_STORE_URL=s3://my-bucket?region=us-east-1
//!
//! # MinIO (self-hosted S3-compatible)
//! PAYLOAD_STORE_URL=s3://my-bucket?endpoint=http://minio:9000&region=us-east-1
//!
//! # Local filesystem
//! PAYLOAD_STORE_URL=file:///tmp/approval-payloads
//!
//! # Keys under a prefix other than "payloads/"
//! PAYLOAD_STORE_URL=s3://my-bucket/approvals/raw
//!
//! # Unset, empty or memory:// selects the in-process store (local mode)
//! ```

use std::sync::Arc;

use bytes::Bytes;
use object_store::{path::Path, ObjectStore};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BlobError {
    /// The pointer references a blob that is not (yet) visible.
    #[error("payload {0} not found")]
    NotFound(Uuid),

    #[error("object store error: {0}")]
    Store(#[from] object_store::Error),

    #[error("payload codec error: {0}")]
    Codec(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct PayloadStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl PayloadStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()), "payloads")
    }

    /// Build a `PayloadStore` from a `PAYLOAD_STORE_URL` value.
    pub fn from_url(url: Option<&str>) -> anyhow::Result<Self> {
        let backend = Backend::parse(url.unwrap_or_default())?;
        match backend {
            Backend::Memory => {
                tracing::warn!("PayloadStore: using in-memory backend, payloads do not survive restarts");
                Ok(Self::in_memory())
            }
            other => {
                tracing::info!(backend = other.kind(), "PayloadStore: using object store backend");
                let (store, prefix) = other.build()?;
                Ok(Self::new(store, prefix))
            }
        }
    }

    fn path_for(&self, payload_id: Uuid) -> Path {
        Path::from(format!("{}/{}.json.zst", self.prefix, payload_id))
    }

    pub async fn put(&self, payload_id: Uuid, raw: &[u8]) -> Result<(), BlobError> {
        let compressed = zstd::encode_all(raw, 3)?;
        let path = self.path_for(payload_id);
        self.store.put(&path, compressed.into()).await?;
        tracing::debug!(payload_id = %payload_id, bytes = raw.len(), "payload stored");
        Ok(())
    }

    pub async fn get(&self, payload_id: Uuid) -> Result<Bytes, BlobError> {
        let path = self.path_for(payload_id);
        let bytes = match self.store.get(&path).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(BlobError::NotFound(payload_id))
            }
            Err(e) => return Err(e.into()),
        };

        let raw = zstd::decode_all(bytes.as_ref())?;
        Ok(Bytes::from(raw))
    }
}

/// Where payload blobs live, as described by `PAYLOAD_STORE_URL`.
#[derive(Debug, PartialEq)]
enum Backend {
    Memory,
    Local {
        root: String,
    },
    /// `s3://bucket[/prefix][?region=..&endpoint=..]`
    S3 {
        bucket: String,
        prefix: String,
        region: String,
        endpoint: Option<String>,
    },
}

const DEFAULT_PREFIX: &str = "payloads";

impl Backend {
    fn parse(url: &str) -> anyhow::Result<Self> {
        let url = url.trim();
        if url.is_empty() || url.starts_with("memory://") {
            return Ok(Backend::Memory);
        }
        if let Some(root) = url.strip_prefix("file://") {
            return Ok(Backend::Local { root: root.to_string() });
        }
        if let Some(rest) = url.strip_prefix("s3://") {
            let (location, query) = rest.split_once('?').unwrap_or((rest, ""));
            let (bucket, prefix) = location.split_once('/').unwrap_or((location, ""));
            if bucket.is_empty() {
                anyhow::bail!("PAYLOAD_STORE_URL has no bucket: {}", url);
            }
            let params = query_params(query);
            return Ok(Backend::S3 {
                bucket: bucket.to_string(),
                prefix: match prefix.trim_matches('/') {
                    "" => DEFAULT_PREFIX.to_string(),
                    p => p.to_string(),
                },
                region: params
                    .get("region")
                    .cloned()
                    .unwrap_or_else(|| "us-east-1".to_string()),
                endpoint: params.get("endpoint").cloned(),
            });
        }
        anyhow::bail!("unsupported PAYLOAD_STORE_URL scheme: {}", url)
    }

    fn kind(&self) -> &'static str {
        match self {
            Backend::Memory => "memory",
            Backend::Local { .. } => "file",
            Backend::S3 { .. } => "s3",
        }
    }

    fn build(self) -> anyhow::Result<(Arc<dyn ObjectStore>, String)> {
        use anyhow::Context;

        match self {
            Backend::Memory => Ok((
                Arc::new(object_store::memory::InMemory::new()),
                DEFAULT_PREFIX.to_string(),
            )),
            Backend::Local { root } => {
                std::fs::create_dir_all(&root)
                    .with_context(|| format!("failed to create payload directory {}", root))?;
                let local = object_store::local::LocalFileSystem::new_with_prefix(&root)
                    .with_context(|| format!("failed to open payload directory {}", root))?;
                Ok((Arc::new(local), DEFAULT_PREFIX.to_string()))
            }
            Backend::S3 { bucket, prefix, region, endpoint } => {
                // Static keys when present; otherwise the builder falls back to
                // instance credentials.
                let mut s3 = object_store::aws::AmazonS3Builder::from_env()
                    .with_bucket_name(&bucket)
                    .with_region(&region);
                if let Some(endpoint) = endpoint {
                    // MinIO and other S3-compatible stores are usually plain http.
                    s3 = s3.with_endpoint(endpoint).with_allow_http(true);
                }
                let s3 = s3
                    .build()
                    .with_context(|| format!("failed to configure S3 bucket {}", bucket))?;
                Ok((Arc::new(s3), prefix))
            }
        }
    }
}

fn query_params(query: &str) -> std::collections::HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| {
            let value = urlencoding::decode(v).map(|d| d.into_owned()).unwrap_or_else(|_| v.to_string());
            (k.to_string(), value)
        })
        .collect()
}
