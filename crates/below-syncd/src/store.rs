//! Object store backends for archive uploads
//!
//! [`BlobStore`] is the seam the uploader writes through. The production
//! implementation wraps any `object_store` backend (GCS, S3, local
//! filesystem, in-memory) and streams with a multipart upload, so the archive
//! is never held in memory as a whole.

use async_trait::async_trait;
use bytes::Bytes;
use clap::ValueEnum;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, WriteMultipart};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Parts uploaded concurrently before `write` waits
const MAX_CONCURRENT_PARTS: usize = 2;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },
    #[error("Invalid store configuration: {message}")]
    Config { message: String },
    #[error("Writer already finished or aborted")]
    Closed,
}

/// Supported object store backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    /// Google Cloud Storage (credentials from the environment)
    Gcs,
    /// Amazon S3 and compatibles (credentials from the environment)
    S3,
    /// Local directory named by the bucket
    File,
    /// In-memory store, discarded at exit
    Memory,
}

/// Build the object store handle for a bucket
pub fn open_object_store(
    backend: StoreBackend,
    bucket: &str,
) -> Result<Arc<dyn ObjectStore>, StoreError> {
    if bucket.is_empty() {
        return Err(StoreError::Config {
            message: "bucket name is empty".to_string(),
        });
    }

    let store: Arc<dyn ObjectStore> = match backend {
        StoreBackend::Gcs => Arc::new(
            object_store::gcp::GoogleCloudStorageBuilder::from_env()
                .with_bucket_name(bucket)
                .build()?,
        ),
        StoreBackend::S3 => Arc::new(
            object_store::aws::AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .build()?,
        ),
        StoreBackend::File => {
            let root = Path::new(bucket);
            std::fs::create_dir_all(root).map_err(|e| StoreError::Config {
                message: format!("failed to create store directory {}: {}", bucket, e),
            })?;
            Arc::new(object_store::local::LocalFileSystem::new_with_prefix(root)?)
        }
        StoreBackend::Memory => Arc::new(object_store::memory::InMemory::new()),
    };

    info!("Opened {:?} store for bucket {:?}", backend, bucket);
    Ok(store)
}

/// Destination for streamed blobs
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Open a writer that creates or overwrites `name` when finished
    async fn open_writer(&self, name: &str) -> Result<Box<dyn BlobWriter>, StoreError>;
}

/// An in-progress blob write
#[async_trait]
pub trait BlobWriter: Send {
    /// Append a chunk, waiting while the backend is saturated
    async fn write(&mut self, chunk: Bytes) -> Result<(), StoreError>;

    /// Commit the blob
    async fn finish(&mut self) -> Result<(), StoreError>;

    /// Discard the blob; a no-op once finished
    async fn abort(&mut self) -> Result<(), StoreError>;
}

/// [`BlobStore`] over an `object_store` backend
#[derive(Clone)]
pub struct ObjectStoreBlobStore {
    inner: Arc<dyn ObjectStore>,
}

impl ObjectStoreBlobStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBlobStore {
    async fn open_writer(&self, name: &str) -> Result<Box<dyn BlobWriter>, StoreError> {
        let location = ObjectPath::from(name);
        let upload = self.inner.put_multipart(&location).await?;
        Ok(Box::new(MultipartBlobWriter {
            upload: Some(WriteMultipart::new(upload)),
        }))
    }
}

struct MultipartBlobWriter {
    upload: Option<WriteMultipart>,
}

#[async_trait]
impl BlobWriter for MultipartBlobWriter {
    async fn write(&mut self, chunk: Bytes) -> Result<(), StoreError> {
        let upload = self.upload.as_mut().ok_or(StoreError::Closed)?;
        upload.wait_for_capacity(MAX_CONCURRENT_PARTS).await?;
        upload.write(&chunk);
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), StoreError> {
        let upload = self.upload.take().ok_or(StoreError::Closed)?;
        upload.finish().await?;
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), StoreError> {
        match self.upload.take() {
            Some(upload) => Ok(upload.abort().await?),
            None => Ok(()),
        }
    }
}
