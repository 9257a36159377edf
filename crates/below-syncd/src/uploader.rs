//! Streaming archive upload under a deadline

use crate::store::{BlobStore, BlobWriter, StoreError};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Upload errors
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Destination {name} unavailable: {source}")]
    DestinationUnavailable {
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("Failed to copy to {name}: {source}")]
    Copy {
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("Failed to read upload source for {name}: {source}")]
    Source {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Upload of {name} timed out after {deadline:?}")]
    Timeout { name: String, deadline: Duration },
    #[error("Failed to finalize {name}: {source}")]
    Finalize {
        name: String,
        #[source]
        source: StoreError,
    },
}

/// Streams byte sources into a [`BlobStore`]
#[derive(Clone)]
pub struct RemoteUploader {
    store: Arc<dyn BlobStore>,
}

impl RemoteUploader {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    /// Copy `source` to `destination`, overwriting any previous object.
    ///
    /// Copy and finalize share `deadline`. On a copy failure or timeout the
    /// remote write is aborted; whatever the store keeps of an aborted write
    /// is left as is. Returns the number of bytes sent.
    pub async fn upload<S>(
        &self,
        source: S,
        destination: &str,
        deadline: Duration,
    ) -> Result<u64, UploadError>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + Unpin,
    {
        let mut writer = self.store.open_writer(destination).await.map_err(|source| {
            UploadError::DestinationUnavailable {
                name: destination.to_string(),
                source,
            }
        })?;

        let outcome = tokio::time::timeout(
            deadline,
            copy_and_finish(source, writer.as_mut(), destination),
        )
        .await;
        let err = match outcome {
            Ok(Ok(sent)) => {
                debug!("Uploaded {} bytes to {}", sent, destination);
                return Ok(sent);
            }
            Ok(Err(err @ UploadError::Finalize { .. })) => return Err(err),
            Ok(Err(err)) => err,
            Err(_) => UploadError::Timeout {
                name: destination.to_string(),
                deadline,
            },
        };

        match tokio::time::timeout(deadline, writer.abort()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to abort upload of {}: {}", destination, e),
            Err(_) => warn!("Abort of {} timed out", destination),
        }
        Err(err)
    }
}

async fn copy_and_finish<S>(
    mut source: S,
    writer: &mut dyn BlobWriter,
    name: &str,
) -> Result<u64, UploadError>
where
    S: Stream<Item = std::io::Result<Bytes>> + Send + Unpin,
{
    let mut sent = 0u64;
    while let Some(chunk) = source.next().await {
        let chunk = chunk.map_err(|source| UploadError::Source {
            name: name.to_string(),
            source,
        })?;
        sent += chunk.len() as u64;
        writer.write(chunk).await.map_err(|source| UploadError::Copy {
            name: name.to_string(),
            source,
        })?;
    }

    writer.finish().await.map_err(|source| UploadError::Finalize {
        name: name.to_string(),
        source,
    })?;
    Ok(sent)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream;
    use parking_lot::Mutex;

    /// What a [`RecordingStore`] saw
    #[derive(Debug, Default)]
    pub(crate) struct Recorded {
        pub data: Vec<u8>,
        pub finished: Vec<String>,
        pub aborted: Vec<String>,
    }

    /// In-memory store double with failure injection
    #[derive(Default)]
    pub(crate) struct RecordingStore {
        pub recorded: Arc<Mutex<Recorded>>,
        pub unavailable: bool,
        pub fail_write: bool,
        pub fail_finish: bool,
    }

    struct RecordingWriter {
        name: String,
        recorded: Arc<Mutex<Recorded>>,
        fail_write: bool,
        fail_finish: bool,
    }

    #[async_trait]
    impl BlobStore for RecordingStore {
        async fn open_writer(&self, name: &str) -> Result<Box<dyn BlobWriter>, StoreError> {
            if self.unavailable {
                return Err(StoreError::Unavailable {
                    message: "bucket does not exist".to_string(),
                });
            }
            Ok(Box::new(RecordingWriter {
                name: name.to_string(),
                recorded: self.recorded.clone(),
                fail_write: self.fail_write,
                fail_finish: self.fail_finish,
            }))
        }
    }

    #[async_trait]
    impl BlobWriter for RecordingWriter {
        async fn write(&mut self, chunk: Bytes) -> Result<(), StoreError> {
            if self.fail_write {
                return Err(StoreError::Unavailable {
                    message: "connection reset".to_string(),
                });
            }
            self.recorded.lock().data.extend_from_slice(&chunk);
            Ok(())
        }

        async fn finish(&mut self) -> Result<(), StoreError> {
            if self.fail_finish {
                return Err(StoreError::Unavailable {
                    message: "commit rejected".to_string(),
                });
            }
            self.recorded.lock().finished.push(self.name.clone());
            Ok(())
        }

        async fn abort(&mut self) -> Result<(), StoreError> {
            self.recorded.lock().aborted.push(self.name.clone());
            Ok(())
        }
    }

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = std::io::Result<Bytes>> + Unpin {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_upload_success() {
        let store = Arc::new(RecordingStore::default());
        let recorded = store.recorded.clone();
        let uploader = RemoteUploader::new(store);

        let sent = uploader
            .upload(chunks(&["abc", "defg"]), "below_n.tar.gz", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(sent, 7);
        let recorded = recorded.lock();
        assert_eq!(recorded.data, b"abcdefg");
        assert_eq!(recorded.finished, vec!["below_n.tar.gz"]);
        assert!(recorded.aborted.is_empty());
    }

    #[tokio::test]
    async fn test_destination_unavailable() {
        let store = Arc::new(RecordingStore {
            unavailable: true,
            ..Default::default()
        });
        let uploader = RemoteUploader::new(store);

        let err = uploader
            .upload(chunks(&["abc"]), "below_n.tar.gz", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::DestinationUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_copy_failure_aborts() {
        let store = Arc::new(RecordingStore {
            fail_write: true,
            ..Default::default()
        });
        let recorded = store.recorded.clone();
        let uploader = RemoteUploader::new(store);

        let err = uploader
            .upload(chunks(&["abc"]), "obj", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Copy { .. }));
        assert_eq!(recorded.lock().aborted, vec!["obj"]);
    }

    #[tokio::test]
    async fn test_finalize_failure_is_distinct() {
        let store = Arc::new(RecordingStore {
            fail_finish: true,
            ..Default::default()
        });
        let recorded = store.recorded.clone();
        let uploader = RemoteUploader::new(store);

        let err = uploader
            .upload(chunks(&["abc"]), "obj", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Finalize { .. }));
        let recorded = recorded.lock();
        assert_eq!(recorded.data, b"abc");
        assert!(recorded.aborted.is_empty());
    }

    #[tokio::test]
    async fn test_source_error_aborts() {
        let store = Arc::new(RecordingStore::default());
        let recorded = store.recorded.clone();
        let uploader = RemoteUploader::new(store);

        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "file vanished")),
        ]);
        let err = uploader
            .upload(source, "obj", Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Source { .. }));
        let recorded = recorded.lock();
        assert!(recorded.finished.is_empty());
        assert_eq!(recorded.aborted, vec!["obj"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_elapses() {
        let store = Arc::new(RecordingStore::default());
        let recorded = store.recorded.clone();
        let uploader = RemoteUploader::new(store);

        let stalled = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(b"head"))])
            .chain(stream::pending());
        let err = uploader
            .upload(stalled, "obj", Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Timeout { .. }));
        let recorded = recorded.lock();
        assert!(recorded.finished.is_empty());
        assert_eq!(recorded.aborted, vec!["obj"]);
    }
}
