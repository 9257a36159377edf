//! Streaming tar.gz bundles of a directory tree
//!
//! A bundle is produced in two steps. [`DirectoryBundler::snapshot`] lists
//! every path under the root once, depth-first. [`DirectoryBundler::stream`]
//! then archives exactly those paths on a blocking task that writes through
//! a bounded channel, so at most `PIPE_CAPACITY` chunks are buffered no
//! matter how large the tree is.
//!
//! A failure on any listed path poisons the pipe before the archive writers
//! are dropped, so no tar or gzip trailer follows the bytes already sent.
//! The stream then ends with an `Err` item; the consumer never sees a short
//! archive as a well-formed one.

use below_sync_core::{archive_path, ArchiveEntry};
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::Stream;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tar::{Builder, EntryType, Header};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Maximum bytes per chunk sent through the pipe
const CHUNK_SIZE: usize = 64 * 1024;
/// Chunks buffered between producer and consumer
const PIPE_CAPACITY: usize = 8;

/// Bundle errors
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("Directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),
    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("Failed to access {}: {source}", .path.display())]
    Access {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to snapshot directory: {0}")]
    Snapshot(#[from] walkdir::Error),
    #[error("Failed to archive {}: {source}", .path.display())]
    Entry {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} shrank while being archived ({missing} bytes short)", .path.display())]
    Truncated { path: PathBuf, missing: u64 },
    #[error("Archive stream error: {0}")]
    Io(#[from] io::Error),
}

/// Paths captured at the start of a bundle operation
#[derive(Debug, Clone)]
pub struct Snapshot {
    root: PathBuf,
    paths: Vec<PathBuf>,
}

impl Snapshot {
    /// Listed paths, in archive order
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

/// Produces compressed archives of one directory
#[derive(Debug, Clone)]
pub struct DirectoryBundler {
    root: PathBuf,
}

impl DirectoryBundler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Snapshot the tree and start streaming its archive
    pub async fn bundle(&self) -> Result<BundleStream, BundleError> {
        let bundler = self.clone();
        let snapshot = tokio::task::spawn_blocking(move || bundler.snapshot())
            .await
            .map_err(|e| BundleError::Io(io::Error::other(e)))??;
        debug!(
            "Snapshot of {} has {} entries",
            self.root.display(),
            snapshot.paths.len()
        );
        Ok(self.stream(snapshot))
    }

    /// List every path under the root, depth-first, sorted by name within
    /// each directory. The root itself is not listed.
    pub fn snapshot(&self) -> Result<Snapshot, BundleError> {
        let metadata = match fs::metadata(&self.root) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BundleError::DirectoryNotFound(self.root.clone()))
            }
            Err(source) => {
                return Err(BundleError::Access {
                    path: self.root.clone(),
                    source,
                })
            }
        };
        if !metadata.is_dir() {
            return Err(BundleError::NotADirectory(self.root.clone()));
        }

        let mut paths = Vec::new();
        for entry in WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry?;
            if entry.depth() == 0 {
                continue;
            }
            paths.push(entry.into_path());
        }

        Ok(Snapshot {
            root: self.root.clone(),
            paths,
        })
    }

    /// Archive `snapshot` on a blocking task, returning the consumer end
    pub fn stream(&self, snapshot: Snapshot) -> BundleStream {
        let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
        let failure_tx = tx.clone();

        tokio::task::spawn_blocking(move || {
            match write_archive(&snapshot, PipeWriter::new(tx)) {
                Ok(()) => debug!(
                    "Archived {} entries from {}",
                    snapshot.paths.len(),
                    snapshot.root.display()
                ),
                Err(e) if failure_tx.is_closed() => {
                    debug!("Archive consumer went away: {}", e);
                }
                Err(e) => {
                    warn!("Bundle of {} failed: {}", snapshot.root.display(), e);
                    let _ = failure_tx.blocking_send(Err(io::Error::other(e)));
                }
            }
        });

        BundleStream { rx }
    }
}

/// Consumer end of a bundle pipe.
///
/// Yields compressed archive chunks. A producer failure arrives as a final
/// `Err` whose inner error is the [`BundleError`].
pub struct BundleStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl Stream for BundleStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Producer end of a bundle pipe; blocks while the pipe is full
struct PipeWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    poisoned: Arc<AtomicBool>,
}

impl PipeWriter {
    fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        Self {
            tx,
            poisoned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that makes every later write fail
    fn poison_flag(&self) -> Arc<AtomicBool> {
        self.poisoned.clone()
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "archive aborted"));
        }
        let n = buf.len().min(CHUNK_SIZE);
        if n == 0 {
            return Ok(0);
        }
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(&buf[..n])))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer closed"))?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn write_archive(snapshot: &Snapshot, pipe: PipeWriter) -> Result<(), BundleError> {
    let poisoned = pipe.poison_flag();
    let encoder = GzEncoder::new(
        BufWriter::with_capacity(CHUNK_SIZE, pipe),
        Compression::default(),
    );
    let mut builder = Builder::new(encoder);

    for path in &snapshot.paths {
        if let Err(e) = append_entry(&mut builder, &snapshot.root, path) {
            // Dropping the writers flushes trailers; none may reach the pipe.
            poisoned.store(true, Ordering::Release);
            return Err(e);
        }
    }

    // Close inner to outer: tar trailer, gzip trailer, then the pipe.
    let encoder = builder.into_inner()?;
    let mut buffered = encoder.finish()?;
    buffered.flush()?;
    Ok(())
}

fn append_entry<W: Write>(
    builder: &mut Builder<W>,
    root: &Path,
    path: &Path,
) -> Result<(), BundleError> {
    let entry_error = |source: io::Error| BundleError::Entry {
        path: path.to_path_buf(),
        source,
    };

    let relative = archive_path(root, path).ok_or_else(|| {
        entry_error(io::Error::new(
            io::ErrorKind::InvalidInput,
            "path is outside the bundle root",
        ))
    })?;
    let metadata = fs::metadata(path).map_err(entry_error)?;
    if !metadata.is_dir() && !metadata.is_file() {
        return Err(entry_error(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file or directory",
        )));
    }

    let entry = ArchiveEntry::from_metadata(relative, &metadata);
    let mut header = header_for(&entry);

    if entry.is_directory {
        builder
            .append_data(&mut header, &entry.relative_path, io::empty())
            .map_err(entry_error)?;
        return Ok(());
    }

    let file = File::open(path).map_err(entry_error)?;
    let mut body = BufReader::new(file).take(entry.size);
    builder
        .append_data(&mut header, &entry.relative_path, &mut body)
        .map_err(entry_error)?;
    if body.limit() > 0 {
        return Err(BundleError::Truncated {
            path: path.to_path_buf(),
            missing: body.limit(),
        });
    }
    Ok(())
}

fn header_for(entry: &ArchiveEntry) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(if entry.is_directory {
        EntryType::Directory
    } else {
        EntryType::Regular
    });
    header.set_size(entry.size);
    header.set_mode(entry.mode);
    header.set_mtime(entry.mtime_secs());
    header
}
