//! File-span mapping and the lazy file-handle cache.

use crate::metainfo::Metainfo;
use crate::storage::StorageError;
use dashmap::DashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::sync::Mutex as TokioMutex;
use tracing::debug;

/// A byte range within one of the torrent's files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    /// Index into [`Metainfo::files`].
    pub file: usize,
    /// Offset within that file.
    pub offset: u64,
    pub length: u64,
}

/// Maps a block (piece, offset, length) onto the file ranges backing it. A
/// block near a piece boundary can cross any number of small files.
pub fn block_spans(meta: &Metainfo, piece: u32, offset: u32, length: u32) -> Vec<FileSpan> {
    let mut global = piece as u64 * meta.piece_length() as u64 + offset as u64;
    let mut remaining = length as u64;
    let mut spans = Vec::with_capacity(1);

    let mut file_start = 0u64;
    for (index, file) in meta.files().iter().enumerate() {
        let file_end = file_start + file.length;
        if global < file_end && remaining > 0 {
            let within = global - file_start;
            let take = (file.length - within).min(remaining);
            if take > 0 {
                spans.push(FileSpan {
                    file: index,
                    offset: within,
                    length: take,
                });
                global += take;
                remaining -= take;
            }
        }
        if remaining == 0 {
            break;
        }
        file_start = file_end;
    }
    spans
}

/// One cached open file. The tokio mutex serializes seek+read/write pairs;
/// the timestamp drives idle eviction.
pub struct CachedFile {
    pub file: TokioMutex<File>,
    last_used: parking_lot::Mutex<Instant>,
    pub writable: bool,
}

impl CachedFile {
    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }
}

/// Lazily opened, idle-evicted file handles for one torrent.
pub struct FileHandleCache {
    root: PathBuf,
    handles: DashMap<usize, Arc<CachedFile>>,
}

impl FileHandleCache {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            handles: DashMap::new(),
        }
    }

    /// Absolute path for a torrent-relative file path, refusing anything
    /// that would escape the download root.
    pub fn resolve(&self, relative: &Path) -> Result<PathBuf, StorageError> {
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => {
                    return Err(StorageError::UnsafePath(
                        relative.to_string_lossy().into_owned(),
                    ))
                }
            }
        }
        Ok(self.root.join(relative))
    }

    /// Returns an open handle for file `index`, opening it on first use and
    /// upgrading a read-only handle when a write needs it.
    pub async fn open(
        &self,
        index: usize,
        relative: &Path,
        write: bool,
    ) -> Result<Arc<CachedFile>, StorageError> {
        if let Some(cached) = self.handles.get(&index) {
            if cached.writable || !write {
                cached.touch();
                return Ok(cached.clone());
            }
            drop(cached);
            self.handles.remove(&index);
        }

        let path = self.resolve(relative)?;
        let file = if write {
            OpenOptions::new().read(true).write(true).open(&path).await?
        } else {
            File::open(&path).await?
        };
        debug!(?path, write, "opened file handle");
        let cached = Arc::new(CachedFile {
            file: TokioMutex::new(file),
            last_used: parking_lot::Mutex::new(Instant::now()),
            writable: write,
        });
        self.handles.insert(index, cached.clone());
        Ok(cached)
    }

    /// Closes handles idle longer than `timeout`.
    pub fn evict_idle(&self, timeout: Duration) {
        self.handles.retain(|_, cached| cached.idle_for() < timeout);
    }

    pub fn open_count(&self) -> usize {
        self.handles.len()
    }

    /// Drops every cached handle.
    pub fn clear(&self) {
        self.handles.clear();
    }
}
