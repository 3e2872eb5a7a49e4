use crate::config::EngineContext;
use crate::metainfo::Metainfo;
use crate::peer::queue::DataLoader;
use crate::peer::Bitfield;
use crate::storage::file::{block_spans, FileHandleCache};
use crate::storage::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, info, warn};

/// Storage lifecycle events, delivered synchronously from storage calls.
pub trait StorageListener: Send + Sync {
    /// One piece verified during the startup check.
    fn piece_checked(&self, piece: u32, have: bool) {
        let _ = (piece, have);
    }
    /// The startup check finished.
    fn all_checked(&self) {}
    /// Every piece is present and verified.
    fn completed(&self) {}
    /// Files are being created and zero-filled; can take a while.
    fn allocating(&self) {}
}

/// Outcome of [`TorrentStorage::put_piece`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    /// Hash mismatch: nothing persisted, the piece is still wanted.
    HashMismatch,
    /// Stored and verified; the torrent is not finished yet.
    Stored,
    /// Stored, and the final full re-verification confirmed completion.
    Complete,
    /// The last piece apparently arrived, but the full re-verification
    /// found pieces missing on disk. The visible bitfield has been rebuilt;
    /// the caller must rebuild its wanted set.
    ReverifyFailed,
}

struct StorageState {
    bitfield: Bitfield,
}

/// Disk backing for one torrent.
pub struct TorrentStorage {
    ctx: Arc<EngineContext>,
    meta: Arc<Metainfo>,
    cache: FileHandleCache,
    state: Mutex<StorageState>,
}

impl TorrentStorage {
    pub fn new(ctx: Arc<EngineContext>, meta: Arc<Metainfo>, root: PathBuf) -> Self {
        let pieces = meta.piece_count();
        Self {
            ctx,
            meta,
            cache: FileHandleCache::new(root),
            state: Mutex::new(StorageState {
                bitfield: Bitfield::new(pieces),
            }),
        }
    }

    pub fn metainfo(&self) -> &Arc<Metainfo> {
        &self.meta
    }

    /// Snapshot of the verified-piece bitfield.
    pub fn bitfield(&self) -> Bitfield {
        self.state.lock().bitfield.clone()
    }

    pub fn has_piece(&self, piece: u32) -> bool {
        self.state.lock().bitfield.get(piece)
    }

    /// Pieces still missing.
    pub fn needed(&self) -> u32 {
        let state = self.state.lock();
        state.bitfield.len() - state.bitfield.count()
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().bitfield.complete()
    }

    /// Creates or verifies the files, then hashes every piece to rebuild
    /// the bitfield. Freshly created files are all zero, so hashing is
    /// skipped when nothing existed before.
    pub async fn check(&self, listener: &dyn StorageListener) -> Result<(), StorageError> {
        let mut any_existed = false;
        let mut announced = false;
        for spec in self.meta.files() {
            let path = self.cache.resolve(&spec.path)?;
            match tokio::fs::metadata(&path).await {
                Ok(md) => {
                    any_existed = true;
                    if md.len() != spec.length {
                        warn!(?path, actual = md.len(), expected = spec.length,
                            "fixing file length");
                        let file = OpenOptions::new().write(true).open(&path).await?;
                        file.set_len(spec.length).await?;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    if !announced {
                        listener.allocating();
                        announced = true;
                    }
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    let file = tokio::fs::File::create(&path).await?;
                    file.set_len(spec.length).await?;
                    debug!(?path, length = spec.length, "created file");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let mut bitfield = Bitfield::new(self.meta.piece_count());
        if any_existed {
            for piece in 0..self.meta.piece_count() {
                let data = self.read_piece_raw(piece).await?;
                let have = self.verify(piece, data).await?;
                if have {
                    bitfield.set(piece);
                }
                listener.piece_checked(piece, have);
            }
        } else {
            for piece in 0..self.meta.piece_count() {
                listener.piece_checked(piece, false);
            }
        }

        info!(
            have = bitfield.count(),
            total = bitfield.len(),
            "storage check finished"
        );
        let complete = bitfield.complete();
        self.state.lock().bitfield = bitfield;
        listener.all_checked();
        if complete {
            listener.completed();
        }
        Ok(())
    }

    /// Reads part of a verified piece, for serving.
    pub async fn read_block(
        &self,
        piece: u32,
        offset: u32,
        length: u32,
    ) -> Result<Bytes, StorageError> {
        if !self.has_piece(piece) {
            return Err(StorageError::PieceNotAvailable(piece));
        }
        if offset as u64 + length as u64 > self.meta.piece_size(piece) as u64 {
            return Err(StorageError::OutOfRange {
                piece,
                offset,
                length,
            });
        }
        self.read_raw(piece, offset, length).await
    }

    /// Verifies and stores a fully assembled piece.
    pub async fn put_piece(&self, piece: u32, data: Bytes) -> Result<PutResult, StorageError> {
        if !self.verify(piece, data.clone()).await? {
            return Ok(PutResult::HashMismatch);
        }

        let mut written = 0usize;
        for span in block_spans(&self.meta, piece, 0, data.len() as u32) {
            let spec = &self.meta.files()[span.file];
            let handle = self.cache.open(span.file, &spec.path, true).await?;
            let mut file = handle.file.lock().await;
            file.seek(SeekFrom::Start(span.offset)).await?;
            file.write_all(&data[written..written + span.length as usize])
                .await?;
            file.flush().await?;
            written += span.length as usize;
        }

        let complete = {
            let mut state = self.state.lock();
            state.bitfield.set(piece);
            state.bitfield.complete()
        };
        if !complete {
            return Ok(PutResult::Stored);
        }

        // The last piece just landed. Re-verify everything before claiming
        // completion; the scratch bitfield keeps the public counters steady
        // while the pass runs.
        let rechecked = self.recheck_all().await?;
        if rechecked.complete() {
            info!("all pieces verified, torrent complete");
            Ok(PutResult::Complete)
        } else {
            warn!(
                missing = rechecked.len() - rechecked.count(),
                "completion re-verification failed, resuming download"
            );
            self.state.lock().bitfield = rechecked;
            Ok(PutResult::ReverifyFailed)
        }
    }

    async fn recheck_all(&self) -> Result<Bitfield, StorageError> {
        let mut scratch = Bitfield::new(self.meta.piece_count());
        for piece in 0..self.meta.piece_count() {
            let data = self.read_piece_raw(piece).await?;
            if self.verify(piece, data).await? {
                scratch.set(piece);
            }
        }
        Ok(scratch)
    }

    async fn verify(&self, piece: u32, data: Bytes) -> Result<bool, StorageError> {
        let meta = self.meta.clone();
        tokio::task::spawn_blocking(move || meta.check_piece(piece, &data))
            .await
            .map_err(|err| StorageError::Io(io::Error::other(err)))
    }

    async fn read_piece_raw(&self, piece: u32) -> Result<Bytes, StorageError> {
        self.read_raw(piece, 0, self.meta.piece_size(piece)).await
    }

    async fn read_raw(&self, piece: u32, offset: u32, length: u32) -> Result<Bytes, StorageError> {
        let mut buf = vec![0u8; length as usize];
        let mut filled = 0usize;
        for span in block_spans(&self.meta, piece, offset, length) {
            let spec = &self.meta.files()[span.file];
            let handle = self.cache.open(span.file, &spec.path, false).await?;
            let mut file = handle.file.lock().await;
            file.seek(SeekFrom::Start(span.offset)).await?;
            file.read_exact(&mut buf[filled..filled + span.length as usize])
                .await?;
            filled += span.length as usize;
        }
        Ok(Bytes::from(buf))
    }

    /// Closes file handles idle past the configured window.
    pub fn evict_idle(&self) {
        self.cache.evict_idle(self.ctx.config.file_idle_timeout);
    }

    /// Drops all cached handles, for shutdown.
    pub fn close(&self) {
        self.cache.clear();
    }
}

/// [`DataLoader`] over a [`TorrentStorage`], for the writer task's deferred
/// piece loads.
pub struct StorageLoader(pub Arc<TorrentStorage>);

#[async_trait]
impl DataLoader for StorageLoader {
    async fn load_data(&self, piece: u32, offset: u32, length: u32) -> Option<Bytes> {
        match self.0.read_block(piece, offset, length).await {
            Ok(data) => Some(data),
            Err(err) => {
                warn!(piece, offset, %err, "deferred piece load failed");
                None
            }
        }
    }
}
