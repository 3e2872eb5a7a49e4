//! Swarm coordination: piece selection, partial-piece custody, peer
//! registration, and torrent-wide progress.
//!
//! The coordinator is the hub every connection talks to. It owns the
//! wanted-piece list (with per-piece holder and requester sets), the
//! orphaned partial pieces waiting for a new downloader, the storage
//! handle, and the magnet metadata fetch. Connections hold an `Arc` to it;
//! all of its state sits behind short-hold locks so reader and writer
//! tasks never block each other through it.
//!
//! Iteration discipline: methods snapshot the peer list under the lock and
//! talk to the peers after releasing it, so a peer callback can never
//! re-enter coordinator state mid-iteration.

use crate::config::EngineContext;
use crate::metainfo::{InfoHash, Metainfo};
use crate::peer::conn::{PeerHandle, PeerKey, SwarmPeer};
use crate::peer::metadata::{
    MagnetState, MetadataMessage, MetadataProgress, METADATA_CHUNK_SIZE, PARALLEL_REQUESTS,
};
use crate::peer::queue::DataLoader;
use crate::peer::{Bitfield, PartialPiece, PeerError, Piece};
use crate::storage::{PutResult, StorageError, StorageListener, TorrentStorage};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Engine lifecycle events, on top of the storage events. All methods are
/// optional; the default implementation ignores everything.
pub trait EngineListener: StorageListener {
    /// Storage failed in a way the engine cannot recover from; the torrent
    /// has been halted.
    fn fatal_error(&self, err: &StorageError) {
        let _ = err;
    }
    /// A magnet download fetched and verified the metadata.
    fn got_metainfo(&self, meta: &Arc<Metainfo>) {
        let _ = meta;
    }
    /// A peer announced its DHT port. The engine has no DHT of its own.
    fn dht_port(&self, key: PeerKey, port: u16) {
        let _ = (key, port);
    }
    /// A peer asked for our swarm comments. Return the reply payload, or
    /// `None` to stay silent.
    fn comment_request_payload(&self) -> Option<Bytes> {
        None
    }
    fn got_comment_request(&self, key: PeerKey) {
        let _ = key;
    }
    /// A peer sent a batch of swarm comments, delivered raw.
    fn got_comments(&self, key: PeerKey, payload: Bytes) {
        let _ = (key, payload);
    }
}

/// One registered wire peer with its rate bookkeeping. The deque order
/// doubles as the seeding round-robin order; the choker rotates peers it
/// chokes to the back.
pub(crate) struct PeerEntry {
    pub(crate) handle: PeerHandle,
    pub(crate) up_history: crate::bandwidth::RateHistory,
    pub(crate) down_history: crate::bandwidth::RateHistory,
    pub(crate) last_uploaded: u64,
    pub(crate) last_downloaded: u64,
}

impl PeerEntry {
    fn new(handle: PeerHandle) -> Self {
        Self {
            handle,
            up_history: crate::bandwidth::RateHistory::new(),
            down_history: crate::bandwidth::RateHistory::new(),
            last_uploaded: 0,
            last_downloaded: 0,
        }
    }
}

pub(crate) struct CoordState {
    pub(crate) peers: VecDeque<PeerEntry>,
    webseeds: Vec<Arc<dyn SwarmPeer>>,
    /// Pieces we still need, with holder/requester sets.
    wanted: Vec<Piece>,
    /// Partially downloaded pieces between owners.
    orphans: Vec<PartialPiece>,
    /// Addresses learned from PEX and the embedder, deduplicated.
    discovered: HashSet<SocketAddr>,
    /// Addresses not yet gossiped onward.
    pex_pending: Vec<SocketAddr>,
    /// Periodic-pass counter, drives the slow cadences.
    pub(crate) run: u64,
}

impl CoordState {
    fn empty() -> Self {
        Self {
            peers: VecDeque::new(),
            webseeds: Vec::new(),
            wanted: Vec::new(),
            orphans: Vec::new(),
            discovered: HashSet::new(),
            pex_pending: Vec::new(),
            run: 0,
        }
    }
}

/// The per-torrent hub. Create one per torrent (or magnet), hand each
/// accepted or dialed connection to [`run_peer`](crate::peer::conn::run_peer)
/// with a clone of the `Arc`, and spawn
/// [`run_checker`](crate::peer::choking::run_checker) for the periodic pass.
pub struct PeerCoordinator {
    pub(crate) ctx: Arc<EngineContext>,
    info_hash: InfoHash,
    root: PathBuf,
    listener: Arc<dyn EngineListener>,
    pub(crate) state: Mutex<CoordState>,
    storage: RwLock<Option<Arc<TorrentStorage>>>,
    magnet: Mutex<Option<MagnetState>>,
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    halted: AtomicBool,
    next_key: AtomicU64,
}

impl PeerCoordinator {
    /// Coordinator for a torrent whose metainfo is already known. Call
    /// [`start`](Self::start) before accepting connections.
    pub fn new(
        ctx: Arc<EngineContext>,
        meta: Arc<Metainfo>,
        root: PathBuf,
        listener: Arc<dyn EngineListener>,
    ) -> Arc<Self> {
        let info_hash = meta.info_hash();
        let storage = Arc::new(TorrentStorage::new(ctx.clone(), meta, root.clone()));
        Arc::new(Self {
            ctx,
            info_hash,
            root,
            listener,
            state: Mutex::new(CoordState::empty()),
            storage: RwLock::new(Some(storage)),
            magnet: Mutex::new(None),
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            halted: AtomicBool::new(false),
            next_key: AtomicU64::new(1),
        })
    }

    /// Coordinator for a magnet download: only the info hash is known, and
    /// storage comes into existence once the metadata arrives.
    pub fn new_magnet(
        ctx: Arc<EngineContext>,
        info_hash: InfoHash,
        root: PathBuf,
        listener: Arc<dyn EngineListener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            info_hash,
            root,
            listener,
            state: Mutex::new(CoordState::empty()),
            storage: RwLock::new(None),
            magnet: Mutex::new(None),
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            halted: AtomicBool::new(false),
            next_key: AtomicU64::new(1),
        })
    }

    /// Checks existing files on disk and builds the wanted-piece list.
    /// A no-op for a magnet coordinator.
    pub async fn start(&self) -> Result<(), StorageError> {
        let Some(storage) = self.storage() else {
            return Ok(());
        };
        storage.check(self.listener.as_ref()).await?;
        self.rebuild_wanted();
        Ok(())
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn storage(&self) -> Option<Arc<TorrentStorage>> {
        self.storage.read().clone()
    }

    pub fn metainfo(&self) -> Option<Arc<Metainfo>> {
        self.storage.read().as_ref().map(|s| s.metainfo().clone())
    }

    pub fn is_complete(&self) -> bool {
        self.storage
            .read()
            .as_ref()
            .is_some_and(|s| s.is_complete())
    }

    pub fn listener(&self) -> &Arc<dyn EngineListener> {
        &self.listener
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub(crate) fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    // ---- connection lifecycle ----

    pub fn allocate_key(&self) -> PeerKey {
        PeerKey(self.next_key.fetch_add(1, Ordering::Relaxed))
    }

    /// Admits a freshly handshaken connection, refusing it when the engine
    /// is halted, full, or already talking to that peer id.
    pub fn register(&self, handle: PeerHandle) -> Result<(), PeerError> {
        if self.is_halted() {
            return Err(PeerError::Refused("engine halted"));
        }
        let mut state = self.state.lock();
        if state.peers.len() >= self.ctx.config.max_connections {
            return Err(PeerError::Refused("connection limit reached"));
        }
        if state
            .peers
            .iter()
            .any(|e| e.handle.peer_id() == handle.peer_id())
        {
            return Err(PeerError::Refused("already connected to this peer"));
        }
        // A random end of the deque, so rotation order is not join order.
        let entry = PeerEntry::new(handle);
        if rand::random() {
            state.peers.push_front(entry);
        } else {
            state.peers.push_back(entry);
        }
        Ok(())
    }

    pub fn peer_disconnected(&self, key: PeerKey) {
        let refill = {
            let mut state = self.state.lock();
            let was_uploader = state
                .peers
                .iter()
                .find(|e| e.handle.key() == key)
                .is_some_and(|e| !e.handle.is_choking() && e.handle.is_interested());
            state.peers.retain(|e| e.handle.key() != key);
            for piece in &mut state.wanted {
                piece.remove_holder(key);
                piece.remove_requester(key);
            }
            debug!(?key, peers = state.peers.len(), "peer removed");
            if was_uploader {
                self.refill_upload_slot(&state)
            } else {
                None
            }
        };
        if let Some(handle) = refill {
            debug!(key = ?handle.key(), "unchoking to refill freed upload slot");
            handle.unchoke();
        }
        // Metadata chunks the peer was fetching go back up for grabs.
        if let Some(magnet) = self.magnet.lock().as_mut() {
            magnet.release_peer(key);
        }
    }

    /// A departing uploader frees a slot; hand it to a waiting peer instead
    /// of leaving it idle until the next checker pass.
    fn refill_upload_slot(&self, state: &CoordState) -> Option<PeerHandle> {
        let unchoked = state
            .peers
            .iter()
            .filter(|e| !e.handle.is_choking() && e.handle.is_interested())
            .count();
        if unchoked >= self.ctx.config.max_uploaders {
            return None;
        }
        state
            .peers
            .iter()
            .find(|e| e.handle.is_choking() && e.handle.is_interested())
            .map(|e| e.handle.clone())
    }

    /// Hands a web seed its key and adds it to the swarm as a holder of
    /// every wanted piece.
    pub fn register_webseed(&self, seed: Arc<dyn SwarmPeer>) {
        let mut state = self.state.lock();
        let key = seed.key();
        for piece in &mut state.wanted {
            piece.add_holder(key);
        }
        state.webseeds.push(seed);
    }

    // ---- piece availability ----

    /// Records that `key` holds `piece`. Returns true when that makes the
    /// peer (newly or still) worth being interested in.
    pub fn got_have(&self, key: PeerKey, piece: u32) -> bool {
        let mut state = self.state.lock();
        match state.wanted.iter_mut().find(|p| p.index() == piece) {
            Some(wanted) => {
                wanted.add_holder(key);
                true
            }
            None => false,
        }
    }

    /// Merges a full bitfield into the holder sets. Returns true when the
    /// peer has anything we want.
    pub fn got_bitfield(&self, key: PeerKey, bitfield: &Bitfield) -> bool {
        let mut state = self.state.lock();
        let mut interesting = false;
        for piece in &mut state.wanted {
            if bitfield.get(piece.index()) {
                piece.add_holder(key);
                interesting = true;
            }
        }
        interesting
    }

    /// A peer declared interest. Returns true if it should be unchoked on
    /// the spot rather than waiting for the next choking pass.
    pub fn peer_interested(&self, key: PeerKey, interested: bool) -> bool {
        if !interested || self.is_halted() {
            return false;
        }
        let state = self.state.lock();
        let unchoked = state
            .peers
            .iter()
            .filter(|e| {
                e.handle.key() != key && !e.handle.is_choking() && e.handle.is_interested()
            })
            .count();
        unchoked < self.ctx.config.max_uploaders
    }

    pub fn got_port(&self, key: PeerKey, port: u16) {
        self.listener.dht_port(key, port);
    }

    // ---- piece selection ----

    /// Sets a piece's selection priority; higher wins over rarity. The
    /// embedder drives this from file priorities.
    pub fn set_priority(&self, piece: u32, priority: i32) {
        let mut state = self.state.lock();
        if let Some(wanted) = state.wanted.iter_mut().find(|p| p.index() == piece) {
            wanted.set_priority(priority);
        }
    }

    /// Picks the next piece for `key` to download, preferring to resume an
    /// orphaned partial the peer holds, then the rarest wanted piece it
    /// holds. During endgame the last pieces are handed to several peers at
    /// once, but never twice to the same peer.
    pub fn next_partial(&self, key: PeerKey) -> Option<PartialPiece> {
        let meta = self.metainfo()?;
        let endgame_threshold = self.ctx.config.endgame_threshold;
        let max_parallel = self.ctx.config.max_parallel_requests;

        let mut guard = self.state.lock();
        let state = &mut *guard;

        // Most-downloaded orphan first: finishing an almost-complete piece
        // beats starting a fresh one.
        let mut best: Option<usize> = None;
        for (i, orphan) in state.orphans.iter().enumerate() {
            let eligible = state
                .wanted
                .iter()
                .find(|p| p.index() == orphan.piece())
                .is_some_and(|p| p.is_held_by(key) && !p.is_requested_by(key));
            if !eligible {
                continue;
            }
            if best.is_none_or(|b| state.orphans[b].downloaded() < orphan.downloaded()) {
                best = Some(i);
            }
        }
        if let Some(i) = best {
            let mut orphan = state.orphans.swap_remove(i);
            orphan.reset_requested();
            if let Some(piece) = state
                .wanted
                .iter_mut()
                .find(|p| p.index() == orphan.piece())
            {
                piece.add_requester(key);
            }
            debug!(?key, piece = orphan.piece(), downloaded = orphan.downloaded(),
                "resuming orphaned partial piece");
            return Some(orphan);
        }

        // Unrequested pieces only; a piece already on the wire to someone
        // else is duplicated only when this peer has no untouched
        // alternative, and only during endgame.
        let endgame = state.wanted.len() <= endgame_threshold;
        let mut candidates: Vec<usize> = state
            .wanted
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_held_by(key) && !p.is_requested())
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() && endgame {
            candidates = state
                .wanted
                .iter()
                .enumerate()
                .filter(|(_, p)| {
                    p.is_held_by(key)
                        && !p.is_requested_by(key)
                        && p.requester_count() < max_parallel
                })
                .map(|(i, _)| i)
                .collect();
        }
        // Shuffle first so the stable sort breaks rarity ties randomly.
        candidates.shuffle(&mut rand::thread_rng());
        candidates.sort_by(|&a, &b| state.wanted[a].selection_order(&state.wanted[b]));
        let pick = *candidates.first()?;
        let index = state.wanted[pick].index();
        state.wanted[pick].add_requester(key);
        drop(guard);

        match PartialPiece::new(&self.ctx, index, meta.piece_size(index)) {
            Ok(partial) => Some(partial),
            Err(err) => {
                warn!(piece = index, %err, "could not allocate partial piece");
                let mut state = self.state.lock();
                if let Some(piece) = state.wanted.iter_mut().find(|p| p.index() == index) {
                    piece.remove_requester(key);
                }
                None
            }
        }
    }

    /// Takes custody of partially downloaded pieces from a peer that was
    /// choked or disconnected. Per piece only the most-downloaded copy is
    /// kept, and the orphan list is capped at the connection limit.
    pub fn save_partials(&self, key: PeerKey, partials: Vec<PartialPiece>) {
        let mut state = self.state.lock();
        for partial in partials {
            let Some(piece) = state
                .wanted
                .iter_mut()
                .find(|p| p.index() == partial.piece())
            else {
                continue; // verified or no longer wanted, drop it
            };
            piece.remove_requester(key);
            if partial.downloaded() == 0 {
                continue;
            }
            match state
                .orphans
                .iter_mut()
                .find(|o| o.piece() == partial.piece())
            {
                Some(existing) if existing.downloaded() >= partial.downloaded() => {}
                Some(existing) => *existing = partial,
                None => state.orphans.push(partial),
            }
        }
        let cap = self.ctx.config.max_connections;
        if state.orphans.len() > cap {
            state
                .orphans
                .sort_by_key(|o| std::cmp::Reverse(o.downloaded()));
            state.orphans.truncate(cap);
        }
    }

    /// A peer finished assembling a piece. Verifies and stores it, updates
    /// the wanted list, and announces it to the swarm.
    pub async fn got_piece(&self, key: PeerKey, partial: PartialPiece) -> Result<(), PeerError> {
        let Some(storage) = self.storage() else {
            return Ok(());
        };
        let index = partial.piece();
        let length = partial.length();
        let data = partial.into_bytes()?;

        match storage.put_piece(index, data).await? {
            PutResult::HashMismatch => {
                warn!(?key, piece = index, "piece failed verification, dropping holder");
                // The bytes were poison; take them back out of the totals
                // and stop asking this peer for the piece.
                self.downloaded.fetch_sub(length as u64, Ordering::Relaxed);
                let mut state = self.state.lock();
                if let Some(piece) = state.wanted.iter_mut().find(|p| p.index() == index) {
                    piece.remove_requester(key);
                    piece.remove_holder(key);
                }
                Ok(())
            }
            PutResult::Stored => {
                self.piece_done(index);
                Ok(())
            }
            PutResult::Complete => {
                self.piece_done(index);
                self.on_complete();
                Ok(())
            }
            PutResult::ReverifyFailed => {
                warn!("resuming after failed completion re-verification");
                self.rebuild_wanted();
                Ok(())
            }
        }
    }

    /// Removes a verified piece from the wanted list and broadcasts HAVE.
    fn piece_done(&self, index: u32) {
        let swarm: Vec<Arc<dyn SwarmPeer>> = {
            let mut state = self.state.lock();
            state.wanted.retain(|p| p.index() != index);
            state.orphans.retain(|o| o.piece() != index);
            state
                .peers
                .iter()
                .map(|e| Arc::new(e.handle.clone()) as Arc<dyn SwarmPeer>)
                .chain(state.webseeds.iter().cloned())
                .collect()
        };
        for peer in swarm {
            peer.notify_have(index);
        }
    }

    fn on_complete(&self) {
        info!(info_hash = %self.info_hash, "download complete");
        self.listener.completed();
        // Nothing left to trade with other seeds.
        let seeds: Vec<PeerHandle> = {
            let state = self.state.lock();
            state
                .peers
                .iter()
                .filter(|e| e.handle.shared.is_seed())
                .map(|e| e.handle.clone())
                .collect()
        };
        for seed in seeds {
            debug!(key = ?seed.key(), "dropping fellow seed");
            seed.disconnect();
        }
    }

    /// Rebuilds the wanted list from the storage bitfield and the connected
    /// peers' claims. Used after startup and after a failed completion
    /// re-verification.
    fn rebuild_wanted(&self) {
        let Some(storage) = self.storage() else {
            return;
        };
        let bitfield = storage.bitfield();
        let mut state = self.state.lock();
        let mut wanted: Vec<Piece> = (0..bitfield.len())
            .filter(|&i| !bitfield.get(i))
            .map(Piece::new)
            .collect();
        for entry in &state.peers {
            let key = entry.handle.key();
            let meta = entry.handle.shared.meta.lock();
            if let Some(theirs) = &meta.bitfield {
                for piece in &mut wanted {
                    if theirs.get(piece.index()) {
                        piece.add_holder(key);
                    }
                }
            } else if meta.pending_have_all {
                for piece in &mut wanted {
                    piece.add_holder(key);
                }
            }
        }
        for seed in &state.webseeds {
            for piece in &mut wanted {
                piece.add_holder(seed.key());
            }
        }
        state
            .orphans
            .retain(|o| wanted.iter().any(|p| p.index() == o.piece()));
        state.wanted = wanted;
    }

    // ---- peer discovery ----

    /// Feeds an address learned from PEX or the embedder into the
    /// discovered set; new addresses are gossiped on the next PEX pass.
    pub fn add_discovered_peer(&self, addr: SocketAddr) {
        let mut state = self.state.lock();
        if state.discovered.insert(addr) {
            state.pex_pending.push(addr);
        }
    }

    /// Snapshot of every address learned so far, for the embedder's dialer.
    pub fn discovered_peers(&self) -> Vec<SocketAddr> {
        self.state.lock().discovered.iter().copied().collect()
    }

    pub(crate) fn take_pex_pending(&self) -> Vec<SocketAddr> {
        std::mem::take(&mut self.state.lock().pex_pending)
    }

    // ---- magnet metadata ----

    /// True while the torrent has no metainfo yet.
    pub fn needs_metadata(&self) -> bool {
        self.storage.read().is_none()
    }

    /// Begins (or joins) the metadata fetch once a peer advertises the
    /// metadata size. Returns the chunk requests to send to that peer.
    pub fn magnet_start(&self, key: PeerKey, metadata_size: u32) -> Result<Vec<u32>, PeerError> {
        if !self.needs_metadata() {
            return Ok(Vec::new());
        }
        let mut magnet = self.magnet.lock();
        match magnet.as_mut() {
            Some(state) if state.total_size() != metadata_size => Err(PeerError::Protocol(
                format!("metadata size {} disagrees", metadata_size),
            )),
            Some(state) => Ok(state.next_requests(key, PARALLEL_REQUESTS)),
            None => {
                let mut state = MagnetState::new(self.info_hash, metadata_size)?;
                let requests = state.next_requests(key, PARALLEL_REQUESTS);
                *magnet = Some(state);
                Ok(requests)
            }
        }
    }

    /// Further chunk requests for a peer with spare metadata pipeline.
    pub fn magnet_requests(&self, key: PeerKey, max: usize) -> Vec<u32> {
        self.magnet
            .lock()
            .as_mut()
            .map(|s| s.next_requests(key, max))
            .unwrap_or_default()
    }

    /// A peer rejected a metadata chunk request.
    pub fn magnet_release(&self, piece: u32) {
        if let Some(state) = self.magnet.lock().as_mut() {
            state.release(piece);
        }
    }

    /// Stores one received metadata chunk. Returns true once the metadata
    /// is complete and storage exists.
    pub async fn magnet_chunk(&self, piece: u32, data: &[u8]) -> Result<bool, PeerError> {
        let progress = {
            let mut magnet = self.magnet.lock();
            let Some(state) = magnet.as_mut() else {
                return Ok(true);
            };
            state.got_chunk(piece, data)?
        };
        match progress {
            MetadataProgress::Incomplete => Ok(false),
            MetadataProgress::Complete(meta) => {
                self.set_metainfo(Arc::new(meta)).await?;
                Ok(true)
            }
        }
    }

    /// Serves a metadata chunk to a requesting peer, once we have it.
    pub fn metadata_chunk(&self, piece: u32) -> Option<MetadataMessage> {
        let meta = self.metainfo()?;
        let info = meta.info_bytes();
        let total = info.len() as u32;
        let start = (piece as u64).checked_mul(METADATA_CHUNK_SIZE as u64)?;
        if start >= total as u64 {
            return None;
        }
        let start = start as usize;
        let end = (start + METADATA_CHUNK_SIZE as usize).min(total as usize);
        Some(MetadataMessage::Data {
            piece,
            total_size: total,
            data: info.slice(start..end),
        })
    }

    /// Installs freshly fetched metadata: creates storage, checks the disk,
    /// converts the bitfields peers sent before we knew the piece count,
    /// and rebuilds the wanted list.
    async fn set_metainfo(&self, meta: Arc<Metainfo>) -> Result<(), PeerError> {
        let storage = Arc::new(TorrentStorage::new(
            self.ctx.clone(),
            meta.clone(),
            self.root.clone(),
        ));
        storage.check(self.listener.as_ref()).await?;
        *self.storage.write() = Some(storage);
        *self.magnet.lock() = None;

        let pieces = meta.piece_count();
        let mut malformed = Vec::new();
        {
            let state = self.state.lock();
            for entry in &state.peers {
                let handle = &entry.handle;
                let mut shared = handle.shared.meta.lock();
                if let Some(bytes) = shared.pending_bitfield.take() {
                    match Bitfield::from_bytes(&bytes, pieces) {
                        Ok(bitfield) => shared.bitfield = Some(bitfield),
                        Err(_) => malformed.push(handle.clone()),
                    }
                } else if shared.pending_have_all {
                    shared.pending_have_all = false;
                    shared.bitfield = Some(Bitfield::full(pieces));
                }
            }
        }
        for handle in malformed {
            warn!(key = ?handle.key(), "pending bitfield does not fit metainfo");
            handle.disconnect();
        }
        self.rebuild_wanted();

        // Declare interest where the rebuilt wanted list says so.
        let interesting: Vec<PeerHandle> = {
            let state = self.state.lock();
            state
                .peers
                .iter()
                .filter(|e| {
                    let key = e.handle.key();
                    state.wanted.iter().any(|p| p.is_held_by(key))
                })
                .map(|e| e.handle.clone())
                .collect()
        };
        for handle in interesting {
            let send = {
                let mut shared = handle.shared.meta.lock();
                !std::mem::replace(&mut shared.interesting, true)
            };
            if send {
                handle.queue.send_interest(true);
            }
        }

        info!(info_hash = %self.info_hash, "metadata installed");
        self.listener.got_metainfo(&meta);
        Ok(())
    }

    // ---- shutdown ----

    /// Unrecoverable storage failure: report it and halt the torrent.
    pub fn fatal(&self, err: &StorageError) {
        error!(%err, "fatal storage error, halting");
        self.listener.fatal_error(err);
        self.halt();
    }

    /// Stops the torrent: refuses new registrations, disconnects everyone,
    /// and drops the file handles. Idempotent.
    pub fn halt(&self) {
        if self.halted.swap(true, Ordering::SeqCst) {
            return;
        }
        let (peers, webseeds) = {
            let mut state = self.state.lock();
            let peers: Vec<PeerHandle> = state.peers.drain(..).map(|e| e.handle).collect();
            let webseeds = std::mem::take(&mut state.webseeds);
            state.wanted.clear();
            state.orphans.clear();
            (peers, webseeds)
        };
        for peer in peers {
            peer.disconnect();
        }
        for seed in webseeds {
            seed.close();
        }
        if let Some(storage) = self.storage() {
            storage.close();
        }
        info!(info_hash = %self.info_hash, "halted");
    }

    /// Resumes a halted torrent: re-checks the files on disk (they may have
    /// changed while we were stopped) and accepts connections again.
    pub async fn restart(&self) -> Result<(), StorageError> {
        if !self.halted.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!(info_hash = %self.info_hash, "restarting");
        self.start().await
    }
}

/// The writer task loads piece data for serving through the coordinator,
/// which also counts the bytes toward the torrent totals.
#[async_trait]
impl DataLoader for PeerCoordinator {
    async fn load_data(&self, piece: u32, offset: u32, length: u32) -> Option<Bytes> {
        let storage = self.storage()?;
        match storage.read_block(piece, offset, length).await {
            Ok(data) => {
                self.add_uploaded(data.len() as u64);
                Some(data)
            }
            Err(err) => {
                warn!(piece, offset, %err, "cannot serve block");
                None
            }
        }
    }
}
