//! Connection setup and the shared per-peer handle.
//!
//! [`run_peer`] drives one connection from handshake to teardown: it splits
//! the stream, exchanges handshakes, registers with the coordinator, spawns
//! the writer task, and runs the reader state machine to completion. The
//! [`PeerHandle`] is what everything else (coordinator, choker, extension
//! handlers) holds onto.

use crate::config::EngineContext;
use crate::coordinator::PeerCoordinator;
use crate::peer::extension;
use crate::peer::fast::allowed_fast_set;
use crate::peer::message::{Handshake, Message};
use crate::peer::queue::{writer_loop, DataLoader, SendQueue};
use crate::peer::state::PeerReader;
use crate::peer::transport::{FrameReader, FrameWriter};
use crate::peer::{Bitfield, PeerError, PeerId};
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Engine-local connection identity. The transport substrate is external,
/// so there is no socket address to key on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey(pub u64);

/// How many allowed-fast pieces we offer a newly connected peer.
const ALLOWED_FAST_COUNT: usize = 10;

/// Byte totals for one peer, shared between writer task and choker.
#[derive(Debug, Default)]
pub struct PeerCounters {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
}

impl PeerCounters {
    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }
}

/// Extension-protocol ids the remote registered in its handshake.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtensionIds {
    pub metadata: Option<u8>,
    pub pex: Option<u8>,
    pub comment: Option<u8>,
}

/// Mutable per-peer state, guarded by a short-hold mutex.
#[derive(Debug)]
pub struct PeerMeta {
    /// What the peer has; `None` until a bitfield/have-all/have-none (or
    /// metainfo, in the magnet case) pins the size.
    pub bitfield: Option<Bitfield>,
    /// Raw bitfield bytes received before we had the metainfo.
    pub pending_bitfield: Option<Bytes>,
    /// Peer claimed everything via have-all before we had the metainfo.
    pub pending_have_all: bool,
    pub interested_in_us: bool,
    /// We are choking them.
    pub we_choke: bool,
    /// We are interested in them.
    pub interesting: bool,
    /// They are choking us.
    pub they_choke: bool,
    pub extension_ids: ExtensionIds,
    pub metadata_size: Option<u32>,
    pub upload_only: bool,
    pub client_version: Option<String>,
    /// Listen port from the extension handshake's `p` key.
    pub listen_port: Option<u16>,
    /// Allowed-fast pieces the peer granted us.
    pub allowed_fast: HashSet<u32>,
}

impl Default for PeerMeta {
    fn default() -> Self {
        Self {
            bitfield: None,
            pending_bitfield: None,
            pending_have_all: false,
            interested_in_us: false,
            we_choke: true,
            interesting: false,
            they_choke: true,
            extension_ids: ExtensionIds::default(),
            metadata_size: None,
            upload_only: false,
            client_version: None,
            listen_port: None,
            allowed_fast: HashSet::new(),
        }
    }
}

/// Immutable identity plus shared mutable state for one connection.
pub struct PeerShared {
    pub key: PeerKey,
    pub peer_id: PeerId,
    pub fast_extension: bool,
    pub extension_protocol: bool,
    pub counters: Arc<PeerCounters>,
    pub meta: parking_lot::Mutex<PeerMeta>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl PeerShared {
    pub(crate) fn new(key: PeerKey, peer_id: PeerId, fast: bool, extensions: bool) -> Arc<Self> {
        Arc::new(Self {
            key,
            peer_id,
            fast_extension: fast,
            extension_protocol: extensions,
            counters: Arc::new(PeerCounters::default()),
            meta: parking_lot::Mutex::new(PeerMeta::default()),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.shutdown.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    pub fn has_piece(&self, piece: u32) -> bool {
        self.meta
            .lock()
            .bitfield
            .as_ref()
            .is_some_and(|b| b.get(piece))
    }

    pub fn is_seed(&self) -> bool {
        let meta = self.meta.lock();
        meta.pending_have_all
            || meta.upload_only
            || meta.bitfield.as_ref().is_some_and(|b| b.complete())
    }
}

/// The capability surface the coordinator needs from any swarm member,
/// wire peer or web seed.
pub trait SwarmPeer: Send + Sync {
    fn key(&self) -> PeerKey;
    /// Announce a freshly verified piece. Web seeds ignore this.
    fn notify_have(&self, piece: u32);
    fn is_seed(&self) -> bool;
    fn close(&self);
}

/// Cloneable reference to one live connection.
#[derive(Clone)]
pub struct PeerHandle {
    pub shared: Arc<PeerShared>,
    pub queue: Arc<SendQueue>,
}

impl PeerHandle {
    pub fn key(&self) -> PeerKey {
        self.shared.key
    }

    pub fn peer_id(&self) -> PeerId {
        self.shared.peer_id
    }

    /// Chokes the peer, stripping its queued piece payloads.
    pub fn choke(&self) {
        let was = {
            let mut meta = self.shared.meta.lock();
            std::mem::replace(&mut meta.we_choke, true)
        };
        if !was {
            self.queue.send_choke();
        }
    }

    pub fn unchoke(&self) {
        let was = {
            let mut meta = self.shared.meta.lock();
            std::mem::replace(&mut meta.we_choke, false)
        };
        if was {
            self.queue.send_unchoke();
        }
    }

    pub fn is_choking(&self) -> bool {
        self.shared.meta.lock().we_choke
    }

    pub fn is_interested(&self) -> bool {
        self.shared.meta.lock().interested_in_us
    }

    /// Client name and version from the extension handshake, if any.
    pub fn client_version(&self) -> Option<String> {
        self.shared.meta.lock().client_version.clone()
    }

    /// Port the peer says it listens on, for the embedder's dialer and
    /// PEX gossip.
    pub fn listen_port(&self) -> Option<u16> {
        self.shared.meta.lock().listen_port
    }

    /// They choke us and we want what they have.
    pub fn is_choked_and_interesting(&self) -> bool {
        let meta = self.shared.meta.lock();
        meta.they_choke && meta.interesting
    }

    pub fn send_extended(&self, ext_id: u8, payload: Bytes) {
        self.queue.send(Message::Extended {
            id: ext_id,
            payload,
        });
    }

    pub fn disconnect(&self) {
        self.shared.close();
        self.queue.close();
    }
}

impl SwarmPeer for PeerHandle {
    fn key(&self) -> PeerKey {
        self.shared.key
    }

    fn notify_have(&self, piece: u32) {
        self.queue.send(Message::Have(piece));
    }

    fn is_seed(&self) -> bool {
        self.shared.is_seed()
    }

    fn close(&self) {
        self.disconnect();
    }
}

/// Runs one peer connection to completion. Returns when the peer
/// disconnects, misbehaves, or the engine shuts the connection down.
pub async fn run_peer<S>(
    stream: S,
    ctx: Arc<EngineContext>,
    coordinator: Arc<PeerCoordinator>,
    outbound: bool,
) -> Result<(), PeerError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half, ctx.config.write_timeout);

    let ours = Handshake::new(coordinator.info_hash(), ctx.our_id);
    let theirs = if outbound {
        writer.send_handshake(&ours).await?;
        reader.read_handshake(ctx.config.write_timeout).await?
    } else {
        let theirs = reader.read_handshake(ctx.config.write_timeout).await?;
        writer.send_handshake(&ours).await?;
        theirs
    };
    if theirs.info_hash != coordinator.info_hash() {
        return Err(PeerError::InfoHashMismatch);
    }
    if theirs.peer_id == ctx.our_id {
        return Err(PeerError::Refused("connected to self"));
    }

    let fast = theirs.supports_fast();
    let extensions = theirs.supports_extensions();
    let key = coordinator.allocate_key();
    let shared = PeerShared::new(key, theirs.peer_id, fast, extensions);
    let queue = Arc::new(SendQueue::new());
    queue.set_fast_extension(fast);
    let handle = PeerHandle {
        shared: shared.clone(),
        queue: queue.clone(),
    };

    coordinator.register(handle.clone())?;
    info!(?key, peer = %theirs.peer_id, outbound, "peer connected");

    let loader: Arc<dyn DataLoader> = coordinator.clone();
    let writer_task = tokio::spawn(writer_loop(
        writer,
        queue.clone(),
        loader,
        shared.counters.clone(),
    ));

    if extensions {
        queue.send(Message::Extended {
            id: extension::HANDSHAKE_ID,
            payload: extension::handshake_payload(&ctx, &coordinator),
        });
    }
    let allowed_fast = send_initial_state(&coordinator, &handle, fast);

    let result = PeerReader::new(
        ctx.clone(),
        coordinator.clone(),
        handle.clone(),
        reader,
        allowed_fast,
    )
    .run()
    .await;

    match &result {
        Ok(()) => debug!(?key, "peer disconnected"),
        Err(PeerError::ConnectionClosed) => debug!(?key, "peer closed connection"),
        Err(err) => warn!(?key, %err, "peer connection failed"),
    }

    queue.close();
    shared.close();
    coordinator.peer_disconnected(key);
    let _ = writer_task.await;

    if let Err(PeerError::Storage(err)) = &result {
        coordinator.fatal(err);
    }
    // Expected teardown is not an error for the caller.
    match result {
        Err(PeerError::ConnectionClosed) => Ok(()),
        other => other,
    }
}

/// Sends our piece state right after the handshakes: have-all/have-none or
/// a bitfield, plus the allowed-fast offers. Returns the allowed-fast set
/// we announced, which the reader honors for requests while choking.
fn send_initial_state(
    coordinator: &PeerCoordinator,
    handle: &PeerHandle,
    fast: bool,
) -> HashSet<u32> {
    let Some(storage) = coordinator.storage() else {
        // Magnet phase: nothing to claim yet.
        if fast {
            handle.queue.send(Message::HaveNone);
        }
        return HashSet::new();
    };
    let bitfield = storage.bitfield();
    if fast && bitfield.complete() {
        handle.queue.send(Message::HaveAll);
    } else if fast && bitfield.is_empty() {
        handle.queue.send(Message::HaveNone);
    } else if !bitfield.is_empty() {
        handle.queue.send(Message::Bitfield(bitfield.to_bytes()));
    }

    let mut announced = HashSet::new();
    if fast && !bitfield.is_empty() {
        let pieces = allowed_fast_set(
            &coordinator.info_hash(),
            &handle.peer_id(),
            bitfield.len(),
            ALLOWED_FAST_COUNT,
        );
        for piece in pieces {
            if bitfield.get(piece) {
                handle.queue.send(Message::AllowedFast(piece));
                announced.insert(piece);
            }
        }
    }
    announced
}
