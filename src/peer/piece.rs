//! Download-side piece bookkeeping: swarm-wide rarity ([`Piece`]), one
//! outstanding chunk request ([`Request`]), and a piece in the middle of
//! being assembled ([`PartialPiece`]).

use crate::config::EngineContext;
use crate::peer::conn::PeerKey;
use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::time::Instant;

/// Coordinator-side view of one piece we still want: who has it, who we
/// have asked for it, and its selection priority.
#[derive(Debug, Clone)]
pub struct Piece {
    index: u32,
    priority: i32,
    holders: HashSet<PeerKey>,
    requesters: HashSet<PeerKey>,
}

impl Piece {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            priority: 0,
            holders: HashSet::new(),
            requesters: HashSet::new(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// How many connected peers hold this piece.
    pub fn rarity(&self) -> usize {
        self.holders.len()
    }

    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    pub fn add_holder(&mut self, peer: PeerKey) {
        self.holders.insert(peer);
    }

    pub fn remove_holder(&mut self, peer: PeerKey) {
        self.holders.remove(&peer);
    }

    pub fn is_held_by(&self, peer: PeerKey) -> bool {
        self.holders.contains(&peer)
    }

    pub fn is_requested(&self) -> bool {
        !self.requesters.is_empty()
    }

    pub fn requester_count(&self) -> usize {
        self.requesters.len()
    }

    /// Records `peer` as a requester. Returns false if it already was one.
    pub fn add_requester(&mut self, peer: PeerKey) -> bool {
        self.requesters.insert(peer)
    }

    pub fn remove_requester(&mut self, peer: PeerKey) {
        self.requesters.remove(&peer);
    }

    pub fn is_requested_by(&self, peer: PeerKey) -> bool {
        self.requesters.contains(&peer)
    }

    /// Selection order: higher priority first, then rarest first.
    pub fn selection_order(&self, other: &Piece) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.rarity().cmp(&other.rarity()))
    }
}

/// One outstanding `(piece, offset, length)` chunk request on a peer.
#[derive(Debug, Clone)]
pub struct Request {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
    pub sent_at: Instant,
}

impl Request {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
            sent_at: Instant::now(),
        }
    }

    pub fn matches(&self, piece: u32, offset: u32, length: u32) -> bool {
        self.piece == piece && self.offset == offset && self.length == length
    }
}

enum Backing {
    Memory(Vec<u8>),
    Disk(std::fs::File),
}

impl std::fmt::Debug for Backing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backing::Memory(buf) => write!(f, "Memory({} bytes)", buf.len()),
            Backing::Disk(_) => write!(f, "Disk"),
        }
    }
}

/// A piece being assembled from sequential chunks.
///
/// Small pieces buffer in memory; pieces over the engine's in-memory
/// threshold, or whose buffer cannot be allocated, spill to an anonymous
/// temp file (and a failed allocation shrinks the threshold for everyone).
/// A partial piece has exactly one owner at a time: the peer downloading
/// it, or the coordinator's orphan list between owners.
#[derive(Debug)]
pub struct PartialPiece {
    piece: u32,
    length: u32,
    downloaded: u32,
    requested: u32,
    backing: Backing,
}

impl PartialPiece {
    pub fn new(ctx: &EngineContext, piece: u32, length: u32) -> io::Result<Self> {
        let backing = Self::allocate(ctx, length)?;
        Ok(Self {
            piece,
            length,
            downloaded: 0,
            requested: 0,
            backing,
        })
    }

    fn allocate(ctx: &EngineContext, length: u32) -> io::Result<Backing> {
        if (length as usize) <= ctx.partial_memory_limit() {
            let mut buf = Vec::new();
            if buf.try_reserve_exact(length as usize).is_ok() {
                return Ok(Backing::Memory(buf));
            }
            ctx.shrink_partial_memory_limit(length as usize);
            tracing::warn!(length, "partial piece buffer allocation failed, spilling to disk");
        }
        let file = match &ctx.config.temp_dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        Ok(Backing::Disk(file))
    }

    pub fn piece(&self) -> u32 {
        self.piece
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    /// Contiguous bytes received from offset zero.
    pub fn downloaded(&self) -> u32 {
        self.downloaded
    }

    pub fn remaining(&self) -> u32 {
        self.length - self.downloaded
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded == self.length
    }

    /// Yields the next chunk to request, up to `chunk` bytes, advancing the
    /// requested high-water mark. `None` once the whole piece is on the
    /// wire.
    pub fn next_request(&mut self, chunk: u32) -> Option<(u32, u32)> {
        if self.requested >= self.length {
            return None;
        }
        let offset = self.requested;
        let length = chunk.min(self.length - offset);
        self.requested += length;
        Some((offset, length))
    }

    /// Rolls the requested mark back to what actually arrived, so lost
    /// chunks get asked for again. Used on restore, reject, and resend.
    pub fn reset_requested(&mut self) {
        self.requested = self.downloaded;
    }

    /// Appends one chunk. Chunks must arrive in order; the caller re-queues
    /// requests when the remote skips ahead. Returns true when the piece is
    /// fully assembled.
    pub fn put_chunk(&mut self, offset: u32, data: &[u8]) -> io::Result<bool> {
        if offset != self.downloaded || offset as u64 + data.len() as u64 > self.length as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "chunk out of sequence",
            ));
        }
        match &mut self.backing {
            Backing::Memory(buf) => buf.extend_from_slice(data),
            // Spilled buffers see small sequential writes; plain blocking
            // io keeps the ownership story simple.
            Backing::Disk(file) => file.write_all(data)?,
        }
        self.downloaded += data.len() as u32;
        if self.requested < self.downloaded {
            self.requested = self.downloaded;
        }
        Ok(self.is_complete())
    }

    /// Consumes the buffer for hashing. Only meaningful once complete.
    pub fn into_bytes(self) -> io::Result<Bytes> {
        match self.backing {
            Backing::Memory(buf) => Ok(Bytes::from(buf)),
            Backing::Disk(mut file) => {
                let mut buf = Vec::with_capacity(self.downloaded as usize);
                file.seek(SeekFrom::Start(0))?;
                file.read_to_end(&mut buf)?;
                Ok(Bytes::from(buf))
            }
        }
    }
}
