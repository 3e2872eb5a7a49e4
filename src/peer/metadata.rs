//! Metadata exchange ([BEP-9]): fetching the info dictionary from peers
//! when a torrent started from a magnet link.
//!
//! The metadata travels in 16 KiB chunks inside extension messages. Each
//! message is a small bencoded dict; data messages carry the raw chunk
//! bytes immediately after the dict.
//!
//! [BEP-9]: http://bittorrent.org/beps/bep_0009.html

use crate::bencode::{self, Value};
use crate::metainfo::{InfoHash, Metainfo};
use crate::peer::{Bitfield, PeerError, PeerKey};
use bytes::{BufMut, Bytes, BytesMut};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Metadata transfers in fixed 16 KiB chunks; only the final chunk is short.
pub const METADATA_CHUNK_SIZE: u32 = 16 * 1024;

/// Cap on an advertised metadata size. Generous: a million-piece torrent's
/// info dict is still well under this.
pub const MAX_METADATA_SIZE: u32 = 4 * 1024 * 1024;

/// Chunk requests kept in flight per peer.
pub const PARALLEL_REQUESTS: usize = 3;

const MSG_REQUEST: i64 = 0;
const MSG_DATA: i64 = 1;
const MSG_REJECT: i64 = 2;

/// One ut_metadata message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: u32, data: Bytes },
    Reject { piece: u32 },
}

impl MetadataMessage {
    pub fn encode(&self) -> Bytes {
        let mut dict = Value::dict();
        match self {
            MetadataMessage::Request { piece } => {
                dict.insert(b"msg_type", MSG_REQUEST);
                dict.insert(b"piece", *piece as i64);
            }
            MetadataMessage::Data {
                piece, total_size, ..
            } => {
                dict.insert(b"msg_type", MSG_DATA);
                dict.insert(b"piece", *piece as i64);
                dict.insert(b"total_size", *total_size as i64);
            }
            MetadataMessage::Reject { piece } => {
                dict.insert(b"msg_type", MSG_REJECT);
                dict.insert(b"piece", *piece as i64);
            }
        }
        let head = bencode::encode(&dict);
        match self {
            MetadataMessage::Data { data, .. } => {
                let mut buf = BytesMut::with_capacity(head.len() + data.len());
                buf.put_slice(&head);
                buf.put_slice(data);
                buf.freeze()
            }
            _ => head,
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let (dict, consumed) = bencode::decode_prefix(payload)?;
        let msg_type = dict
            .get(b"msg_type")
            .and_then(|v| v.as_integer())
            .ok_or_else(|| PeerError::InvalidMessage("metadata msg_type".into()))?;
        let piece = dict
            .get(b"piece")
            .and_then(|v| v.as_integer())
            .filter(|&p| p >= 0 && p <= u32::MAX as i64)
            .ok_or_else(|| PeerError::InvalidMessage("metadata piece".into()))?
            as u32;

        match msg_type {
            MSG_REQUEST => Ok(MetadataMessage::Request { piece }),
            MSG_DATA => {
                let total_size = dict
                    .get(b"total_size")
                    .and_then(|v| v.as_integer())
                    .filter(|&n| n > 0 && n <= MAX_METADATA_SIZE as i64)
                    .ok_or_else(|| PeerError::InvalidMessage("metadata total_size".into()))?
                    as u32;
                Ok(MetadataMessage::Data {
                    piece,
                    total_size,
                    data: Bytes::copy_from_slice(&payload[consumed..]),
                })
            }
            MSG_REJECT => Ok(MetadataMessage::Reject { piece }),
            other => Err(PeerError::InvalidMessage(format!(
                "metadata msg_type {}",
                other
            ))),
        }
    }
}

/// What a completed chunk did to the overall fetch.
#[derive(Debug)]
pub enum MetadataProgress {
    Incomplete,
    Complete(Metainfo),
}

/// Assembly state for an in-flight metadata fetch.
///
/// Created once a peer's extension handshake reveals `metadata_size`. On a
/// final info-hash mismatch the whole buffer is wiped and the fetch starts
/// over from nothing; a corrupt chunk cannot be located, so nothing partial
/// is worth keeping.
#[derive(Debug)]
pub struct MagnetState {
    info_hash: InfoHash,
    total_size: u32,
    have: Bitfield,
    /// Chunk index to the peer currently fetching it.
    in_flight: HashMap<u32, PeerKey>,
    buf: Vec<u8>,
}

impl MagnetState {
    pub fn new(info_hash: InfoHash, metadata_size: u32) -> Result<Self, PeerError> {
        if metadata_size == 0 || metadata_size > MAX_METADATA_SIZE {
            return Err(PeerError::Protocol(format!(
                "metadata size {}",
                metadata_size
            )));
        }
        let chunks = metadata_size.div_ceil(METADATA_CHUNK_SIZE);
        info!(metadata_size, chunks, "starting metadata fetch");
        Ok(Self {
            info_hash,
            total_size: metadata_size,
            have: Bitfield::new(chunks),
            in_flight: HashMap::new(),
            buf: vec![0; metadata_size as usize],
        })
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn chunk_count(&self) -> u32 {
        self.have.len()
    }

    fn chunk_size(&self, piece: u32) -> u32 {
        let start = piece * METADATA_CHUNK_SIZE;
        (self.total_size - start).min(METADATA_CHUNK_SIZE)
    }

    /// Picks up to `max` missing chunks for `key` to request, in random
    /// order so parallel fetches from several peers interleave instead of
    /// colliding.
    pub fn next_requests(&mut self, key: PeerKey, max: usize) -> Vec<u32> {
        let mut candidates: Vec<u32> = (0..self.have.len())
            .filter(|&c| !self.have.get(c) && !self.in_flight.contains_key(&c))
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(max);
        for &c in &candidates {
            self.in_flight.insert(c, key);
        }
        candidates
    }

    /// A peer rejected or failed a chunk request; allow it to be re-picked.
    pub fn release(&mut self, piece: u32) {
        self.in_flight.remove(&piece);
    }

    /// Returns every chunk a departed peer was fetching to the pool.
    pub fn release_peer(&mut self, key: PeerKey) {
        self.in_flight.retain(|_, holder| *holder != key);
    }

    /// Stores one received chunk. The final chunk triggers decoding and the
    /// info-hash comparison; a mismatch resets the fetch entirely and
    /// surfaces as an error the caller treats as a per-peer disconnect.
    pub fn got_chunk(&mut self, piece: u32, data: &[u8]) -> Result<MetadataProgress, PeerError> {
        if piece >= self.have.len() {
            return Err(PeerError::Protocol(format!("metadata chunk {}", piece)));
        }
        if data.len() != self.chunk_size(piece) as usize {
            return Err(PeerError::Protocol(format!(
                "metadata chunk {} length {}",
                piece,
                data.len()
            )));
        }
        self.in_flight.remove(&piece);
        if self.have.get(piece) {
            debug!(piece, "duplicate metadata chunk");
            return Ok(MetadataProgress::Incomplete);
        }
        let start = (piece * METADATA_CHUNK_SIZE) as usize;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.have.set(piece);

        if !self.have.complete() {
            return Ok(MetadataProgress::Incomplete);
        }

        match Metainfo::from_info_bytes(&self.buf) {
            Ok(meta) if meta.info_hash() == self.info_hash => {
                info!(size = self.total_size, "metadata fetch complete");
                Ok(MetadataProgress::Complete(meta))
            }
            result => {
                if let Err(err) = result {
                    warn!(%err, "fetched metadata does not parse, restarting");
                } else {
                    warn!("fetched metadata hash mismatch, restarting");
                }
                self.restart();
                Err(PeerError::Metainfo(
                    crate::metainfo::MetainfoError::InfoHashMismatch,
                ))
            }
        }
    }

    /// Wipes everything fetched so far. Deliberately destructive: with the
    /// hash check failed there is no way to tell which chunk lied.
    fn restart(&mut self) {
        self.have = Bitfield::new(self.have.len());
        self.in_flight.clear();
        self.buf.fill(0);
    }
}
