//! Inbound message state machine: one instance per connection, owned by
//! the reader task.
//!
//! All download-side bookkeeping that belongs to exactly one connection
//! lives here: the outstanding-request pipeline, the partial pieces being
//! assembled, and the once-only bitfield rule. Anything swarm-wide goes
//! through the coordinator.

use crate::config::EngineContext;
use crate::coordinator::PeerCoordinator;
use crate::peer::extension;
use crate::peer::message::Message;
use crate::peer::transport::FrameReader;
use crate::peer::{Bitfield, PartialPiece, PeerError, PeerHandle, Request};
use bytes::Bytes;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, trace, warn};

/// Whether the reader loop keeps going after a message.
enum Next {
    Continue,
    Stop,
}

pub struct PeerReader<R> {
    ctx: Arc<EngineContext>,
    coordinator: Arc<PeerCoordinator>,
    handle: PeerHandle,
    reader: FrameReader<R>,
    outstanding: VecDeque<Request>,
    partials: Vec<PartialPiece>,
    bitfield_received: bool,
    /// Allowed-fast pieces we announced; requests for them are served even
    /// while we choke.
    allowed_fast_sent: HashSet<u32>,
}

impl<R: AsyncRead + Unpin> PeerReader<R> {
    pub fn new(
        ctx: Arc<EngineContext>,
        coordinator: Arc<PeerCoordinator>,
        handle: PeerHandle,
        reader: FrameReader<R>,
        allowed_fast_sent: HashSet<u32>,
    ) -> Self {
        Self {
            ctx,
            coordinator,
            handle,
            reader,
            outstanding: VecDeque::new(),
            partials: Vec::new(),
            bitfield_received: false,
            allowed_fast_sent,
        }
    }

    pub async fn run(mut self) -> Result<(), PeerError> {
        let result = self.drive().await;
        self.return_partials();
        result
    }

    async fn drive(&mut self) -> Result<(), PeerError> {
        let mut retransmit = tokio::time::interval(self.ctx.config.request_ttl / 2);
        retransmit.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        retransmit.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                _ = self.handle.shared.wait_closed() => return Ok(()),
                _ = retransmit.tick() => self.retransmit(),
                message = self.reader.next_message(self.ctx.config.inactivity_timeout) => {
                    match self.handle_message(message?).await? {
                        Next::Continue => {}
                        Next::Stop => return Ok(()),
                    }
                }
            }
        }
    }

    fn key(&self) -> crate::peer::PeerKey {
        self.handle.key()
    }

    async fn handle_message(&mut self, message: Message) -> Result<Next, PeerError> {
        if message.is_fast() && !self.handle.shared.fast_extension {
            return Err(PeerError::Protocol(
                "fast message without fast extension".into(),
            ));
        }
        match message {
            Message::KeepAlive => Ok(Next::Continue),
            Message::Choke => {
                self.handle.shared.meta.lock().they_choke = true;
                self.handle.queue.on_choked();
                self.return_partials();
                Ok(Next::Continue)
            }
            Message::Unchoke => {
                self.handle.shared.meta.lock().they_choke = false;
                self.request_more();
                Ok(Next::Continue)
            }
            Message::Interested => {
                self.handle.shared.meta.lock().interested_in_us = true;
                if self.coordinator.peer_interested(self.key(), true) {
                    self.handle.unchoke();
                }
                Ok(Next::Continue)
            }
            Message::NotInterested => {
                self.handle.shared.meta.lock().interested_in_us = false;
                self.coordinator.peer_interested(self.key(), false);
                Ok(Next::Continue)
            }
            Message::Have(piece) => self.handle_have(piece),
            Message::Bitfield(bytes) => self.handle_bitfield(bytes),
            Message::HaveAll => self.handle_have_all(),
            Message::HaveNone => self.handle_have_none(),
            Message::Request {
                piece,
                offset,
                length,
            } => self.handle_request(piece, offset, length),
            Message::Piece {
                piece,
                offset,
                data,
            } => self.handle_piece(piece, offset, data).await,
            Message::Cancel {
                piece,
                offset,
                length,
            } => {
                self.handle.queue.cancel_piece(piece, offset, length);
                Ok(Next::Continue)
            }
            Message::Port(port) => {
                self.coordinator.got_port(self.key(), port);
                Ok(Next::Continue)
            }
            Message::Suggest(piece) => {
                trace!(piece, "peer suggested piece");
                Ok(Next::Continue)
            }
            Message::Reject {
                piece,
                offset,
                length,
            } => self.handle_reject(piece, offset, length),
            Message::AllowedFast(piece) => {
                self.handle.shared.meta.lock().allowed_fast.insert(piece);
                Ok(Next::Continue)
            }
            Message::Extended { id, payload } => {
                extension::handle_message(&self.coordinator, &self.handle, id, payload).await?;
                Ok(Next::Continue)
            }
        }
    }

    fn handle_have(&mut self, piece: u32) -> Result<Next, PeerError> {
        let Some(meta) = self.coordinator.metainfo() else {
            trace!(piece, "have before metadata, ignoring");
            return Ok(Next::Continue);
        };
        if piece >= meta.piece_count() {
            return Err(PeerError::Protocol(format!("have {} out of range", piece)));
        }
        {
            let mut shared = self.handle.shared.meta.lock();
            shared
                .bitfield
                .get_or_insert_with(|| Bitfield::new(meta.piece_count()))
                .set(piece);
        }
        if self.coordinator.got_have(self.key(), piece) {
            self.mark_interesting();
            self.request_more();
        }
        self.disconnect_if_mutual_seeds()
    }

    fn handle_bitfield(&mut self, bytes: Bytes) -> Result<Next, PeerError> {
        if self.bitfield_received {
            return Err(PeerError::Protocol("second bitfield".into()));
        }
        self.bitfield_received = true;

        let Some(meta) = self.coordinator.metainfo() else {
            // Magnet phase: keep the raw bytes until the metainfo pins the
            // piece count.
            self.handle.shared.meta.lock().pending_bitfield = Some(bytes);
            return Ok(Next::Continue);
        };
        let bitfield = Bitfield::from_bytes(&bytes, meta.piece_count())?;
        let interesting = self.coordinator.got_bitfield(self.key(), &bitfield);
        self.handle.shared.meta.lock().bitfield = Some(bitfield);
        if interesting {
            self.mark_interesting();
            self.request_more();
        }
        self.disconnect_if_mutual_seeds()
    }

    fn handle_have_all(&mut self) -> Result<Next, PeerError> {
        if self.bitfield_received {
            return Err(PeerError::Protocol("have-all after bitfield".into()));
        }
        self.bitfield_received = true;
        let Some(meta) = self.coordinator.metainfo() else {
            self.handle.shared.meta.lock().pending_have_all = true;
            return Ok(Next::Continue);
        };
        let bitfield = Bitfield::full(meta.piece_count());
        let interesting = self.coordinator.got_bitfield(self.key(), &bitfield);
        self.handle.shared.meta.lock().bitfield = Some(bitfield);
        if interesting {
            self.mark_interesting();
            self.request_more();
        }
        self.disconnect_if_mutual_seeds()
    }

    fn handle_have_none(&mut self) -> Result<Next, PeerError> {
        if self.bitfield_received {
            return Err(PeerError::Protocol("have-none after bitfield".into()));
        }
        self.bitfield_received = true;
        if let Some(meta) = self.coordinator.metainfo() {
            self.handle.shared.meta.lock().bitfield = Some(Bitfield::new(meta.piece_count()));
        }
        Ok(Next::Continue)
    }

    /// Both sides seeding: nothing to trade, free the slots.
    fn disconnect_if_mutual_seeds(&self) -> Result<Next, PeerError> {
        if self.coordinator.is_complete() && self.handle.shared.is_seed() {
            debug!(key = ?self.key(), "seed-to-seed connection, dropping");
            return Ok(Next::Stop);
        }
        Ok(Next::Continue)
    }

    fn handle_request(&mut self, piece: u32, offset: u32, length: u32) -> Result<Next, PeerError> {
        let fast = self.handle.shared.fast_extension;
        let Some(storage) = self.coordinator.storage() else {
            if fast {
                self.handle.queue.send(Message::Reject {
                    piece,
                    offset,
                    length,
                });
            }
            return Ok(Next::Continue);
        };
        let meta = storage.metainfo();
        if length == 0
            || length > self.ctx.config.max_request_length
            || piece >= meta.piece_count()
            || offset as u64 + length as u64 > meta.piece_size(piece) as u64
        {
            return Err(PeerError::Protocol(format!(
                "bad request {}/{}/{}",
                piece, offset, length
            )));
        }
        if !storage.has_piece(piece) {
            // Not necessarily malice: a completion re-check may have taken
            // the piece away after our earlier HAVE.
            debug!(piece, "request for piece we lack");
            if fast {
                self.handle.queue.send(Message::Reject {
                    piece,
                    offset,
                    length,
                });
            }
            return Ok(Next::Continue);
        }
        let choking = self.handle.is_choking();
        if choking && !(fast && self.allowed_fast_sent.contains(&piece)) {
            if fast {
                self.handle.queue.send(Message::Reject {
                    piece,
                    offset,
                    length,
                });
            }
            return Ok(Next::Continue);
        }
        let queued = self.handle.queue.queued_piece_bytes();
        if queued + length as usize > self.ctx.config.max_queued_bytes {
            // A flooding peer loses the request, not the connection; it can
            // re-ask once its queue drains.
            debug!(piece, queued, "outbound queue full, discarding request");
            if fast {
                self.handle.queue.send(Message::Reject {
                    piece,
                    offset,
                    length,
                });
            }
            return Ok(Next::Continue);
        }
        self.handle.queue.queue_piece(piece, offset, length);
        Ok(Next::Continue)
    }

    async fn handle_piece(
        &mut self,
        piece: u32,
        offset: u32,
        data: Bytes,
    ) -> Result<Next, PeerError> {
        let length = data.len() as u32;
        let Some(idx) = self
            .outstanding
            .iter()
            .position(|r| r.matches(piece, offset, length))
        else {
            // Lingering in-flight data after a choke cleared our requests.
            debug!(piece, offset, "piece data without matching request");
            return Ok(Next::Continue);
        };

        // Requests the remote skipped over are considered dropped; rewind
        // their pieces so the chunks get asked for again.
        let skipped: Vec<Request> = self.outstanding.drain(..idx).collect();
        self.outstanding.pop_front();
        for dropped in &skipped {
            trace!(piece = dropped.piece, offset = dropped.offset, "request skipped by remote");
            if let Some(partial) = self.partials.iter_mut().find(|p| p.piece() == dropped.piece) {
                partial.reset_requested();
            }
        }
        // Later in-flight entries for a rewound piece would duplicate the
        // re-issued requests.
        self.outstanding
            .retain(|r| !skipped.iter().any(|s| s.piece == r.piece));

        self.coordinator.add_downloaded(length as u64);
        self.handle.shared.counters.add_downloaded(length as u64);

        let Some(pos) = self.partials.iter().position(|p| p.piece() == piece) else {
            debug!(piece, "piece data for a piece we no longer track");
            return Ok(Next::Continue);
        };
        if self.partials[pos].downloaded() != offset {
            // Buffers fill strictly in order; this chunk arrived ahead of a
            // gap, so rewind and re-request.
            self.partials[pos].reset_requested();
            self.outstanding.retain(|r| r.piece != piece);
            self.request_more();
            return Ok(Next::Continue);
        }
        let complete = self.partials[pos].put_chunk(offset, &data)?;
        if complete {
            let partial = self.partials.swap_remove(pos);
            self.coordinator.got_piece(self.key(), partial).await?;
        }
        self.request_more();
        Ok(Next::Continue)
    }

    fn handle_reject(&mut self, piece: u32, offset: u32, length: u32) -> Result<Next, PeerError> {
        let Some(idx) = self
            .outstanding
            .iter()
            .position(|r| r.matches(piece, offset, length))
        else {
            return Ok(Next::Continue);
        };
        self.outstanding.remove(idx);
        // Hand the whole partial back; selection will route it to a more
        // willing peer (possibly us again, later).
        if let Some(pos) = self.partials.iter().position(|p| p.piece() == piece) {
            let mut partial = self.partials.swap_remove(pos);
            partial.reset_requested();
            self.outstanding.retain(|r| r.piece != piece);
            self.coordinator.save_partials(self.key(), vec![partial]);
        }
        self.request_more();
        Ok(Next::Continue)
    }

    /// Keeps the outbound pipeline full, pulling new partial pieces from
    /// the coordinator as the current ones are fully on the wire.
    fn request_more(&mut self) {
        if self.handle.shared.meta.lock().they_choke {
            return;
        }
        let chunk = self.ctx.config.chunk_size;
        while self.outstanding.len() < self.ctx.config.pipeline_depth {
            if let Some((piece, offset, length)) = self.next_chunk(chunk) {
                self.handle.queue.send_request(piece, offset, length);
                self.outstanding.push_back(Request::new(piece, offset, length));
            } else if let Some(partial) = self.coordinator.next_partial(self.key()) {
                self.partials.push(partial);
            } else {
                break;
            }
        }
        if self.outstanding.is_empty() && self.partials.is_empty() {
            let dropped = {
                let mut meta = self.handle.shared.meta.lock();
                std::mem::replace(&mut meta.interesting, false)
            };
            if dropped {
                self.handle.queue.send_interest(false);
            }
        }
    }

    fn next_chunk(&mut self, chunk: u32) -> Option<(u32, u32, u32)> {
        for partial in &mut self.partials {
            if let Some((offset, length)) = partial.next_request(chunk) {
                return Some((partial.piece(), offset, length));
            }
        }
        None
    }

    fn mark_interesting(&self) {
        let send = {
            let mut meta = self.handle.shared.meta.lock();
            !std::mem::replace(&mut meta.interesting, true)
        };
        if send {
            self.handle.queue.send_interest(true);
        }
    }

    /// Resends requests that have gone unanswered too long.
    fn retransmit(&mut self) {
        let ttl = self.ctx.config.request_ttl;
        let mut resent = 0;
        for request in &mut self.outstanding {
            if request.sent_at.elapsed() >= ttl {
                self.handle
                    .queue
                    .send_request(request.piece, request.offset, request.length);
                request.sent_at = std::time::Instant::now();
                resent += 1;
            }
        }
        if resent > 0 {
            warn!(key = ?self.handle.key(), resent, "retransmitted stale requests");
        }
    }

    /// Hands every partially downloaded piece back to the coordinator.
    fn return_partials(&mut self) {
        self.outstanding.clear();
        if self.partials.is_empty() {
            return;
        }
        let mut partials = std::mem::take(&mut self.partials);
        for partial in &mut partials {
            partial.reset_requested();
        }
        self.coordinator.save_partials(self.key(), partials);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, Value};
    use crate::config::EngineConfig;
    use crate::coordinator::EngineListener;
    use crate::metainfo::Metainfo;
    use crate::peer::conn::PeerShared;
    use crate::peer::{PeerId, PeerKey, SendQueue};
    use crate::storage::StorageListener;
    use sha1::{Digest, Sha1};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Quiet;
    impl StorageListener for Quiet {}
    impl EngineListener for Quiet {}

    fn make_meta(piece_length: usize, payload: &[u8]) -> Arc<Metainfo> {
        let mut hashes = Vec::new();
        for chunk in payload.chunks(piece_length) {
            hashes.extend_from_slice(&Sha1::digest(chunk));
        }
        let mut info = BTreeMap::new();
        info.insert(Bytes::from_static(b"name"), Value::string("reader"));
        info.insert(
            Bytes::from_static(b"length"),
            Value::Integer(payload.len() as i64),
        );
        info.insert(
            Bytes::from_static(b"piece length"),
            Value::Integer(piece_length as i64),
        );
        info.insert(Bytes::from_static(b"pieces"), Value::Bytes(Bytes::from(hashes)));
        let encoded = bencode::encode(&Value::Dict(info));
        Arc::new(Metainfo::from_info_bytes(&encoded).unwrap())
    }

    async fn reader_fixture(
        config: EngineConfig,
        piece_length: usize,
        payload: &[u8],
    ) -> (
        PeerReader<tokio::io::DuplexStream>,
        Arc<PeerCoordinator>,
        PeerHandle,
        TempDir,
    ) {
        let dir = TempDir::new().unwrap();
        let ctx = EngineContext::new(config, PeerId::generate());
        let meta = make_meta(piece_length, payload);
        let coordinator = PeerCoordinator::new(
            ctx.clone(),
            meta,
            dir.path().to_path_buf(),
            Arc::new(Quiet),
        );
        coordinator.start().await.unwrap();
        let handle = PeerHandle {
            shared: PeerShared::new(PeerKey(1), PeerId::generate(), false, false),
            queue: Arc::new(SendQueue::new()),
        };
        let (io, _remote) = tokio::io::duplex(64);
        let reader = PeerReader::new(
            ctx,
            coordinator.clone(),
            handle.clone(),
            FrameReader::new(io),
            HashSet::new(),
        );
        (reader, coordinator, handle, dir)
    }

    #[tokio::test]
    async fn test_out_of_order_chunk_does_not_duplicate_outstanding() {
        let payload = vec![7u8; 48];
        let config = EngineConfig {
            chunk_size: 16,
            pipeline_depth: 4,
            ..EngineConfig::default()
        };
        let (mut reader, coordinator, handle, _dir) =
            reader_fixture(config, 48, &payload).await;

        handle.shared.meta.lock().they_choke = false;
        coordinator.got_have(PeerKey(1), 0);
        reader.request_more();
        assert_eq!(reader.outstanding.len(), 3);

        // The chunk at offset 16 lands while offset 0 is still in flight,
        // so the whole piece rewinds and its chunks go out again.
        let message = Message::Piece {
            piece: 0,
            offset: 16,
            data: Bytes::from(vec![7u8; 16]),
        };
        reader.handle_message(message).await.unwrap();

        let triples: HashSet<(u32, u32, u32)> = reader
            .outstanding
            .iter()
            .map(|r| (r.piece, r.offset, r.length))
            .collect();
        assert_eq!(reader.outstanding.len(), 3);
        assert_eq!(triples.len(), 3, "no duplicate in-flight requests");
    }

    #[tokio::test]
    async fn test_request_flood_discarded_without_disconnect() {
        let payload = vec![3u8; 48];
        let config = EngineConfig {
            chunk_size: 16,
            max_queued_bytes: 24,
            ..EngineConfig::default()
        };
        let (mut reader, coordinator, handle, _dir) =
            reader_fixture(config, 48, &payload).await;
        coordinator
            .storage()
            .unwrap()
            .put_piece(0, Bytes::from(payload.clone()))
            .await
            .unwrap();
        handle.unchoke();

        assert!(reader.handle_request(0, 0, 16).is_ok());
        // Second request would exceed the queue cap: dropped, not fatal.
        assert!(reader.handle_request(0, 16, 16).is_ok());
        assert_eq!(handle.queue.queued_piece_bytes(), 16);
    }
}
