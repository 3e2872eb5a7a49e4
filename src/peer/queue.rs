//! Outbound message queue and the writer task.
//!
//! The writer task is the only place socket writes happen, and the only
//! place piece data is loaded from disk: a queued piece message holds just
//! `(piece, offset, length)` until the moment it reaches the socket, so
//! slow disks stall one peer's writer instead of the reader path.
//!
//! Queue discipline:
//! - control messages go ahead of queued piece payloads
//! - a request already in the queue is not enqueued twice
//! - our queued requests are dropped when the peer chokes us
//! - queued pieces are dropped when we choke the peer, each converted to a
//!   reject when the fast extension is active
//! - a choke annihilates a queued unchoke instead of chasing it (and the
//!   same for the interest pair)

use crate::peer::conn::PeerCounters;
use crate::peer::message::Message;
use crate::peer::transport::FrameWriter;
use crate::peer::PeerError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::sync::Notify;
use tracing::trace;

/// Deferred-load seam between the writer task and storage. The loader runs
/// on the writer task only.
#[async_trait]
pub trait DataLoader: Send + Sync {
    /// Loads piece data for serving. `None` means the data is gone (piece
    /// re-checked away, storage shutting down); the writer rejects or skips.
    async fn load_data(&self, piece: u32, offset: u32, length: u32) -> Option<Bytes>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Control(Message),
    /// A piece response whose data has not been loaded yet.
    Piece { piece: u32, offset: u32, length: u32 },
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<Outgoing>,
    queued_piece_bytes: usize,
    fast_extension: bool,
    closed: bool,
}

/// Shared outbound queue for one peer connection.
pub struct SendQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    pub fn set_fast_extension(&self, enabled: bool) {
        self.inner.lock().fast_extension = enabled;
    }

    pub fn fast_extension(&self) -> bool {
        self.inner.lock().fast_extension
    }

    /// Enqueues a control message, ahead of any queued piece payloads.
    pub fn send(&self, message: Message) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        Self::push_control(&mut inner, message);
        drop(inner);
        self.notify.notify_one();
    }

    fn push_control(inner: &mut Inner, message: Message) {
        let pos = inner
            .queue
            .iter()
            .position(|m| matches!(m, Outgoing::Piece { .. }))
            .unwrap_or(inner.queue.len());
        inner.queue.insert(pos, Outgoing::Control(message));
    }

    /// Enqueues an outbound request unless an identical one is queued.
    pub fn send_request(&self, piece: u32, offset: u32, length: u32) {
        let request = Message::Request {
            piece,
            offset,
            length,
        };
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        let duplicate = inner
            .queue
            .iter()
            .any(|m| matches!(m, Outgoing::Control(q) if *q == request));
        if duplicate {
            trace!(piece, offset, length, "suppressing duplicate request");
            return;
        }
        Self::push_control(&mut inner, request);
        drop(inner);
        self.notify.notify_one();
    }

    /// Enqueues a choke. A still-queued unchoke is removed instead, and any
    /// queued piece payloads are dropped (as rejects when the fast
    /// extension is on).
    pub fn send_choke(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        let fast = inner.fast_extension;
        let mut rejects = Vec::new();
        inner.queue.retain(|m| match m {
            Outgoing::Piece {
                piece,
                offset,
                length,
            } => {
                rejects.push((*piece, *offset, *length));
                false
            }
            _ => true,
        });
        for (piece, offset, length) in rejects {
            inner.queued_piece_bytes -= length as usize;
            if fast {
                Self::push_control(
                    &mut inner,
                    Message::Reject {
                        piece,
                        offset,
                        length,
                    },
                );
            }
        }
        if !Self::remove_control(&mut inner, &Message::Unchoke) {
            Self::push_control(&mut inner, Message::Choke);
        }
        drop(inner);
        self.notify.notify_one();
    }

    pub fn send_unchoke(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        if !Self::remove_control(&mut inner, &Message::Choke) {
            Self::push_control(&mut inner, Message::Unchoke);
        }
        drop(inner);
        self.notify.notify_one();
    }

    pub fn send_interest(&self, interested: bool) {
        let (send, cancel) = if interested {
            (Message::Interested, Message::NotInterested)
        } else {
            (Message::NotInterested, Message::Interested)
        };
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        if !Self::remove_control(&mut inner, &cancel) {
            Self::push_control(&mut inner, send);
        }
        drop(inner);
        self.notify.notify_one();
    }

    fn remove_control(inner: &mut Inner, message: &Message) -> bool {
        if let Some(pos) = inner
            .queue
            .iter()
            .position(|m| matches!(m, Outgoing::Control(q) if q == message))
        {
            inner.queue.remove(pos);
            true
        } else {
            false
        }
    }

    /// Drops our queued requests; called when the peer chokes us.
    pub fn on_choked(&self) {
        let mut inner = self.inner.lock();
        inner
            .queue
            .retain(|m| !matches!(m, Outgoing::Control(Message::Request { .. })));
    }

    /// Queues a deferred piece response. Returns the queued payload bytes
    /// after the push so the caller can enforce the pipeline cap.
    pub fn queue_piece(&self, piece: u32, offset: u32, length: u32) -> usize {
        let mut inner = self.inner.lock();
        if inner.closed {
            return inner.queued_piece_bytes;
        }
        inner.queue.push_back(Outgoing::Piece {
            piece,
            offset,
            length,
        });
        inner.queued_piece_bytes += length as usize;
        let queued = inner.queued_piece_bytes;
        drop(inner);
        self.notify.notify_one();
        queued
    }

    /// Removes a queued piece response after a cancel. Returns whether one
    /// was still queued.
    pub fn cancel_piece(&self, piece: u32, offset: u32, length: u32) -> bool {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.queue.iter().position(|m| {
            matches!(m, Outgoing::Piece { piece: p, offset: o, length: l }
                if *p == piece && *o == offset && *l == length)
        }) {
            inner.queue.remove(pos);
            inner.queued_piece_bytes -= length as usize;
            true
        } else {
            false
        }
    }

    pub fn queued_piece_bytes(&self) -> usize {
        self.inner.lock().queued_piece_bytes
    }

    /// Enqueues a keepalive only when nothing else is waiting to go out.
    pub fn keepalive_if_idle(&self) {
        let mut inner = self.inner.lock();
        if inner.closed || !inner.queue.is_empty() {
            return;
        }
        inner.queue.push_back(Outgoing::Control(Message::KeepAlive));
        drop(inner);
        self.notify.notify_one();
    }

    /// Shuts the queue; the writer task drains out after the next pop.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Next message for the writer task; `None` once closed.
    pub async fn pop(&self) -> Option<Outgoing> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return None;
                }
                if let Some(item) = inner.queue.pop_front() {
                    if let Outgoing::Piece { length, .. } = item {
                        inner.queued_piece_bytes -= length as usize;
                    }
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    #[cfg(test)]
    fn drain(&self) -> Vec<Outgoing> {
        let mut inner = self.inner.lock();
        inner.queued_piece_bytes = 0;
        inner.queue.drain(..).collect()
    }
}

/// Writer task body: drains the queue into the socket, loading deferred
/// piece data on the way out.
pub async fn writer_loop<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    queue: Arc<SendQueue>,
    loader: Arc<dyn DataLoader>,
    counters: Arc<PeerCounters>,
) -> Result<(), PeerError> {
    while let Some(outgoing) = queue.pop().await {
        match outgoing {
            Outgoing::Control(message) => writer.send(&message).await?,
            Outgoing::Piece {
                piece,
                offset,
                length,
            } => match loader.load_data(piece, offset, length).await {
                Some(data) => {
                    writer
                        .send(&Message::Piece {
                            piece,
                            offset,
                            data,
                        })
                        .await?;
                    counters.add_uploaded(length as u64);
                }
                None => {
                    trace!(piece, offset, "piece data unavailable at send time");
                    if queue.fast_extension() {
                        writer
                            .send(&Message::Reject {
                                piece,
                                offset,
                                length,
                            })
                            .await?;
                    }
                }
            },
        }
    }
    writer.shutdown().await;
    Ok(())
}
