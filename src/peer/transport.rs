//! Framed message transport over an arbitrary byte stream.
//!
//! The engine does not open sockets itself; callers hand it anything
//! implementing `AsyncRead + AsyncWrite` (a TCP stream, a tunnel, an
//! in-memory duplex in tests). The stream is split once at connection setup
//! into a [`FrameReader`] owned by the reader task and a [`FrameWriter`]
//! owned by the writer task.

use crate::peer::message::{Handshake, Message, HANDSHAKE_LEN};
use crate::peer::PeerError;
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Upper bound on one frame body. A piece message carries at most 64 KiB of
/// payload, but a bitfield for a very large torrent can run to hundreds of
/// kilobytes.
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Inbound half: buffers stream bytes and yields whole frames.
pub struct FrameReader<R> {
    io: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    /// Reads the 68-byte handshake, bounding the wait.
    pub async fn read_handshake(&mut self, limit: Duration) -> Result<Handshake, PeerError> {
        timeout(limit, self.fill(HANDSHAKE_LEN))
            .await
            .map_err(|_| PeerError::Timeout)??;
        let raw = self.buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&raw)
    }

    /// Reads the next message, waiting up to `idle` for it to start
    /// arriving. Keepalives come back as [`Message::KeepAlive`].
    pub async fn next_message(&mut self, idle: Duration) -> Result<Message, PeerError> {
        timeout(idle, self.fill(4))
            .await
            .map_err(|_| PeerError::Timeout)??;
        let len = (&self.buf[..4]).get_u32() as usize;
        if len > MAX_FRAME_SIZE {
            return Err(PeerError::MessageTooLarge(len));
        }
        // The body gets a fresh (shorter) deadline once the prefix is here.
        timeout(idle, self.fill(4 + len))
            .await
            .map_err(|_| PeerError::Timeout)??;
        self.buf.advance(4);
        let frame = self.buf.split_to(len).freeze();
        Message::decode(frame)
    }

    async fn fill(&mut self, needed: usize) -> Result<(), PeerError> {
        while self.buf.len() < needed {
            let n = self.io.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }
        Ok(())
    }
}

/// Outbound half: writes handshakes and messages, each under a deadline.
pub struct FrameWriter<W> {
    io: W,
    write_timeout: Duration,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(io: W, write_timeout: Duration) -> Self {
        Self { io, write_timeout }
    }

    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        self.write_all(&handshake.encode()).await
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        self.write_all(&message.encode()).await
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), PeerError> {
        timeout(self.write_timeout, async {
            self.io.write_all(data).await?;
            self.io.flush().await
        })
        .await
        .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.io.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::InfoHash;
    use crate::peer::PeerId;

    const IDLE: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_handshake_and_messages_over_duplex() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, client_write) = tokio::io::split(client);

        let mut writer = FrameWriter::new(client_write, IDLE);
        let mut reader = FrameReader::new(server_read);

        let hs = Handshake::new(InfoHash::new([7; 20]), PeerId::generate());
        writer.send_handshake(&hs).await.unwrap();
        writer.send(&Message::Have(3)).await.unwrap();
        writer.send(&Message::KeepAlive).await.unwrap();
        writer.send(&Message::Unchoke).await.unwrap();

        assert_eq!(reader.read_handshake(IDLE).await.unwrap(), hs);
        assert_eq!(reader.next_message(IDLE).await.unwrap(), Message::Have(3));
        assert_eq!(reader.next_message(IDLE).await.unwrap(), Message::KeepAlive);
        assert_eq!(reader.next_message(IDLE).await.unwrap(), Message::Unchoke);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, _keep) = tokio::io::split(server);
        let (_client_read, mut client_write) = tokio::io::split(client);

        client_write
            .write_all(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes())
            .await
            .unwrap();

        let mut reader = FrameReader::new(server_read);
        assert!(matches!(
            reader.next_message(IDLE).await,
            Err(PeerError::MessageTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_stream_reports_eof() {
        let (client, server) = tokio::io::duplex(1024);
        drop(client);
        let (server_read, _server_write) = tokio::io::split(server);
        let mut reader = FrameReader::new(server_read);
        assert!(matches!(
            reader.next_message(IDLE).await,
            Err(PeerError::ConnectionClosed)
        ));
    }
}
