use crate::bencode::BencodeError;
use crate::metainfo::MetainfoError;
use crate::storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid handshake")]
    InvalidHandshake,

    #[error("info hash mismatch")]
    InfoHashMismatch,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timeout")]
    Timeout,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("connection refused: {0}")]
    Refused(&'static str),

    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("metainfo error: {0}")]
    Metainfo(#[from] MetainfoError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
