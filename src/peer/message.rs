//! Peer wire messages ([BEP-3]), the fast extension ([BEP-6]), and the
//! extension-protocol envelope ([BEP-10]).
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html
//! [BEP-6]: http://bittorrent.org/beps/bep_0006.html
//! [BEP-10]: http://bittorrent.org/beps/bep_0010.html

use crate::metainfo::InfoHash;
use crate::peer::{PeerError, PeerId};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// Total handshake length: 1 + 19 + 8 + 20 + 20.
pub const HANDSHAKE_LEN: usize = 68;

// Reserved-byte capability bits.
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;
const FAST_BYTE: usize = 7;
const FAST_BIT: u8 = 0x04;
const DHT_BYTE: usize = 7;
const DHT_BIT: u8 = 0x01;

/// The 68-byte connection preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub reserved: [u8; 8],
}

impl Handshake {
    /// Builds our outgoing handshake, advertising the extension protocol
    /// and the fast extension.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        reserved[FAST_BYTE] |= FAST_BIT;
        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }

    pub fn supports_fast(&self) -> bool {
        self.reserved[FAST_BYTE] & FAST_BIT != 0
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved[DHT_BYTE] & DHT_BIT != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(self.info_hash.as_bytes());
        buf.put_slice(self.peer_id.as_bytes());
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() != HANDSHAKE_LEN
            || data[0] as usize != PROTOCOL.len()
            || &data[1..20] != PROTOCOL
        {
            return Err(PeerError::InvalidHandshake);
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);
        Ok(Self {
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::from_bytes(peer_id),
            reserved,
        })
    }
}

mod id {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
    pub const PORT: u8 = 9;
    pub const SUGGEST: u8 = 13;
    pub const HAVE_ALL: u8 = 14;
    pub const HAVE_NONE: u8 = 15;
    pub const REJECT: u8 = 16;
    pub const ALLOWED_FAST: u8 = 17;
    pub const EXTENDED: u8 = 20;
}

/// One length-prefixed wire message. `encode` includes the 4-byte length
/// prefix; `decode` takes the frame body with the prefix already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request {
        piece: u32,
        offset: u32,
        length: u32,
    },
    Piece {
        piece: u32,
        offset: u32,
        data: Bytes,
    },
    Cancel {
        piece: u32,
        offset: u32,
        length: u32,
    },
    Port(u16),
    Suggest(u32),
    HaveAll,
    HaveNone,
    Reject {
        piece: u32,
        offset: u32,
        length: u32,
    },
    AllowedFast(u32),
    Extended {
        id: u8,
        payload: Bytes,
    },
}

impl Message {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len() + 4);
        buf.put_u32(self.encoded_len() as u32);
        match self {
            Message::KeepAlive => {}
            Message::Choke => buf.put_u8(id::CHOKE),
            Message::Unchoke => buf.put_u8(id::UNCHOKE),
            Message::Interested => buf.put_u8(id::INTERESTED),
            Message::NotInterested => buf.put_u8(id::NOT_INTERESTED),
            Message::Have(piece) => {
                buf.put_u8(id::HAVE);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                buf.put_u8(id::BITFIELD);
                buf.put_slice(bits);
            }
            Message::Request {
                piece,
                offset,
                length,
            } => {
                buf.put_u8(id::REQUEST);
                buf.put_u32(*piece);
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            Message::Piece {
                piece,
                offset,
                data,
            } => {
                buf.put_u8(id::PIECE);
                buf.put_u32(*piece);
                buf.put_u32(*offset);
                buf.put_slice(data);
            }
            Message::Cancel {
                piece,
                offset,
                length,
            } => {
                buf.put_u8(id::CANCEL);
                buf.put_u32(*piece);
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            Message::Port(port) => {
                buf.put_u8(id::PORT);
                buf.put_u16(*port);
            }
            Message::Suggest(piece) => {
                buf.put_u8(id::SUGGEST);
                buf.put_u32(*piece);
            }
            Message::HaveAll => buf.put_u8(id::HAVE_ALL),
            Message::HaveNone => buf.put_u8(id::HAVE_NONE),
            Message::Reject {
                piece,
                offset,
                length,
            } => {
                buf.put_u8(id::REJECT);
                buf.put_u32(*piece);
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            Message::AllowedFast(piece) => {
                buf.put_u8(id::ALLOWED_FAST);
                buf.put_u32(*piece);
            }
            Message::Extended { id: ext, payload } => {
                buf.put_u8(id::EXTENDED);
                buf.put_u8(*ext);
                buf.put_slice(payload);
            }
        }
        buf.freeze()
    }

    fn encoded_len(&self) -> usize {
        match self {
            Message::KeepAlive => 0,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::HaveAll
            | Message::HaveNone => 1,
            Message::Have(_) | Message::Suggest(_) | Message::AllowedFast(_) => 5,
            Message::Bitfield(bits) => 1 + bits.len(),
            Message::Request { .. } | Message::Cancel { .. } | Message::Reject { .. } => 13,
            Message::Piece { data, .. } => 9 + data.len(),
            Message::Port(_) => 3,
            Message::Extended { payload, .. } => 2 + payload.len(),
        }
    }

    /// Decodes one frame body (length prefix already consumed).
    pub fn decode(mut frame: Bytes) -> Result<Self, PeerError> {
        if frame.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let msg_id = frame.get_u8();
        let body_len = frame.len();
        let need = move |n: usize| -> Result<(), PeerError> {
            if body_len < n {
                Err(PeerError::InvalidMessage(format!(
                    "message {} truncated",
                    msg_id
                )))
            } else {
                Ok(())
            }
        };
        let msg = match msg_id {
            id::CHOKE => Message::Choke,
            id::UNCHOKE => Message::Unchoke,
            id::INTERESTED => Message::Interested,
            id::NOT_INTERESTED => Message::NotInterested,
            id::HAVE => {
                need(4)?;
                Message::Have(frame.get_u32())
            }
            id::BITFIELD => Message::Bitfield(frame),
            id::REQUEST => {
                need(12)?;
                Message::Request {
                    piece: frame.get_u32(),
                    offset: frame.get_u32(),
                    length: frame.get_u32(),
                }
            }
            id::PIECE => {
                need(8)?;
                Message::Piece {
                    piece: frame.get_u32(),
                    offset: frame.get_u32(),
                    data: frame,
                }
            }
            id::CANCEL => {
                need(12)?;
                Message::Cancel {
                    piece: frame.get_u32(),
                    offset: frame.get_u32(),
                    length: frame.get_u32(),
                }
            }
            id::PORT => {
                need(2)?;
                Message::Port(frame.get_u16())
            }
            id::SUGGEST => {
                need(4)?;
                Message::Suggest(frame.get_u32())
            }
            id::HAVE_ALL => Message::HaveAll,
            id::HAVE_NONE => Message::HaveNone,
            id::REJECT => {
                need(12)?;
                Message::Reject {
                    piece: frame.get_u32(),
                    offset: frame.get_u32(),
                    length: frame.get_u32(),
                }
            }
            id::ALLOWED_FAST => {
                need(4)?;
                Message::AllowedFast(frame.get_u32())
            }
            id::EXTENDED => {
                need(1)?;
                Message::Extended {
                    id: frame.get_u8(),
                    payload: frame,
                }
            }
            other => return Err(PeerError::UnknownMessageId(other)),
        };
        Ok(msg)
    }

    /// True for the fast-extension message ids, which both sides must have
    /// negotiated before use.
    pub fn is_fast(&self) -> bool {
        matches!(
            self,
            Message::Suggest(_)
                | Message::HaveAll
                | Message::HaveNone
                | Message::Reject { .. }
                | Message::AllowedFast(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_roundtrip() {
        let hs = Handshake::new(InfoHash::new([0xaa; 20]), PeerId::generate());
        let encoded = hs.encode();
        assert_eq!(encoded.len(), HANDSHAKE_LEN);
        let decoded = Handshake::decode(&encoded).unwrap();
        assert_eq!(decoded, hs);
        assert!(decoded.supports_extensions());
        assert!(decoded.supports_fast());
        assert!(!decoded.supports_dht());
    }

    #[test]
    fn test_handshake_rejects_wrong_protocol() {
        let mut encoded = BytesMut::from(
            &Handshake::new(InfoHash::new([0; 20]), PeerId::generate()).encode()[..],
        );
        encoded[1] = b'X';
        assert!(Handshake::decode(&encoded).is_err());
        assert!(Handshake::decode(&encoded[..67]).is_err());
    }

    #[test]
    fn test_message_roundtrip() {
        let messages = vec![
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have(42),
            Message::Bitfield(Bytes::from_static(&[0xf0, 0x01])),
            Message::Request {
                piece: 1,
                offset: 16384,
                length: 16384,
            },
            Message::Piece {
                piece: 2,
                offset: 0,
                data: Bytes::from_static(b"data"),
            },
            Message::Cancel {
                piece: 1,
                offset: 16384,
                length: 16384,
            },
            Message::Port(6881),
            Message::Suggest(3),
            Message::HaveAll,
            Message::HaveNone,
            Message::Reject {
                piece: 4,
                offset: 0,
                length: 16384,
            },
            Message::AllowedFast(5),
            Message::Extended {
                id: 0,
                payload: Bytes::from_static(b"d1:md2:ab"),
            },
        ];
        for msg in messages {
            let mut encoded = msg.encode();
            let len = encoded.get_u32() as usize;
            assert_eq!(len, encoded.len());
            assert_eq!(Message::decode(encoded).unwrap(), msg);
        }
    }

    #[test]
    fn test_decode_rejects_truncated() {
        assert!(Message::decode(Bytes::from_static(&[id::HAVE, 0, 0])).is_err());
        assert!(Message::decode(Bytes::from_static(&[id::REQUEST, 0, 0, 0, 1])).is_err());
        assert!(Message::decode(Bytes::from_static(&[id::PIECE, 0, 0, 0, 1])).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_id() {
        assert!(matches!(
            Message::decode(Bytes::from_static(&[99])),
            Err(PeerError::UnknownMessageId(99))
        ));
    }
}
