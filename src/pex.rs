//! Peer Exchange ([BEP-11]): gossiping known swarm members over the
//! extension protocol.
//!
//! A ut_pex message is a bencoded dict with compact address lists: 6 bytes
//! per IPv4 peer under `added`/`dropped`, 18 bytes per IPv6 peer under
//! `added6`/`dropped6`, and one flag byte per added peer under `added.f`.
//!
//! [BEP-11]: http://bittorrent.org/beps/bep_0011.html

use crate::bencode::Value;
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Per-peer capability flags carried alongside `added` entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PexFlags {
    pub encryption: bool,
    pub seed: bool,
    pub connectable: bool,
}

impl PexFlags {
    const ENCRYPTION: u8 = 0x01;
    const SEED: u8 = 0x02;
    const CONNECTABLE: u8 = 0x10;

    pub fn from_byte(b: u8) -> Self {
        Self {
            encryption: b & Self::ENCRYPTION != 0,
            seed: b & Self::SEED != 0,
            connectable: b & Self::CONNECTABLE != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut b = 0;
        if self.encryption {
            b |= Self::ENCRYPTION;
        }
        if self.seed {
            b |= Self::SEED;
        }
        if self.connectable {
            b |= Self::CONNECTABLE;
        }
        b
    }
}

/// One ut_pex payload, in both directions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PexMessage {
    pub added: Vec<(SocketAddr, PexFlags)>,
    pub dropped: Vec<SocketAddr>,
}

impl PexMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, addr: SocketAddr, flags: PexFlags) {
        self.added.push((addr, flags));
    }

    pub fn drop_peer(&mut self, addr: SocketAddr) {
        self.dropped.push(addr);
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.dropped.is_empty()
    }

    /// Encodes into the ut_pex dict.
    pub fn to_value(&self) -> Value {
        let mut added4 = BytesMut::new();
        let mut flags4 = BytesMut::new();
        let mut added6 = BytesMut::new();
        let mut flags6 = BytesMut::new();
        for (addr, flags) in &self.added {
            match addr {
                SocketAddr::V4(a) => {
                    added4.put_slice(&a.ip().octets());
                    added4.put_u16(a.port());
                    flags4.put_u8(flags.to_byte());
                }
                SocketAddr::V6(a) => {
                    added6.put_slice(&a.ip().octets());
                    added6.put_u16(a.port());
                    flags6.put_u8(flags.to_byte());
                }
            }
        }
        let mut dropped4 = BytesMut::new();
        let mut dropped6 = BytesMut::new();
        for addr in &self.dropped {
            match addr {
                SocketAddr::V4(a) => {
                    dropped4.put_slice(&a.ip().octets());
                    dropped4.put_u16(a.port());
                }
                SocketAddr::V6(a) => {
                    dropped6.put_slice(&a.ip().octets());
                    dropped6.put_u16(a.port());
                }
            }
        }

        let mut dict = Value::dict();
        dict.insert(b"added", added4.freeze());
        dict.insert(b"added.f", flags4.freeze());
        if !added6.is_empty() {
            dict.insert(b"added6", added6.freeze());
            dict.insert(b"added6.f", flags6.freeze());
        }
        if !dropped4.is_empty() {
            dict.insert(b"dropped", dropped4.freeze());
        }
        if !dropped6.is_empty() {
            dict.insert(b"dropped6", dropped6.freeze());
        }
        dict
    }

    /// Decodes a received ut_pex dict. Unknown keys are ignored; truncated
    /// trailing entries are dropped.
    pub fn from_value(value: &Value) -> Self {
        let field = |key: &[u8]| -> Bytes {
            value
                .get(key)
                .and_then(|v| v.as_bytes())
                .cloned()
                .unwrap_or_default()
        };
        let mut message = Self::new();

        let added = field(b"added");
        let flags = field(b"added.f");
        for (i, entry) in added.chunks_exact(6).enumerate() {
            let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
            let port = u16::from_be_bytes([entry[4], entry[5]]);
            let f = flags.get(i).copied().map(PexFlags::from_byte).unwrap_or_default();
            message.add(SocketAddr::V4(SocketAddrV4::new(ip, port)), f);
        }

        let added6 = field(b"added6");
        let flags6 = field(b"added6.f");
        for (i, entry) in added6.chunks_exact(18).enumerate() {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&entry[..16]);
            let port = u16::from_be_bytes([entry[16], entry[17]]);
            let f = flags6.get(i).copied().map(PexFlags::from_byte).unwrap_or_default();
            message.add(
                SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0)),
                f,
            );
        }

        for entry in field(b"dropped").chunks_exact(6) {
            let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
            let port = u16::from_be_bytes([entry[4], entry[5]]);
            message.drop_peer(SocketAddr::V4(SocketAddrV4::new(ip, port)));
        }
        for entry in field(b"dropped6").chunks_exact(18) {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&entry[..16]);
            let port = u16::from_be_bytes([entry[16], entry[17]]);
            message.drop_peer(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                0,
                0,
            )));
        }
        message
    }
}
