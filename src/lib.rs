//! snarl - a BitTorrent peer engine
//!
//! The engine covers everything between an established byte stream and the
//! disk: handshakes, the peer wire protocol, piece selection, choking,
//! verified storage, magnet metadata exchange, PEX, and web seeding. Peer
//! discovery and the transport that produces connections are the
//! embedder's job; hand each accepted or dialed stream to
//! [`peer::conn::run_peer`] and the engine does the rest.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 bencode encoding/decoding
//! - [`metainfo`] - BEP-3 torrent metainfo and info hashes
//! - [`peer`] - BEP-3/6/9/10 peer wire protocol, fast extension,
//!   extension protocol, metadata exchange
//! - [`coordinator`] - swarm-wide piece selection and progress
//! - [`storage`] - verified disk I/O and file management
//! - [`pex`] - BEP-11 peer exchange
//! - [`webseed`] - HTTP web seeding
//! - [`bandwidth`] - transfer-rate accounting for the choker
//! - [`config`] - engine configuration and shared context

pub mod bandwidth;
pub mod bencode;
pub mod config;
pub mod coordinator;
pub mod metainfo;
pub mod peer;
pub mod pex;
pub mod storage;
pub mod webseed;

pub use bencode::{decode, encode, BencodeError, Value};
pub use config::{EngineConfig, EngineContext};
pub use coordinator::{EngineListener, PeerCoordinator};
pub use metainfo::{FileSpec, InfoHash, Metainfo, MetainfoError};
pub use peer::{
    Bitfield, Handshake, Message, PartialPiece, PeerError, PeerHandle, PeerId, PeerKey, SwarmPeer,
};
pub use pex::{PexFlags, PexMessage};
pub use storage::{PutResult, StorageError, StorageListener, TorrentStorage};
pub use webseed::{WebSeed, WebSeedHandle};
