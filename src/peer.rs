//! Peer wire protocol and per-connection machinery.
//!
//! One connected peer is three cooperating pieces: a [`conn`] reader task
//! that owns the inbound half and the request [`state`] machine, a
//! [`queue`] writer task that owns the outbound half and performs deferred
//! piece loads, and the shared bookkeeping both sides and the coordinator
//! look at. The [`choking`] pass runs separately on the coordinator's
//! schedule.

pub mod bitfield;
pub mod choking;
pub mod conn;
pub mod error;
pub mod extension;
pub mod fast;
pub mod message;
pub mod metadata;
pub mod peer_id;
pub mod piece;
pub mod queue;
pub mod state;
pub mod transport;

pub use bitfield::Bitfield;
pub use conn::{PeerHandle, PeerKey, SwarmPeer};
pub use error::PeerError;
pub use message::{Handshake, Message};
pub use peer_id::PeerId;
pub use piece::{PartialPiece, Piece, Request};
pub use queue::{DataLoader, SendQueue};

#[cfg(test)]
mod tests;
