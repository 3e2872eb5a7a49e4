//! Allowed-fast set generation ([BEP-6]).
//!
//! The allowed-fast set is the handful of pieces we will serve to a peer
//! even while choking it, so a fresh peer can bootstrap something to trade.
//! BEP-6 derives the set from the peer's masked IP; the transport substrate
//! here is address-agnostic, so the remote peer id stands in as the
//! per-peer ingredient. Both ends of a connection do not need to agree on
//! the set: each side honors whatever it announced.
//!
//! [BEP-6]: http://bittorrent.org/beps/bep_0006.html

use crate::metainfo::InfoHash;
use crate::peer::PeerId;
use sha1::{Digest, Sha1};

/// Derives `count` distinct allowed-fast piece indices for one peer.
pub fn allowed_fast_set(
    info_hash: &InfoHash,
    peer_id: &PeerId,
    piece_count: u32,
    count: usize,
) -> Vec<u32> {
    if piece_count == 0 {
        return Vec::new();
    }
    let count = count.min(piece_count as usize);
    let mut set = Vec::with_capacity(count);

    let mut hasher = Sha1::new();
    hasher.update(peer_id.as_bytes());
    hasher.update(info_hash.as_bytes());
    let mut x: [u8; 20] = hasher.finalize().into();

    while set.len() < count {
        for chunk in x.chunks_exact(4) {
            let index = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) % piece_count;
            if !set.contains(&index) {
                set.push(index);
                if set.len() == count {
                    break;
                }
            }
        }
        x = Sha1::digest(x).into();
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_is_deterministic_and_distinct() {
        let info_hash = InfoHash::new([0x11; 20]);
        let peer = PeerId::from_bytes([0x22; 20]);

        let a = allowed_fast_set(&info_hash, &peer, 1000, 10);
        let b = allowed_fast_set(&info_hash, &peer, 1000, 10);
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
        for (i, x) in a.iter().enumerate() {
            assert!(*x < 1000);
            assert!(!a[i + 1..].contains(x));
        }
    }

    #[test]
    fn test_set_differs_per_peer() {
        let info_hash = InfoHash::new([0x11; 20]);
        let a = allowed_fast_set(&info_hash, &PeerId::from_bytes([1; 20]), 1000, 10);
        let b = allowed_fast_set(&info_hash, &PeerId::from_bytes([2; 20]), 1000, 10);
        assert_ne!(a, b);
    }

    #[test]
    fn test_small_torrent_caps_count() {
        let info_hash = InfoHash::new([0x11; 20]);
        let set = allowed_fast_set(&info_hash, &PeerId::from_bytes([1; 20]), 4, 10);
        assert_eq!(set.len(), 4);
        assert_eq!(allowed_fast_set(&info_hash, &PeerId::from_bytes([1; 20]), 0, 10), vec![]);
    }
}
