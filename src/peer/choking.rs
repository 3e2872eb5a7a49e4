//! The periodic choking pass and its slow-cadence side jobs.
//!
//! Every check period the coordinator rebuilds per-peer transfer rates,
//! decides who keeps an upload slot, and runs the low-frequency chores on
//! a modulo cadence: idle file-handle eviction every 2nd pass, PEX gossip
//! every 4th, comment requests every 8th. Keepalives go out every pass.
//!
//! Slot policy: while leeching, slots go to the peers feeding us fastest,
//! with peers that choke us while we want their data sorted last. While
//! seeding, slots follow the peer deque order; choked peers rotate to the
//! back, which round-robins the slots through the swarm. One slot is
//! reserved for a randomly picked leftover candidate, so a new peer always
//! has a chance to prove itself.

use crate::bandwidth::over_cap_choke_probability;
use crate::bencode;
use crate::coordinator::PeerCoordinator;
use crate::peer::conn::{PeerHandle, PeerKey};
use crate::peer::extension;
use crate::pex::{PexFlags, PexMessage};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, trace};

/// Rate-annotated snapshot of one peer, input to [`decide`].
#[derive(Debug, Clone)]
pub struct PeerView {
    pub key: PeerKey,
    pub interested: bool,
    /// We are currently choking them.
    pub choked: bool,
    pub upload_rate: u64,
    pub download_rate: u64,
    /// They choke us although we are interested.
    pub snubbing_us: bool,
}

/// What one choking pass wants changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Decisions {
    pub unchoke: Vec<PeerKey>,
    pub choke: Vec<PeerKey>,
}

/// Picks the upload-slot holders for the next period. Pure so it can be
/// tested with a seeded rng; `views` must be in the coordinator's deque
/// order, which carries the seeding round-robin.
pub fn decide<R: Rng>(
    views: &[PeerView],
    max_uploaders: usize,
    seeding: bool,
    shed_probability: f64,
    rng: &mut R,
) -> Decisions {
    let mut slots = max_uploaders.max(1);
    if shed_probability > 0.0 && rng.gen_bool(shed_probability.min(1.0)) {
        // Over the upload cap: give up one slot this period.
        slots = (slots - 1).max(1);
    }

    let mut candidates: Vec<&PeerView> = views.iter().filter(|v| v.interested).collect();
    if !seeding {
        candidates
            .sort_by_key(|v| (v.snubbing_us, std::cmp::Reverse(v.download_rate)));
    }

    let mut selected: Vec<PeerKey> = if candidates.len() <= slots {
        candidates.iter().map(|v| v.key).collect()
    } else if slots == 1 {
        vec![candidates[0].key]
    } else {
        // Reserve the last slot for a random leftover candidate.
        let regular = slots - 1;
        let mut selected: Vec<PeerKey> =
            candidates[..regular].iter().map(|v| v.key).collect();
        let optimistic = rng.gen_range(regular..candidates.len());
        selected.push(candidates[optimistic].key);
        selected
    };
    selected.dedup();

    let mut decisions = Decisions::default();
    for view in views {
        let keep = selected.contains(&view.key);
        match (view.choked, keep) {
            (true, true) => decisions.unchoke.push(view.key),
            (false, false) => decisions.choke.push(view.key),
            _ => {}
        }
    }
    decisions
}

/// Drives the periodic pass until the coordinator halts.
pub async fn run_checker(coordinator: Arc<PeerCoordinator>) {
    let mut interval = tokio::time::interval(coordinator.ctx.config.check_period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    while !coordinator.is_halted() {
        interval.tick().await;
        coordinator.run_periodic_pass();
    }
    debug!("checker stopped");
}

impl PeerCoordinator {
    /// One full periodic pass: rates, choking, rotation, and the cadenced
    /// chores. Also callable directly by tests and embedders that schedule
    /// their own timers.
    pub fn run_periodic_pass(&self) {
        if self.is_halted() {
            return;
        }
        let period = self.ctx.config.check_period;
        let seeding = self.is_complete();

        let (views, handles, run, upload_total) = {
            let mut state = self.state.lock();
            state.run += 1;
            let run = state.run;
            let mut views = Vec::with_capacity(state.peers.len());
            let mut handles = Vec::with_capacity(state.peers.len());
            let mut upload_total = 0u64;
            for entry in state.peers.iter_mut() {
                let uploaded = entry.handle.shared.counters.uploaded();
                let downloaded = entry.handle.shared.counters.downloaded();
                entry.up_history.push(uploaded - entry.last_uploaded);
                entry.down_history.push(downloaded - entry.last_downloaded);
                entry.last_uploaded = uploaded;
                entry.last_downloaded = downloaded;

                let view = PeerView {
                    key: entry.handle.key(),
                    interested: entry.handle.is_interested(),
                    choked: entry.handle.is_choking(),
                    upload_rate: entry.up_history.rate(period),
                    download_rate: entry.down_history.rate(period),
                    snubbing_us: entry.handle.is_choked_and_interesting(),
                };
                upload_total += view.upload_rate;
                views.push(view);
                handles.push(entry.handle.clone());
            }
            (views, handles, run, upload_total)
        };

        let shed = self
            .ctx
            .config
            .upload_cap
            .map(|cap| over_cap_choke_probability(upload_total, cap))
            .unwrap_or(0.0);
        let decisions = decide(
            &views,
            self.ctx.config.max_uploaders,
            seeding,
            shed,
            &mut rand::thread_rng(),
        );
        trace!(?decisions, upload_total, "choking pass");

        for handle in &handles {
            if decisions.choke.contains(&handle.key()) {
                handle.choke();
            } else if decisions.unchoke.contains(&handle.key()) {
                handle.unchoke();
            }
        }
        if !decisions.choke.is_empty() {
            let mut state = self.state.lock();
            let mut kept = std::collections::VecDeque::with_capacity(state.peers.len());
            let mut rotated = Vec::new();
            for entry in state.peers.drain(..) {
                if decisions.choke.contains(&entry.handle.key()) {
                    rotated.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            kept.extend(rotated);
            state.peers = kept;
        }

        for handle in &handles {
            handle.queue.keepalive_if_idle();
        }
        if run % 2 == 0 {
            if let Some(storage) = self.storage() {
                storage.evict_idle();
            }
        }
        if run % 4 == 0 {
            self.send_pex(&handles);
        }
        if run % 8 == 0 {
            self.request_comments(&handles);
        }
    }

    /// Gossips newly discovered addresses to every peer speaking ut_pex.
    fn send_pex(&self, handles: &[PeerHandle]) {
        let pending = self.take_pex_pending();
        if pending.is_empty() {
            return;
        }
        let mut message = PexMessage::new();
        for addr in pending {
            message.add(
                addr,
                PexFlags {
                    connectable: true,
                    ..Default::default()
                },
            );
        }
        let payload = bencode::encode(&message.to_value());
        for handle in handles {
            let id = handle.shared.meta.lock().extension_ids.pex;
            if let Some(id) = id {
                handle.send_extended(id, payload.clone());
            }
        }
    }

    fn request_comments(&self, handles: &[PeerHandle]) {
        let payload = extension::comment_request_payload();
        for handle in handles {
            let id = handle.shared.meta.lock().extension_ids.comment;
            if let Some(id) = id {
                handle.send_extended(id, payload.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn view(key: u64, interested: bool, choked: bool, down: u64) -> PeerView {
        PeerView {
            key: PeerKey(key),
            interested,
            choked,
            upload_rate: 0,
            download_rate: down,
            snubbing_us: false,
        }
    }

    #[test]
    fn test_leeching_prefers_fastest_feeders() {
        let views = vec![
            view(1, true, true, 10),
            view(2, true, true, 500),
            view(3, true, true, 200),
            view(4, false, true, 9000),
        ];
        let mut rng = StdRng::seed_from_u64(7);
        let d = decide(&views, 2, false, 0.0, &mut rng);
        // One slot goes to the fastest feeder; the optimistic slot lands on
        // one of the others but never the uninterested peer.
        assert!(d.unchoke.contains(&PeerKey(2)));
        assert_eq!(d.unchoke.len(), 2);
        assert!(!d.unchoke.contains(&PeerKey(4)));
        assert!(d.choke.is_empty());
    }

    #[test]
    fn test_snubbing_peers_sorted_last() {
        let mut snubber = view(1, true, true, 900);
        snubber.snubbing_us = true;
        let views = vec![snubber, view(2, true, true, 5)];
        let mut rng = StdRng::seed_from_u64(1);
        let d = decide(&views, 2, false, 0.0, &mut rng);
        // Both fit, but with one slot the feeder would win over the snubber.
        assert_eq!(d.unchoke.len(), 2);
        let d = decide(&views, 1, false, 0.0, &mut rng);
        assert_eq!(d.unchoke, vec![PeerKey(2)]);
    }

    #[test]
    fn test_seeding_keeps_deque_order() {
        let views = vec![
            view(3, true, true, 0),
            view(1, true, true, 0),
            view(2, true, true, 0),
        ];
        let mut rng = StdRng::seed_from_u64(2);
        let d = decide(&views, 2, true, 0.0, &mut rng);
        // First slot follows deque order; the optimistic slot picks from
        // the rest.
        assert_eq!(d.unchoke[0], PeerKey(3));
        assert_eq!(d.unchoke.len(), 2);
    }

    #[test]
    fn test_unselected_unchoked_peers_get_choked() {
        let views = vec![
            view(1, true, false, 100),
            view(2, true, false, 900),
            view(3, false, false, 0),
        ];
        let mut rng = StdRng::seed_from_u64(3);
        let d = decide(&views, 1, false, 0.0, &mut rng);
        // The fastest feeder keeps its slot (no unchoke needed), everyone
        // else loses theirs.
        assert!(d.unchoke.is_empty());
        assert_eq!(d.choke, vec![PeerKey(1), PeerKey(3)]);
    }

    #[test]
    fn test_over_cap_sheds_a_slot() {
        let views = vec![view(1, true, false, 0), view(2, true, false, 0)];
        let mut rng = StdRng::seed_from_u64(4);
        // Probability one always sheds exactly one slot, and never below one.
        let d = decide(&views, 2, true, 1.0, &mut rng);
        assert_eq!(d.choke.len(), 1);
        let d = decide(&views, 1, true, 1.0, &mut rng);
        assert_eq!(d.choke.len(), 1);
    }
}
