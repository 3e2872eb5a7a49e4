//! Transfer-rate accounting.
//!
//! Each peer (and the torrent as a whole) keeps a short rolling history of
//! per-check-period byte counts. Rates are weighted toward the most recent
//! period so the choker reacts to what a peer is doing now rather than what
//! it did a minute ago.

use std::time::Duration;

/// How many check periods a rate history remembers.
pub const RATE_DEPTH: usize = 3;

/// Fixed-depth rolling byte-count history.
///
/// `push` records the bytes moved during one check period; `rate` converts
/// the history into a weighted bytes-per-second figure, weighting the
/// newest sample `RATE_DEPTH` times as heavily as the oldest.
#[derive(Debug, Clone, Default)]
pub struct RateHistory {
    samples: [u64; RATE_DEPTH],
}

impl RateHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes the byte count for the period just ended, dropping the oldest.
    pub fn push(&mut self, bytes: u64) {
        self.samples.rotate_right(1);
        self.samples[0] = bytes;
    }

    /// Weighted bytes-per-second over the recorded history.
    pub fn rate(&self, period: Duration) -> u64 {
        let mut total = 0u64;
        let mut factor = 0u64;
        for (i, &sample) in self.samples.iter().enumerate() {
            let weight = (RATE_DEPTH - i) as u64;
            total += weight * sample;
            factor += weight;
        }
        let secs = period.as_secs().max(1);
        total / (factor * secs)
    }

    pub fn clear(&mut self) {
        self.samples = [0; RATE_DEPTH];
    }
}

/// Probability that one uploader should be choked this pass, given the
/// global upload rate and the configured cap.
///
/// Zero while under the cap; approaches one as the overshoot grows, so a
/// small overshoot sheds one or two uploaders rather than all of them.
pub fn over_cap_choke_probability(upload_rate: u64, cap: u64) -> f64 {
    if upload_rate <= cap || upload_rate == 0 {
        return 0.0;
    }
    (upload_rate - cap) as f64 / upload_rate as f64
}
