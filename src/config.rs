//! Engine configuration and shared context.
//!
//! Every component takes an explicit [`EngineContext`] instead of reaching
//! for process-global state, so several torrents (or several engines in one
//! test) can run side by side with different settings.

use crate::peer::PeerId;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Tunable knobs for one engine instance. `Default` gives the standard
/// protocol values; tests shrink the timing knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upload slots across the torrent.
    pub max_uploaders: usize,
    /// Connected-peer cap; also bounds the orphaned partial-piece list.
    pub max_connections: usize,
    /// Outstanding outbound requests per peer.
    pub pipeline_depth: usize,
    /// Outbound request granularity in bytes.
    pub chunk_size: u32,
    /// Largest inbound request we will serve.
    pub max_request_length: u32,
    /// Cap on bytes sitting in one peer's outbound piece queue.
    pub max_queued_bytes: usize,
    /// Remaining-piece count at which endgame duplication starts.
    pub endgame_threshold: usize,
    /// Duplicate requesters allowed per piece during endgame.
    pub max_parallel_requests: usize,
    /// Interval between choking passes.
    pub check_period: Duration,
    /// Socket inactivity before a peer is dropped.
    pub inactivity_timeout: Duration,
    /// Age at which an unanswered request is resent.
    pub request_ttl: Duration,
    /// Timeout for individual socket writes.
    pub write_timeout: Duration,
    /// Upload cap in bytes/sec; `None` means unlimited.
    pub upload_cap: Option<u64>,
    /// Pieces at or under this size buffer in memory; larger ones spill to a
    /// temp file. Shrinks at runtime after an allocation failure.
    pub partial_memory_limit: usize,
    /// Directory for spilled partial-piece buffers; `None` uses the system
    /// temp dir.
    pub temp_dir: Option<PathBuf>,
    /// Idle time before a cached file handle is closed.
    pub file_idle_timeout: Duration,
    /// Port the embedder accepts connections on, advertised in the
    /// extension handshake; `None` for unreachable clients.
    pub listen_port: Option<u16>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_uploaders: 8,
            max_connections: 24,
            pipeline_depth: 5,
            chunk_size: 16 * 1024,
            max_request_length: 64 * 1024,
            max_queued_bytes: 128 * 1024,
            endgame_threshold: 8,
            max_parallel_requests: 4,
            check_period: Duration::from_secs(40),
            inactivity_timeout: Duration::from_secs(8 * 60),
            request_ttl: Duration::from_secs(2 * 60),
            write_timeout: Duration::from_secs(3 * 60),
            upload_cap: None,
            partial_memory_limit: 2 * 1024 * 1024,
            temp_dir: None,
            file_idle_timeout: Duration::from_secs(30),
            listen_port: None,
        }
    }
}

/// Shared per-engine context: configuration, our identity, and the few
/// bits of cross-component mutable state.
#[derive(Debug)]
pub struct EngineContext {
    pub config: EngineConfig,
    pub our_id: PeerId,
    partial_memory_limit: AtomicUsize,
}

impl EngineContext {
    pub fn new(config: EngineConfig, our_id: PeerId) -> Arc<Self> {
        let limit = config.partial_memory_limit;
        Arc::new(Self {
            config,
            our_id,
            partial_memory_limit: AtomicUsize::new(limit),
        })
    }

    /// Current in-memory threshold for partial-piece buffers.
    pub fn partial_memory_limit(&self) -> usize {
        self.partial_memory_limit.load(Ordering::Relaxed)
    }

    /// Halves the in-memory threshold after an allocation failure so later
    /// buffers go straight to disk.
    pub fn shrink_partial_memory_limit(&self, failed_size: usize) {
        let current = self.partial_memory_limit.load(Ordering::Relaxed);
        let new = (failed_size / 2).min(current / 2);
        self.partial_memory_limit.store(new, Ordering::Relaxed);
    }
}
