//! HTTP web seeding: an always-unchoked swarm member backed by a web
//! server instead of a socket peer.
//!
//! A web seed joins the coordinator through the same [`SwarmPeer`] surface
//! as a wire peer and pulls pieces through the same `next_partial` /
//! `got_piece` path, so selection, endgame, and verification treat it like
//! any other seed. Bytes come from HTTP range requests against the seed's
//! base URL; a trailing slash means "directory layout" and file paths get
//! appended, anything else is taken as a direct single-file URL.

use crate::coordinator::PeerCoordinator;
use crate::metainfo::{FileSpec, Metainfo};
use crate::peer::conn::{PeerKey, SwarmPeer};
use crate::peer::PartialPiece;
use crate::storage::block_spans;
use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// How long to wait when there is nothing to fetch.
const IDLE_POLL: Duration = Duration::from_secs(5);
/// Backoff after a failed fetch.
const ERROR_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
enum WebSeedError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("range returned {got} bytes, wanted {wanted}")]
    ShortBody { wanted: u64, got: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One web seed. Created with [`WebSeed::spawn`], which registers it with
/// the coordinator and starts its fetch task.
pub struct WebSeed {
    key: PeerKey,
    base: String,
}

impl WebSeed {
    pub fn spawn(coordinator: Arc<PeerCoordinator>, base_url: String) -> Arc<WebSeedHandle> {
        let seed = Arc::new(WebSeedHandle {
            inner: WebSeed {
                key: coordinator.allocate_key(),
                base: base_url,
            },
            closed: AtomicBool::new(false),
        });
        coordinator.register_webseed(seed.clone());
        info!(key = ?seed.inner.key, url = %seed.inner.base, "web seed registered");
        tokio::spawn(run(coordinator, seed.clone()));
        seed
    }

    /// URL serving the given file.
    fn url_for(&self, spec: &FileSpec) -> String {
        if !self.base.ends_with('/') {
            return self.base.clone();
        }
        let mut url = self.base.clone();
        let parts: Vec<String> = spec
            .path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        url.push_str(&parts.join("/"));
        url
    }
}

/// The coordinator-facing handle for one web seed.
pub struct WebSeedHandle {
    inner: WebSeed,
    closed: AtomicBool,
}

impl WebSeedHandle {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl SwarmPeer for WebSeedHandle {
    fn key(&self) -> PeerKey {
        self.inner.key
    }

    fn notify_have(&self, _piece: u32) {}

    fn is_seed(&self) -> bool {
        true
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

async fn run(coordinator: Arc<PeerCoordinator>, seed: Arc<WebSeedHandle>) {
    let client = match Client::builder().timeout(REQUEST_TIMEOUT).build() {
        Ok(client) => client,
        Err(err) => {
            warn!(%err, "cannot build http client, web seed disabled");
            return;
        }
    };
    let key = seed.inner.key;

    while !seed.is_closed() && !coordinator.is_halted() && !coordinator.is_complete() {
        let Some(meta) = coordinator.metainfo() else {
            // Magnet phase; wire peers have to fetch the metadata first.
            sleep(IDLE_POLL).await;
            continue;
        };
        let Some(mut partial) = coordinator.next_partial(key) else {
            sleep(IDLE_POLL).await;
            continue;
        };
        // A resumed orphan already has bytes in it; only what the fetch
        // adds counts as downloaded.
        let resumed = partial.downloaded();
        match fetch_piece(&client, &seed.inner, &meta, &mut partial).await {
            Ok(()) => {
                let piece = partial.piece();
                coordinator.add_downloaded((partial.downloaded() - resumed) as u64);
                if let Err(err) = coordinator.got_piece(key, partial).await {
                    warn!(piece, %err, "storing web seed piece failed");
                    sleep(ERROR_BACKOFF).await;
                } else {
                    debug!(piece, "piece fetched from web seed");
                }
            }
            Err(err) => {
                warn!(piece = partial.piece(), %err, "web seed fetch failed");
                coordinator.save_partials(key, vec![partial]);
                sleep(ERROR_BACKOFF).await;
            }
        }
    }
    debug!(?key, "web seed task finished");
}

/// Fetches the rest of a partial piece, one range request per file span.
async fn fetch_piece(
    client: &Client,
    seed: &WebSeed,
    meta: &Metainfo,
    partial: &mut PartialPiece,
) -> Result<(), WebSeedError> {
    let piece = partial.piece();
    let offset = partial.downloaded();
    let length = partial.length() - offset;
    for span in block_spans(meta, piece, offset, length) {
        let spec = &meta.files()[span.file];
        let url = seed.url_for(spec);
        let range = format!("bytes={}-{}", span.offset, span.offset + span.length - 1);
        let response = client
            .get(&url)
            .header(RANGE, range)
            .send()
            .await?
            .error_for_status()?;
        // Stream the body straight into the partial piece instead of
        // buffering the whole range.
        let mut body = response.bytes_stream();
        let mut received = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            received += chunk.len() as u64;
            if received > span.length {
                break;
            }
            partial.put_chunk(partial.downloaded(), &chunk)?;
        }
        if received != span.length {
            return Err(WebSeedError::ShortBody {
                wanted: span.length,
                got: received as usize,
            });
        }
    }
    Ok(())
}
