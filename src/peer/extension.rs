//! Extension protocol ([BEP-10]) handshake and dispatch.
//!
//! We register three extended messages: `ut_metadata` for magnet metadata
//! exchange, `ut_pex` for peer exchange, and `ut_comment` for swarm
//! comments. Incoming messages arrive tagged with the ids *we* registered;
//! outgoing ones use the ids the remote registered in its handshake.
//!
//! [BEP-10]: http://bittorrent.org/beps/bep_0010.html

use crate::bencode::{self, Value};
use crate::config::EngineContext;
use crate::coordinator::PeerCoordinator;
use crate::peer::metadata::{MetadataMessage, PARALLEL_REQUESTS};
use crate::peer::{PeerError, PeerHandle};
use crate::pex::PexMessage;
use bytes::Bytes;
use tracing::{debug, trace, warn};

/// Message id zero is always the extension handshake itself.
pub const HANDSHAKE_ID: u8 = 0;

/// Our registered id for ut_metadata.
pub const METADATA_ID: u8 = 1;
/// Our registered id for ut_pex.
pub const PEX_ID: u8 = 2;
/// Our registered id for ut_comment.
pub const COMMENT_ID: u8 = 3;

/// Builds our extension handshake payload.
pub fn handshake_payload(ctx: &EngineContext, coordinator: &PeerCoordinator) -> Bytes {
    let mut m = Value::dict();
    m.insert(b"ut_metadata", METADATA_ID as i64);
    m.insert(b"ut_pex", PEX_ID as i64);
    m.insert(b"ut_comment", COMMENT_ID as i64);

    let mut dict = Value::dict();
    dict.insert(b"m", m);
    if let Some(port) = ctx.config.listen_port {
        dict.insert(b"p", port as i64);
    }
    dict.insert(b"v", concat!("snarl ", env!("CARGO_PKG_VERSION")));
    dict.insert(b"reqq", ctx.config.max_queued_bytes as i64 / ctx.config.chunk_size as i64);
    if let Some(meta) = coordinator.metainfo() {
        dict.insert(b"metadata_size", meta.info_bytes().len() as i64);
    }
    if coordinator.is_complete() {
        dict.insert(b"upload_only", 1i64);
    }
    bencode::encode(&dict)
}

/// Handles one incoming extended message.
pub async fn handle_message(
    coordinator: &PeerCoordinator,
    handle: &PeerHandle,
    id: u8,
    payload: Bytes,
) -> Result<(), PeerError> {
    match id {
        HANDSHAKE_ID => handle_handshake(coordinator, handle, &payload),
        METADATA_ID => handle_metadata(coordinator, handle, &payload).await,
        PEX_ID => handle_pex(coordinator, &payload),
        COMMENT_ID => handle_comment(coordinator, handle, &payload),
        other => {
            trace!(id = other, "unknown extended message id");
            Ok(())
        }
    }
}

fn handle_handshake(
    coordinator: &PeerCoordinator,
    handle: &PeerHandle,
    payload: &[u8],
) -> Result<(), PeerError> {
    let dict = bencode::decode(payload)?;
    let lookup = |name: &[u8]| {
        dict.get(b"m")
            .and_then(|m| m.get(name))
            .and_then(|v| v.as_integer())
            .filter(|&id| id > 0 && id <= u8::MAX as i64)
            .map(|id| id as u8)
    };

    let metadata_size = dict
        .get(b"metadata_size")
        .and_then(|v| v.as_integer())
        .filter(|&n| n > 0 && n <= u32::MAX as i64)
        .map(|n| n as u32);

    let (metadata_id, size) = {
        let mut meta = handle.shared.meta.lock();
        meta.extension_ids.metadata = lookup(b"ut_metadata");
        meta.extension_ids.pex = lookup(b"ut_pex");
        meta.extension_ids.comment = lookup(b"ut_comment");
        meta.metadata_size = metadata_size;
        meta.listen_port = dict
            .get(b"p")
            .and_then(|v| v.as_integer())
            .filter(|&p| p > 0 && p <= u16::MAX as i64)
            .map(|p| p as u16);
        if let Some(v) = dict.get(b"v").and_then(|v| v.as_str()) {
            meta.client_version = Some(v.to_owned());
        }
        if dict.get(b"upload_only").and_then(|v| v.as_integer()) == Some(1) {
            meta.upload_only = true;
        }
        (meta.extension_ids.metadata, meta.metadata_size)
    };
    debug!(key = ?handle.key(), ?metadata_id, ?size, "extension handshake");

    // A magnet download can start fetching as soon as one peer tells us
    // how big the info dict is.
    if coordinator.needs_metadata() {
        if let (Some(remote_id), Some(size)) = (metadata_id, size) {
            let requests = coordinator.magnet_start(handle.key(), size)?;
            for piece in requests {
                handle.send_extended(
                    remote_id,
                    MetadataMessage::Request { piece }.encode(),
                );
            }
        }
    }
    Ok(())
}

async fn handle_metadata(
    coordinator: &PeerCoordinator,
    handle: &PeerHandle,
    payload: &[u8],
) -> Result<(), PeerError> {
    let remote_id = handle.shared.meta.lock().extension_ids.metadata;
    match MetadataMessage::decode(payload)? {
        MetadataMessage::Request { piece } => {
            let Some(remote_id) = remote_id else {
                return Ok(());
            };
            let reply = coordinator
                .metadata_chunk(piece)
                .unwrap_or(MetadataMessage::Reject { piece });
            handle.send_extended(remote_id, reply.encode());
            Ok(())
        }
        MetadataMessage::Data { piece, data, .. } => {
            if !coordinator.needs_metadata() {
                return Ok(());
            }
            let completed = coordinator.magnet_chunk(piece, &data).await?;
            if !completed {
                if let Some(remote_id) = remote_id {
                    for piece in coordinator.magnet_requests(handle.key(), PARALLEL_REQUESTS) {
                        handle.send_extended(
                            remote_id,
                            MetadataMessage::Request { piece }.encode(),
                        );
                    }
                }
            }
            Ok(())
        }
        MetadataMessage::Reject { piece } => {
            debug!(piece, "metadata request rejected");
            coordinator.magnet_release(piece);
            Ok(())
        }
    }
}

fn handle_pex(coordinator: &PeerCoordinator, payload: &[u8]) -> Result<(), PeerError> {
    let value = bencode::decode(payload)?;
    let message = PexMessage::from_value(&value);
    trace!(
        added = message.added.len(),
        dropped = message.dropped.len(),
        "pex message"
    );
    for (addr, flags) in message.added {
        if flags.connectable {
            coordinator.add_discovered_peer(addr);
        }
    }
    Ok(())
}

/// ut_comment carries a small bencoded dict; `t` 0 is a request for
/// comments, 1 a batch of them. The engine does not interpret comment
/// bodies, it hands them to the listener.
fn handle_comment(
    coordinator: &PeerCoordinator,
    handle: &PeerHandle,
    payload: &[u8],
) -> Result<(), PeerError> {
    let value = bencode::decode(payload)?;
    match value.get(b"t").and_then(|v| v.as_integer()) {
        Some(0) => {
            coordinator.listener().got_comment_request(handle.key());
            let remote_id = handle.shared.meta.lock().extension_ids.comment;
            if let (Some(remote_id), Some(reply)) =
                (remote_id, coordinator.listener().comment_request_payload())
            {
                handle.send_extended(remote_id, reply);
            }
            Ok(())
        }
        Some(1) => {
            coordinator
                .listener()
                .got_comments(handle.key(), Bytes::copy_from_slice(payload));
            Ok(())
        }
        other => {
            warn!(?other, "unrecognized ut_comment type");
            Ok(())
        }
    }
}

/// Builds an outgoing ut_comment request payload.
pub fn comment_request_payload() -> Bytes {
    let mut dict = Value::dict();
    dict.insert(b"t", 0i64);
    bencode::encode(&dict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, EngineContext};
    use crate::coordinator::EngineListener;
    use crate::metainfo::InfoHash;
    use crate::peer::conn::PeerShared;
    use crate::peer::{PeerId, PeerKey, SendQueue};
    use crate::storage::StorageListener;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Quiet;
    impl StorageListener for Quiet {}
    impl EngineListener for Quiet {}

    fn fixture() -> (Arc<PeerCoordinator>, PeerHandle, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            listen_port: Some(6881),
            ..EngineConfig::default()
        };
        let ctx = EngineContext::new(config, PeerId::generate());
        let coordinator = PeerCoordinator::new_magnet(
            ctx,
            InfoHash::new([1u8; 20]),
            dir.path().to_path_buf(),
            Arc::new(Quiet),
        );
        let handle = PeerHandle {
            shared: PeerShared::new(PeerKey(1), PeerId::generate(), true, true),
            queue: Arc::new(SendQueue::new()),
        };
        (coordinator, handle, dir)
    }

    #[test]
    fn test_handshake_payload_advertises_listen_port() {
        let (coordinator, _, _dir) = fixture();
        let payload = handshake_payload(&coordinator.ctx, &coordinator);
        let dict = bencode::decode(&payload).unwrap();
        assert_eq!(dict.get(b"p").and_then(|v| v.as_integer()), Some(6881));
        assert!(dict.get(b"m").and_then(|m| m.get(b"ut_metadata")).is_some());
    }

    #[test]
    fn test_handshake_records_remote_listen_port() {
        let (coordinator, handle, _dir) = fixture();
        let mut m = Value::dict();
        m.insert(b"ut_pex", 5i64);
        let mut dict = Value::dict();
        dict.insert(b"m", m);
        dict.insert(b"p", 51413i64);

        handle_handshake(&coordinator, &handle, &bencode::encode(&dict)).unwrap();
        assert_eq!(handle.listen_port(), Some(51413));
        assert_eq!(handle.shared.meta.lock().extension_ids.pex, Some(5));
    }
}
