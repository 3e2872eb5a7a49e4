//! End-to-end connection tests over in-memory duplex streams: two full
//! engine instances talking the real wire protocol to each other.

use crate::bencode::{self, Value};
use crate::config::{EngineConfig, EngineContext};
use crate::coordinator::{EngineListener, PeerCoordinator};
use crate::metainfo::Metainfo;
use crate::peer::conn::run_peer;
use crate::peer::PeerError;
use crate::peer::PeerId;
use crate::storage::StorageListener;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

struct Quiet;
impl StorageListener for Quiet {}
impl EngineListener for Quiet {}

fn make_meta(name: &str, piece_length: usize, payload: &[u8]) -> Arc<Metainfo> {
    let mut hashes = Vec::new();
    for chunk in payload.chunks(piece_length) {
        hashes.extend_from_slice(&Sha1::digest(chunk));
    }
    let mut info = BTreeMap::new();
    info.insert(Bytes::from_static(b"name"), Value::string(name));
    info.insert(
        Bytes::from_static(b"length"),
        Value::Integer(payload.len() as i64),
    );
    info.insert(
        Bytes::from_static(b"piece length"),
        Value::Integer(piece_length as i64),
    );
    info.insert(Bytes::from_static(b"pieces"), Value::Bytes(Bytes::from(hashes)));
    let encoded = bencode::encode(&Value::Dict(info));
    Arc::new(Metainfo::from_info_bytes(&encoded).unwrap())
}

async fn seeded_coordinator(
    meta: Arc<Metainfo>,
    dir: &Path,
    payload: &[u8],
) -> Arc<PeerCoordinator> {
    tokio::fs::write(dir.join(&meta.files()[0].path), payload)
        .await
        .unwrap();
    let ctx = EngineContext::new(EngineConfig::default(), PeerId::generate());
    let coordinator =
        PeerCoordinator::new(ctx.clone(), meta, dir.to_path_buf(), Arc::new(Quiet));
    coordinator.start().await.unwrap();
    assert!(coordinator.is_complete(), "seed fixture must start complete");
    coordinator
}

async fn empty_coordinator(meta: Arc<Metainfo>, dir: &Path) -> Arc<PeerCoordinator> {
    let ctx = EngineContext::new(EngineConfig::default(), PeerId::generate());
    let coordinator =
        PeerCoordinator::new(ctx.clone(), meta, dir.to_path_buf(), Arc::new(Quiet));
    coordinator.start().await.unwrap();
    coordinator
}

fn connect(
    a: Arc<PeerCoordinator>,
    b: Arc<PeerCoordinator>,
) -> (
    tokio::task::JoinHandle<Result<(), PeerError>>,
    tokio::task::JoinHandle<Result<(), PeerError>>,
) {
    let (left, right) = tokio::io::duplex(256 * 1024);
    let task_a = tokio::spawn(run_peer(left, a.ctx.clone(), a, true));
    let task_b = tokio::spawn(run_peer(right, b.ctx.clone(), b, false));
    (task_a, task_b)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(10), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_leech_downloads_everything_from_seed() {
    let payload: Vec<u8> = (0..200u8).cycle().take(3 * 32 + 7).collect();
    let meta = make_meta("xfer", 32, &payload);

    let seed_dir = TempDir::new().unwrap();
    let leech_dir = TempDir::new().unwrap();
    let seed = seeded_coordinator(meta.clone(), seed_dir.path(), &payload).await;
    let leech = empty_coordinator(meta.clone(), leech_dir.path()).await;

    let (seed_task, leech_task) = connect(seed.clone(), leech.clone());

    let probe = leech.clone();
    wait_for(move || probe.is_complete()).await;

    // Completion drops the now-useless seed connection; both tasks wind
    // down cleanly.
    timeout(Duration::from_secs(10), seed_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    timeout(Duration::from_secs(10), leech_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let on_disk = tokio::fs::read(leech_dir.path().join("xfer")).await.unwrap();
    assert_eq!(on_disk, payload);
    assert_eq!(leech.downloaded(), payload.len() as u64);
    assert_eq!(seed.uploaded(), payload.len() as u64);
}

#[tokio::test]
async fn test_two_seeds_part_ways() {
    let payload = vec![4u8; 64];
    let meta = make_meta("dup", 32, &payload);

    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let a = seeded_coordinator(meta.clone(), dir_a.path(), &payload).await;
    let b = seeded_coordinator(meta.clone(), dir_b.path(), &payload).await;

    let (task_a, task_b) = connect(a, b);
    let (ra, rb) = timeout(Duration::from_secs(10), futures::future::join(task_a, task_b))
        .await
        .unwrap();
    ra.unwrap().unwrap();
    rb.unwrap().unwrap();
}

#[tokio::test]
async fn test_wrong_info_hash_is_refused() {
    let payload = vec![1u8; 32];
    let meta_a = make_meta("one", 32, &payload);
    let meta_b = make_meta("two", 32, &payload);

    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let a = seeded_coordinator(meta_a, dir_a.path(), &payload).await;
    let b = seeded_coordinator(meta_b, dir_b.path(), &payload).await;

    let (task_a, task_b) = connect(a, b);
    // Handshakes cross before either side checks, so both reject.
    let (ra, rb) = timeout(Duration::from_secs(10), futures::future::join(task_a, task_b))
        .await
        .unwrap();
    assert!(matches!(ra.unwrap(), Err(PeerError::InfoHashMismatch)));
    assert!(matches!(rb.unwrap(), Err(PeerError::InfoHashMismatch)));
}

#[tokio::test]
async fn test_magnet_leech_fetches_metadata_then_payload() {
    let payload: Vec<u8> = (0..255u8).cycle().take(96).collect();
    let meta = make_meta("magnet", 32, &payload);

    let seed_dir = TempDir::new().unwrap();
    let leech_dir = TempDir::new().unwrap();
    let seed = seeded_coordinator(meta.clone(), seed_dir.path(), &payload).await;

    let ctx = EngineContext::new(EngineConfig::default(), PeerId::generate());
    let leech = PeerCoordinator::new_magnet(
        ctx,
        meta.info_hash(),
        leech_dir.path().to_path_buf(),
        Arc::new(Quiet),
    );
    leech.start().await.unwrap();
    assert!(leech.needs_metadata());

    let (_seed_task, _leech_task) = connect(seed, leech.clone());

    let probe = leech.clone();
    wait_for(move || !probe.needs_metadata()).await;
    assert_eq!(leech.metainfo().unwrap().info_hash(), meta.info_hash());

    // With the metadata installed the download continues on the same
    // connection.
    let probe = leech.clone();
    wait_for(move || probe.is_complete()).await;
    let on_disk = tokio::fs::read(leech_dir.path().join("magnet"))
        .await
        .unwrap();
    assert_eq!(on_disk, payload);
}
