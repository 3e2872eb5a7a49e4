use super::*;
use crate::bencode::{self, Value};
use crate::config::{EngineConfig, EngineContext};
use crate::metainfo::Metainfo;
use crate::peer::queue::DataLoader;
use crate::peer::PeerId;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

fn ctx() -> Arc<EngineContext> {
    EngineContext::new(EngineConfig::default(), PeerId::generate())
}

/// Builds a multi-file metainfo over `files` and returns it with the full
/// concatenated payload.
fn make_meta(piece_length: usize, files: &[(&str, Vec<u8>)]) -> (Arc<Metainfo>, Vec<u8>) {
    let mut payload = Vec::new();
    for (_, data) in files {
        payload.extend_from_slice(data);
    }
    let mut hashes = Vec::new();
    for chunk in payload.chunks(piece_length) {
        hashes.extend_from_slice(&Sha1::digest(chunk));
    }

    let mut info = BTreeMap::new();
    info.insert(Bytes::from_static(b"name"), Value::string("test"));
    info.insert(
        Bytes::from_static(b"piece length"),
        Value::Integer(piece_length as i64),
    );
    info.insert(Bytes::from_static(b"pieces"), Value::Bytes(Bytes::from(hashes)));
    if files.len() == 1 && files[0].0 == "test" {
        info.insert(
            Bytes::from_static(b"length"),
            Value::Integer(files[0].1.len() as i64),
        );
    } else {
        let list = files
            .iter()
            .map(|(name, data)| {
                let mut d = BTreeMap::new();
                d.insert(Bytes::from_static(b"length"), Value::Integer(data.len() as i64));
                d.insert(
                    Bytes::from_static(b"path"),
                    Value::List(vec![Value::string(name)]),
                );
                Value::Dict(d)
            })
            .collect();
        info.insert(Bytes::from_static(b"files"), Value::List(list));
    }

    let encoded = bencode::encode(&Value::Dict(info));
    (Arc::new(Metainfo::from_info_bytes(&encoded).unwrap()), payload)
}

#[derive(Default)]
struct CountingListener {
    checked: AtomicU32,
    present: AtomicU32,
    completed: AtomicU32,
}

impl StorageListener for CountingListener {
    fn piece_checked(&self, _piece: u32, have: bool) {
        self.checked.fetch_add(1, Ordering::SeqCst);
        if have {
            self.present.fetch_add(1, Ordering::SeqCst);
        }
    }
    fn completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

fn piece_bytes(payload: &[u8], meta: &Metainfo, piece: u32) -> Bytes {
    let start = piece as usize * meta.piece_length() as usize;
    let end = start + meta.piece_size(piece) as usize;
    Bytes::copy_from_slice(&payload[start..end])
}

#[tokio::test]
async fn test_check_creates_files_with_empty_bitfield() {
    let dir = TempDir::new().unwrap();
    let (meta, _) = make_meta(16, &[("a.bin", vec![1; 20]), ("b.bin", vec![2; 28])]);
    let storage = TorrentStorage::new(ctx(), meta.clone(), dir.path().to_path_buf());

    let listener = CountingListener::default();
    storage.check(&listener).await.unwrap();

    assert_eq!(listener.checked.load(Ordering::SeqCst), meta.piece_count());
    assert_eq!(listener.present.load(Ordering::SeqCst), 0);
    assert_eq!(storage.needed(), meta.piece_count());
    assert_eq!(
        tokio::fs::metadata(dir.path().join("test/a.bin"))
            .await
            .unwrap()
            .len(),
        20
    );
}

#[tokio::test]
async fn test_put_and_read_across_file_boundary() {
    let dir = TempDir::new().unwrap();
    let (meta, payload) = make_meta(16, &[("a.bin", vec![1; 10]), ("b.bin", vec![2; 22])]);
    let storage = TorrentStorage::new(ctx(), meta.clone(), dir.path().to_path_buf());
    storage.check(&CountingListener::default()).await.unwrap();

    // Piece 0 spans a.bin and b.bin.
    let result = storage.put_piece(0, piece_bytes(&payload, &meta, 0)).await.unwrap();
    assert_eq!(result, PutResult::Stored);
    assert!(storage.has_piece(0));

    let read = storage.read_block(0, 4, 12).await.unwrap();
    assert_eq!(&read[..], &payload[4..16]);
}

#[tokio::test]
async fn test_read_unverified_piece_is_an_error() {
    let dir = TempDir::new().unwrap();
    let (meta, _) = make_meta(16, &[("test", vec![3; 32])]);
    let storage = TorrentStorage::new(ctx(), meta, dir.path().to_path_buf());
    storage.check(&CountingListener::default()).await.unwrap();

    assert!(matches!(
        storage.read_block(0, 0, 16).await,
        Err(StorageError::PieceNotAvailable(0))
    ));
}

#[tokio::test]
async fn test_corrupt_piece_rejected_without_side_effects() {
    let dir = TempDir::new().unwrap();
    let (meta, _) = make_meta(16, &[("test", vec![3; 32])]);
    let storage = TorrentStorage::new(ctx(), meta, dir.path().to_path_buf());
    storage.check(&CountingListener::default()).await.unwrap();

    let result = storage
        .put_piece(0, Bytes::from_static(&[9; 16]))
        .await
        .unwrap();
    assert_eq!(result, PutResult::HashMismatch);
    assert!(!storage.has_piece(0));
    assert_eq!(storage.needed(), 2);
}

#[tokio::test]
async fn test_completion_runs_final_reverification() {
    let dir = TempDir::new().unwrap();
    let (meta, payload) = make_meta(16, &[("test", vec![5; 40])]);
    let storage = TorrentStorage::new(ctx(), meta.clone(), dir.path().to_path_buf());
    storage.check(&CountingListener::default()).await.unwrap();

    assert_eq!(
        storage.put_piece(0, piece_bytes(&payload, &meta, 0)).await.unwrap(),
        PutResult::Stored
    );
    assert_eq!(
        storage.put_piece(1, piece_bytes(&payload, &meta, 1)).await.unwrap(),
        PutResult::Stored
    );
    assert_eq!(
        storage.put_piece(2, piece_bytes(&payload, &meta, 2)).await.unwrap(),
        PutResult::Complete
    );
    assert!(storage.is_complete());
}

#[tokio::test]
async fn test_failed_reverification_rebuilds_bitfield() {
    let dir = TempDir::new().unwrap();
    let (meta, payload) = make_meta(16, &[("test", vec![5; 40])]);
    let storage = TorrentStorage::new(ctx(), meta.clone(), dir.path().to_path_buf());
    storage.check(&CountingListener::default()).await.unwrap();

    storage.put_piece(0, piece_bytes(&payload, &meta, 0)).await.unwrap();
    storage.put_piece(1, piece_bytes(&payload, &meta, 1)).await.unwrap();

    // Corrupt piece 0 on disk behind the engine's back.
    storage.close();
    let path = dir.path().join("test");
    let mut on_disk = tokio::fs::read(&path).await.unwrap();
    on_disk[0] ^= 0xff;
    tokio::fs::write(&path, &on_disk).await.unwrap();

    let result = storage
        .put_piece(2, piece_bytes(&payload, &meta, 2))
        .await
        .unwrap();
    assert_eq!(result, PutResult::ReverifyFailed);
    assert!(!storage.is_complete());
    assert!(!storage.has_piece(0));
    assert!(storage.has_piece(1));
    assert_eq!(storage.needed(), 1);
}

#[tokio::test]
async fn test_check_detects_existing_data() {
    let dir = TempDir::new().unwrap();
    let (meta, payload) = make_meta(16, &[("test", vec![7; 40])]);

    // Seed the file with the first two pieces valid and the last corrupted.
    let mut on_disk = payload.clone();
    on_disk[35] ^= 0xff;
    tokio::fs::create_dir_all(dir.path()).await.unwrap();
    tokio::fs::write(dir.path().join("test"), &on_disk).await.unwrap();

    let storage = TorrentStorage::new(ctx(), meta.clone(), dir.path().to_path_buf());
    let listener = CountingListener::default();
    storage.check(&listener).await.unwrap();

    assert_eq!(listener.present.load(Ordering::SeqCst), 2);
    assert!(storage.has_piece(0));
    assert!(storage.has_piece(1));
    assert!(!storage.has_piece(2));
    assert_eq!(listener.completed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_loader_returns_none_for_missing_piece() {
    let dir = TempDir::new().unwrap();
    let (meta, payload) = make_meta(16, &[("test", vec![7; 32])]);
    let storage = Arc::new(TorrentStorage::new(ctx(), meta.clone(), dir.path().to_path_buf()));
    storage.check(&CountingListener::default()).await.unwrap();
    storage.put_piece(0, piece_bytes(&payload, &meta, 0)).await.unwrap();

    let loader = StorageLoader(storage);
    assert!(loader.load_data(0, 0, 16).await.is_some());
    assert!(loader.load_data(1, 0, 16).await.is_none());
}

#[test]
fn test_block_spans_cross_files() {
    let (meta, _) = make_meta(16, &[("a.bin", vec![0; 10]), ("b.bin", vec![0; 6]), ("c.bin", vec![0; 16])]);

    // Piece 0 covers all of a.bin, all of b.bin.
    let spans = block_spans(&meta, 0, 0, 16);
    assert_eq!(
        spans,
        vec![
            FileSpan { file: 0, offset: 0, length: 10 },
            FileSpan { file: 1, offset: 0, length: 6 },
        ]
    );

    // A block in the middle of piece 1 sits wholly in c.bin.
    let spans = block_spans(&meta, 1, 4, 8);
    assert_eq!(spans, vec![FileSpan { file: 2, offset: 4, length: 8 }]);
}
