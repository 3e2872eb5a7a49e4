//! Torrent metainfo ([BEP-3]).
//!
//! A [`Metainfo`] is the immutable descriptor a torrent runs against: the
//! info hash, the piece-hash table, and the ordered file list covering one
//! contiguous byte range. It is built either from a `.torrent` file or from
//! a raw info dictionary obtained over the metadata extension (the magnet
//! bootstrap path).
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

use crate::bencode::{self, BencodeError, Value};
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    #[error("info hash mismatch")]
    InfoHashMismatch,
}

/// SHA-1 hash of the bencoded info dictionary. Identifies the torrent.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Hashes a bencoded info dictionary.
    pub fn of(info_bytes: &[u8]) -> Self {
        Self(Sha1::digest(info_bytes).into())
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self)
    }
}

/// One file within a torrent: a relative path and its byte length.
#[derive(Debug, Clone)]
pub struct FileSpec {
    pub path: PathBuf,
    pub length: u64,
}

/// Immutable torrent descriptor.
#[derive(Debug, Clone)]
pub struct Metainfo {
    info_hash: InfoHash,
    name: String,
    piece_length: u32,
    piece_hashes: Vec<[u8; 20]>,
    files: Vec<FileSpec>,
    total_length: u64,
    info_bytes: Bytes,
}

impl Metainfo {
    /// Parses a whole `.torrent` file.
    ///
    /// The info hash is computed by re-encoding the decoded info dictionary,
    /// which reproduces the original bytes for canonical input.
    pub fn from_torrent_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let root = bencode::decode(data)?;
        let info = root.get(b"info").ok_or(MetainfoError::MissingField("info"))?;
        Self::from_info_value(info)
    }

    /// Parses a raw bencoded info dictionary, as delivered by the metadata
    /// extension. The caller compares the resulting [`Metainfo::info_hash`]
    /// against the expected hash.
    pub fn from_info_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let info = bencode::decode(data)?;
        Self::from_info_value(&info)
    }

    fn from_info_value(info: &Value) -> Result<Self, MetainfoError> {
        if info.as_dict().is_none() {
            return Err(MetainfoError::InvalidField("info"));
        }
        let info_bytes = bencode::encode(info);
        let info_hash = InfoHash::of(&info_bytes);

        let name = info
            .get(b"name")
            .and_then(|v| v.as_str())
            .ok_or(MetainfoError::MissingField("name"))?
            .to_owned();

        let piece_length = info
            .get(b"piece length")
            .and_then(|v| v.as_integer())
            .filter(|&n| n > 0 && n <= u32::MAX as i64)
            .ok_or(MetainfoError::InvalidField("piece length"))?
            as u32;

        let pieces = info
            .get(b"pieces")
            .and_then(|v| v.as_bytes())
            .ok_or(MetainfoError::MissingField("pieces"))?;
        if pieces.is_empty() || pieces.len() % 20 != 0 {
            return Err(MetainfoError::InvalidField("pieces"));
        }
        let piece_hashes: Vec<[u8; 20]> = pieces
            .chunks_exact(20)
            .map(|c| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(c);
                hash
            })
            .collect();

        let files = Self::parse_files(info, &name)?;
        let total_length: u64 = files.iter().map(|f| f.length).sum();

        let max = piece_hashes.len() as u64 * piece_length as u64;
        let min = max.saturating_sub(piece_length as u64);
        if total_length <= min || total_length > max {
            return Err(MetainfoError::InvalidField("length"));
        }

        Ok(Self {
            info_hash,
            name,
            piece_length,
            piece_hashes,
            files,
            total_length,
            info_bytes: Bytes::from(info_bytes),
        })
    }

    fn parse_files(info: &Value, name: &str) -> Result<Vec<FileSpec>, MetainfoError> {
        if let Some(length) = info.get(b"length") {
            // Single-file torrent: the name is the file name.
            let length = length
                .as_integer()
                .filter(|&n| n >= 0)
                .ok_or(MetainfoError::InvalidField("length"))? as u64;
            return Ok(vec![FileSpec {
                path: PathBuf::from(name),
                length,
            }]);
        }

        let list = info
            .get(b"files")
            .and_then(|v| v.as_list())
            .ok_or(MetainfoError::MissingField("files"))?;
        if list.is_empty() {
            return Err(MetainfoError::InvalidField("files"));
        }

        let mut files = Vec::with_capacity(list.len());
        for entry in list {
            let length = entry
                .get(b"length")
                .and_then(|v| v.as_integer())
                .filter(|&n| n >= 0)
                .ok_or(MetainfoError::InvalidField("files"))? as u64;
            let components = entry
                .get(b"path")
                .and_then(|v| v.as_list())
                .ok_or(MetainfoError::InvalidField("files"))?;
            let mut path = PathBuf::from(name);
            for component in components {
                let part = component
                    .as_str()
                    .ok_or(MetainfoError::InvalidField("path"))?;
                if part.is_empty() || part == "." || part == ".." || part.contains(['/', '\\']) {
                    return Err(MetainfoError::InvalidField("path"));
                }
                path.push(part);
            }
            if path == PathBuf::from(name) {
                return Err(MetainfoError::InvalidField("path"));
            }
            files.push(FileSpec { path, length });
        }
        Ok(files)
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Nominal piece length. All pieces but the last have this length.
    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    /// Actual length of piece `index`; the last piece is usually short.
    pub fn piece_size(&self, index: u32) -> u32 {
        let start = index as u64 * self.piece_length as u64;
        (self.total_length - start).min(self.piece_length as u64) as u32
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn files(&self) -> &[FileSpec] {
        &self.files
    }

    /// The raw bencoded info dictionary, for serving metadata requests.
    pub fn info_bytes(&self) -> &Bytes {
        &self.info_bytes
    }

    /// Verifies a fully assembled piece against its expected hash.
    pub fn check_piece(&self, index: u32, data: &[u8]) -> bool {
        let Some(expected) = self.piece_hashes.get(index as usize) else {
            return false;
        };
        data.len() == self.piece_size(index) as usize
            && <[u8; 20]>::from(Sha1::digest(data)) == *expected
    }
}
