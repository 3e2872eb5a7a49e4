//! On-disk piece storage.
//!
//! A [`TorrentStorage`] owns the byte range a torrent maps onto its files:
//! startup verification, block reads for serving, and hash-checked piece
//! writes. File handles open lazily through a cache and close again after
//! an idle window, so a torrent with thousands of files does not pin
//! thousands of descriptors.
//!
//! Storage I/O errors are fatal for the torrent; callers surface them
//! through their listener and halt.

mod error;
mod file;
mod store;

pub use error::StorageError;
pub use file::{block_spans, FileHandleCache, FileSpan};
pub use store::{PutResult, StorageListener, StorageLoader, TorrentStorage};

#[cfg(test)]
mod tests;
