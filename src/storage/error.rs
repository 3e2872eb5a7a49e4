use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("piece {0} not available")]
    PieceNotAvailable(u32),

    #[error("read beyond piece bounds: piece {piece} offset {offset} length {length}")]
    OutOfRange { piece: u32, offset: u32, length: u32 },

    #[error("unsafe file path: {0}")]
    UnsafePath(String),
}
