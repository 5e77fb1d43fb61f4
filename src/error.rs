use thiserror::Error;

use crate::source::SourceError;

#[derive(Error, Debug)]
pub enum PackError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("source object {path} is corrupt: expected {expected} bytes, got {got}")]
    SourceCorrupt {
        path: String,
        expected: u64,
        got: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("piece commitment failed: {0}")]
    CommP(String),

    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),

    #[error("directory {0} is missing from the catalog")]
    DirectoryMissing(i64),

    #[error("directory data corrupt: {0}")]
    DirectoryData(String),

    #[error("invalid CID in catalog: {0}")]
    Cid(#[from] cid::Error),

    #[error("failed to resolve source handler: {0}")]
    HandlerResolution(String),

    #[error("block of {size} bytes cannot fit a CAR capped at {piece_size} bytes")]
    BlockTooLarge { size: u64, piece_size: u64 },

    #[error("file range {0} missing from pack result")]
    RangeNotPacked(i64),

    #[error("{0} not found")]
    NotFound(String),

    #[error("pack job cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, PackError>;
