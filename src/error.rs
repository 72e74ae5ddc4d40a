use thiserror::Error;

use crate::relative_ptr::SegmentId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("segment {0} is not registered")]
    SegmentNotFound(SegmentId),
    #[error("segment {0} is already registered")]
    DuplicateSegment(SegmentId),
    #[error("no pool holds a payload of {0} bytes")]
    NoPoolForSize(u32),
    #[error("chunk pool with {chunk_size} byte chunks is exhausted")]
    PoolExhausted { chunk_size: u32 },
    #[error("{requested} chunks requested, a group holds at most {max}")]
    TooManyChunks { requested: usize, max: usize },
    #[error("chunk group pool is exhausted")]
    GroupPoolExhausted,
}

pub type Result<T> = std::result::Result<T, Error>;
