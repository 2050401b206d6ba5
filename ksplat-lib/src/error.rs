use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KsplatError>;

#[derive(Debug, Error)]
pub enum KsplatError {
    #[error("Failed to parse the PLY header: {0}")]
    HeaderParse(String),

    #[error("Malformed splat buffer: {0}")]
    MalformedBuffer(String),

    #[error("Splat index {index} is out of range (splat count {count})")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("Unsupported camera or input shape: {0}")]
    UnsupportedCameraOrInputShape(String),

    #[error("Zstandard compression failed: {0}")]
    ZstdCompress(String),

    #[error("Zstandard decompression failed: {0}")]
    ZstdDecompress(String),

    #[error("The sort peer is no longer running")]
    SortPeerDisconnected,

    #[error("An I/O error occurred: {0}")]
    Io(#[from] io::Error),
}
