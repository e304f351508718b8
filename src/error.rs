use thiserror::Error;

/// Errors surfaced by the streaming engine to its caller.
///
/// Per-chunk failures never show up here: they are logged and dropped by the
/// render pass, see [`crate::downloader::FetchError`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StreamError {
    #[error("pyramid metadata unavailable: {0}")]
    MetadataUnavailable(String),
    #[error("invalid pyramid level {level} (pyramid has {levels} levels)")]
    InvalidLevel { level: usize, levels: usize },
    #[error("viewport coordinate {0} is not finite")]
    NonFiniteCoordinate(f64),
    #[error("stream is closed")]
    StreamClosed,
}

pub type Result<T, E = StreamError> = std::result::Result<T, E>;
