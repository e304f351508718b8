#![warn(clippy::all, rust_2018_idioms)]

use anyhow::{anyhow, Context};
use std::io::{Cursor, Read};

pub mod cache;
pub mod config;
pub mod downloader;
pub mod error;
pub mod model;
pub mod streamer;
pub mod viewport;
pub mod volume;
pub mod zarr;

pub use cache::ChunkCache;
pub use config::StreamerConfig;
pub use downloader::{CancelToken, ChunkStore, FetchError};
pub use error::StreamError;
pub use model::{ChunkAddress, ChunkKey, Dims3, PyramidModel};
pub use streamer::{PassState, StreamStats, ViewportStreamer};
pub use volume::{OutputBuffer, VoxelData};

pub fn zstd_decompress(input: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut uncompressed = Vec::new();
    ruzstd::decoding::StreamingDecoder::new(Cursor::new(input))
        .map_err(|e| anyhow!("invalid zstd frame: {e:?}"))?
        .read_to_end(&mut uncompressed)
        .context("zstd decompression failed")?;

    Ok(uncompressed)
}
