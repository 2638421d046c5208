//! File system level payload handling
//!
//! Provides the buffered copy loop, LZ4 compression and the chunk
//! splitter shared by every transport.

pub mod chunk;
pub mod compress;
mod copy;

pub use chunk::{
    chunk_count, chunk_name, discover_chunk_set, reassemble, split, split_file, ChunkReader,
    RollingChunkWriter,
};
pub use compress::CompressionStats;
pub use copy::*;
