//! LZ4 compression for transfer payloads
//!
//! Uses the LZ4 frame format so payloads of any size stream through in
//! bounded memory. Compression always runs on plaintext, before encryption.

use crate::error::{Result, TransportError};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use std::io::{self, Read, Write};

/// LZ4 frame magic number (little-endian on the wire)
pub const LZ4_FRAME_MAGIC: [u8; 4] = [0x04, 0x22, 0x4D, 0x18];

/// Compression statistics
#[derive(Debug, Clone, Default)]
pub struct CompressionStats {
    /// Original size before compression
    pub original_size: u64,
    /// Compressed size
    pub compressed_size: u64,
    /// Compression ratio (compressed / original)
    pub ratio: f64,
}

impl CompressionStats {
    pub fn new(original_size: u64, compressed_size: u64) -> Self {
        let ratio = if original_size > 0 {
            compressed_size as f64 / original_size as f64
        } else {
            0.0
        };
        Self {
            original_size,
            compressed_size,
            ratio,
        }
    }

    /// Get space saved as a percentage
    pub fn space_saved_percent(&self) -> f64 {
        if self.original_size > 0 {
            (1.0 - self.ratio) * 100.0
        } else {
            0.0
        }
    }
}

/// Wrap a writer so everything written to it is compressed
///
/// Call `finish()` on the returned encoder to write the end mark.
pub fn compress_writer<W: Write>(writer: W) -> FrameEncoder<W> {
    FrameEncoder::new(writer)
}

/// Wrap a reader yielding an LZ4 frame so it yields the original bytes
pub fn decompress_reader<R: Read>(reader: R) -> FrameDecoder<R> {
    FrameDecoder::new(reader)
}

/// Finish an encoder, mapping frame errors into transport errors
pub fn finish_encoder<W: Write>(encoder: FrameEncoder<W>) -> io::Result<W> {
    encoder.finish().map_err(|e| {
        TransportError::Compression(format!("LZ4 frame finish failed: {}", e)).into_io()
    })
}

/// Check whether data starts with an LZ4 frame header
pub fn is_lz4_frame(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == LZ4_FRAME_MAGIC
}

/// Compress data in memory
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = compress_writer(Vec::with_capacity(data.len() / 2 + 64));
    encoder.write_all(data)?;
    Ok(finish_encoder(encoder)?)
}

/// Decompress data in memory
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = decompress_reader(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| TransportError::Compression(format!("LZ4 decompression failed: {}", e)))?;
    Ok(out)
}
