//! Fixed-size chunk splitting and reassembly
//!
//! Chunk `i` of base name `X` is always `X.part{i:04}`. A set is only valid
//! when every index from zero to the expected count is present; readers
//! validate the whole set before yielding a single byte.

use crate::config::defaults::{CHUNK_SUFFIX, TEMP_SUFFIX};
use crate::error::{IoResultExt, Result, TransportError};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Number of chunks a payload of `size` bytes occupies.
///
/// Always at least one, so an empty payload still has a chunk to commit.
/// A `chunk_size` of zero means no ceiling.
pub fn chunk_count(size: i64, chunk_size: u64) -> u64 {
    if size <= 0 || chunk_size == 0 {
        return 1;
    }
    (size as u64).div_ceil(chunk_size).max(1)
}

/// Name of chunk `index` of `base`
pub fn chunk_name(base: &str, index: u32) -> String {
    format!("{}{}{:04}", base, CHUNK_SUFFIX, index)
}

/// Path of chunk `index` of `base` inside `dir`
pub fn chunk_path(dir: &Path, base: &str, index: u32) -> PathBuf {
    dir.join(chunk_name(base, index))
}

/// Parse the chunk index out of `name` if it is a committed chunk of `base`
pub fn parse_chunk_index(name: &str, base: &str) -> Option<u32> {
    let digits = name.strip_prefix(base)?.strip_prefix(CHUNK_SUFFIX)?;
    if digits.len() < 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Split everything `source` yields into `dir/base.partNNNN` files.
///
/// Every chunk is exactly `chunk_size` bytes except the last. Empty input
/// yields a single empty chunk; an exact multiple yields no trailing empty one.
pub fn split(source: &mut dyn Read, dir: &Path, base: &str, chunk_size: u64) -> Result<Vec<PathBuf>> {
    if chunk_size == 0 {
        return Err(TransportError::config("chunk size must be greater than zero"));
    }
    fs::create_dir_all(dir).with_path(dir)?;

    let mut writer = RollingChunkWriter::new(dir, base, chunk_size);
    io::copy(source, &mut writer).with_path(dir)?;
    let paths = writer.finish().with_path(dir)?;

    debug!("Split '{}' into {} chunk(s) of up to {} bytes", base, paths.len(), chunk_size);
    Ok(paths)
}

/// Split a file into chunks named after it
pub fn split_file(path: &Path, dir: &Path, chunk_size: u64) -> Result<Vec<PathBuf>> {
    let base = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TransportError::InvalidPath(path.display().to_string()))?;
    let mut file = File::open(path).with_path(path)?;
    split(&mut file, dir, base, chunk_size)
}

/// Open a chunk set for sequential reading.
///
/// Fails with [`TransportError::MissingChunk`] naming the first absent index
/// before any data is produced.
pub fn reassemble(paths: &[PathBuf]) -> Result<ChunkReader> {
    for (index, path) in paths.iter().enumerate() {
        if !path.is_file() {
            return Err(TransportError::MissingChunk {
                base: chunk_base(path),
                index: index as u32,
            });
        }
    }
    Ok(ChunkReader::new(paths.to_vec()))
}

/// Find the committed chunks of `base` in `dir`, ordered by index.
///
/// With `expected` set, the set must contain exactly that many chunks.
/// Staged `.tmp` parts are ignored.
pub fn discover_chunk_set(dir: &Path, base: &str, expected: Option<u32>) -> Result<Vec<PathBuf>> {
    let mut indices = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(TransportError::NotFound(dir.join(base).display().to_string()));
        }
        Err(e) => return Err(TransportError::io(dir, e)),
    };

    for entry in entries {
        let entry = entry.with_path(dir)?;
        if let Some(index) = entry.file_name().to_str().and_then(|n| parse_chunk_index(n, base)) {
            indices.push(index);
        }
    }

    if indices.is_empty() {
        return Err(TransportError::NotFound(dir.join(base).display().to_string()));
    }

    let count = complete_chunk_count(base, indices, expected)?;
    Ok((0..count).map(|i| chunk_path(dir, base, i)).collect())
}

/// Check that `indices` cover `0..count` and return `count`.
///
/// `count` is `expected` when given, otherwise one past the highest index.
pub fn complete_chunk_count(base: &str, mut indices: Vec<u32>, expected: Option<u32>) -> Result<u32> {
    indices.sort_unstable();
    let count = expected.unwrap_or_else(|| indices.last().map_or(0, |last| last + 1));
    for index in 0..count {
        if indices.binary_search(&index).is_err() {
            return Err(TransportError::MissingChunk {
                base: base.to_string(),
                index,
            });
        }
    }
    Ok(count)
}

fn chunk_base(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.rfind(CHUNK_SUFFIX) {
        Some(pos) => name[..pos].to_string(),
        None => name,
    }
}

/// Sequential reader over a validated chunk set
pub struct ChunkReader {
    paths: Vec<PathBuf>,
    next: usize,
    current: Option<File>,
}

impl ChunkReader {
    fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            next: 0,
            current: None,
        }
    }

    /// Number of chunks in the set
    pub fn chunk_count(&self) -> usize {
        self.paths.len()
    }

    /// Total size of all chunks on disk
    pub fn total_len(&self) -> Result<u64> {
        self.paths.iter().try_fold(0u64, |acc, p| {
            Ok(acc + fs::metadata(p).with_path(p)?.len())
        })
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(file) = self.current.as_mut() {
                let n = file.read(buf)?;
                if n > 0 || buf.is_empty() {
                    return Ok(n);
                }
                self.current = None;
            }

            let Some(path) = self.paths.get(self.next) else {
                return Ok(0);
            };
            let file = File::open(path).map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    TransportError::MissingChunk {
                        base: chunk_base(path),
                        index: self.next as u32,
                    }
                    .into_io()
                } else {
                    e
                }
            })?;
            self.current = Some(file);
            self.next += 1;
        }
    }
}

/// `Write` sink that rolls over to a new part file every `chunk_size` bytes.
///
/// Parts are opened lazily, so a write that ends exactly on a boundary does
/// not create a trailing empty part. Parts not yet returned by
/// [`finish`](Self::finish) are deleted on drop.
pub struct RollingChunkWriter {
    dir: PathBuf,
    base: String,
    suffix: String,
    chunk_size: u64,
    current: Option<BufWriter<File>>,
    current_len: u64,
    written: u64,
    paths: Vec<PathBuf>,
    finished: bool,
}

impl RollingChunkWriter {
    /// Writer producing `dir/base.partNNNN`. A `chunk_size` of zero never rolls.
    pub fn new(dir: &Path, base: &str, chunk_size: u64) -> Self {
        Self {
            dir: dir.to_path_buf(),
            base: base.to_string(),
            suffix: String::new(),
            chunk_size: if chunk_size == 0 { u64::MAX } else { chunk_size },
            current: None,
            current_len: 0,
            written: 0,
            paths: Vec::new(),
            finished: false,
        }
    }

    /// Writer producing `dir/base.partNNNN.tmp`, for staging before a commit
    pub fn staging(dir: &Path, base: &str, chunk_size: u64) -> Self {
        let mut writer = Self::new(dir, base, chunk_size);
        writer.suffix = TEMP_SUFFIX.to_string();
        writer
    }

    /// Bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Parts opened so far
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    fn roll(&mut self) -> io::Result<()> {
        self.close_current()?;
        let index = self.paths.len() as u32;
        let path = self
            .dir
            .join(format!("{}{}", chunk_name(&self.base, index), self.suffix));
        let file = File::create(&path)?;
        self.paths.push(path);
        self.current = Some(BufWriter::new(file));
        self.current_len = 0;
        Ok(())
    }

    fn close_current(&mut self) -> io::Result<()> {
        if let Some(mut writer) = self.current.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Flush and sync the last part and return every part path in order
    pub fn finish(mut self) -> io::Result<Vec<PathBuf>> {
        if self.paths.is_empty() {
            self.roll()?;
        }
        self.close_current()?;
        self.finished = true;
        Ok(std::mem::take(&mut self.paths))
    }
}

impl Write for RollingChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.current.is_none() || self.current_len >= self.chunk_size {
            self.roll()?;
        }

        let room = self.chunk_size - self.current_len;
        let n = (buf.len() as u64).min(room) as usize;
        if let Some(writer) = self.current.as_mut() {
            writer.write_all(&buf[..n])?;
        }
        self.current_len += n as u64;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.current.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for RollingChunkWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.current = None;
        for path in &self.paths {
            let _ = fs::remove_file(path);
        }
    }
}
