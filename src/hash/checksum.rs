//! SHA-256 content checksums
//!
//! Checksums are computed once over plaintext at capture time and carried
//! through [`TransferMetadata`](crate::sync::TransferMetadata) and the resume
//! ledger. All helpers stream, so payload size does not matter.

use crate::config::defaults::DEFAULT_BUFFER_SIZE;
use crate::error::{IoResultExt, Result, TransportError};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Compute the checksum of data in memory
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute the checksum of everything a reader yields
pub fn hash_reader<R: Read>(reader: &mut R) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; DEFAULT_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        total += bytes_read as u64;
    }

    Ok((hex::encode(hasher.finalize()), total))
}

/// Compute the checksum of a file
pub fn hash_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_path(path)?;
    let mut reader = BufReader::with_capacity(DEFAULT_BUFFER_SIZE, file);
    let (hash, _) = hash_reader(&mut reader).with_path(path)?;
    Ok(hash)
}

/// Compare two checksums, tolerating case differences
pub fn checksums_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Reader adapter that hashes bytes as they pass through
///
/// Wrap the plaintext source of a send with this, then call
/// [`HashingReader::finalize`] once the pipeline has drained it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes_read: u64,
}

impl<R: Read> HashingReader<R> {
    /// Create a new hashing reader
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_read: 0,
        }
    }

    /// Bytes read so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Finish and return (hex digest, byte count)
    pub fn finalize(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.bytes_read)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_read += n as u64;
        Ok(n)
    }
}

/// Reader adapter that checks the checksum of everything it yields.
///
/// At EOF the digest is compared with the expected one; a mismatch surfaces
/// as an `IntegrityMismatch` error from `read` instead of a clean EOF.
pub struct VerifyingReader<R> {
    inner: R,
    hasher: Sha256,
    expected: String,
    label: String,
    verified: bool,
}

impl<R: Read> VerifyingReader<R> {
    pub fn new(inner: R, expected: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            expected: expected.into(),
            label: label.into(),
            verified: false,
        }
    }
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.hasher.update(&buf[..n]);
        } else if !buf.is_empty() && !self.verified {
            let actual = hex::encode(std::mem::take(&mut self.hasher).finalize());
            if !checksums_match(&actual, &self.expected) {
                return Err(TransportError::integrity_mismatch(
                    self.label.clone(),
                    self.expected.clone(),
                    actual,
                )
                .into_io());
            }
            self.verified = true;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_known_digests() {
        assert_eq!(hash_bytes(b""), EMPTY_SHA256);
        assert_eq!(
            hash_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hash_file_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..3_000_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        assert_eq!(hash_file(&path).unwrap(), hash_bytes(&data));
    }

    #[test]
    fn test_hash_missing_file() {
        let err = hash_file(Path::new("/definitely/not/here")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_hashing_reader_passthrough() {
        let data = b"migration payload".repeat(1000);
        let mut reader = HashingReader::new(Cursor::new(data.clone()));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();

        assert_eq!(out, data);
        let (hash, len) = reader.finalize();
        assert_eq!(hash, hash_bytes(&data));
        assert_eq!(len, data.len() as u64);
    }

    #[test]
    fn test_verifying_reader() {
        let data = b"restored bytes".to_vec();
        let mut ok = VerifyingReader::new(Cursor::new(data.clone()), hash_bytes(&data), "a");
        let mut out = Vec::new();
        ok.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);

        let mut bad = VerifyingReader::new(Cursor::new(data), hash_bytes(b"other"), "a");
        let err = bad.read_to_end(&mut Vec::new()).unwrap_err();
        assert!(matches!(
            TransportError::from(err),
            TransportError::IntegrityMismatch { .. }
        ));
    }

    #[test]
    fn test_checksum_comparison_ignores_case() {
        assert!(!checksums_match(EMPTY_SHA256, "abc"));
        assert!(checksums_match(EMPTY_SHA256, &EMPTY_SHA256.to_uppercase()));
    }
}
