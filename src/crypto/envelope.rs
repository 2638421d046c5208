//! Passphrase encryption with a self-describing envelope
//!
//! Layout:
//!
//! ```text
//! "ZIME" | salt (16) | iv (12) | segment*
//! segment = header (u32 LE: bit 31 = final, bits 0..31 = sealed length)
//!           | AES-256-GCM ciphertext + 16-byte tag
//! ```
//!
//! The key is PBKDF2-HMAC-SHA256(passphrase, salt) with
//! [`KDF_ITERATIONS`] rounds. Salt and IV are fresh per envelope, so equal
//! plaintexts never produce equal ciphertexts. Plaintext is sealed in
//! [`SEGMENT_SIZE`] segments whose nonce is the IV xor the segment counter,
//! with the final flag folded into the nonce as well: reordering, dropping or
//! truncating segments fails authentication. Exactly one final segment is
//! always written, so an empty plaintext still authenticates.

use crate::config::defaults::KDF_ITERATIONS;
use crate::error::{Result, TransportError};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use std::io::{self, Read, Write};

/// Magic bytes identifying an encrypted envelope
pub const ENVELOPE_MAGIC: [u8; 4] = *b"ZIME";

/// Salt length in bytes
pub const SALT_LEN: usize = 16;

/// IV length in bytes
pub const IV_LEN: usize = 12;

/// Authentication tag length in bytes
pub const TAG_LEN: usize = 16;

/// Derived key length in bytes (AES-256)
pub const KEY_LEN: usize = 32;

/// Plaintext bytes per sealed segment
pub const SEGMENT_SIZE: usize = 64 * 1024;

/// Envelope header length (magic + salt + iv)
pub const HEADER_LEN: usize = ENVELOPE_MAGIC.len() + SALT_LEN + IV_LEN;

const FINAL_FLAG: u32 = 0x8000_0000;

/// Passphrase-derived key, zeroed on drop
struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
    fn derive(passphrase: &str, salt: &[u8]) -> Self {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<sha2::Sha256>(passphrase.as_bytes(), salt, KDF_ITERATIONS, &mut key);
        Self(key)
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.0)
            .map_err(|e| TransportError::Crypto(format!("cipher setup failed: {}", e)))
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        for byte in &mut self.0 {
            *byte = 0;
        }
    }
}

fn segment_nonce(iv: &[u8; IV_LEN], counter: u64, last: bool) -> [u8; IV_LEN] {
    let mut nonce = *iv;
    for (i, b) in counter.to_le_bytes().iter().enumerate() {
        nonce[i] ^= b;
    }
    if last {
        nonce[IV_LEN - 1] ^= 0x80;
    }
    nonce
}

/// Check whether data starts with the envelope magic
pub fn is_envelope(data: &[u8]) -> bool {
    data.len() >= ENVELOPE_MAGIC.len() && data[..ENVELOPE_MAGIC.len()] == ENVELOPE_MAGIC
}

/// Encrypt a buffer into a complete envelope
pub fn encrypt(plaintext: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    let mut writer = EncryptingWriter::new(Vec::with_capacity(plaintext.len() + 64), passphrase)?;
    writer.write_all(plaintext)?;
    Ok(writer.finish()?)
}

/// Decrypt a complete envelope
///
/// Fails with [`TransportError::InvalidFormat`] when the data is not an
/// envelope and [`TransportError::Authentication`] when the passphrase is
/// wrong or the data was altered.
pub fn decrypt(envelope: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    let mut reader = DecryptingReader::new(envelope, passphrase)?;
    let mut plaintext = Vec::with_capacity(envelope.len().saturating_sub(HEADER_LEN));
    reader.read_to_end(&mut plaintext)?;
    Ok(plaintext)
}

/// Streaming encryptor
///
/// The envelope header is written on construction; call
/// [`EncryptingWriter::finish`] to seal the final segment. Dropping the
/// writer without finishing leaves an envelope that fails to authenticate.
pub struct EncryptingWriter<W: Write> {
    inner: W,
    cipher: Aes256Gcm,
    iv: [u8; IV_LEN],
    counter: u64,
    pending: Vec<u8>,
}

impl<W: Write> EncryptingWriter<W> {
    /// Create an encryptor with a fresh salt and IV, writing the header
    pub fn new(mut inner: W, passphrase: &str) -> Result<Self> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);

        let cipher = DerivedKey::derive(passphrase, &salt).cipher()?;

        inner.write_all(&ENVELOPE_MAGIC)?;
        inner.write_all(&salt)?;
        inner.write_all(&iv)?;

        Ok(Self {
            inner,
            cipher,
            iv,
            counter: 0,
            pending: Vec::with_capacity(SEGMENT_SIZE * 2),
        })
    }

    fn seal_segment(&mut self, len: usize, last: bool) -> io::Result<()> {
        let nonce = segment_nonce(&self.iv, self.counter, last);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), &self.pending[..len])
            .map_err(|_| TransportError::Crypto("segment encryption failed".to_string()).into_io())?;

        let mut header = sealed.len() as u32;
        if last {
            header |= FINAL_FLAG;
        }

        self.inner.write_all(&header.to_le_bytes())?;
        self.inner.write_all(&sealed)?;
        self.pending.drain(..len);
        self.counter += 1;
        Ok(())
    }

    /// Seal the final segment, flush, and return the inner writer
    pub fn finish(mut self) -> io::Result<W> {
        let len = self.pending.len();
        self.seal_segment(len, true)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        // Hold back at least one byte so the final segment is never empty
        // unless the whole plaintext is.
        while self.pending.len() > SEGMENT_SIZE {
            self.seal_segment(SEGMENT_SIZE, false)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streaming decryptor
pub struct DecryptingReader<R: Read> {
    inner: R,
    cipher: Aes256Gcm,
    iv: [u8; IV_LEN],
    counter: u64,
    plain: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: Read> DecryptingReader<R> {
    /// Read and validate the envelope header, then derive the key
    ///
    /// The magic is checked before any key derivation or decryption.
    pub fn new(mut inner: R, passphrase: &str) -> Result<Self> {
        let mut magic = [0u8; 4];
        read_header_field(&mut inner, &mut magic)?;
        if magic != ENVELOPE_MAGIC {
            return Err(TransportError::InvalidFormat(format!(
                "expected envelope magic \"ZIME\", found {:02x?}",
                magic
            )));
        }

        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        read_header_field(&mut inner, &mut salt)?;
        read_header_field(&mut inner, &mut iv)?;

        let cipher = DerivedKey::derive(passphrase, &salt).cipher()?;

        Ok(Self {
            inner,
            cipher,
            iv,
            counter: 0,
            plain: Vec::new(),
            pos: 0,
            done: false,
        })
    }

    fn next_segment(&mut self) -> Result<()> {
        let mut header = [0u8; 4];
        if let Err(e) = self.inner.read_exact(&mut header) {
            return Err(if e.kind() == io::ErrorKind::UnexpectedEof {
                TransportError::Authentication("envelope truncated before final segment".to_string())
            } else {
                e.into()
            });
        }

        let header = u32::from_le_bytes(header);
        let last = header & FINAL_FLAG != 0;
        let len = (header & !FINAL_FLAG) as usize;
        if !(TAG_LEN..=SEGMENT_SIZE + TAG_LEN).contains(&len) {
            return Err(TransportError::InvalidFormat(format!(
                "corrupt segment length {} at segment {}",
                len, self.counter
            )));
        }

        let mut sealed = vec![0u8; len];
        if let Err(e) = self.inner.read_exact(&mut sealed) {
            return Err(if e.kind() == io::ErrorKind::UnexpectedEof {
                TransportError::Authentication(format!("segment {} truncated", self.counter))
            } else {
                e.into()
            });
        }

        let nonce = segment_nonce(&self.iv, self.counter, last);
        self.plain = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_slice())
            .map_err(|_| {
                TransportError::Authentication(
                    "wrong passphrase or corrupted ciphertext".to_string(),
                )
            })?;
        self.pos = 0;
        self.counter += 1;

        if last {
            self.done = true;
            let mut probe = [0u8; 1];
            if self.inner.read(&mut probe)? != 0 {
                return Err(TransportError::InvalidFormat(
                    "trailing data after final segment".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn read_header_field<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            TransportError::InvalidFormat("data too short for envelope header".to_string())
        } else {
            e.into()
        }
    })
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.plain.len() {
            if self.done {
                return Ok(0);
            }
            self.next_segment().map_err(TransportError::into_io)?;
        }

        let n = buf.len().min(self.plain.len() - self.pos);
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hello_world_envelope() {
        let envelope = encrypt(b"Hello, World!", "x").unwrap();
        assert_eq!(&envelope[..4], b"ZIME");
        assert!(is_envelope(&envelope));

        assert_eq!(decrypt(&envelope, "x").unwrap(), b"Hello, World!");

        match decrypt(&envelope, "y") {
            Err(TransportError::Authentication(_)) => {}
            other => panic!("expected authentication error, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_magic_is_invalid_format() {
        let mut envelope = encrypt(b"Hello, World!", "x").unwrap();
        envelope[0] = b'X';
        assert!(matches!(
            decrypt(&envelope, "x"),
            Err(TransportError::InvalidFormat(_))
        ));

        assert!(matches!(
            decrypt(b"plain text, not ours", "x"),
            Err(TransportError::InvalidFormat(_))
        ));
        assert!(matches!(decrypt(b"ZI", "x"), Err(TransportError::InvalidFormat(_))));
    }

    #[test]
    fn test_fresh_salt_per_call() {
        let a = encrypt(b"same input", "pw").unwrap();
        let b = encrypt(b"same input", "pw").unwrap();
        assert_ne!(a, b);
        assert_ne!(a[4..4 + SALT_LEN], b[4..4 + SALT_LEN]);
    }

    #[test]
    fn test_empty_and_segment_boundaries() {
        for len in [0usize, 1, SEGMENT_SIZE - 1, SEGMENT_SIZE, SEGMENT_SIZE + 1, 3 * SEGMENT_SIZE] {
            let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
            let envelope = encrypt(&data, "boundary").unwrap();
            assert_eq!(decrypt(&envelope, "boundary").unwrap(), data, "len {}", len);
        }
    }

    #[test]
    fn test_truncation_detected() {
        let data = vec![42u8; SEGMENT_SIZE * 2 + 10];
        let envelope = encrypt(&data, "pw").unwrap();

        // Drop the final segment entirely
        let first_segment_end = HEADER_LEN + 4 + SEGMENT_SIZE + TAG_LEN;
        let truncated = &envelope[..first_segment_end];
        assert!(matches!(
            decrypt(truncated, "pw"),
            Err(TransportError::Authentication(_))
        ));

        // Cut mid-segment
        let cut = &envelope[..envelope.len() - 5];
        assert!(matches!(decrypt(cut, "pw"), Err(TransportError::Authentication(_))));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let mut envelope = encrypt(b"some important bytes", "pw").unwrap();
        let last = envelope.len() - 1;
        envelope[last] ^= 0x01;
        assert!(matches!(
            decrypt(&envelope, "pw"),
            Err(TransportError::Authentication(_))
        ));
    }

    #[test]
    fn test_streaming_small_writes() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();
        let mut writer = EncryptingWriter::new(Vec::new(), "stream").unwrap();
        for piece in data.chunks(777) {
            writer.write_all(piece).unwrap();
        }
        let envelope = writer.finish().unwrap();

        let mut reader = DecryptingReader::new(envelope.as_slice(), "stream").unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 1000];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn prop_round_trip(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let envelope = encrypt(&data, "prop").unwrap();
            prop_assert_eq!(decrypt(&envelope, "prop").unwrap(), data);
        }
    }
}
