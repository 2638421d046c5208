//! Send and receive pipelines
//!
//! Send runs plaintext through checksum, LZ4 and the encryption envelope
//! into any sink. Receive runs the inverse and verifies the checksum at EOF.

use crate::crypto::{DecryptingReader, EncryptingWriter};
use crate::error::{Result, TransportError};
use crate::fs::compress::{compress_writer, decompress_reader, finish_encoder};
use crate::fs::{copy_with_progress, ProgressFn, TransferContext};
use crate::hash::{checksums_match, HashingReader, VerifyingReader};
use crate::network::ManifestHeader;
use crate::sync::TransferMetadata;
use lz4_flex::frame::FrameEncoder;
use std::fmt;
use std::io::{self, Read, Write};

/// Which transforms a transport applies on send
#[derive(Clone, Default)]
pub struct PipelinePolicy {
    compress: bool,
    passphrase: Option<String>,
}

impl fmt::Debug for PipelinePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelinePolicy")
            .field("compress", &self.compress)
            .field("encrypt", &self.encrypts())
            .finish()
    }
}

impl PipelinePolicy {
    /// An empty passphrase disables encryption
    pub fn new(compress: bool, passphrase: Option<String>) -> Self {
        Self {
            compress,
            passphrase: passphrase.filter(|p| !p.is_empty()),
        }
    }

    /// No compression, no encryption
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn compresses(&self) -> bool {
        self.compress
    }

    pub fn encrypts(&self) -> bool {
        self.passphrase.is_some()
    }

    pub fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_deref()
    }

    /// Record the transforms this policy applies
    pub fn apply_to(&self, meta: &mut TransferMetadata) {
        meta.is_compressed = self.compress;
        meta.is_encrypted = self.encrypts();
    }

    pub fn manifest_header(&self) -> ManifestHeader {
        ManifestHeader {
            compressed: self.compress,
            encrypted: self.encrypts(),
        }
    }
}

/// Writer stack for the send direction: compress first, then encrypt
enum EncodeWriter<W: Write> {
    Plain(W),
    Compressed(FrameEncoder<W>),
    Encrypted(EncryptingWriter<W>),
    Both(FrameEncoder<EncryptingWriter<W>>),
}

impl<W: Write> EncodeWriter<W> {
    fn new(sink: W, policy: &PipelinePolicy) -> Result<Self> {
        Ok(match (policy.compress, policy.passphrase()) {
            (false, None) => Self::Plain(sink),
            (true, None) => Self::Compressed(compress_writer(sink)),
            (false, Some(pass)) => Self::Encrypted(EncryptingWriter::new(sink, pass)?),
            (true, Some(pass)) => Self::Both(compress_writer(EncryptingWriter::new(sink, pass)?)),
        })
    }

    fn finish(self) -> io::Result<W> {
        match self {
            Self::Plain(mut w) => {
                w.flush()?;
                Ok(w)
            }
            Self::Compressed(w) => finish_encoder(w),
            Self::Encrypted(w) => w.finish(),
            Self::Both(w) => finish_encoder(w)?.finish(),
        }
    }
}

impl<W: Write> Write for EncodeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Compressed(w) => w.write(buf),
            Self::Encrypted(w) => w.write(buf),
            Self::Both(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Compressed(w) => w.flush(),
            Self::Encrypted(w) => w.flush(),
            Self::Both(w) => w.flush(),
        }
    }
}

/// Outcome of running a payload through the send pipeline
#[derive(Debug)]
pub struct Encoded<W> {
    /// The sink, with every transformed byte written and flushed
    pub sink: W,
    /// SHA-256 of the plaintext
    pub checksum: String,
    /// Plaintext length
    pub plain_len: u64,
}

/// Run `source` through the send pipeline into `sink`.
///
/// Progress is reported in plaintext bytes. When `expected` is set, the
/// plaintext checksum must match it; otherwise `IntegrityMismatch` is
/// returned and the caller must not commit what the sink received.
pub fn encode<W: Write>(
    ctx: &TransferContext,
    policy: &PipelinePolicy,
    source: &mut dyn Read,
    sink: W,
    label: &str,
    expected: Option<&str>,
    progress: Option<ProgressFn<'_>>,
) -> Result<Encoded<W>> {
    let mut hashing = HashingReader::new(source);
    let mut writer = EncodeWriter::new(sink, policy)?;

    copy_with_progress(ctx, &mut hashing, &mut writer, progress)?;
    let sink = writer.finish()?;

    let (checksum, plain_len) = hashing.finalize();
    verify_checksum(label, expected, &checksum)?;

    Ok(Encoded {
        sink,
        checksum,
        plain_len,
    })
}

/// Compare a computed checksum with the expected one, if any
pub fn verify_checksum(label: &str, expected: Option<&str>, actual: &str) -> Result<()> {
    match expected {
        Some(expected) if !checksums_match(expected, actual) => {
            Err(TransportError::integrity_mismatch(label, expected, actual))
        }
        _ => Ok(()),
    }
}

/// Reverse the send pipeline over `source`.
///
/// `encrypted` payloads need a passphrase. The envelope magic is checked
/// here, before anything is handed back.
pub fn decode(
    source: Box<dyn Read + Send>,
    compressed: bool,
    encrypted: bool,
    passphrase: Option<&str>,
) -> Result<Box<dyn Read + Send>> {
    let plain: Box<dyn Read + Send> = if encrypted {
        let pass = passphrase.ok_or_else(|| {
            TransportError::config("payload is encrypted but no passphrase is configured")
        })?;
        Box::new(DecryptingReader::new(source, pass)?)
    } else {
        source
    };

    Ok(if compressed {
        Box::new(decompress_reader(plain))
    } else {
        plain
    })
}

/// Reverse the pipeline and, when a checksum is known, verify it at EOF
pub fn decode_verified(
    source: Box<dyn Read + Send>,
    compressed: bool,
    encrypted: bool,
    passphrase: Option<&str>,
    label: &str,
    checksum: Option<&str>,
) -> Result<Box<dyn Read + Send>> {
    let plain = decode(source, compressed, encrypted, passphrase)?;
    Ok(match checksum {
        Some(sum) => Box::new(VerifyingReader::new(plain, sum, label)),
        None => plain,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::is_envelope;
    use crate::fs::compress::is_lz4_frame;
    use crate::hash::hash_bytes;
    use std::io::Cursor;

    fn round_trip(policy: &PipelinePolicy, data: &[u8]) -> Vec<u8> {
        let ctx = TransferContext::new();
        let encoded = encode(&ctx, policy, &mut Cursor::new(data), Vec::new(), "t", None, None).unwrap();
        assert_eq!(encoded.checksum, hash_bytes(data));
        assert_eq!(encoded.plain_len, data.len() as u64);

        let mut out = Vec::new();
        decode_verified(
            Box::new(Cursor::new(encoded.sink)),
            policy.compresses(),
            policy.encrypts(),
            policy.passphrase(),
            "t",
            Some(&encoded.checksum),
        )
        .unwrap()
        .read_to_end(&mut out)
        .unwrap();
        out
    }

    #[test]
    fn test_every_policy_round_trips() {
        let data = b"captured profile data ".repeat(5000);
        for policy in [
            PipelinePolicy::plain(),
            PipelinePolicy::new(true, None),
            PipelinePolicy::new(false, Some("pw".into())),
            PipelinePolicy::new(true, Some("pw".into())),
        ] {
            assert_eq!(round_trip(&policy, &data), data, "{:?}", policy);
            assert!(round_trip(&policy, b"").is_empty());
        }
    }

    #[test]
    fn test_layering_order() {
        let ctx = TransferContext::new();
        let data = vec![0u8; 10_000];

        let both = PipelinePolicy::new(true, Some("pw".into()));
        let out = encode(&ctx, &both, &mut Cursor::new(&data), Vec::new(), "t", None, None).unwrap();
        assert!(is_envelope(&out.sink));

        let compressed = PipelinePolicy::new(true, None);
        let out = encode(&ctx, &compressed, &mut Cursor::new(&data), Vec::new(), "t", None, None).unwrap();
        assert!(is_lz4_frame(&out.sink));
        assert!(out.sink.len() < data.len());
    }

    #[test]
    fn test_checksum_mismatch_on_encode() {
        let ctx = TransferContext::new();
        let err = encode(
            &ctx,
            &PipelinePolicy::plain(),
            &mut Cursor::new(b"abc"),
            Vec::new(),
            "docs/a.txt",
            Some(&hash_bytes(b"abd")),
            None,
        )
        .unwrap_err();
        match err {
            TransportError::IntegrityMismatch { path, .. } => assert_eq!(path, "docs/a.txt"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_decode_errors() {
        let plain = Box::new(Cursor::new(b"not an envelope at all".to_vec()));
        assert!(matches!(
            decode(plain, false, true, Some("pw")).err(),
            Some(TransportError::InvalidFormat(_))
        ));

        let plain = Box::new(Cursor::new(Vec::new()));
        assert!(matches!(
            decode(plain, false, true, None).err(),
            Some(TransportError::Config(_))
        ));
    }

    #[test]
    fn test_flags_recorded() {
        let mut meta = TransferMetadata::new("a", 1);
        PipelinePolicy::new(true, Some(String::new())).apply_to(&mut meta);
        assert!(meta.is_compressed);
        assert!(!meta.is_encrypted);
    }
}
