//! Error types for ZIM transport
//!
//! Every transport operation returns [`Result`]. The variants are chosen so a
//! caller can tell apart the cases the protocol cares about: a payload that is
//! not there, an envelope that is not ours, a wrong passphrase, and a transfer
//! that was cancelled.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for transport operations
#[derive(Error, Debug)]
pub enum TransportError {
    /// I/O error during file operations
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Committed payload (or manifest, or ledger) not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A chunk set is incomplete
    #[error("Incomplete chunk set for '{base}': missing chunk {index:04}")]
    MissingChunk { base: String, index: u32 },

    /// Data does not start with the expected envelope magic
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Authentication tag did not verify (wrong passphrase or tampered data)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Other cryptographic failure (key derivation, cipher setup)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Checksum verification failed
    #[error("Integrity check failed for '{path}': expected {expected}, got {actual}")]
    IntegrityMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// Invalid relative path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Network/SSH/Bluetooth connection error
    #[error("Connection error to '{host}': {message}")]
    Connection { host: String, message: String },

    /// SSH authentication failed
    #[error("SSH authentication failed for '{user}@{host}': {message}")]
    SshAuthentication {
        user: String,
        host: String,
        message: String,
    },

    /// Remote side reported or caused a failure
    #[error("Remote transfer error: {0}")]
    Remote(String),

    /// Wire protocol violation on a stream transport
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Manifest or ledger parsing/writing error
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Operation not available for this medium or build
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Operation cancelled by user
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation timed out
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<TransportError>,
    },
}

impl TransportError {
    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an integrity mismatch error
    pub fn integrity_mismatch(
        path: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::IntegrityMismatch {
            path: path.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a connection error
    pub fn connection(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create an SSH authentication error
    pub fn auth(
        user: impl Into<String>,
        host: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::SshAuthentication {
            user: user.into(),
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Check if this error is recoverable (the whole call can be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. }
            | Self::Connection { .. }
            | Self::Remote(_)
            | Self::Timeout(_)
            | Self::IntegrityMismatch { .. } => true,
            Self::WithContext { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }

    /// Check if this is a not-found condition (missing payload or chunk)
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::MissingChunk { .. } => true,
            Self::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            Self::WithContext { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Get the path associated with this error, if any
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Io { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Wrap this error in an `io::Error` so it can cross a `Read`/`Write`
    /// boundary and be recovered intact by `From<io::Error>`.
    pub fn into_io(self) -> std::io::Error {
        let kind = match &self {
            Self::Cancelled => std::io::ErrorKind::Interrupted,
            Self::NotFound(_) | Self::MissingChunk { .. } => std::io::ErrorKind::NotFound,
            _ => std::io::ErrorKind::InvalidData,
        };
        std::io::Error::new(kind, self)
    }
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        if err
            .get_ref()
            .map(|inner| inner.is::<TransportError>())
            .unwrap_or(false)
        {
            if let Some(inner) = err.into_inner() {
                if let Ok(transport) = inner.downcast::<TransportError>() {
                    return *transport;
                }
            }
            return TransportError::Remote("unrecoverable wrapped error".to_string());
        }

        TransportError::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Manifest(err.to_string())
    }
}

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Add path context to an I/O error
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| match TransportError::from(e) {
            TransportError::Io { source, .. } => TransportError::io(path, source),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = TransportError::io("/test/path", io_err);
        assert_eq!(err.path().unwrap(), &PathBuf::from("/test/path"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_error_recoverability() {
        assert!(TransportError::Timeout(30).is_recoverable());
        assert!(!TransportError::Cancelled.is_recoverable());
        assert!(!TransportError::Authentication("bad tag".into()).is_recoverable());

        let wrapped = TransportError::connection("host", "reset").with_context("sending item");
        assert!(wrapped.is_recoverable());
    }

    #[test]
    fn test_wrapped_error_survives_io_boundary() {
        let io_err = TransportError::InvalidFormat("bad magic".into()).into_io();
        match TransportError::from(io_err) {
            TransportError::InvalidFormat(msg) => assert_eq!(msg, "bad magic"),
            other => panic!("unexpected variant: {other:?}"),
        }

        let io_err = TransportError::Cancelled.into_io();
        assert_eq!(io_err.kind(), std::io::ErrorKind::Interrupted);
        assert!(matches!(TransportError::from(io_err), TransportError::Cancelled));
    }

    #[test]
    fn test_with_path_keeps_wrapped_variant() {
        let res: std::io::Result<()> = Err(TransportError::Authentication("tag".into()).into_io());
        let err = res.with_path("/tmp/x").unwrap_err();
        assert!(matches!(err, TransportError::Authentication(_)));

        let res: std::io::Result<()> = Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let err = res.with_path("/tmp/x").unwrap_err();
        assert_eq!(err.path().unwrap(), &PathBuf::from("/tmp/x"));
    }
}
