//! Per-item transfer metadata

use crate::error::{Result, TransportError};
use serde::{Deserialize, Serialize};

/// Metadata travelling with one payload
///
/// `relative_path` is the dedup and resume key. The transport overwrites
/// `is_compressed` and `is_encrypted` on send with what it actually applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct TransferMetadata {
    pub relative_path: String,
    pub size_bytes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Position within a set the caller split itself; transports never touch it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    #[serde(default)]
    pub is_compressed: bool,
    #[serde(default)]
    pub is_encrypted: bool,
}

impl TransferMetadata {
    pub fn new(relative_path: impl Into<String>, size_bytes: i64) -> Self {
        Self {
            relative_path: relative_path.into(),
            size_bytes,
            ..Default::default()
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Validated path components
    pub fn components(&self) -> Result<Vec<&str>> {
        relative_components(&self.relative_path)
    }

    /// Last path component
    pub fn file_name(&self) -> Result<&str> {
        self.components()?
            .pop()
            .ok_or_else(|| TransportError::InvalidPath(self.relative_path.clone()))
    }
}

/// Split a relative path into components, rejecting anything that could
/// escape the data root.
///
/// Both `/` and `\` separate components. Empty and `.` components are
/// dropped; `..`, absolute paths and drive prefixes are rejected.
pub fn relative_components(path: &str) -> Result<Vec<&str>> {
    let invalid = || TransportError::InvalidPath(path.to_string());

    if path.starts_with('/') || path.starts_with('\\') {
        return Err(invalid());
    }
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(invalid());
    }

    let mut parts = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return Err(invalid()),
            p => parts.push(p),
        }
    }

    if parts.is_empty() {
        return Err(invalid());
    }
    Ok(parts)
}

/// Normalized `/`-separated form of a relative path
pub fn normalize_relative_path(path: &str) -> Result<String> {
    Ok(relative_components(path)?.join("/"))
}
