//! Resume ledger
//!
//! Records which payloads have been durably committed on a medium, keyed by
//! normalized relative path and checksum, so a retried session can skip
//! them. An entry is dropped before its payload is replaced and written
//! again after the new one is committed. The file is rewritten in full
//! (temp file + rename) on every change.

use super::metadata::normalize_relative_path;
use crate::error::{IoResultExt, Result, TransportError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tracing::debug;

/// Persisted record of completed transfers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResumeLedger {
    /// Relative paths committed so far
    #[serde(default)]
    pub completed_files: BTreeSet<String>,
    /// Checksum each path was committed with
    #[serde(default)]
    pub checksums: BTreeMap<String, String>,
    /// Stored part count of payloads committed as chunk sets
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub part_counts: BTreeMap<String, u32>,
    /// Time of the last update
    #[serde(default = "Utc::now")]
    pub last_updated_utc: DateTime<Utc>,
}

impl Default for ResumeLedger {
    fn default() -> Self {
        Self {
            completed_files: BTreeSet::new(),
            checksums: BTreeMap::new(),
            part_counts: BTreeMap::new(),
            last_updated_utc: Utc::now(),
        }
    }
}

impl ResumeLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a send of `relative_path` with `checksum` can be skipped.
    ///
    /// Only a known checksum equal to the recorded one counts; a send without
    /// a checksum is never skipped.
    pub fn is_complete(&self, relative_path: &str, checksum: Option<&str>) -> bool {
        let key = ledger_key(relative_path);
        match (checksum, self.checksums.get(&key)) {
            (Some(wanted), Some(recorded)) => {
                self.completed_files.contains(&key) && wanted.eq_ignore_ascii_case(recorded)
            }
            _ => false,
        }
    }

    /// Record a committed payload
    pub fn record(&mut self, relative_path: &str, checksum: Option<&str>) {
        let key = ledger_key(relative_path);
        match checksum {
            Some(sum) => {
                self.checksums.insert(key.clone(), sum.to_ascii_lowercase());
            }
            None => {
                self.checksums.remove(&key);
            }
        }
        self.completed_files.insert(key);
        self.last_updated_utc = Utc::now();
    }

    /// Remember how many parts a committed payload was stored as
    pub fn set_part_count(&mut self, relative_path: &str, parts: u32) {
        let key = ledger_key(relative_path);
        if parts > 1 {
            self.part_counts.insert(key, parts);
        } else {
            self.part_counts.remove(&key);
        }
    }

    /// Stored part count, for payloads committed as chunk sets
    pub fn part_count(&self, relative_path: &str) -> Option<u32> {
        self.part_counts.get(&ledger_key(relative_path)).copied()
    }

    /// Drop every trace of `relative_path`; returns whether there was one
    pub fn forget(&mut self, relative_path: &str) -> bool {
        let key = ledger_key(relative_path);
        let known = self.completed_files.remove(&key);
        self.checksums.remove(&key);
        self.part_counts.remove(&key);
        if known {
            self.last_updated_utc = Utc::now();
        }
        known
    }

    /// Completed relative paths
    pub fn completed(&self) -> HashSet<String> {
        self.completed_files.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.completed_files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed_files.is_empty()
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse from JSON
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| TransportError::Manifest(format!("invalid resume ledger: {}", e)))
    }

    /// Load a ledger file; a missing file is an empty ledger
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(data) => Self::from_json(&data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(TransportError::io(path, e)),
        }
    }

    /// Atomically replace the ledger file
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(crate::config::defaults::TEMP_SUFFIX);
        let temp_path = std::path::PathBuf::from(temp_name);

        let data = self.to_json()?;
        {
            let file = File::create(&temp_path).with_path(&temp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&data).with_path(&temp_path)?;
            writer.flush().with_path(&temp_path)?;
            writer.get_ref().sync_all().with_path(&temp_path)?;
        }

        std::fs::rename(&temp_path, path).with_path(path)?;
        debug!("Resume ledger saved with {} entries", self.len());
        Ok(())
    }
}

/// `docs\a.txt` and `docs/a.txt` name the same stored payload
fn ledger_key(relative_path: &str) -> String {
    normalize_relative_path(relative_path).unwrap_or_else(|_| relative_path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_skip_requires_matching_checksum() {
        let mut ledger = ResumeLedger::new();
        ledger.record("docs/a.txt", Some("ABCD"));

        assert!(ledger.is_complete("docs/a.txt", Some("abcd")));
        assert!(!ledger.is_complete("docs/a.txt", Some("ffff")));
        assert!(!ledger.is_complete("docs/a.txt", None));
        assert!(!ledger.is_complete("docs/b.txt", Some("abcd")));
        assert!(ledger.completed().contains("docs/a.txt"));
    }

    #[test]
    fn test_record_without_checksum_clears_old_one() {
        let mut ledger = ResumeLedger::new();
        ledger.record("a", Some("11"));
        ledger.record("a", None);
        assert!(!ledger.is_complete("a", Some("11")));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_spellings_of_one_path_share_an_entry() {
        let mut ledger = ResumeLedger::new();
        ledger.record("docs/a.txt", Some("aa"));
        ledger.record("docs\\a.txt", Some("bb"));

        assert_eq!(ledger.len(), 1);
        assert!(!ledger.is_complete("docs/a.txt", Some("aa")));
        assert!(ledger.is_complete("./docs//a.txt", Some("bb")));
        assert!(ledger.completed().contains("docs/a.txt"));
    }

    #[test]
    fn test_forget_drops_entry_and_part_count() {
        let mut ledger = ResumeLedger::new();
        ledger.record("big.bin", Some("aa"));
        ledger.set_part_count("big.bin", 3);
        assert_eq!(ledger.part_count("big.bin"), Some(3));

        assert!(ledger.forget("big.bin"));
        assert!(!ledger.forget("big.bin"));
        assert!(ledger.is_empty());
        assert_eq!(ledger.part_count("big.bin"), None);
        assert!(!ledger.is_complete("big.bin", Some("aa")));

        ledger.set_part_count("small.bin", 1);
        assert_eq!(ledger.part_count("small.bin"), None);
    }

    #[test]
    fn test_json_layout() {
        let mut ledger = ResumeLedger::new();
        ledger.record("x/y.bin", Some("aa"));
        let json = String::from_utf8(ledger.to_json().unwrap()).unwrap();
        assert!(json.contains("\"CompletedFiles\""));
        assert!(json.contains("\"Checksums\""));
        assert!(json.contains("\"LastUpdatedUtc\""));
        assert!(json.contains("\"x/y.bin\": \"aa\""));
    }

    #[test]
    fn test_save_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("zim-resume.json");

        assert!(ResumeLedger::load(&path).unwrap().is_empty());

        let mut ledger = ResumeLedger::new();
        ledger.record("one", Some("01"));
        ledger.record("two", Some("02"));
        ledger.save(&path).unwrap();

        let loaded = ResumeLedger::load(&path).unwrap();
        assert_eq!(loaded, ledger);
        assert!(!dir.path().join("zim-resume.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_ledger_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("zim-resume.json");
        std::fs::write(&path, b"garbage").unwrap();
        assert!(matches!(ResumeLedger::load(&path), Err(TransportError::Manifest(_))));
    }
}
