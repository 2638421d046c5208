//! Filesystem-rooted payload store
//!
//! Shared by the external storage and network share transports. Payloads
//! are staged as `<final>.partNNNN.tmp` next to their destination and only
//! renamed into place once fully written and verified. A multi-part set is
//! renamed highest index first, so `part0000` appearing marks it complete.

use super::pipeline::{self, PipelinePolicy};
use super::data_path;
use crate::config::defaults::{MANIFEST_FILE_NAME, PROBE_FILE_PREFIX, RESUME_FILE_NAME, TEMP_SUFFIX};
use crate::error::{IoResultExt, Result, TransportError};
use crate::fs::chunk::{chunk_path, parse_chunk_index};
use crate::fs::{
    copy_with_progress, discover_chunk_set, reassemble, CompressionStats, ProgressFn, RollingChunkWriter,
    TransferContext,
};
use crate::sync::{ResumeLedger, TransferManifest, TransferMetadata};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

/// Payload store under a filesystem root
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    policy: PipelinePolicy,
    part_ceiling: Option<u64>,
    spool_reads: bool,
    lock: Mutex<()>,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>, policy: PipelinePolicy) -> Self {
        Self {
            root: root.into(),
            policy,
            part_ceiling: None,
            spool_reads: false,
            lock: Mutex::new(()),
        }
    }

    /// Cap the size of each stored part; larger payloads become chunk sets
    pub fn with_part_ceiling(mut self, ceiling: Option<u64>) -> Self {
        self.part_ceiling = ceiling.filter(|&c| c > 0);
        self
    }

    /// Copy committed payloads to a local temp file before decoding
    pub fn with_spooled_reads(mut self, spool: bool) -> Self {
        self.spool_reads = spool;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> &PipelinePolicy {
        &self.policy
    }

    pub fn part_ceiling(&self) -> Option<u64> {
        self.part_ceiling
    }

    /// Committed location of an item
    pub fn payload_path(&self, relative_path: &str) -> Result<PathBuf> {
        let rel = data_path(relative_path)?;
        Ok(rel.split('/').fold(self.root.clone(), |acc, part| acc.join(part)))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE_NAME)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(RESUME_FILE_NAME)
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write and delete a probe file under the root
    pub fn probe(&self) -> bool {
        match self.try_probe() {
            Ok(()) => true,
            Err(e) => {
                debug!("Probe of {} failed: {}", self.root.display(), e);
                false
            }
        }
    }

    fn try_probe(&self) -> Result<()> {
        let _guard = self.guard();
        fs::create_dir_all(&self.root).with_path(&self.root)?;

        let path = self.root.join(format!("{}-{}", PROBE_FILE_PREFIX, Uuid::new_v4()));
        let marker = path.to_string_lossy().into_owned();
        fs::write(&path, marker.as_bytes()).with_path(&path)?;
        let back = fs::read(&path).with_path(&path);
        fs::remove_file(&path).with_path(&path)?;

        if back? != marker.as_bytes() {
            return Err(TransportError::Remote(format!(
                "probe file under {} read back different content",
                self.root.display()
            )));
        }
        Ok(())
    }

    /// Resume ledger as currently stored
    pub fn ledger(&self) -> Result<ResumeLedger> {
        let _guard = self.guard();
        ResumeLedger::load(&self.ledger_path())
    }

    pub fn completed(&self) -> Result<HashSet<String>> {
        Ok(self.ledger()?.completed())
    }

    pub fn send(
        &self,
        ctx: &TransferContext,
        source: &mut dyn Read,
        meta: &mut TransferMetadata,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<()> {
        let final_path = self.payload_path(&meta.relative_path)?;
        let (dir, name) = split_final(&final_path)?;
        self.policy.apply_to(meta);

        let _guard = self.guard();
        let ledger_path = self.ledger_path();
        let mut ledger = ResumeLedger::load(&ledger_path)?;
        if ledger.is_complete(&meta.relative_path, meta.checksum.as_deref()) {
            info!("Skipping '{}': already delivered", meta.relative_path);
            return Ok(());
        }

        fs::create_dir_all(dir).with_path(dir)?;
        let staging = RollingChunkWriter::staging(dir, name, self.part_ceiling.unwrap_or(0));
        let encoded = pipeline::encode(
            ctx,
            &self.policy,
            source,
            staging,
            &meta.relative_path,
            meta.checksum.as_deref(),
            progress,
        )?;
        let stored = encoded.sink.bytes_written();
        let staged = encoded.sink.finish().with_path(dir)?;

        let committed = ctx
            .check()
            .and_then(|()| forget_entry(&mut ledger, &ledger_path, &meta.relative_path))
            .and_then(|()| commit_parts(dir, name, &staged, &final_path));
        if let Err(e) = committed {
            discard(&staged);
            return Err(e);
        }

        ledger.record(&meta.relative_path, Some(&encoded.checksum));
        ledger.set_part_count(&meta.relative_path, staged.len() as u32);
        ledger.save(&ledger_path)?;

        let stats = CompressionStats::new(encoded.plain_len, stored);
        info!(
            "Committed '{}' ({} -> {} bytes, {:.1}% saved, {} part(s))",
            meta.relative_path,
            stats.original_size,
            stats.compressed_size,
            stats.space_saved_percent(),
            staged.len()
        );
        Ok(())
    }

    pub fn receive(&self, ctx: &TransferContext, meta: &TransferMetadata) -> Result<Box<dyn Read + Send>> {
        let final_path = self.payload_path(&meta.relative_path)?;
        let (dir, name) = split_final(&final_path)?;

        let _guard = self.guard();
        let raw: Box<dyn Read + Send> = if final_path.is_file() {
            Box::new(File::open(&final_path).with_path(&final_path)?)
        } else {
            let expected = ResumeLedger::load(&self.ledger_path())?.part_count(&meta.relative_path);
            let parts = discover_chunk_set(dir, name, expected)?;
            Box::new(reassemble(&parts)?)
        };

        let raw = if self.spool_reads {
            spool_local(ctx, raw)?
        } else {
            raw
        };

        pipeline::decode_verified(
            raw,
            self.policy.compresses(),
            self.policy.encrypts(),
            self.policy.passphrase(),
            &meta.relative_path,
            meta.checksum.as_deref(),
        )
    }

    pub fn write_manifest(&self, ctx: &TransferContext, manifest: &TransferManifest) -> Result<()> {
        let json = manifest.to_json()?;
        let final_path = self.manifest_path();
        let temp_path = with_suffix(&final_path, TEMP_SUFFIX);

        let _guard = self.guard();
        fs::create_dir_all(&self.root).with_path(&self.root)?;

        let result = (|| {
            let file = File::create(&temp_path).with_path(&temp_path)?;
            let encoded = pipeline::encode(
                ctx,
                &self.policy,
                &mut json.as_slice(),
                BufWriter::new(file),
                MANIFEST_FILE_NAME,
                None,
                None,
            )?;
            let file = encoded.sink.into_inner().map_err(|e| e.into_error()).with_path(&temp_path)?;
            file.sync_all().with_path(&temp_path)?;
            fs::rename(&temp_path, &final_path).with_path(&final_path)
        })();

        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        } else {
            info!("Manifest written to {}", final_path.display());
        }
        result
    }

    pub fn read_manifest(&self, _ctx: &TransferContext) -> Result<TransferManifest> {
        let path = self.manifest_path();
        let _guard = self.guard();

        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TransportError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(TransportError::io(&path, e)),
        };

        let mut reader = pipeline::decode(
            Box::new(file),
            self.policy.compresses(),
            self.policy.encrypts(),
            self.policy.passphrase(),
        )?;
        let mut json = Vec::new();
        reader.read_to_end(&mut json)?;
        TransferManifest::from_json(&json)
    }
}

fn split_final(path: &Path) -> Result<(&Path, &str)> {
    let invalid = || TransportError::InvalidPath(path.display().to_string());
    let dir = path.parent().ok_or_else(invalid)?;
    let name = path.file_name().and_then(|n| n.to_str()).ok_or_else(invalid)?;
    Ok((dir, name))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn discard(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!("Could not remove staged {}: {}", path.display(), e);
            }
        }
    }
}

/// Drop the ledger entry before the committed payload is touched
fn forget_entry(ledger: &mut ResumeLedger, ledger_path: &Path, relative_path: &str) -> Result<()> {
    if ledger.forget(relative_path) {
        ledger.save(ledger_path)?;
    }
    Ok(())
}

/// Replace whatever is committed under `final_path` with the staged parts
fn commit_parts(dir: &Path, name: &str, staged: &[PathBuf], final_path: &Path) -> Result<()> {
    let mut stale: Vec<u32> = fs::read_dir(dir)
        .with_path(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().and_then(|n| parse_chunk_index(n, name)))
        .collect();
    stale.sort_unstable();

    // part0000 goes first so an old set stops looking complete
    for index in stale {
        remove_if_present(&chunk_path(dir, name, index))?;
    }

    if let [single] = staged {
        fs::rename(single, final_path).with_path(final_path)?;
        return Ok(());
    }

    remove_if_present(final_path)?;
    for (index, part) in staged.iter().enumerate().rev() {
        let target = chunk_path(dir, name, index as u32);
        fs::rename(part, &target).with_path(&target)?;
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TransportError::io(path, e)),
    }
}

fn spool_local(ctx: &TransferContext, mut raw: Box<dyn Read + Send>) -> Result<Box<dyn Read + Send>> {
    let mut spool = tempfile::tempfile()?;
    {
        let mut writer = BufWriter::new(&mut spool);
        copy_with_progress(ctx, &mut raw, &mut writer, None)?;
    }
    spool.seek(SeekFrom::Start(0))?;
    Ok(Box::new(spool))
}
