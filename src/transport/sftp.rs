//! SFTP transport
//!
//! Payloads are encoded into a local staging directory first, so the
//! checksum is settled before anything reaches the server. Uploads land on
//! `.tmp` names and are renamed into place; chunk sets are renamed highest
//! index first. The resume ledger lives next to the data on the server.

use super::pipeline::{self, PipelinePolicy};
use super::{data_path, ProgressFn, TransferContext, Transport, TransportMethod};
use crate::config::defaults::{MANIFEST_FILE_NAME, PROBE_FILE_PREFIX, RESUME_FILE_NAME, TEMP_SUFFIX};
use crate::error::{IoResultExt, Result, TransportError};
use crate::fs::chunk::{chunk_name, complete_chunk_count, parse_chunk_index};
use crate::fs::{CompressionStats, RollingChunkWriter};
use crate::network::{remote_join, remote_split, SftpClient};
use crate::sync::{ResumeLedger, TransferManifest, TransferMetadata};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct SftpState {
    client: Box<dyn SftpClient>,
    closed: bool,
}

/// Transport to a directory on an SFTP server
pub struct SftpTransport {
    base: String,
    policy: PipelinePolicy,
    chunk_size: Option<u64>,
    state: Mutex<SftpState>,
    ledger_lock: Arc<Mutex<()>>,
}

impl SftpTransport {
    /// `base` is the remote root; the session is opened on first use
    pub fn new(
        client: Box<dyn SftpClient>,
        base: impl Into<String>,
        policy: PipelinePolicy,
        chunk_size: Option<u64>,
    ) -> Self {
        Self {
            base: base.into(),
            policy,
            chunk_size: chunk_size.filter(|&c| c > 0),
            state: Mutex::new(SftpState { client, closed: false }),
            ledger_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Serialize ledger updates with other transports writing the same base
    pub fn with_ledger_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.ledger_lock = lock;
        self
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn remote_path(&self, relative_path: &str) -> Result<String> {
        Ok(remote_join(&self.base, &data_path(relative_path)?))
    }

    fn ledger_path(&self) -> String {
        remote_join(&self.base, RESUME_FILE_NAME)
    }

    fn manifest_path(&self) -> String {
        remote_join(&self.base, MANIFEST_FILE_NAME)
    }

    /// Lock the session and make sure it is open
    fn connected(&self) -> Result<MutexGuard<'_, SftpState>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(TransportError::connection(state.client.host(), "transport closed"));
        }
        if !state.client.is_connected() {
            state.client.connect()?;
            info!("SFTP session to {} open", state.client.host());
        }
        Ok(state)
    }

    fn load_ledger(&self, client: &mut dyn SftpClient) -> Result<ResumeLedger> {
        let mut json = Vec::new();
        match client.download(&self.ledger_path(), &mut json) {
            Ok(_) => ResumeLedger::from_json(&json),
            Err(e) if e.is_not_found() => Ok(ResumeLedger::new()),
            Err(e) => Err(e),
        }
    }

    fn save_ledger(&self, client: &mut dyn SftpClient, ledger: &ResumeLedger) -> Result<()> {
        let json = ledger.to_json()?;
        put_atomic(client, &mut json.as_slice(), &self.ledger_path())
    }

    /// Reload the remote ledger, add one entry and write it back
    fn record_delivery(&self, client: &mut dyn SftpClient, relative_path: &str, checksum: &str, parts: u32) -> Result<()> {
        let _guard = self.ledger_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ledger = self.load_ledger(client)?;
        ledger.record(relative_path, Some(checksum));
        ledger.set_part_count(relative_path, parts);
        self.save_ledger(client, &ledger)
    }

    /// Drop the remote entry for `relative_path` before its payload is replaced
    fn forget_delivery(&self, client: &mut dyn SftpClient, relative_path: &str) -> Result<()> {
        let _guard = self.ledger_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ledger = self.load_ledger(client)?;
        if ledger.forget(relative_path) {
            self.save_ledger(client, &ledger)?;
        }
        Ok(())
    }

    fn try_probe(&self) -> Result<()> {
        let mut state = self.connected()?;
        let client = state.client.as_mut();

        client.create_dir_all(&self.base)?;
        let probe = remote_join(&self.base, &format!("{}-{}", PROBE_FILE_PREFIX, Uuid::new_v4()));
        client.upload(&mut probe.as_bytes(), &probe)?;
        let found = client.exists(&probe);
        client.delete(&probe)?;

        if !found? {
            return Err(TransportError::Remote(format!("probe {} vanished after upload", probe)));
        }
        Ok(())
    }

    /// Upload staged parts under `.tmp` names; returns `(temp, target)` pairs
    fn upload_parts(
        &self,
        ctx: &TransferContext,
        client: &mut dyn SftpClient,
        parts: &[PathBuf],
        remote: &str,
    ) -> Result<Vec<(String, String)>> {
        let (dir, name) = remote_split(remote);
        let targets: Vec<String> = match parts {
            [_] => vec![remote.to_string()],
            _ => (0..parts.len())
                .map(|i| remote_join(dir, &chunk_name(name, i as u32)))
                .collect(),
        };

        let mut uploaded = Vec::with_capacity(parts.len());
        let result = (|| {
            for (part, target) in parts.iter().zip(targets) {
                ctx.check()?;
                let temp = format!("{}{}", target, TEMP_SUFFIX);
                let mut file = BufReader::new(File::open(part).with_path(part)?);
                uploaded.push((temp.clone(), target));
                let len = client.upload(&mut file, &temp)?;
                debug!("Uploaded {} ({} bytes)", temp, len);
            }
            ctx.check()
        })();

        if let Err(e) = result {
            remove_temps(client, &uploaded);
            return Err(e);
        }
        Ok(uploaded)
    }

    /// Fetch the committed payload into a local spool file
    fn fetch(&self, ctx: &TransferContext, client: &mut dyn SftpClient, remote: &str, expected: Option<u32>) -> Result<File> {
        let mut spool = tempfile::tempfile()?;
        {
            let mut writer = BufWriter::new(&mut spool);
            if client.exists(remote)? {
                client.download(remote, &mut writer)?;
            } else {
                let (dir, name) = remote_split(remote);
                let indices: Vec<u32> = match client.list(dir) {
                    Ok(entries) => entries
                        .iter()
                        .filter_map(|entry| parse_chunk_index(&entry.name, name))
                        .collect(),
                    Err(e) if e.is_not_found() => Vec::new(),
                    Err(e) => return Err(e),
                };
                if indices.is_empty() {
                    return Err(TransportError::NotFound(remote.to_string()));
                }

                let count = complete_chunk_count(name, indices, expected)?;
                for index in 0..count {
                    ctx.check()?;
                    client.download(&remote_join(dir, &chunk_name(name, index)), &mut writer)?;
                }
            }
            writer.flush()?;
        }
        spool.seek(SeekFrom::Start(0))?;
        Ok(spool)
    }
}

/// Upload to `<path>.tmp`, then rename over `path`
fn put_atomic(client: &mut dyn SftpClient, source: &mut dyn Read, path: &str) -> Result<()> {
    let temp = format!("{}{}", path, TEMP_SUFFIX);
    if let Err(e) = client.upload(source, &temp) {
        let _ = client.delete(&temp);
        return Err(e);
    }
    client.rename(&temp, path)
}

/// Replace the committed variants of `remote` with the uploaded parts,
/// highest index first
fn commit_uploads(client: &mut dyn SftpClient, remote: &str, uploaded: &[(String, String)]) -> Result<()> {
    let (dir, name) = remote_split(remote);
    remove_stale(client, dir, name, remote, uploaded.len() > 1)?;
    for (temp, target) in uploaded.iter().rev() {
        client.rename(temp, target)?;
    }
    Ok(())
}

fn remove_temps(client: &mut dyn SftpClient, uploaded: &[(String, String)]) {
    for (temp, _) in uploaded {
        if let Err(e) = client.delete(temp) {
            warn!("Could not remove {}: {}", temp, e);
        }
    }
}

/// Delete committed variants of `name` that the new upload replaces
fn remove_stale(client: &mut dyn SftpClient, dir: &str, name: &str, remote: &str, chunked: bool) -> Result<()> {
    let mut stale: Vec<u32> = match client.list(dir) {
        Ok(entries) => entries
            .iter()
            .filter_map(|entry| parse_chunk_index(&entry.name, name))
            .collect(),
        Err(e) if e.is_not_found() => Vec::new(),
        Err(e) => return Err(e),
    };
    stale.sort_unstable();

    for index in stale {
        client.delete(&remote_join(dir, &chunk_name(name, index)))?;
    }
    if chunked {
        client.delete(remote)?;
    }
    Ok(())
}

impl Transport for SftpTransport {
    fn method(&self) -> TransportMethod {
        TransportMethod::Sftp
    }

    fn test_connection(&self, _ctx: &TransferContext) -> bool {
        match self.try_probe() {
            Ok(()) => true,
            Err(e) => {
                debug!("SFTP probe of {} failed: {}", self.base, e);
                false
            }
        }
    }

    fn send(
        &self,
        ctx: &TransferContext,
        source: &mut dyn Read,
        meta: &mut TransferMetadata,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<()> {
        let remote = self.remote_path(&meta.relative_path)?;
        let (dir, name) = remote_split(&remote);
        self.policy.apply_to(meta);

        let mut state = self.connected()?;
        let client = state.client.as_mut();

        let ledger = self.load_ledger(client)?;
        if ledger.is_complete(&meta.relative_path, meta.checksum.as_deref()) {
            info!("Skipping '{}': already on {}", meta.relative_path, client.host());
            return Ok(());
        }

        let staging = tempfile::tempdir()?;
        let writer = RollingChunkWriter::new(staging.path(), name, self.chunk_size.unwrap_or(0));
        let encoded = pipeline::encode(
            ctx,
            &self.policy,
            source,
            writer,
            &meta.relative_path,
            meta.checksum.as_deref(),
            progress,
        )?;
        let stored = encoded.sink.bytes_written();
        let parts = encoded.sink.finish().with_path(staging.path())?;

        client.create_dir_all(dir)?;
        let uploaded = self.upload_parts(ctx, client, &parts, &remote)?;

        let committed = self
            .forget_delivery(client, &meta.relative_path)
            .and_then(|()| commit_uploads(client, &remote, &uploaded));
        if let Err(e) = committed {
            remove_temps(client, &uploaded);
            return Err(e);
        }

        self.record_delivery(client, &meta.relative_path, &encoded.checksum, parts.len() as u32)?;

        let stats = CompressionStats::new(encoded.plain_len, stored);
        info!(
            "Committed '{}' to {}:{} ({} -> {} bytes, {:.1}% saved, {} part(s))",
            meta.relative_path,
            client.host(),
            remote,
            stats.original_size,
            stats.compressed_size,
            stats.space_saved_percent(),
            parts.len()
        );
        Ok(())
    }

    fn receive(&self, ctx: &TransferContext, meta: &TransferMetadata) -> Result<Box<dyn Read + Send>> {
        let remote = self.remote_path(&meta.relative_path)?;
        let spool = {
            let mut state = self.connected()?;
            let client = state.client.as_mut();
            let expected = self.load_ledger(client)?.part_count(&meta.relative_path);
            self.fetch(ctx, client, &remote, expected)?
        };

        pipeline::decode_verified(
            Box::new(BufReader::new(spool)),
            self.policy.compresses(),
            self.policy.encrypts(),
            self.policy.passphrase(),
            &meta.relative_path,
            meta.checksum.as_deref(),
        )
    }

    fn send_manifest(&self, ctx: &TransferContext, manifest: &TransferManifest) -> Result<()> {
        let json = manifest.to_json()?;
        let encoded = pipeline::encode(ctx, &self.policy, &mut json.as_slice(), Vec::new(), MANIFEST_FILE_NAME, None, None)?;

        let mut state = self.connected()?;
        let client = state.client.as_mut();
        client.create_dir_all(&self.base)?;
        put_atomic(client, &mut encoded.sink.as_slice(), &self.manifest_path())
    }

    fn receive_manifest(&self, _ctx: &TransferContext) -> Result<TransferManifest> {
        let mut raw = Vec::new();
        {
            let mut state = self.connected()?;
            state.client.download(&self.manifest_path(), &mut raw)?;
        }

        let mut reader = pipeline::decode(
            Box::new(std::io::Cursor::new(raw)),
            self.policy.compresses(),
            self.policy.encrypts(),
            self.policy.passphrase(),
        )?;
        let mut json = Vec::new();
        reader.read_to_end(&mut json)?;
        TransferManifest::from_json(&json)
    }

    fn completed_transfers(&self, _ctx: &TransferContext) -> Result<HashSet<String>> {
        let mut state = self.connected()?;
        Ok(self.load_ledger(state.client.as_mut())?.completed())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.closed {
            state.closed = true;
            state.client.disconnect();
            info!("SFTP session to {} closed", state.client.host());
        }
        Ok(())
    }
}

impl Drop for SftpTransport {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.client.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use crate::network::sftp::memory::MemorySftpClient;
    use std::io::Cursor;

    fn transport(client: &MemorySftpClient, policy: PipelinePolicy, chunk: Option<u64>) -> SftpTransport {
        SftpTransport::new(Box::new(client.clone()), "/srv/zim", policy, chunk)
    }

    fn read_all(mut reader: Box<dyn Read + Send>) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_send_commits_through_temp_names() {
        let client = MemorySftpClient::new();
        let sftp = transport(&client, PipelinePolicy::plain(), None);
        let ctx = TransferContext::new();

        let mut meta = TransferMetadata::new("docs/a.txt", 5).with_checksum(hash_bytes(b"hello"));
        sftp.send(&ctx, &mut Cursor::new(b"hello"), &mut meta, None).unwrap();

        assert_eq!(
            client.ops(),
            [
                "upload /srv/zim/zim-data/docs/a.txt.tmp",
                "rename /srv/zim/zim-data/docs/a.txt.tmp -> /srv/zim/zim-data/docs/a.txt",
                "upload /srv/zim/zim-resume.json.tmp",
                "rename /srv/zim/zim-resume.json.tmp -> /srv/zim/zim-resume.json",
            ]
        );
        assert_eq!(client.file("/srv/zim/zim-data/docs/a.txt").unwrap(), b"hello");

        // already in the remote ledger: nothing is uploaded
        let before = client.ops().len();
        sftp.send(&ctx, &mut Cursor::new(b"hello"), &mut meta, None).unwrap();
        assert_eq!(client.ops().len(), before + 1);
        assert!(client.ops().last().unwrap().starts_with("download /srv/zim/zim-resume.json"));

        let fresh = transport(&client, PipelinePolicy::plain(), None);
        assert!(fresh.completed_transfers(&ctx).unwrap().contains("docs/a.txt"));
        assert_eq!(read_all(fresh.receive(&ctx, &meta).unwrap()), b"hello");
    }

    #[test]
    fn test_chunk_set_renamed_highest_first() {
        let client = MemorySftpClient::new();
        let sftp = transport(&client, PipelinePolicy::plain(), Some(4));
        let ctx = TransferContext::new();
        let data = b"0123456789";

        let mut meta = TransferMetadata::new("f.bin", 10);
        sftp.send(&ctx, &mut Cursor::new(data), &mut meta, None).unwrap();
        let ledger = ResumeLedger::from_json(&client.file("/srv/zim/zim-resume.json").unwrap()).unwrap();
        assert_eq!(ledger.part_count("f.bin"), Some(3));

        let renames: Vec<String> = client.ops().into_iter().filter(|op| op.starts_with("rename") && op.contains("f.bin")).collect();
        assert_eq!(
            renames,
            [
                "rename /srv/zim/zim-data/f.bin.part0002.tmp -> /srv/zim/zim-data/f.bin.part0002",
                "rename /srv/zim/zim-data/f.bin.part0001.tmp -> /srv/zim/zim-data/f.bin.part0001",
                "rename /srv/zim/zim-data/f.bin.part0000.tmp -> /srv/zim/zim-data/f.bin.part0000",
            ]
        );
        assert_eq!(read_all(sftp.receive(&ctx, &meta).unwrap()), data);

        client.state.lock().unwrap().files.remove("/srv/zim/zim-data/f.bin.part0001");
        match sftp.receive(&ctx, &meta) {
            Err(TransportError::MissingChunk { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected MissingChunk, got {:?}", other.err()),
        }

        // a smaller resend replaces the chunk set with a single object
        let mut meta = TransferMetadata::new("f.bin", 3);
        sftp.send(&ctx, &mut Cursor::new(b"abc"), &mut meta, None).unwrap();
        let data_files: Vec<String> = client.paths().into_iter().filter(|p| p.contains("zim-data")).collect();
        assert_eq!(data_files, ["/srv/zim/zim-data/f.bin"]);
    }

    #[test]
    fn test_failed_upload_leaves_nothing_committed() {
        let client = MemorySftpClient::new();
        client.state.lock().unwrap().fail_upload_containing = Some("part0002".to_string());
        let sftp = transport(&client, PipelinePolicy::new(false, Some("pw".into())), Some(16));
        let ctx = TransferContext::new();

        let mut meta = TransferMetadata::new("x.bin", 100);
        let err = sftp.send(&ctx, &mut Cursor::new(vec![1u8; 100]), &mut meta, None).unwrap_err();
        assert!(matches!(err, TransportError::Remote(_)));
        assert!(client.paths().is_empty());
        assert!(sftp.completed_transfers(&ctx).unwrap().is_empty());
    }

    #[test]
    fn test_failed_rename_forgets_old_entry() {
        let client = MemorySftpClient::new();
        let sftp = transport(&client, PipelinePolicy::plain(), Some(4));
        let ctx = TransferContext::new();

        let old = b"0123456789";
        let mut meta = TransferMetadata::new("f.bin", 10).with_checksum(hash_bytes(old));
        sftp.send(&ctx, &mut Cursor::new(old), &mut meta, None).unwrap();

        client.state.lock().unwrap().fail_rename_containing = Some("f.bin.part0001".to_string());
        let new = b"abcdefghij";
        let mut changed = TransferMetadata::new("f.bin", 10).with_checksum(hash_bytes(new));
        let err = sftp.send(&ctx, &mut Cursor::new(new), &mut changed, None).unwrap_err();
        assert!(matches!(err, TransportError::Remote(_)));
        assert!(!sftp.completed_transfers(&ctx).unwrap().contains("f.bin"));
        assert!(!client.paths().iter().any(|p| p.ends_with(".tmp")));

        // the retry is not skipped, since the old parts are gone
        client.state.lock().unwrap().fail_rename_containing = None;
        sftp.send(&ctx, &mut Cursor::new(old), &mut meta, None).unwrap();
        assert_eq!(read_all(sftp.receive(&ctx, &meta).unwrap()), old);
    }

    #[test]
    fn test_checksum_mismatch_uploads_nothing() {
        let client = MemorySftpClient::new();
        let sftp = transport(&client, PipelinePolicy::new(true, None), None);
        let mut meta = TransferMetadata::new("y.txt", 3).with_checksum(hash_bytes(b"other"));
        let err = sftp
            .send(&TransferContext::new(), &mut Cursor::new(b"abc"), &mut meta, None)
            .unwrap_err();
        assert!(matches!(err, TransportError::IntegrityMismatch { .. }));
        assert!(!client.ops().iter().any(|op| op.starts_with("upload")));
    }

    #[test]
    fn test_manifest_probe_and_close() {
        let client = MemorySftpClient::new();
        let sftp = transport(&client, PipelinePolicy::new(true, Some("pw".into())), None);
        let ctx = TransferContext::new();

        assert!(sftp.test_connection(&ctx));
        assert!(client.paths().is_empty());

        assert!(sftp.receive_manifest(&ctx).unwrap_err().is_not_found());
        let manifest = TransferManifest::new("host", "os", TransportMethod::Sftp);
        sftp.send_manifest(&ctx, &manifest).unwrap();
        assert_eq!(sftp.receive_manifest(&ctx).unwrap(), manifest);

        assert!(sftp.receive(&ctx, &TransferMetadata::new("none.txt", 0)).err().unwrap().is_not_found());

        sftp.close().unwrap();
        sftp.close().unwrap();
        assert!(!sftp.test_connection(&ctx));
        assert!(matches!(
            sftp.completed_transfers(&ctx).err(),
            Some(TransportError::Connection { .. })
        ));
        assert_eq!(client.state.lock().unwrap().connects, 1);
    }

    #[test]
    fn test_refused_connection() {
        let client = MemorySftpClient::new();
        client.state.lock().unwrap().fail_connect = true;
        let sftp = transport(&client, PipelinePolicy::plain(), None);
        assert!(!sftp.test_connection(&TransferContext::new()));
        let mut meta = TransferMetadata::new("a", 1);
        let err = sftp
            .send(&TransferContext::new(), &mut Cursor::new(b"a"), &mut meta, None)
            .unwrap_err();
        assert!(err.is_recoverable());
    }
}
