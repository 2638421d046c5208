//! Removable media (USB drives, external disks)

use super::filesystem::DirectoryStore;
use super::pipeline::PipelinePolicy;
use super::{ProgressFn, TransferContext, Transport, TransportMethod};
use crate::config::defaults::FAT32_MAX_FILE_SIZE;
use crate::error::Result;
use crate::sync::{TransferManifest, TransferMetadata};
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Transport over a mounted removable drive.
///
/// Payloads larger than [`FAT32_MAX_FILE_SIZE`] are split into a chunk set
/// unless a different part ceiling is configured.
#[derive(Debug)]
pub struct ExternalStorageTransport {
    store: DirectoryStore,
}

impl ExternalStorageTransport {
    pub fn new(root: impl Into<PathBuf>, policy: PipelinePolicy) -> Self {
        Self {
            store: DirectoryStore::new(root, policy).with_part_ceiling(Some(FAT32_MAX_FILE_SIZE)),
        }
    }

    /// Override the per-part size ceiling
    pub fn with_part_ceiling(self, ceiling: u64) -> Self {
        Self {
            store: self.store.with_part_ceiling(Some(ceiling)),
        }
    }

    pub fn root(&self) -> &Path {
        self.store.root()
    }

    pub fn store(&self) -> &DirectoryStore {
        &self.store
    }
}

impl Transport for ExternalStorageTransport {
    fn method(&self) -> TransportMethod {
        TransportMethod::ExternalStorage
    }

    fn test_connection(&self, _ctx: &TransferContext) -> bool {
        self.store.probe()
    }

    fn send(
        &self,
        ctx: &TransferContext,
        source: &mut dyn Read,
        meta: &mut TransferMetadata,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<()> {
        self.store.send(ctx, source, meta, progress)
    }

    fn receive(&self, ctx: &TransferContext, meta: &TransferMetadata) -> Result<Box<dyn Read + Send>> {
        self.store.receive(ctx, meta)
    }

    fn send_manifest(&self, ctx: &TransferContext, manifest: &TransferManifest) -> Result<()> {
        self.store.write_manifest(ctx, manifest)
    }

    fn receive_manifest(&self, ctx: &TransferContext) -> Result<TransferManifest> {
        self.store.read_manifest(ctx)
    }

    fn completed_transfers(&self, _ctx: &TransferContext) -> Result<HashSet<String>> {
        self.store.completed()
    }

    fn close(&self) -> Result<()> {
        debug!("Releasing {}", self.store.root().display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::hash::hash_bytes;
    use crate::sync::{ItemType, MigrationItem};
    use filetime::FileTime;
    use std::fs;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn read_all(mut reader: Box<dyn Read + Send>) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_idempotent_resend_leaves_payload_untouched() {
        let dir = TempDir::new().unwrap();
        let transport = ExternalStorageTransport::new(dir.path(), PipelinePolicy::new(true, Some("k".into())));
        let ctx = TransferContext::new();
        let data = b"hello world";

        let mut manifest = TransferManifest::new("laptop", "Windows 10", TransportMethod::ExternalStorage);
        manifest.add_item(MigrationItem::new("docs", ItemType::Folder, data.len() as i64));
        transport.send_manifest(&ctx, &manifest).unwrap();

        let mut meta = TransferMetadata::new("docs/a.txt", data.len() as i64).with_checksum(hash_bytes(data));
        transport.send(&ctx, &mut Cursor::new(data), &mut meta, None).unwrap();
        assert!(meta.is_compressed && meta.is_encrypted);

        assert!(dir.path().join("zim-manifest.json").is_file());
        assert!(dir.path().join("zim-resume.json").is_file());
        let payload = dir.path().join("zim-data/docs/a.txt");
        assert!(payload.is_file());

        let old = FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_mtime(&payload, old).unwrap();

        transport.send(&ctx, &mut Cursor::new(data), &mut meta, None).unwrap();
        let mtime = FileTime::from_last_modification_time(&fs::metadata(&payload).unwrap());
        assert_eq!(mtime, old);

        let completed = transport.completed_transfers(&ctx).unwrap();
        assert_eq!(completed.len(), 1);
        assert!(completed.contains("docs/a.txt"));

        let reader = ExternalStorageTransport::new(dir.path(), PipelinePolicy::new(true, Some("k".into())));
        assert_eq!(reader.receive_manifest(&ctx).unwrap(), manifest);
        assert_eq!(read_all(reader.receive(&ctx, &meta).unwrap()), data);
    }

    #[test]
    fn test_wrong_passphrase_is_rejected() {
        let dir = TempDir::new().unwrap();
        let ctx = TransferContext::new();
        let sender = ExternalStorageTransport::new(dir.path(), PipelinePolicy::new(false, Some("right".into())));
        let mut meta = TransferMetadata::new("s.txt", 6);
        sender.send(&ctx, &mut Cursor::new(b"secret"), &mut meta, None).unwrap();

        let receiver = ExternalStorageTransport::new(dir.path(), PipelinePolicy::new(false, Some("wrong".into())));
        let result = receiver.receive(&ctx, &meta).and_then(|mut r| {
            let mut out = Vec::new();
            r.read_to_end(&mut out)?;
            Ok(out)
        });
        assert!(matches!(result, Err(TransportError::Authentication(_))));
    }

    #[test]
    fn test_tampered_payload_fails_verification() {
        let dir = TempDir::new().unwrap();
        let ctx = TransferContext::new();
        let transport = ExternalStorageTransport::new(dir.path(), PipelinePolicy::plain());
        let mut meta = TransferMetadata::new("t.txt", 5).with_checksum(hash_bytes(b"abcde"));
        transport.send(&ctx, &mut Cursor::new(b"abcde"), &mut meta, None).unwrap();

        fs::write(dir.path().join("zim-data/t.txt"), b"abcdX").unwrap();
        let mut out = Vec::new();
        let err = transport.receive(&ctx, &meta).unwrap().read_to_end(&mut out).unwrap_err();
        assert!(matches!(TransportError::from(err), TransportError::IntegrityMismatch { .. }));
    }

    #[test]
    fn test_concurrent_senders_share_one_ledger() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ExternalStorageTransport::new(dir.path(), PipelinePolicy::new(true, None)));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let transport = Arc::clone(&transport);
                thread::spawn(move || {
                    let data = vec![i as u8; 10_000 + i];
                    let mut meta = TransferMetadata::new(format!("t{}/f.bin", i), data.len() as i64)
                        .with_checksum(hash_bytes(&data));
                    transport
                        .send(&TransferContext::new(), &mut Cursor::new(data), &mut meta, None)
                        .unwrap();
                    meta
                })
            })
            .collect();
        let metas: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let ctx = TransferContext::new();
        assert_eq!(transport.completed_transfers(&ctx).unwrap().len(), 8);
        for (i, meta) in metas.iter().enumerate() {
            assert_eq!(read_all(transport.receive(&ctx, meta).unwrap()), vec![i as u8; 10_000 + i]);
        }
    }

    #[test]
    fn test_part_ceiling_and_close() {
        let dir = TempDir::new().unwrap();
        let transport = ExternalStorageTransport::new(dir.path(), PipelinePolicy::plain()).with_part_ceiling(64);
        let ctx = TransferContext::new();
        let data = vec![9u8; 200];

        let mut meta = TransferMetadata::new("p.bin", 200);
        transport.send(&ctx, &mut Cursor::new(&data), &mut meta, None).unwrap();
        assert!(dir.path().join("zim-data/p.bin.part0003").is_file());
        assert!(!dir.path().join("zim-data/p.bin.part0004").exists());
        assert_eq!(read_all(transport.receive(&ctx, &meta).unwrap()), data);

        transport.close().unwrap();
        transport.close().unwrap();
    }

    #[test]
    fn test_unreachable_root() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let transport = ExternalStorageTransport::new(blocker.join("drive"), PipelinePolicy::plain());
        assert!(!transport.test_connection(&TransferContext::new()));
    }
}
