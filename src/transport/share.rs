//! SMB/NFS network share

use super::filesystem::DirectoryStore;
use super::pipeline::PipelinePolicy;
use super::{ProgressFn, TransferContext, Transport, TransportMethod};
use crate::error::Result;
use crate::sync::{TransferManifest, TransferMetadata};
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Transport over a mounted share or UNC path.
///
/// Committed payloads are copied into a local temp file before decoding so
/// a slow or flaky share is only read once, under the transport lock.
#[derive(Debug)]
pub struct NetworkShareTransport {
    store: DirectoryStore,
}

impl NetworkShareTransport {
    /// `chunk_size` bounds the size of each object written to the share
    pub fn new(root: impl Into<PathBuf>, policy: PipelinePolicy, chunk_size: Option<u64>) -> Self {
        Self {
            store: DirectoryStore::new(root, policy)
                .with_part_ceiling(chunk_size)
                .with_spooled_reads(true),
        }
    }

    pub fn root(&self) -> &Path {
        self.store.root()
    }

    pub fn store(&self) -> &DirectoryStore {
        &self.store
    }
}

impl Transport for NetworkShareTransport {
    fn method(&self) -> TransportMethod {
        TransportMethod::NetworkShare
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
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use std::fs;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn test_chunked_share_round_trip() {
        let dir = TempDir::new().unwrap();
        let transport = NetworkShareTransport::new(dir.path(), PipelinePolicy::plain(), Some(1000));
        let ctx = TransferContext::new();
        let data: Vec<u8> = (0..4500u32).map(|i| (i % 251) as u8).collect();

        let mut meta = TransferMetadata::new("profile\\AppData\\x.db", data.len() as i64)
            .with_checksum(hash_bytes(&data));
        transport.send(&ctx, &mut Cursor::new(&data), &mut meta, None).unwrap();

        let stored = dir.path().join("zim-data/profile/AppData");
        assert!(stored.join("x.db.part0000").is_file());
        assert!(stored.join("x.db.part0004").is_file());
        assert!(!stored.join("x.db").exists());

        let mut out = Vec::new();
        transport.receive(&ctx, &meta).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, data);

        // the set is still found by discovery once the ledger is gone
        fs::remove_file(dir.path().join("zim-resume.json")).unwrap();
        let mut out = Vec::new();
        transport.receive(&ctx, &meta).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_unchunked_share_progress() {
        let dir = TempDir::new().unwrap();
        let transport = NetworkShareTransport::new(dir.path(), PipelinePolicy::new(true, None), None);
        let ctx = TransferContext::new().with_buffer_size(4096);
        let data = vec![3u8; 50_000];

        let seen = std::sync::Mutex::new(Vec::new());
        let report = |n: u64| seen.lock().unwrap().push(n);
        let mut meta = TransferMetadata::new("big.bin", data.len() as i64);
        transport.send(&ctx, &mut Cursor::new(&data), &mut meta, Some(&report)).unwrap();

        let seen = seen.into_inner().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last().copied(), Some(data.len() as u64));
        assert!(!dir.path().join("zim-data/big.bin.part0000").exists());
        assert!(fs::metadata(dir.path().join("zim-data/big.bin")).unwrap().len() < data.len() as u64);
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let dir = TempDir::new().unwrap();
        let transport = NetworkShareTransport::new(dir.path().join("share"), PipelinePolicy::plain(), None);
        let mut meta = TransferMetadata::new("../../etc/passwd", 1);
        let err = transport
            .send(&TransferContext::new(), &mut Cursor::new(b"x"), &mut meta, None)
            .unwrap_err();
        assert!(matches!(err, crate::error::TransportError::InvalidPath(_)));
        assert!(!dir.path().join("share").exists());
    }
}
