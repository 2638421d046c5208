//! Session-backed transport core
//!
//! DirectWiFi and Bluetooth differ only in how the duplex stream is
//! obtained. Everything after that lives here: lazy session setup, the
//! in-memory resume ledger, and framing payloads through the pipeline.

use super::pipeline::{self, PipelinePolicy};
use crate::config::defaults::MANIFEST_FILE_NAME;
use crate::error::{Result, TransportError};
use crate::fs::{ProgressFn, TransferContext};
use crate::network::{FrameKind, FrameSession};
use crate::sync::{normalize_relative_path, ResumeLedger, TransferManifest, TransferMetadata};
use std::collections::HashSet;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

#[derive(Default)]
struct StreamState {
    session: Option<FrameSession>,
    closed: bool,
    ledger: ResumeLedger,
}

pub(super) struct StreamCore {
    label: &'static str,
    policy: PipelinePolicy,
    spool_dir: Option<PathBuf>,
    state: Mutex<StreamState>,
}

impl StreamCore {
    pub fn new(label: &'static str, policy: PipelinePolicy) -> Self {
        Self {
            label,
            policy,
            spool_dir: None,
            state: Mutex::new(StreamState::default()),
        }
    }

    pub fn set_spool_dir(&mut self, dir: PathBuf) {
        self.spool_dir = Some(dir);
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the session, opening it first if needed.
    ///
    /// A link failure on an open session is terminal for this transport.
    fn with_session<T, O, F>(&self, ctx: &TransferContext, open: O, f: F) -> Result<T>
    where
        O: FnOnce(&TransferContext) -> Result<FrameSession>,
        F: FnOnce(&mut FrameSession, &mut ResumeLedger) -> Result<T>,
    {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(TransportError::connection(self.label, "transport closed"));
        }

        let session = match state.session.take() {
            Some(session) => session,
            None => {
                ctx.check()?;
                let session = open(ctx)?;
                info!("{} session with {} established", self.label, session.peer());
                match &self.spool_dir {
                    Some(dir) => session.with_spool_dir(dir),
                    None => session,
                }
            }
        };
        let session = state.session.insert(session);

        let result = f(session, &mut state.ledger);
        if let Err(TransportError::Connection { .. }) = &result {
            if let Some(mut broken) = state.session.take() {
                warn!("{} session with {} lost", self.label, broken.peer());
                broken.close();
            }
            state.closed = true;
        }
        result
    }

    pub fn test_connection<O>(&self, ctx: &TransferContext, open: O) -> bool
    where
        O: FnOnce(&TransferContext) -> Result<FrameSession>,
    {
        match self.with_session(ctx, open, |session, _| session.ping()) {
            Ok(rtt) => {
                debug!("{} round trip {:?}", self.label, rtt);
                true
            }
            Err(e) => {
                debug!("{} probe failed: {}", self.label, e);
                false
            }
        }
    }

    pub fn send<O>(
        &self,
        ctx: &TransferContext,
        open: O,
        source: &mut dyn Read,
        meta: &mut TransferMetadata,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<()>
    where
        O: FnOnce(&TransferContext) -> Result<FrameSession>,
    {
        normalize_relative_path(&meta.relative_path)?;
        self.policy.apply_to(meta);
        let meta = &*meta;

        self.with_session(ctx, open, |session, ledger| {
            if ledger.is_complete(&meta.relative_path, meta.checksum.as_deref()) {
                info!("Skipping '{}': already delivered this session", meta.relative_path);
                return Ok(());
            }

            let header = serde_json::to_vec(meta)?;
            let mut checksum = None;
            session.send_payload(FrameKind::ItemHeader, &header, |writer| {
                let encoded = pipeline::encode(
                    ctx,
                    &self.policy,
                    source,
                    writer,
                    &meta.relative_path,
                    meta.checksum.as_deref(),
                    progress,
                )?;
                checksum = Some(encoded.checksum);
                Ok(())
            })?;

            ledger.record(&meta.relative_path, checksum.as_deref());
            debug!("'{}' acknowledged by {}", meta.relative_path, session.peer());
            Ok(())
        })
    }

    /// Wait for the item; transforms follow the flags the sender attached
    pub fn receive<O>(&self, ctx: &TransferContext, open: O, meta: &TransferMetadata) -> Result<Box<dyn Read + Send>>
    where
        O: FnOnce(&TransferContext) -> Result<FrameSession>,
    {
        let payload = self.with_session(ctx, open, |session, ledger| {
            let payload = session.receive_item(ctx, &meta.relative_path)?;
            ledger.record(&payload.header.relative_path, payload.header.checksum.as_deref());
            Ok(payload)
        })?;

        let header = payload.header;
        let checksum = meta.checksum.as_deref().or(header.checksum.as_deref());
        pipeline::decode_verified(
            Box::new(BufReader::new(payload.file)),
            header.is_compressed,
            header.is_encrypted,
            self.policy.passphrase(),
            &meta.relative_path,
            checksum,
        )
    }

    pub fn send_manifest<O>(&self, ctx: &TransferContext, open: O, manifest: &TransferManifest) -> Result<()>
    where
        O: FnOnce(&TransferContext) -> Result<FrameSession>,
    {
        let json = manifest.to_json()?;
        let header = serde_json::to_vec(&self.policy.manifest_header())?;

        self.with_session(ctx, open, |session, _| {
            session.send_payload(FrameKind::ManifestHeader, &header, |writer| {
                pipeline::encode(ctx, &self.policy, &mut json.as_slice(), writer, MANIFEST_FILE_NAME, None, None)?;
                Ok(())
            })
        })
    }

    pub fn receive_manifest<O>(&self, ctx: &TransferContext, open: O) -> Result<TransferManifest>
    where
        O: FnOnce(&TransferContext) -> Result<FrameSession>,
    {
        let payload = self.with_session(ctx, open, |session, _| session.receive_manifest(ctx))?;

        let mut reader = pipeline::decode(
            Box::new(BufReader::new(payload.file)),
            payload.header.compressed,
            payload.header.encrypted,
            self.policy.passphrase(),
        )?;
        let mut json = Vec::new();
        reader.read_to_end(&mut json)?;
        TransferManifest::from_json(&json)
    }

    pub fn completed(&self) -> HashSet<String> {
        self.lock().ledger.completed()
    }

    pub fn close(&self) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        if let Some(mut session) = state.session.take() {
            info!("Closing {} session with {}", self.label, session.peer());
            session.close();
        }
        Ok(())
    }
}

impl Drop for StreamCore {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut session) = state.session.take() {
            session.close();
        }
    }
}
