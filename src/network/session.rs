//! Framed session over a duplex byte stream
//!
//! Shared by the DirectWiFi and Bluetooth transports. A sender streams a
//! header, Data frames and End, then waits for the peer's Ack. A receiver
//! spools each incoming payload to an anonymous temp file and acks it;
//! payloads that arrive before they are asked for wait in a spool map keyed
//! by relative path, so items can be received in any order.

use super::wire::{self, Frame, FrameKind, ManifestHeader, MAX_DATA_FRAME};
use crate::error::{Result, TransportError};
use crate::fs::TransferContext;
use crate::sync::{normalize_relative_path, TransferMetadata};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::net::{Shutdown, TcpStream};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A bidirectional byte stream a session can run over
pub trait DuplexStream: Read + Write + Send {
    /// Shut the stream down in both directions
    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DuplexStream for TcpStream {
    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

/// A payload received and spooled to disk
#[derive(Debug)]
pub struct SpooledPayload<H> {
    /// Header the sender attached
    pub header: H,
    /// Anonymous temp file positioned at the start
    pub file: File,
    /// Spooled length in bytes
    pub len: u64,
}

/// Framed session state for one connection
pub struct FrameSession {
    stream: BufReader<Box<dyn DuplexStream>>,
    peer: String,
    spool_dir: Option<PathBuf>,
    items: HashMap<String, SpooledPayload<TransferMetadata>>,
    manifest: Option<SpooledPayload<ManifestHeader>>,
    peer_closed: bool,
}

impl FrameSession {
    /// Exchange protocol magic with the peer and start a session
    pub fn handshake(mut stream: Box<dyn DuplexStream>, peer: impl Into<String>) -> Result<Self> {
        let peer = peer.into();
        wire::write_magic(&mut stream).map_err(|e| link_error(&peer, e))?;

        let mut stream = BufReader::new(stream);
        wire::read_magic(&mut stream).map_err(|e| link_error(&peer, e))?;
        debug!("Session established with {}", peer);

        Ok(Self {
            stream,
            peer,
            spool_dir: None,
            items: HashMap::new(),
            manifest: None,
            peer_closed: false,
        })
    }

    /// Spool incoming payloads under `dir` instead of the system temp dir
    pub fn with_spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = Some(dir.into());
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Relative paths received but not yet consumed
    pub fn pending_items(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    fn send(&mut self, kind: FrameKind, body: &[u8]) -> Result<()> {
        wire::write_frame(self.stream.get_mut(), kind, body).map_err(|e| link_error(&self.peer, e))
    }

    fn recv(&mut self) -> Result<Frame> {
        let frame = wire::read_frame(&mut self.stream).map_err(|e| link_error(&self.peer, e))?;
        if frame.kind == FrameKind::Close {
            self.peer_closed = true;
            return Err(TransportError::connection(&self.peer, "peer closed the session"));
        }
        Ok(frame)
    }

    /// Stream one payload to the peer and wait for its Ack.
    ///
    /// `encode` writes the payload through the supplied writer, which cuts
    /// it into Data frames. If `encode` fails the peer is told to discard
    /// what it has spooled.
    pub fn send_payload<F>(&mut self, header_kind: FrameKind, header: &[u8], encode: F) -> Result<()>
    where
        F: FnOnce(&mut DataFrameWriter<'_>) -> Result<()>,
    {
        self.send(header_kind, header)?;

        let result = {
            let mut writer = DataFrameWriter::new(self);
            encode(&mut writer).and_then(|()| writer.send_pending())
        };

        match result {
            Ok(()) => {
                self.send(FrameKind::End, &[])?;
                self.wait_for_ack()
            }
            Err(e) => {
                if let Err(abort_err) = self.send(FrameKind::Abort, e.to_string().as_bytes()) {
                    debug!("Could not send abort to {}: {}", self.peer, abort_err);
                }
                Err(e)
            }
        }
    }

    fn wait_for_ack(&mut self) -> Result<()> {
        loop {
            let frame = self.recv()?;
            match frame.kind {
                FrameKind::Ack => return Ok(()),
                FrameKind::Abort => {
                    return Err(TransportError::Remote(format!(
                        "{} rejected the payload: {}",
                        self.peer,
                        frame.text()
                    )));
                }
                _ => self.dispatch(frame)?,
            }
        }
    }

    /// Handle a frame that is not the one the caller is waiting for
    fn dispatch(&mut self, frame: Frame) -> Result<()> {
        match frame.kind {
            FrameKind::Ping => self.send(FrameKind::Pong, &[]),
            FrameKind::Pong => Ok(()),
            FrameKind::ManifestHeader => {
                let header: ManifestHeader = serde_json::from_slice(&frame.body)
                    .map_err(|e| TransportError::protocol(format!("bad manifest header: {}", e)))?;
                if let Some((file, len)) = self.spool()? {
                    if self.manifest.is_some() {
                        warn!("{} sent a second manifest; keeping the newest", self.peer);
                    }
                    self.manifest = Some(SpooledPayload { header, file, len });
                }
                Ok(())
            }
            FrameKind::ItemHeader => {
                let meta: TransferMetadata = serde_json::from_slice(&frame.body)
                    .map_err(|e| TransportError::protocol(format!("bad item header: {}", e)))?;
                let key = normalize_relative_path(&meta.relative_path)?;
                if let Some((file, len)) = self.spool()? {
                    debug!("Spooled '{}' ({} bytes) from {}", key, len, self.peer);
                    self.items.insert(key, SpooledPayload { header: meta, file, len });
                }
                Ok(())
            }
            other => Err(TransportError::protocol(format!(
                "unexpected {:?} frame from {}",
                other, self.peer
            ))),
        }
    }

    /// Spool Data frames until End (acked) or Abort (discarded)
    fn spool(&mut self) -> Result<Option<(File, u64)>> {
        let file = match &self.spool_dir {
            Some(dir) => tempfile::tempfile_in(dir),
            None => tempfile::tempfile(),
        }?;
        let mut writer = BufWriter::new(file);
        let mut len = 0u64;

        loop {
            let frame = self.recv()?;
            match frame.kind {
                FrameKind::Data => {
                    writer.write_all(&frame.body)?;
                    len += frame.body.len() as u64;
                }
                FrameKind::End => break,
                FrameKind::Abort => {
                    debug!("{} aborted a payload: {}", self.peer, frame.text());
                    return Ok(None);
                }
                FrameKind::Ping => self.send(FrameKind::Pong, &[])?,
                other => {
                    return Err(TransportError::protocol(format!(
                        "unexpected {:?} frame inside a payload",
                        other
                    )));
                }
            }
        }

        let mut file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        file.seek(SeekFrom::Start(0))?;
        self.send(FrameKind::Ack, &[])?;
        Ok(Some((file, len)))
    }

    /// Wait for the item with `relative_path`, spooling others meanwhile
    pub fn receive_item(
        &mut self,
        ctx: &TransferContext,
        relative_path: &str,
    ) -> Result<SpooledPayload<TransferMetadata>> {
        let key = normalize_relative_path(relative_path)?;
        loop {
            if let Some(item) = self.items.remove(&key) {
                return Ok(item);
            }
            if self.peer_closed {
                return Err(TransportError::NotFound(format!(
                    "{} closed the session without sending '{}'",
                    self.peer, key
                )));
            }
            ctx.check()?;
            let frame = self.recv().map_err(|e| self.closed_as_not_found(e, &key))?;
            self.dispatch(frame)?;
        }
    }

    /// Wait for the manifest, spooling items meanwhile
    pub fn receive_manifest(&mut self, ctx: &TransferContext) -> Result<SpooledPayload<ManifestHeader>> {
        loop {
            if let Some(manifest) = self.manifest.take() {
                return Ok(manifest);
            }
            if self.peer_closed {
                return Err(TransportError::NotFound(format!(
                    "{} closed the session without sending a manifest",
                    self.peer
                )));
            }
            ctx.check()?;
            let frame = self.recv()?;
            self.dispatch(frame)?;
        }
    }

    fn closed_as_not_found(&self, err: TransportError, key: &str) -> TransportError {
        if self.peer_closed {
            TransportError::NotFound(format!("{} closed the session without sending '{}'", self.peer, key))
        } else {
            err
        }
    }

    /// Round trip a Ping; frames arriving meanwhile are handled normally
    pub fn ping(&mut self) -> Result<Duration> {
        let start = Instant::now();
        self.send(FrameKind::Ping, &[])?;
        loop {
            let frame = self.recv()?;
            match frame.kind {
                FrameKind::Pong => return Ok(start.elapsed()),
                _ => self.dispatch(frame)?,
            }
        }
    }

    /// Tell the peer we are leaving and shut the stream down
    pub fn close(&mut self) {
        if !self.peer_closed {
            if let Err(e) = self.send(FrameKind::Close, &[]) {
                debug!("Close frame to {} not delivered: {}", self.peer, e);
            }
        }
        if let Err(e) = self.stream.get_mut().shutdown() {
            debug!("Shutdown of {} failed: {}", self.peer, e);
        }
        self.items.clear();
        self.manifest = None;
    }
}

fn link_error(peer: &str, err: TransportError) -> TransportError {
    match err {
        TransportError::Io { source, .. } => TransportError::connection(peer, source.to_string()),
        TransportError::Connection { message, .. } => TransportError::connection(peer, message),
        other => other,
    }
}

/// `Write` adapter cutting a payload into Data frames
pub struct DataFrameWriter<'a> {
    session: &'a mut FrameSession,
    buf: Vec<u8>,
}

impl<'a> DataFrameWriter<'a> {
    fn new(session: &'a mut FrameSession) -> Self {
        Self {
            session,
            buf: Vec::with_capacity(MAX_DATA_FRAME),
        }
    }

    fn send_pending(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.session.send(FrameKind::Data, &self.buf)?;
        self.buf.clear();
        Ok(())
    }
}

impl Write for DataFrameWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = MAX_DATA_FRAME - self.buf.len();
        let n = data.len().min(room);
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() == MAX_DATA_FRAME {
            self.send_pending().map_err(TransportError::into_io)?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_pending().map_err(TransportError::into_io)
    }
}
