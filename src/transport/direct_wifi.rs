//! Peer-to-peer TCP transport
//!
//! One side listens, the other connects. Both run the framed session, so
//! either side may send or receive once the connection is up.

use super::pipeline::PipelinePolicy;
use super::stream::StreamCore;
use super::{ProgressFn, TransferContext, Transport, TransportMethod};
use crate::error::{Result, TransportError};
use crate::network::FrameSession;
use crate::sync::{TransferManifest, TransferMetadata};
use std::collections::HashSet;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

enum Endpoint {
    Listen(TcpListener),
    Connect(String),
}

/// Direct socket between two machines on the same network
pub struct DirectWiFiTransport {
    endpoint: Endpoint,
    timeout: Duration,
    core: StreamCore,
}

impl DirectWiFiTransport {
    /// Bind `addr` now; the peer is accepted on first use
    pub fn listen(addr: &str, policy: PipelinePolicy, timeout: Duration) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(|e| TransportError::connection(addr, e.to_string()))?;
        info!("Listening for a DirectWiFi peer on {}", listener.local_addr()?);
        Ok(Self {
            endpoint: Endpoint::Listen(listener),
            timeout,
            core: StreamCore::new("DirectWiFi", policy),
        })
    }

    /// Connect to `addr` (host:port) on first use
    pub fn connect(addr: impl Into<String>, policy: PipelinePolicy, timeout: Duration) -> Self {
        Self {
            endpoint: Endpoint::Connect(addr.into()),
            timeout,
            core: StreamCore::new("DirectWiFi", policy),
        }
    }

    /// Spool received payloads under `dir`
    pub fn with_spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.core.set_spool_dir(dir.into());
        self
    }

    /// Bound address of a listening transport
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.endpoint {
            Endpoint::Listen(listener) => listener.local_addr().ok(),
            Endpoint::Connect(_) => None,
        }
    }

    fn open(&self, ctx: &TransferContext) -> Result<FrameSession> {
        let (stream, peer) = match &self.endpoint {
            Endpoint::Listen(listener) => self.accept(ctx, listener)?,
            Endpoint::Connect(addr) => (self.dial(addr)?, addr.clone()),
        };
        stream.set_nodelay(true)?;
        FrameSession::handshake(Box::new(stream), peer)
    }

    fn accept(&self, ctx: &TransferContext, listener: &TcpListener) -> Result<(TcpStream, String)> {
        listener.set_nonblocking(true)?;
        let deadline = Instant::now() + self.timeout;

        let accepted = loop {
            match listener.accept() {
                Ok(accepted) => break Ok(accepted),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if let Err(e) = ctx.check() {
                        break Err(e);
                    }
                    if Instant::now() >= deadline {
                        break Err(TransportError::Timeout(self.timeout.as_secs()));
                    }
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(TransportError::connection("DirectWiFi listener", e.to_string())),
            }
        };
        listener.set_nonblocking(false)?;

        let (stream, peer) = accepted?;
        stream.set_nonblocking(false)?;
        debug!("Accepted DirectWiFi peer {}", peer);
        Ok((stream, peer.to_string()))
    }

    fn dial(&self, addr: &str) -> Result<TcpStream> {
        let candidates = addr
            .to_socket_addrs()
            .map_err(|e| TransportError::connection(addr, e.to_string()))?;

        let mut last_error = None;
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, self.timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Connect to {} failed: {}", candidate, e);
                    last_error = Some(e);
                }
            }
        }

        Err(TransportError::connection(
            addr,
            last_error.map_or_else(|| "address resolved to nothing".to_string(), |e| e.to_string()),
        ))
    }
}

impl Transport for DirectWiFiTransport {
    fn method(&self) -> TransportMethod {
        TransportMethod::DirectWiFi
    }

    fn test_connection(&self, ctx: &TransferContext) -> bool {
        self.core.test_connection(ctx, |ctx| self.open(ctx))
    }

    fn send(
        &self,
        ctx: &TransferContext,
        source: &mut dyn Read,
        meta: &mut TransferMetadata,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<()> {
        self.core.send(ctx, |ctx| self.open(ctx), source, meta, progress)
    }

    fn receive(&self, ctx: &TransferContext, meta: &TransferMetadata) -> Result<Box<dyn Read + Send>> {
        self.core.receive(ctx, |ctx| self.open(ctx), meta)
    }

    fn send_manifest(&self, ctx: &TransferContext, manifest: &TransferManifest) -> Result<()> {
        self.core.send_manifest(ctx, |ctx| self.open(ctx), manifest)
    }

    fn receive_manifest(&self, ctx: &TransferContext) -> Result<TransferManifest> {
        self.core.receive_manifest(ctx, |ctx| self.open(ctx))
    }

    fn completed_transfers(&self, _ctx: &TransferContext) -> Result<HashSet<String>> {
        Ok(self.core.completed())
    }

    fn close(&self) -> Result<()> {
        self.core.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use crate::sync::{ItemType, MigrationItem};
    use std::io::Cursor;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn listener(policy: PipelinePolicy) -> (DirectWiFiTransport, String) {
        let transport = DirectWiFiTransport::listen("127.0.0.1:0", policy, TIMEOUT).unwrap();
        let addr = transport.local_addr().unwrap().to_string();
        (transport, addr)
    }

    fn read_all(mut reader: Box<dyn Read + Send>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_loopback_session() {
        let (receiver, addr) = listener(PipelinePolicy::new(false, Some("shared".into())));
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 241) as u8).collect();
        let sent = data.clone();

        let sender = thread::spawn(move || {
            let ctx = TransferContext::new();
            let sender = DirectWiFiTransport::connect(addr, PipelinePolicy::new(true, Some("shared".into())), TIMEOUT);

            let mut manifest = TransferManifest::new("src", "os", TransportMethod::DirectWiFi);
            manifest.add_item(MigrationItem::new("f.bin", ItemType::File, sent.len() as i64));
            sender.send_manifest(&ctx, &manifest).unwrap();

            let mut meta = TransferMetadata::new("dir/f.bin", sent.len() as i64).with_checksum(hash_bytes(&sent));
            sender.send(&ctx, &mut Cursor::new(&sent), &mut meta, None).unwrap();
            assert!(meta.is_compressed && meta.is_encrypted);

            // second send of the same item is skipped
            sender.send(&ctx, &mut Cursor::new(&sent), &mut meta, None).unwrap();
            assert!(sender.completed_transfers(&ctx).unwrap().contains("dir/f.bin"));

            sender.close().unwrap();
            sender.close().unwrap();
            manifest
        });

        let ctx = TransferContext::new();
        let manifest = receiver.receive_manifest(&ctx).unwrap();

        // the receiver does not know the sender compressed; the header says so
        let meta = TransferMetadata::new("dir/f.bin", data.len() as i64);
        assert_eq!(read_all(receiver.receive(&ctx, &meta).unwrap()).unwrap(), data);

        assert_eq!(manifest, sender.join().unwrap());
        assert!(receiver.receive(&ctx, &TransferMetadata::new("other", 0)).err().unwrap().is_not_found());

        receiver.close().unwrap();
        assert!(matches!(
            receiver.receive(&ctx, &meta).err(),
            Some(TransportError::Connection { .. })
        ));
    }

    #[test]
    fn test_repeat_send_in_session_transmits_nothing() {
        let (receiver, addr) = listener(PipelinePolicy::plain());

        let sender = thread::spawn(move || {
            let ctx = TransferContext::new();
            let sender = DirectWiFiTransport::connect(addr, PipelinePolicy::plain(), TIMEOUT);

            let mut meta = TransferMetadata::new("docs/a.txt", 5).with_checksum(hash_bytes(b"hello"));
            sender.send(&ctx, &mut Cursor::new(b"hello"), &mut meta, None).unwrap();

            let mut again = Cursor::new(b"hello");
            let reported = std::sync::atomic::AtomicU64::new(0);
            let report = |n: u64| reported.store(n, std::sync::atomic::Ordering::SeqCst);
            sender.send(&ctx, &mut again, &mut meta, Some(&report)).unwrap();
            assert_eq!(again.position(), 0);
            assert_eq!(reported.into_inner(), 0);

            let mut other = TransferMetadata::new("docs/b.txt", 5);
            sender.send(&ctx, &mut Cursor::new(b"world"), &mut other, None).unwrap();
            sender.close().unwrap();
        });

        let ctx = TransferContext::new();
        let first = TransferMetadata::new("docs/a.txt", 5);
        assert_eq!(read_all(receiver.receive(&ctx, &first).unwrap()).unwrap(), b"hello");
        let second = TransferMetadata::new("docs/b.txt", 5);
        assert_eq!(read_all(receiver.receive(&ctx, &second).unwrap()).unwrap(), b"world");
        sender.join().unwrap();

        // only one copy of docs/a.txt ever crossed the link
        assert!(receiver.receive(&ctx, &first).err().unwrap().is_not_found());
    }

    #[test]
    fn test_integrity_mismatch_is_not_acked() {
        let (receiver, addr) = listener(PipelinePolicy::plain());

        let sender = thread::spawn(move || {
            let ctx = TransferContext::new();
            let sender = DirectWiFiTransport::connect(addr, PipelinePolicy::plain(), TIMEOUT);
            let mut bad = TransferMetadata::new("bad.txt", 3).with_checksum(hash_bytes(b"xyz"));
            let err = sender.send(&ctx, &mut Cursor::new(b"abc"), &mut bad, None).unwrap_err();
            assert!(matches!(err, TransportError::IntegrityMismatch { .. }));

            let mut good = TransferMetadata::new("good.txt", 3);
            sender.send(&ctx, &mut Cursor::new(b"abc"), &mut good, None).unwrap();
            let completed = sender.completed_transfers(&ctx).unwrap();
            sender.close().unwrap();
            completed
        });

        let ctx = TransferContext::new();
        let good = TransferMetadata::new("good.txt", 3);
        assert_eq!(read_all(receiver.receive(&ctx, &good).unwrap()).unwrap(), b"abc");

        let completed = sender.join().unwrap();
        assert_eq!(completed.len(), 1);
        assert!(receiver.receive(&ctx, &TransferMetadata::new("bad.txt", 3)).err().unwrap().is_not_found());
    }

    #[test]
    fn test_accept_times_out_and_cancels() {
        let transport = DirectWiFiTransport::listen("127.0.0.1:0", PipelinePolicy::plain(), Duration::from_millis(200))
            .unwrap();
        assert!(!transport.test_connection(&TransferContext::new()));

        let ctx = TransferContext::new();
        ctx.cancel_token().cancel();
        let mut meta = TransferMetadata::new("a", 1);
        let err = transport.send(&ctx, &mut Cursor::new(b"a"), &mut meta, None).unwrap_err();
        assert!(matches!(err, TransportError::Cancelled));
    }

    #[test]
    fn test_connect_refused() {
        let addr = {
            let probe = TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().to_string()
        };
        let transport = DirectWiFiTransport::connect(addr, PipelinePolicy::plain(), Duration::from_secs(1));
        assert!(!transport.test_connection(&TransferContext::new()));
    }
}
