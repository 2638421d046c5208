//! Bluetooth transport over a platform adapter

use super::pipeline::PipelinePolicy;
use super::stream::StreamCore;
use super::{ProgressFn, TransferContext, Transport, TransportMethod};
use crate::config::defaults::{BLUETOOTH_ASSUMED_BYTES_PER_SEC, BLUETOOTH_SERVICE_ID};
use crate::error::Result;
use crate::network::{BluetoothAdapter, BluetoothDevice, FrameSession};
use crate::sync::{TransferManifest, TransferMetadata};
use std::collections::HashSet;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Which side of the RFCOMM channel this transport is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BluetoothRole {
    /// Advertise the service and wait for a peer
    Listen,
    /// Connect to a discovered device
    Connect(BluetoothDevice),
}

/// Expected duration for `bytes` at the assumed Bluetooth throughput
pub fn estimate_transfer_time(bytes: u64) -> Duration {
    let nanos = u128::from(bytes) * 1_000_000_000 / u128::from(BLUETOOTH_ASSUMED_BYTES_PER_SEC);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

pub struct BluetoothTransport {
    adapter: Arc<dyn BluetoothAdapter>,
    role: BluetoothRole,
    timeout: Duration,
    core: StreamCore,
    disposed: AtomicBool,
}

impl BluetoothTransport {
    pub fn new(adapter: Arc<dyn BluetoothAdapter>, role: BluetoothRole, policy: PipelinePolicy, timeout: Duration) -> Self {
        Self {
            adapter,
            role,
            timeout,
            core: StreamCore::new("Bluetooth", policy),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn role(&self) -> &BluetoothRole {
        &self.role
    }

    /// Scan for nearby devices
    pub fn discover_devices(&self, timeout: Duration) -> Result<Vec<BluetoothDevice>> {
        let devices = self.adapter.discover(timeout)?;
        info!("Discovered {} Bluetooth device(s)", devices.len());
        Ok(devices)
    }

    fn open(&self, _ctx: &TransferContext) -> Result<FrameSession> {
        let (stream, peer) = match &self.role {
            BluetoothRole::Listen => (
                self.adapter.accept(BLUETOOTH_SERVICE_ID, self.timeout)?,
                "bluetooth peer".to_string(),
            ),
            BluetoothRole::Connect(device) => (
                self.adapter.connect(device, BLUETOOTH_SERVICE_ID)?,
                device.to_string(),
            ),
        };
        FrameSession::handshake(stream, peer)
    }
}

impl Transport for BluetoothTransport {
    fn method(&self) -> TransportMethod {
        TransportMethod::Bluetooth
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
        if meta.size_bytes > 0 {
            info!(
                "Sending '{}' over Bluetooth, expected {}",
                meta.relative_path,
                humantime::format_duration(estimate_transfer_time(meta.size_bytes as u64))
            );
        }
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
        self.core.close()?;
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.adapter.dispose();
        }
        Ok(())
    }
}

impl Drop for BluetoothTransport {
    fn drop(&mut self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.adapter.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::hash::hash_bytes;
    use crate::network::DuplexStream;
    use std::io::Cursor;
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::thread;
    use uuid::Uuid;

    /// Adapter whose RFCOMM channel is a loopback TCP socket
    struct LoopbackAdapter {
        listener: Mutex<Option<TcpListener>>,
        addr: SocketAddr,
        disposed: AtomicUsize,
    }

    impl LoopbackAdapter {
        fn pair() -> (Arc<Self>, Arc<Self>) {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            let server = Arc::new(Self {
                listener: Mutex::new(Some(listener)),
                addr,
                disposed: AtomicUsize::new(0),
            });
            let client = Arc::new(Self {
                listener: Mutex::new(None),
                addr,
                disposed: AtomicUsize::new(0),
            });
            (server, client)
        }
    }

    impl BluetoothAdapter for LoopbackAdapter {
        fn discover(&self, _timeout: Duration) -> Result<Vec<BluetoothDevice>> {
            Ok(vec![BluetoothDevice::new("peer", "00:11:22:33:44:55")])
        }

        fn connect(&self, _device: &BluetoothDevice, service: Uuid) -> Result<Box<dyn DuplexStream>> {
            assert_eq!(service, BLUETOOTH_SERVICE_ID);
            Ok(Box::new(TcpStream::connect(self.addr)?))
        }

        fn accept(&self, service: Uuid, _timeout: Duration) -> Result<Box<dyn DuplexStream>> {
            assert_eq!(service, BLUETOOTH_SERVICE_ID);
            let guard = self.listener.lock().unwrap();
            let listener = guard
                .as_ref()
                .ok_or_else(|| TransportError::connection("loopback", "not advertising"))?;
            let (stream, _) = listener.accept()?;
            Ok(Box::new(stream))
        }

        fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_estimate_transfer_time() {
        assert_eq!(estimate_transfer_time(0), Duration::ZERO);
        assert_eq!(estimate_transfer_time(1024 * 1024), Duration::from_secs(4));
        assert_eq!(estimate_transfer_time(128 * 1024), Duration::from_millis(500));
        assert!(estimate_transfer_time(u64::MAX) > Duration::from_secs(1 << 30));
    }

    #[test]
    fn test_session_over_adapter() {
        let (server_adapter, client_adapter) = LoopbackAdapter::pair();
        let policy = PipelinePolicy::new(true, Some("bt".into()));

        let server = BluetoothTransport::new(
            server_adapter.clone(),
            BluetoothRole::Listen,
            policy.clone(),
            Duration::from_secs(10),
        );

        let client_policy = policy.clone();
        let client_thread = thread::spawn(move || {
            let probe = BluetoothTransport::new(
                client_adapter.clone(),
                BluetoothRole::Listen,
                client_policy.clone(),
                Duration::from_secs(1),
            );
            let devices = probe.discover_devices(Duration::from_secs(1)).unwrap();
            drop(probe);

            let client = BluetoothTransport::new(
                client_adapter.clone(),
                BluetoothRole::Connect(devices[0].clone()),
                client_policy,
                Duration::from_secs(10),
            );
            let ctx = TransferContext::new();
            let data = b"bluetooth payload".repeat(100);
            let mut meta = TransferMetadata::new("bt/data.bin", data.len() as i64).with_checksum(hash_bytes(&data));
            client.send(&ctx, &mut Cursor::new(&data), &mut meta, None).unwrap();
            client.close().unwrap();
            client.close().unwrap();
            (client_adapter, data)
        });

        let ctx = TransferContext::new();
        let meta = TransferMetadata::new("bt/data.bin", 0);
        let mut out = Vec::new();
        server.receive(&ctx, &meta).unwrap().read_to_end(&mut out).unwrap();

        let (client_adapter, data) = client_thread.join().unwrap();
        assert_eq!(out, data);
        // one dispose from the dropped probe, one from close
        assert_eq!(client_adapter.disposed.load(Ordering::SeqCst), 2);

        assert!(server.completed_transfers(&ctx).unwrap().contains("bt/data.bin"));
        server.close().unwrap();
        drop(server);
        assert_eq!(server_adapter.disposed.load(Ordering::SeqCst), 1);
    }
}
