//! Transport abstraction
//!
//! Every medium implements [`Transport`]: the same resumable, verified
//! protocol over a filesystem root, an SFTP session, a TCP socket or a
//! Bluetooth channel.
//!
//! ## Layout on persistent media
//!
//! | Path | Contents |
//! |------|----------|
//! | `zim-manifest.json` | session manifest |
//! | `zim-resume.json` | resume ledger |
//! | `zim-data/<relative path>` | payload, or `.partNNNN` chunk set |
//!
//! ## Media
//!
//! | Transport | Resume state | Atomic commit |
//! |-----------|--------------|---------------|
//! | External storage | ledger on the medium | rename of `.tmp` parts |
//! | Network share | ledger on the share | rename of `.tmp` parts |
//! | SFTP | ledger on the server | remote rename of `.tmp` uploads |
//! | Direct WiFi | per session | receiver Ack |
//! | Bluetooth | per session | receiver Ack |

mod bluetooth;
mod direct_wifi;
mod external;
mod filesystem;
pub mod pipeline;
mod sftp;
mod share;
mod stream;

pub use bluetooth::{estimate_transfer_time, BluetoothRole, BluetoothTransport};
pub use direct_wifi::DirectWiFiTransport;
pub use external::ExternalStorageTransport;
pub use filesystem::DirectoryStore;
pub use pipeline::PipelinePolicy;
pub use sftp::SftpTransport;
pub use share::NetworkShareTransport;

pub use crate::config::TransportMethod;
pub use crate::fs::{CancelToken, ProgressFn, TransferContext};

use crate::config::defaults::DATA_DIR_NAME;
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::sync::{relative_components, TransferManifest, TransferMetadata};
use std::collections::HashSet;
use std::io::Read;

/// Common contract of every transfer medium
///
/// Implementations serialize calls on one instance internally, so a
/// transport can be shared between threads.
pub trait Transport: Send + Sync {
    /// Medium this transport moves data over
    fn method(&self) -> TransportMethod;

    /// Check that the medium is reachable and writable.
    ///
    /// Never fails: any problem is logged and reported as `false`.
    fn test_connection(&self, ctx: &TransferContext) -> bool;

    /// Send one payload, committing it atomically.
    ///
    /// Skips the medium entirely when the resume state already lists
    /// `meta.relative_path` with the same checksum. Sets
    /// `meta.is_compressed`/`meta.is_encrypted` to what was applied.
    fn send(
        &self,
        ctx: &TransferContext,
        source: &mut dyn Read,
        meta: &mut TransferMetadata,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<()>;

    /// Open a committed payload, reversing the send pipeline
    fn receive(&self, ctx: &TransferContext, meta: &TransferMetadata) -> Result<Box<dyn Read + Send>>;

    /// Send the session manifest
    fn send_manifest(&self, ctx: &TransferContext, manifest: &TransferManifest) -> Result<()>;

    /// Receive the session manifest
    fn receive_manifest(&self, ctx: &TransferContext) -> Result<TransferManifest>;

    /// Relative paths already delivered; empty when nothing is recorded
    fn completed_transfers(&self, ctx: &TransferContext) -> Result<HashSet<String>>;

    /// Release the connection. Idempotent.
    fn close(&self) -> Result<()>;
}

/// Path of an item's payload relative to the transport root, `/`-separated
pub fn data_path(relative_path: &str) -> Result<String> {
    let mut path = String::from(DATA_DIR_NAME);
    for component in relative_components(relative_path)? {
        path.push('/');
        path.push_str(component);
    }
    Ok(path)
}

/// Build a transport from runtime configuration.
///
/// Bluetooth needs a platform adapter and is constructed directly with
/// [`BluetoothTransport::new`].
pub fn open_transport(config: &TransportConfig) -> Result<Box<dyn Transport>> {
    let policy = PipelinePolicy::new(config.compress, config.passphrase.clone());

    match config.method {
        TransportMethod::ExternalStorage => {
            let mut transport = ExternalStorageTransport::new(&config.root, policy);
            if let Some(size) = config.chunk_size {
                transport = transport.with_part_ceiling(size);
            }
            Ok(Box::new(transport))
        }
        TransportMethod::NetworkShare => Ok(Box::new(NetworkShareTransport::new(
            &config.root,
            policy,
            config.chunk_size,
        ))),
        TransportMethod::Sftp => open_sftp(config, policy),
        TransportMethod::DirectWiFi => {
            let transport = if config.listen {
                let addr = config
                    .address
                    .clone()
                    .unwrap_or_else(|| crate::config::with_default_port("0.0.0.0"));
                DirectWiFiTransport::listen(&addr, policy, config.connect_timeout())?
            } else {
                let addr = config
                    .address
                    .clone()
                    .ok_or_else(|| TransportError::config("DirectWiFi needs a peer address"))?;
                DirectWiFiTransport::connect(addr, policy, config.connect_timeout())
            };
            Ok(Box::new(transport))
        }
        TransportMethod::Bluetooth => Err(TransportError::Unsupported(
            "Bluetooth needs a platform adapter; construct BluetoothTransport directly".to_string(),
        )),
    }
}

#[cfg(feature = "ssh")]
fn open_sftp(config: &TransportConfig, policy: PipelinePolicy) -> Result<Box<dyn Transport>> {
    use crate::network::Ssh2SftpClient;

    let remote = config
        .remote
        .clone()
        .ok_or_else(|| TransportError::config("SFTP needs a remote user@host"))?;
    let client = Ssh2SftpClient::new(remote, config.connect_timeout());
    let base = config.root.to_string_lossy().replace('\\', "/");
    Ok(Box::new(SftpTransport::new(Box::new(client), base, policy, config.chunk_size)))
}

#[cfg(not(feature = "ssh"))]
fn open_sftp(_config: &TransportConfig, _policy: PipelinePolicy) -> Result<Box<dyn Transport>> {
    Err(TransportError::Unsupported(
        "SFTP support was not compiled in (enable the `ssh` feature)".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_data_path() {
        assert_eq!(data_path("docs/a.txt").unwrap(), "zim-data/docs/a.txt");
        assert_eq!(data_path("docs\\b.txt").unwrap(), "zim-data/docs/b.txt");
        assert!(matches!(data_path("../x"), Err(TransportError::InvalidPath(_))));
    }

    #[test]
    fn test_open_filesystem_transports() {
        let dir = TempDir::new().unwrap();
        let config = TransportConfig {
            root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let transport = open_transport(&config).unwrap();
        assert_eq!(transport.method(), TransportMethod::ExternalStorage);
        assert!(transport.test_connection(&TransferContext::new()));

        let config = TransportConfig {
            method: TransportMethod::NetworkShare,
            ..config
        };
        assert_eq!(open_transport(&config).unwrap().method(), TransportMethod::NetworkShare);
    }

    #[test]
    fn test_bluetooth_needs_adapter() {
        let config = TransportConfig {
            method: TransportMethod::Bluetooth,
            ..Default::default()
        };
        assert!(matches!(open_transport(&config).err(), Some(TransportError::Unsupported(_))));
    }
}
