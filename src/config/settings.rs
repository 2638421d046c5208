//! Configuration settings for ZIM transport
//!
//! Defines the CLI arguments, the runtime transport configuration derived
//! from them, and the size/remote-path parsers they rely on.

use super::defaults::{
    DEFAULT_BUFFER_SIZE, DEFAULT_CONNECT_TIMEOUT, DEFAULT_DIRECT_WIFI_PORT, DEFAULT_SSH_PORT,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// ZIM transport - move a migration payload between machines
#[derive(Parser, Debug, Clone)]
#[command(name = "zim-transport")]
#[command(author = "ZIM Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Resumable, verified migration payload transport")]
#[command(long_about = r#"
Moves a captured migration payload (manifest plus files) between hosts over
external storage, a network share, SFTP, a direct WiFi socket or Bluetooth.

Every medium gets the same guarantees:
  - compress -> encrypt -> chunk on send, the reverse on receive
  - temp-then-commit writes, never a half-written final object
  - SHA-256 verification and a resume ledger for cheap retries

Examples:
  zim-transport --method external --root /media/usb send ~/captured
  zim-transport --method sftp --remote me@nas --root /srv/zim receive ./restore
  zim-transport --method wifi --listen receive ./restore
  zim-transport estimate 2G
"#)]
pub struct CliArgs {
    /// Transport medium
    #[arg(short = 'm', long, value_enum, default_value = "external")]
    pub method: TransportMethod,

    /// Transport root: mount point, UNC share, or remote base directory
    #[arg(short = 'r', long, value_name = "PATH", default_value = ".")]
    pub root: PathBuf,

    /// Remote SFTP endpoint (user@host)
    #[arg(long, value_name = "USER@HOST")]
    pub remote: Option<String>,

    /// SSH port
    #[arg(long, default_value_t = DEFAULT_SSH_PORT, value_name = "PORT")]
    pub ssh_port: u16,

    /// SSH private key path
    #[arg(long, value_name = "PATH")]
    pub ssh_key: Option<PathBuf>,

    /// SSH password (falls back to key or agent authentication)
    #[arg(long, env = "ZIM_SSH_PASSWORD", hide_env_values = true)]
    pub ssh_password: Option<String>,

    /// Number of parallel SFTP sessions for sends (0 = auto)
    #[arg(long, default_value = "1", value_name = "NUM")]
    pub sessions: usize,

    /// Peer address for DirectWiFi (host or host:port)
    #[arg(long, value_name = "ADDR")]
    pub address: Option<String>,

    /// Listen for the peer instead of connecting (DirectWiFi)
    #[arg(long)]
    pub listen: bool,

    /// Compress payloads (LZ4) before encryption
    #[arg(short = 'c', long)]
    pub compress: bool,

    /// Encrypt payloads with this passphrase
    #[arg(long, env = "ZIM_PASSPHRASE", hide_env_values = true)]
    pub passphrase: Option<String>,

    /// Split stored payloads into chunks of this size (e.g., 64M)
    #[arg(long, value_name = "SIZE")]
    pub chunk_size: Option<String>,

    /// Buffer size for copy loops (e.g., 1M, 64K)
    #[arg(short = 'b', long, default_value = "1M", value_name = "SIZE")]
    pub buffer_size: String,

    /// Seconds to wait for a peer or server
    #[arg(long, default_value = "30", value_name = "SECS")]
    pub connect_timeout: u64,

    /// Show a progress bar
    #[arg(short = 'p', long)]
    pub progress: bool,

    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Check that the medium is reachable and writable
    #[command(name = "probe")]
    Probe,

    /// Send every file under a directory, preceded by a manifest
    #[command(name = "send")]
    Send {
        /// Directory holding the captured payload
        source: PathBuf,
    },

    /// Receive the manifest and every selected item into a directory
    #[command(name = "receive")]
    Receive {
        /// Directory to restore into
        destination: PathBuf,
    },

    /// Show completed transfers recorded in the resume ledger
    #[command(name = "status")]
    Status,

    /// Estimate Bluetooth transfer time for a payload size
    #[command(name = "estimate")]
    Estimate {
        /// Payload size (e.g., 700M)
        size: String,
    },

    /// Split a file into numbered chunks
    #[command(name = "split")]
    Split {
        /// File to split
        file: PathBuf,
        /// Output directory for chunks
        out_dir: PathBuf,
        /// Chunk size (e.g., 4G)
        #[arg(long, default_value = "64M")]
        chunk_size: String,
    },

    /// Reassemble chunks (in the given order) into one file
    #[command(name = "join")]
    Join {
        /// Output file
        output: PathBuf,
        /// Chunk files in index order
        #[arg(required = true)]
        parts: Vec<PathBuf>,
    },
}

/// Medium a manifest was (or will be) carried over
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TransportMethod {
    /// USB disk or other locally mounted volume
    #[default]
    #[value(name = "external")]
    ExternalStorage,
    /// SMB/UNC or NFS share
    #[value(name = "share")]
    NetworkShare,
    /// Remote server over SSH/SFTP
    #[value(name = "sftp")]
    Sftp,
    /// Direct peer-to-peer TCP socket
    #[value(name = "wifi")]
    DirectWiFi,
    /// RFCOMM-style Bluetooth channel
    #[value(name = "bluetooth")]
    Bluetooth,
}

impl TransportMethod {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExternalStorage => "External storage",
            Self::NetworkShare => "Network share",
            Self::Sftp => "SFTP",
            Self::DirectWiFi => "Direct WiFi",
            Self::Bluetooth => "Bluetooth",
        }
    }
}

/// Runtime configuration derived from CLI args
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Medium
    pub method: TransportMethod,
    /// Filesystem root or remote base directory
    pub root: PathBuf,
    /// SFTP endpoint
    pub remote: Option<RemoteConfig>,
    /// DirectWiFi peer address (host:port)
    pub address: Option<String>,
    /// Listen instead of connecting (DirectWiFi)
    pub listen: bool,
    /// Compress payloads
    pub compress: bool,
    /// Encryption passphrase
    #[serde(skip_serializing, default)]
    pub passphrase: Option<String>,
    /// Chunk size for stored payloads
    pub chunk_size: Option<u64>,
    /// Buffer size in bytes
    pub buffer_size: usize,
    /// Connect/accept timeout in seconds
    pub connect_timeout_secs: u64,
}

/// Remote host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Remote hostname or IP
    pub host: String,
    /// Username
    pub user: String,
    /// Port
    pub port: u16,
    /// SSH key path
    pub key_path: Option<PathBuf>,
    /// Password
    #[serde(skip_serializing, default)]
    pub password: Option<String>,
    /// Number of parallel sessions
    pub sessions: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            method: TransportMethod::ExternalStorage,
            root: PathBuf::from("."),
            remote: None,
            address: None,
            listen: false,
            compress: false,
            passphrase: None,
            chunk_size: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
        }
    }
}

/// Parse human-readable size string to bytes
pub fn parse_size(size: &str) -> Result<u64, String> {
    let size = size.trim().to_uppercase();

    if size.is_empty() {
        return Err("Empty size string".to_string());
    }

    let (num_str, multiplier) = if size.ends_with("TB") || size.ends_with('T') {
        let num = size.trim_end_matches(|c| c == 'T' || c == 'B');
        (num, 1024u64 * 1024 * 1024 * 1024)
    } else if size.ends_with("GB") || size.ends_with('G') {
        let num = size.trim_end_matches(|c| c == 'G' || c == 'B');
        (num, 1024u64 * 1024 * 1024)
    } else if size.ends_with("MB") || size.ends_with('M') {
        let num = size.trim_end_matches(|c| c == 'M' || c == 'B');
        (num, 1024u64 * 1024)
    } else if size.ends_with("KB") || size.ends_with('K') {
        let num = size.trim_end_matches(|c| c == 'K' || c == 'B');
        (num, 1024u64)
    } else if size.ends_with('B') {
        let num = size.trim_end_matches('B');
        (num, 1u64)
    } else {
        (size.as_str(), 1u64)
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number: {}", num_str))?;

    if num < 0.0 {
        return Err(format!("Negative size: {}", num_str));
    }

    Ok((num * multiplier as f64) as u64)
}

/// Parse remote endpoint (user@host or user@host:port)
pub fn parse_remote(spec: &str) -> Option<(String, String, Option<u16>)> {
    let (user, host_port) = spec.split_once('@')?;
    if user.is_empty() || host_port.is_empty() {
        return None;
    }

    match host_port.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().ok()?;
            Some((user.to_string(), host.to_string(), Some(port)))
        }
        None => Some((user.to_string(), host_port.to_string(), None)),
    }
}

/// Append the default DirectWiFi port when an address has none
pub fn with_default_port(address: &str) -> String {
    if address.rsplit_once(':').map(|(_, p)| p.parse::<u16>().is_ok()).unwrap_or(false) {
        address.to_string()
    } else {
        format!("{}:{}", address, DEFAULT_DIRECT_WIFI_PORT)
    }
}

impl TransportConfig {
    /// Create config from CLI arguments
    pub fn from_cli(args: &CliArgs) -> Result<Self, String> {
        let mut config = Self {
            method: args.method,
            root: args.root.clone(),
            listen: args.listen,
            compress: args.compress,
            passphrase: args.passphrase.clone().filter(|p| !p.is_empty()),
            connect_timeout_secs: args.connect_timeout,
            ..Default::default()
        };

        config.buffer_size = parse_size(&args.buffer_size)
            .map_err(|e| format!("Invalid buffer size: {}", e))? as usize;
        if config.buffer_size == 0 {
            return Err("Buffer size must be positive".to_string());
        }

        config.chunk_size = args
            .chunk_size
            .as_ref()
            .map(|s| parse_size(s))
            .transpose()
            .map_err(|e| format!("Invalid chunk size: {}", e))?;
        if config.chunk_size == Some(0) {
            return Err("Chunk size must be positive".to_string());
        }

        if let Some(remote) = &args.remote {
            let (user, host, port) = parse_remote(remote)
                .ok_or_else(|| format!("Invalid remote '{}', expected user@host[:port]", remote))?;
            config.remote = Some(RemoteConfig {
                host,
                user,
                port: port.unwrap_or(args.ssh_port),
                key_path: args.ssh_key.clone(),
                password: args.ssh_password.clone(),
                sessions: args.sessions,
            });
        }

        config.address = args.address.as_deref().map(with_default_port);

        match config.method {
            TransportMethod::Sftp if config.remote.is_none() => {
                Err("SFTP requires --remote user@host".to_string())
            }
            TransportMethod::DirectWiFi if !config.listen && config.address.is_none() => {
                Err("DirectWiFi requires --address or --listen".to_string())
            }
            _ => Ok(config),
        }
    }

    /// Connect/accept timeout
    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_timeout_secs)
    }
}
