//! Network plumbing for the remote media
//!
//! - `wire`: frame codec for peer-to-peer sessions
//! - `session`: framed send/receive over any duplex stream
//! - `sftp`: remote file operations and the libssh2 client
//! - `bluetooth`: the platform adapter seam
//! - `parallel`: multi-session SFTP sends
//!
//! ## Stream protocol
//!
//! ```text
//! A -> B   ZIMWIRE1                      (both directions)
//! A -> B   ItemHeader {metadata json}
//! A -> B   Data ... Data End
//! B -> A   Ack                            (or Abort)
//! ```

mod bluetooth;
mod parallel;
mod session;
pub(crate) mod sftp;
pub mod wire;

pub use bluetooth::{BluetoothAdapter, BluetoothDevice};
pub use parallel::{effective_sessions, ParallelSftpSender};
pub use session::{DataFrameWriter, DuplexStream, FrameSession, SpooledPayload};
pub use sftp::{remote_join, remote_split, RemoteEntry, SftpClient};
pub use wire::{FrameKind, ManifestHeader};

#[cfg(feature = "ssh")]
pub use sftp::Ssh2SftpClient;
