//! # ZIM Transport - resumable migration payload transport
//!
//! Moves a captured migration payload (a manifest plus many files) from a
//! source machine to a target machine over one of five interchangeable
//! media: external storage, a network share, SFTP, a direct WiFi socket or
//! Bluetooth.
//!
//! ## Guarantees
//!
//! - **One pipeline**: compress (LZ4) then encrypt (AES-256-GCM) then chunk
//!   on send, the exact reverse on receive
//! - **Atomic commits**: temp-then-rename on persistent media, receiver Ack
//!   on stream media; a failed send never leaves a committed object
//! - **Integrity**: SHA-256 of the plaintext verified on both ends
//! - **Resume**: a ledger of delivered items makes retries cheap
//!
//! ## Quick Start
//!
//! ```no_run
//! use zim_transport::prelude::*;
//! use std::fs::File;
//! use std::io::Read;
//!
//! let transport = ExternalStorageTransport::new("/media/usb", PipelinePolicy::new(true, None));
//! let ctx = TransferContext::new();
//!
//! let mut meta = TransferMetadata::new("Documents/report.docx", 52_000)
//!     .with_checksum(hash_file("/home/me/Documents/report.docx".as_ref())?);
//! let mut source = File::open("/home/me/Documents/report.docx")?;
//! transport.send(&ctx, &mut source, &mut meta, None)?;
//!
//! let mut restored = Vec::new();
//! transport.receive(&ctx, &meta)?.read_to_end(&mut restored)?;
//! # Ok::<(), zim_transport::TransportError>(())
//! ```
//!
//! ## Choosing a medium
//!
//! ```no_run
//! use zim_transport::config::{TransportConfig, TransportMethod};
//! use zim_transport::transport::open_transport;
//!
//! let config = TransportConfig {
//!     method: TransportMethod::NetworkShare,
//!     root: "//nas/migrations/laptop-42".into(),
//!     compress: true,
//!     passphrase: Some("correct horse".into()),
//!     ..Default::default()
//! };
//! let transport = open_transport(&config)?;
//! assert!(transport.test_connection(&Default::default()));
//! # Ok::<(), zim_transport::TransportError>(())
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod hash;
pub mod network;
pub mod progress;
pub mod sync;
pub mod transport;

// Re-export commonly used types
pub use config::{TransportConfig, TransportMethod};
pub use error::{Result, TransportError};
pub use sync::{TransferManifest, TransferMetadata};
pub use transport::{open_transport, Transport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use zim_transport::prelude::*;
    //! ```

    pub use crate::config::{TransportConfig, TransportMethod};
    pub use crate::error::{Result, TransportError};
    pub use crate::fs::{CancelToken, ProgressFn, TransferContext};
    pub use crate::hash::{hash_bytes, hash_file};
    pub use crate::progress::{channel_progress, TransferProgress};
    pub use crate::sync::{ItemType, MigrationItem, ResumeLedger, TransferManifest, TransferMetadata};
    pub use crate::transport::{
        open_transport, BluetoothRole, BluetoothTransport, DirectWiFiTransport, ExternalStorageTransport,
        NetworkShareTransport, PipelinePolicy, SftpTransport, Transport,
    };
}
