//! Named constants shared by every medium
//!
//! On-medium layout names, wire constants and tuning defaults live here so
//! both ends of a transfer agree on them.

use std::time::Duration;
use uuid::Uuid;

/// Manifest file name under the transport root
pub const MANIFEST_FILE_NAME: &str = "zim-manifest.json";

/// Resume ledger file name under the transport root
pub const RESUME_FILE_NAME: &str = "zim-resume.json";

/// Data directory under the transport root; mirrors each item's relative path
pub const DATA_DIR_NAME: &str = "zim-data";

/// Prefix of the marker object written and deleted by connection probes
pub const PROBE_FILE_PREFIX: &str = ".zim-probe";

/// Suffix for uncommitted objects
pub const TEMP_SUFFIX: &str = ".tmp";

/// Chunk suffix stem; the index follows, zero-padded to four digits
pub const CHUNK_SUFFIX: &str = ".part";

/// Buffer size for copy loops (1 MiB)
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Chunk size used to bound per-request size on unreliable links (64 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Largest file a FAT32 volume can hold (4 GiB - 1)
pub const FAT32_MAX_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024 - 1;

/// PBKDF2-HMAC-SHA256 iteration count for passphrase key derivation
pub const KDF_ITERATIONS: u32 = 100_000;

/// TCP port the listening side of a DirectWiFi session binds to
pub const DEFAULT_DIRECT_WIFI_PORT: u16 = 52400;

/// RFCOMM service identifier advertised and looked up by Bluetooth sessions
pub const BLUETOOTH_SERVICE_ID: Uuid = Uuid::from_u128(0x6f1c2a9e_5b7d_4e3a_9c41_7a2f0d8e3b15);

/// Assumed Bluetooth throughput ceiling used for ETA display (256 KiB/s)
pub const BLUETOOTH_ASSUMED_BYTES_PER_SEC: u64 = 256 * 1024;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// How long a listening side waits for its peer
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default Bluetooth device scan duration
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on parallel SFTP sessions
pub const MAX_PARALLEL_SESSIONS: usize = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fat32_limit() {
        assert_eq!(FAT32_MAX_FILE_SIZE, 4_294_967_295);
    }

    #[test]
    fn test_service_id_format() {
        assert_eq!(
            BLUETOOTH_SERVICE_ID.to_string(),
            "6f1c2a9e-5b7d-4e3a-9c41-7a2f0d8e3b15"
        );
    }
}
