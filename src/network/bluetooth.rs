//! Bluetooth adapter seam
//!
//! The Bluetooth transport never touches an OS stack directly. It asks a
//! [`BluetoothAdapter`] for a duplex channel bound to a service identifier
//! and runs the ordinary framed session over it.

use super::session::DuplexStream;
use crate::error::Result;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// A device found during discovery
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BluetoothDevice {
    /// Friendly name
    pub name: String,
    /// Hardware address (e.g. `00:11:22:33:44:55`)
    pub address: String,
}

impl BluetoothDevice {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for BluetoothDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.address)
    }
}

/// Platform Bluetooth stack
///
/// Implementations provide RFCOMM-style stream channels. All methods may
/// block; `accept` must give up after `timeout`.
pub trait BluetoothAdapter: Send + Sync {
    /// Scan for nearby devices
    fn discover(&self, timeout: Duration) -> Result<Vec<BluetoothDevice>>;

    /// Open a channel to `service` on `device`
    fn connect(&self, device: &BluetoothDevice, service: Uuid) -> Result<Box<dyn DuplexStream>>;

    /// Advertise `service` and wait for one peer
    fn accept(&self, service: Uuid, timeout: Duration) -> Result<Box<dyn DuplexStream>>;

    /// Stop advertising and release adapter resources
    fn dispose(&self);
}
