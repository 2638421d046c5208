//! Transfer manifest
//!
//! Describes what a migration session carries. Produced once by the source,
//! consumed once by the destination before any item moves, and never
//! modified in between.

use crate::config::TransportMethod;
use crate::error::{Result, TransportError};
use serde::{Deserialize, Serialize};

/// Kind of a migration item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ItemType {
    #[default]
    File,
    Folder,
    Application,
    Settings,
    UserProfile,
    BrowserData,
    #[serde(other)]
    Other,
}

/// Summary of one item in a migration session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MigrationItem {
    /// Name shown to the user
    pub display_name: String,
    /// Item kind
    pub item_type: ItemType,
    /// Whether the user chose to migrate it
    pub is_selected: bool,
    /// Estimated size in bytes
    pub estimated_size_bytes: i64,
}

impl MigrationItem {
    /// Create a selected item
    pub fn new(display_name: impl Into<String>, item_type: ItemType, estimated_size_bytes: i64) -> Self {
        Self {
            display_name: display_name.into(),
            item_type,
            is_selected: true,
            estimated_size_bytes,
        }
    }
}

/// Manifest describing a whole migration session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TransferManifest {
    /// Host the payload was captured on
    pub source_hostname: String,
    /// OS version of the source host
    pub source_os_version: String,
    /// Medium the session uses
    pub transport_method: TransportMethod,
    /// Items in capture order
    #[serde(default)]
    pub items: Vec<MigrationItem>,
}

impl TransferManifest {
    /// Create an empty manifest
    pub fn new(
        source_hostname: impl Into<String>,
        source_os_version: impl Into<String>,
        transport_method: TransportMethod,
    ) -> Self {
        Self {
            source_hostname: source_hostname.into(),
            source_os_version: source_os_version.into(),
            transport_method,
            items: Vec::new(),
        }
    }

    /// Create an empty manifest describing the current host
    pub fn for_this_host(transport_method: TransportMethod) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let os_version = sysinfo::System::long_os_version().unwrap_or_else(|| "unknown".to_string());
        Self::new(hostname, os_version, transport_method)
    }

    /// Append an item
    pub fn add_item(&mut self, item: MigrationItem) {
        self.items.push(item);
    }

    /// Items the user selected, in order
    pub fn selected_items(&self) -> impl Iterator<Item = &MigrationItem> {
        self.items.iter().filter(|i| i.is_selected)
    }

    /// Sum of estimated sizes of the selected items
    pub fn total_estimated_size(&self) -> u64 {
        self.selected_items()
            .map(|i| i.estimated_size_bytes.max(0) as u64)
            .sum()
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse from JSON
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| TransportError::Manifest(format!("invalid manifest: {}", e)))
    }

    /// Print a short summary to stdout
    pub fn print_summary(&self) {
        println!("Manifest from {} ({})", self.source_hostname, self.source_os_version);
        println!("  Method: {}", self.transport_method.name());
        println!(
            "  Items:  {} ({} selected, {})",
            self.items.len(),
            self.selected_items().count(),
            humansize::format_size(self.total_estimated_size(), humansize::BINARY)
        );
    }
}
