//! Session bookkeeping
//!
//! Provides:
//! - The transfer manifest exchanged once per session
//! - Per-item transfer metadata and relative-path validation
//! - The resume ledger that lets retried sessions skip committed items

mod ledger;
mod manifest;
mod metadata;

pub use ledger::ResumeLedger;
pub use manifest::*;
pub use metadata::*;
