//! Content checksums
//!
//! SHA-256 over plaintext, with streaming helpers for files, readers and
//! pass-through verification during a send.

mod checksum;

pub use checksum::*;
