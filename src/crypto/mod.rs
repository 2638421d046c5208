//! Encryption module
//!
//! Passphrase-based AES-256-GCM with the `ZIME` envelope, usable on whole
//! buffers or as streaming reader/writer adapters.

mod envelope;

pub use envelope::*;
