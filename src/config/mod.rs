//! Configuration module for ZIM transport
//!
//! Provides CLI arguments, runtime transport settings and the named
//! constants both ends of a transfer must agree on.

pub mod defaults;
mod settings;

pub use settings::*;
