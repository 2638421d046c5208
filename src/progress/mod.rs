//! Progress reporting module
//!
//! Provides session-wide progress bars for the command-line tool and a
//! non-blocking channel adapter for embedding callers.

mod reporter;

pub use reporter::*;
