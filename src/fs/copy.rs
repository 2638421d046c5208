//! Buffered stream copy with progress and cancellation
//!
//! Every transport funnels payload bytes through [`copy_with_progress`], so
//! cancellation is observed at buffer granularity on every medium.

use crate::config::defaults::DEFAULT_BUFFER_SIZE;
use crate::error::{Result, TransportError};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Progress callback, invoked with the cumulative byte count.
///
/// Called synchronously on the I/O thread; implementations must not block.
pub type ProgressFn<'a> = &'a (dyn Fn(u64) + Sync);

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; every clone observes it
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Return `Err(Cancelled)` once cancellation has been requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(TransportError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Per-call context passed to every transport operation
#[derive(Debug, Clone)]
pub struct TransferContext {
    cancel: CancelToken,
    buffer_size: usize,
}

impl Default for TransferContext {
    fn default() -> Self {
        Self {
            cancel: CancelToken::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl TransferContext {
    /// Context with a fresh token and the default buffer size
    pub fn new() -> Self {
        Self::default()
    }

    /// Context observing an existing token
    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    /// Override the copy buffer size (minimum 4 KiB)
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(4096);
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check(&self) -> Result<()> {
        self.cancel.check()
    }
}

/// Copy `reader` into `writer` until EOF.
///
/// Checks cancellation before every buffer, reports cumulative bytes after
/// every write, and flushes the writer at the end. Returns the byte count.
pub fn copy_with_progress(
    ctx: &TransferContext,
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    progress: Option<ProgressFn<'_>>,
) -> Result<u64> {
    let mut buffer = vec![0u8; ctx.buffer_size()];
    let mut total = 0u64;

    loop {
        ctx.check()?;

        let bytes_read = match reader.read(&mut buffer) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted && e.get_ref().is_none() => continue,
            Err(e) => return Err(e.into()),
        };
        if bytes_read == 0 {
            break;
        }

        writer.write_all(&buffer[..bytes_read])?;
        total += bytes_read as u64;

        if let Some(report) = progress {
            report(total);
        }
    }

    writer.flush()?;
    Ok(total)
}
