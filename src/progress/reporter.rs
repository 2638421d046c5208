//! Progress reporter implementation
//!
//! Transports report cumulative bytes per item through a plain callback.
//! [`TransferProgress`] turns those per-item counts into session-wide
//! indicatif bars, and [`channel_progress`] hands them to another thread
//! without ever blocking the copy loop.

use crossbeam::channel::{bounded, Receiver};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

fn style(template: &str, fallback: ProgressStyle) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .map(|s| s.progress_chars("=> "))
        .unwrap_or(fallback)
}

/// Session-wide progress display for a batch of items
pub struct TransferProgress {
    /// Multi-progress container
    multi: MultiProgress,
    /// Main progress bar (bytes)
    bytes_bar: ProgressBar,
    /// Item count progress bar
    items_bar: ProgressBar,
    /// Current item line
    status: ProgressBar,
    start_time: Instant,
    total_bytes: AtomicU64,
    total_items: AtomicU64,
    bytes_done: AtomicU64,
    items_done: AtomicU64,
    /// Cumulative count last reported for the current item
    item_bytes: AtomicU64,
    enabled: AtomicBool,
}

impl TransferProgress {
    /// Create a new progress display
    pub fn new() -> Self {
        let multi = MultiProgress::new();

        let status = multi.add(ProgressBar::new_spinner());
        status.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );

        let items_bar = multi.add(ProgressBar::new(0));
        items_bar.set_style(style(
            "{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} items ({percent}%)",
            ProgressStyle::default_bar(),
        ));
        items_bar.set_prefix("Items");

        let bytes_bar = multi.add(ProgressBar::new(0));
        bytes_bar.set_style(style(
            "{prefix:.bold.dim} [{bar:40.green/white}] {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta})",
            ProgressStyle::default_bar(),
        ));
        bytes_bar.set_prefix("Data ");

        Self {
            multi,
            bytes_bar,
            items_bar,
            status,
            start_time: Instant::now(),
            total_bytes: AtomicU64::new(0),
            total_items: AtomicU64::new(0),
            bytes_done: AtomicU64::new(0),
            items_done: AtomicU64::new(0),
            item_bytes: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    /// Create a hidden progress display (for quiet mode and tests)
    pub fn disabled() -> Self {
        let progress = Self::new();
        progress.enabled.store(false, Ordering::SeqCst);
        progress.multi.set_draw_target(ProgressDrawTarget::hidden());
        progress
    }

    /// Set the batch totals
    pub fn set_totals(&self, items: u64, bytes: u64) {
        self.total_items.store(items, Ordering::Relaxed);
        self.total_bytes.store(bytes, Ordering::Relaxed);
        self.items_bar.set_length(items);
        self.bytes_bar.set_length(bytes);
    }

    /// Start a new item
    pub fn begin_item(&self, name: &str) {
        self.item_bytes.store(0, Ordering::Relaxed);
        let display = if name.len() > 60 {
            let cut = name.len() - 57;
            let cut = (cut..name.len()).find(|&i| name.is_char_boundary(i)).unwrap_or(cut);
            format!("...{}", &name[cut..])
        } else {
            name.to_string()
        };
        self.status.set_message(display);
    }

    /// Record a cumulative byte count for the current item.
    ///
    /// Counts that do not advance are ignored, so the bars never go backwards.
    pub fn update_item(&self, cumulative: u64) {
        let previous = self.item_bytes.fetch_max(cumulative, Ordering::Relaxed);
        if cumulative > previous {
            let delta = cumulative - previous;
            self.bytes_done.fetch_add(delta, Ordering::Relaxed);
            self.bytes_bar.inc(delta);
        }
    }

    /// Mark the current item done
    pub fn finish_item(&self) {
        self.items_done.fetch_add(1, Ordering::Relaxed);
        self.items_bar.inc(1);
        self.item_bytes.store(0, Ordering::Relaxed);
    }

    /// Count an item that was skipped because it was already delivered
    pub fn skip_item(&self, size: u64) {
        self.bytes_done.fetch_add(size, Ordering::Relaxed);
        self.bytes_bar.inc(size);
        self.finish_item();
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Current throughput in bytes/second
    pub fn throughput(&self) -> f64 {
        let bytes = self.bytes_done.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            bytes as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Finish with a success message
    pub fn finish_success(&self, message: &str) {
        self.status.finish_with_message(format!("✓ {}", message));
        self.items_bar.finish();
        self.bytes_bar.finish();
    }

    /// Finish with an error message
    pub fn finish_error(&self, message: &str) {
        self.status.finish_with_message(format!("✗ {}", message));
        self.items_bar.abandon();
        self.bytes_bar.abandon();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Snapshot for the final report
    pub fn summary(&self) -> ProgressSummary {
        ProgressSummary {
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            bytes_done: self.bytes_done.load(Ordering::Relaxed),
            total_items: self.total_items.load(Ordering::Relaxed),
            items_done: self.items_done.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            throughput: self.throughput(),
        }
    }
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress summary
#[derive(Debug, Clone)]
pub struct ProgressSummary {
    pub total_bytes: u64,
    pub bytes_done: u64,
    pub total_items: u64,
    pub items_done: u64,
    pub elapsed: Duration,
    /// Throughput in bytes/second
    pub throughput: f64,
}

impl ProgressSummary {
    /// Get completion percentage
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.bytes_done as f64 / self.total_bytes as f64) * 100.0
        }
    }

    /// Print summary to console
    pub fn print(&self) {
        println!("Progress: {:.1}%", self.percentage());
        println!("Items:    {}/{}", self.items_done, self.total_items);
        println!(
            "Bytes:    {}/{}",
            humansize::format_size(self.bytes_done, humansize::BINARY),
            humansize::format_size(self.total_bytes, humansize::BINARY)
        );
        println!("Elapsed:  {}", humantime::format_duration(Duration::from_secs(self.elapsed.as_secs())));
        println!("Speed:    {}/s", humansize::format_size(self.throughput as u64, humansize::BINARY));
    }
}

/// Progress callback backed by a bounded channel.
///
/// The callback uses `try_send`, so it never blocks the copy loop; updates
/// are dropped while the receiver lags behind.
pub fn channel_progress(capacity: usize) -> (impl Fn(u64) + Send + Sync, Receiver<u64>) {
    let (tx, rx) = bounded(capacity.max(1));
    let report = move |bytes: u64| {
        let _ = tx.try_send(bytes);
    };
    (report, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_progress_accumulates_items() {
        let progress = TransferProgress::disabled();
        progress.set_totals(3, 1000);

        progress.begin_item("a");
        progress.update_item(100);
        progress.update_item(300);
        progress.update_item(200);
        progress.finish_item();

        progress.begin_item("b");
        progress.update_item(200);
        progress.finish_item();

        progress.skip_item(500);

        let summary = progress.summary();
        assert_eq!(summary.bytes_done, 1000);
        assert_eq!(summary.items_done, 3);
        assert_eq!(summary.percentage(), 100.0);
    }

    #[test]
    fn test_long_names_are_truncated() {
        let progress = TransferProgress::disabled();
        progress.begin_item(&"é".repeat(80));
    }

    #[test]
    fn test_channel_progress_never_blocks() {
        let (report, rx) = channel_progress(2);
        for n in 1..=10 {
            report(n);
        }
        let received: Vec<u64> = rx.try_iter().collect();
        assert_eq!(received, vec![1, 2]);

        report(11);
        assert_eq!(rx.try_recv().unwrap(), 11);
    }

    #[test]
    fn test_channel_progress_after_receiver_dropped() {
        let (report, rx) = channel_progress(1);
        drop(rx);
        report(42);
    }
}
