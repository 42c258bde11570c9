//! Progress reporting for long-running table loops.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

use crate::daemon::shutdown::is_terminated;

/// Counts finished items out of a known total and logs at bounded intervals.
#[derive(Debug)]
pub struct ProgressCounter {
    label: String,
    total: usize,
    done: AtomicUsize,
    start: Instant,
    interval: Duration,
    last_report_ms: AtomicU64,
}

impl ProgressCounter {
    pub fn new(label: impl Into<String>, total: usize) -> Self {
        Self::with_interval(label, total, Duration::from_secs(5))
    }

    pub fn with_interval(label: impl Into<String>, total: usize, interval: Duration) -> Self {
        Self {
            label: label.into(),
            total,
            done: AtomicUsize::new(0),
            start: Instant::now(),
            interval,
            last_report_ms: AtomicU64::new(0),
        }
    }

    /// Records one finished item and returns the new count.
    pub fn increment(&self) -> usize {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        if self.should_report(done) {
            info!("{}: {}/{}", self.label, done, self.total);
        }
        done
    }

    fn should_report(&self, done: usize) -> bool {
        if is_terminated() {
            return false;
        }
        if done == self.total {
            return true;
        }
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_report_ms.load(Ordering::SeqCst);
        now_ms.saturating_sub(last) >= self.interval.as_millis() as u64
            && self
                .last_report_ms
                .compare_exchange(last, now_ms, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn finish(&self) {
        if !is_terminated() {
            info!(
                "{}: {}/{} in {}",
                self.label,
                self.done(),
                self.total,
                format_duration(self.elapsed().as_secs())
            );
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(bytes: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 { (bytes as f64 / secs) as u64 } else { bytes };
    format!("{}/s", format_bytes(rate))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counter_counts() {
        let counter = ProgressCounter::with_interval("tables restored", 3, Duration::ZERO);
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.increment(), 3);
        assert_eq!(counter.done(), counter.total());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_counter_concurrent_increments() {
        let counter = Arc::new(ProgressCounter::new("tables restored", 100));
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let counter = counter.clone();
                tokio::spawn(async move {
                    counter.increment();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(counter.done(), 100);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed_and_duration() {
        assert_eq!(format_speed(2048, Duration::from_secs(2)), "1.00 KB/s");
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3665), "1h 1m");
    }
}
