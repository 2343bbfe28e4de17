//! Rolling pipeline counters, logged periodically so an operator can see
//! scrape throughput without a metrics stack.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::context::AppContext;

const REPORT_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Default)]
pub struct ScrapeStats {
    scraped: AtomicU64,
    unchanged: AtomicU64,
    changed: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
}

impl ScrapeStats {
    pub fn record_unchanged(&self) {
        self.scraped.fetch_add(1, Ordering::Relaxed);
        self.unchanged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_changed(&self) {
        self.scraped.fetch_add(1, Ordering::Relaxed);
        self.changed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.scraped.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeued(&self) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    /// Read and reset, so each report covers one window.
    pub fn drain(&self) -> StatsWindow {
        StatsWindow {
            scraped: self.scraped.swap(0, Ordering::Relaxed),
            unchanged: self.unchanged.swap(0, Ordering::Relaxed),
            changed: self.changed.swap(0, Ordering::Relaxed),
            failed: self.failed.swap(0, Ordering::Relaxed),
            requeued: self.requeued.swap(0, Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsWindow {
    pub scraped: u64,
    pub unchanged: u64,
    pub changed: u64,
    pub failed: u64,
    pub requeued: u64,
}

impl fmt::Display for StatsWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scraped={} unchanged={} changed={} failed={} requeued={}",
            self.scraped, self.unchanged, self.changed, self.failed, self.requeued
        )
    }
}

pub async fn run_stats_reporter(ctx: Arc<AppContext>) {
    let mut tick = tokio::time::interval(REPORT_INTERVAL);
    tick.tick().await; // immediate first tick carries nothing
    loop {
        tick.tick().await;
        let window = ctx.stats.drain();
        if window.scraped > 0 || window.requeued > 0 {
            info!(%window, "pipeline stats");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_resets_the_window() {
        let stats = ScrapeStats::default();
        stats.record_changed();
        stats.record_unchanged();
        stats.record_failed();
        stats.record_requeued();

        let window = stats.drain();
        assert_eq!(window.scraped, 3);
        assert_eq!(window.changed, 1);
        assert_eq!(window.unchanged, 1);
        assert_eq!(window.failed, 1);
        assert_eq!(window.requeued, 1);

        let empty = stats.drain();
        assert_eq!(empty.scraped, 0);
        assert_eq!(empty.requeued, 0);
    }

    #[test]
    fn window_renders_one_line() {
        let stats = ScrapeStats::default();
        stats.record_changed();
        let line = stats.drain().to_string();
        assert_eq!(line, "scraped=1 unchanged=0 changed=1 failed=0 requeued=0");
    }
}
