//! Shared handles, built once at start-up and passed to every component
//! constructor. No process-global state anywhere.

use std::sync::Arc;
use std::time::Duration;

use browser_pool::{BrowserPool, BrowserPoolConfig};
use watcher_common::Config;
use watcher_feed::FeedAssembler;
use watcher_store::Store;

use crate::assist::Assist;
use crate::extractor::Extractor;
use crate::ratelimit::RateLimiter;
use crate::stats::ScrapeStats;

pub struct AppContext {
    pub config: Config,
    pub store: Store,
    pub browsers: Arc<BrowserPool>,
    pub extractor: Extractor,
    pub assist: Assist,
    pub feeds: FeedAssembler,
    /// Alert spam guard: one event per target per window.
    pub alert_limiter: RateLimiter,
    /// Manual refresh guard: one refresh per target per window.
    pub refresh_limiter: RateLimiter,
    pub stats: ScrapeStats,
}

impl AppContext {
    pub fn new(config: Config, store: Store) -> Arc<Self> {
        let browsers = BrowserPool::new(BrowserPoolConfig {
            size: config.browser_pool_size,
            headless: true,
            page_load_timeout: config.page_load_timeout(),
            network_idle: config.network_idle(),
            max_page_bytes: config.max_page_bytes,
        });

        let extractor = Extractor::new(Arc::clone(&browsers), config.lease_timeout());
        let assist = Assist::new(&config);
        let feeds = FeedAssembler::new(store.clone());
        let alert_limiter = RateLimiter::new(Duration::from_secs(config.alert_window_secs));
        let refresh_limiter = RateLimiter::new(Duration::from_secs(config.refresh_window_secs));

        Arc::new(Self {
            config,
            store,
            browsers,
            extractor,
            assist,
            feeds,
            alert_limiter,
            refresh_limiter,
            stats: ScrapeStats::default(),
        })
    }
}
