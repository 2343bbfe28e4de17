//! Bounded pool of isolated headless Chromium instances.
//!
//! Each slot is a separate browser process with its own scratch profile, so
//! targets never share a cookie jar. Leases are served in FIFO order via a
//! fair semaphore; a faulted instance is destroyed on release and replaced
//! lazily on the next lease. The pool holds no durable state and can be
//! dropped and rebuilt at any moment.

pub mod error;

pub use error::{PoolError, Result};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::page::Page;
use futures::StreamExt;
use tempfile::TempDir;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct BrowserPoolConfig {
    /// Number of browser instances (and concurrent leases).
    pub size: usize,
    pub headless: bool,
    /// Navigation timeout for a single page load.
    pub page_load_timeout: Duration,
    /// Settle window after DOM-ready before the page is handed out.
    pub network_idle: Duration,
    /// Documents larger than this have trailing body children removed
    /// before any selector runs.
    pub max_page_bytes: usize,
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            size: 10,
            headless: true,
            page_load_timeout: Duration::from_secs(30),
            network_idle: Duration::from_millis(500),
            max_page_bytes: 10 * 1024 * 1024,
        }
    }
}

// =============================================================================
// Pooled instance
// =============================================================================

struct PooledBrowser {
    id: u64,
    browser: Browser,
    handler: JoinHandle<()>,
    /// Scratch profile; removed from disk when the instance is destroyed.
    _profile: TempDir,
}

impl PooledBrowser {
    async fn healthy(&self) -> bool {
        self.browser.version().await.is_ok()
    }

    async fn destroy(mut self) {
        debug!(browser = self.id, "destroying browser instance");
        if let Err(e) = self.browser.close().await {
            warn!(browser = self.id, error = %e, "browser did not close cleanly");
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
    }
}

// =============================================================================
// Pool
// =============================================================================

pub struct BrowserPool {
    config: BrowserPoolConfig,
    /// Fair semaphore: waiters are served in arrival order, which gives the
    /// FIFO lease guarantee.
    permits: Arc<Semaphore>,
    /// Idle instances. May hold fewer entries than outstanding permits
    /// allow; the shortfall is launched lazily on lease.
    idle: Mutex<VecDeque<PooledBrowser>>,
    next_id: AtomicU64,
}

impl BrowserPool {
    pub fn new(config: BrowserPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(config.size)),
            idle: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(0),
            config,
        })
    }

    pub fn size(&self) -> usize {
        self.config.size
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Lease a browser instance, waiting at most `deadline`.
    pub async fn lease(self: &Arc<Self>, deadline: Duration) -> Result<BrowserLease> {
        let permit = tokio::time::timeout(deadline, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| PoolError::Exhausted)?
            .map_err(|_| PoolError::Exhausted)?;

        // Reuse an idle instance when it still responds; otherwise replace it.
        let inner = loop {
            let candidate = self.idle.lock().await.pop_front();
            match candidate {
                Some(browser) => {
                    if browser.healthy().await {
                        break browser;
                    }
                    warn!(browser = browser.id, "idle browser failed health check");
                    browser.destroy().await;
                }
                None => break self.launch().await?,
            }
        };

        debug!(browser = inner.id, "leased browser instance");
        Ok(BrowserLease {
            inner: Some(inner),
            pool: Arc::clone(self),
            faulted: false,
            _permit: permit,
        })
    }

    /// Close every idle instance. In-flight leases finish on their own.
    pub async fn shutdown(&self) {
        let mut idle = self.idle.lock().await;
        info!(count = idle.len(), "shutting down browser pool");
        while let Some(browser) = idle.pop_front() {
            browser.destroy().await;
        }
    }

    async fn launch(&self) -> Result<PooledBrowser> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let profile = TempDir::with_prefix("watcher_browser_")
            .context("failed to create browser profile dir")?;

        let mut builder = BrowserConfigBuilder::default()
            .request_timeout(self.config.page_load_timeout)
            .window_size(1280, 1024)
            .user_data_dir(profile.path())
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg("--disable-breakpad")
            .arg("--disable-hang-monitor")
            .arg("--disable-notifications")
            .arg("--disable-popup-blocking")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--metrics-recording-only")
            .arg("--mute-audio")
            .arg("--hide-scrollbars")
            // Keep renderers away from the local filesystem. The scheme
            // guard upstream already rejects file:// URLs outright.
            .arg("--disable-file-system");

        if self.config.headless {
            builder = builder.headless_mode(HeadlessMode::default());
        } else {
            builder = builder.with_head();
        }

        let browser_config = builder
            .build()
            .map_err(PoolError::Launch)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| PoolError::Launch(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "browser handler event error");
                }
            }
        });

        info!(browser = id, "launched browser instance");
        Ok(PooledBrowser {
            id,
            browser,
            handler: handler_task,
            _profile: profile,
        })
    }

    fn give_back(self: Arc<Self>, browser: PooledBrowser, faulted: bool) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return; // runtime gone, the process is shutting down
        };
        handle.spawn(async move {
            if faulted {
                // Destroyed now; the replacement is launched lazily by the
                // next lease.
                browser.destroy().await;
            } else {
                self.idle.lock().await.push_back(browser);
            }
        });
    }
}

// =============================================================================
// Lease
// =============================================================================

/// Exclusive hold on one browser instance. Returned to the pool on drop;
/// a lease marked faulted has its instance destroyed instead.
pub struct BrowserLease {
    inner: Option<PooledBrowser>,
    pool: Arc<BrowserPool>,
    faulted: bool,
    _permit: OwnedSemaphorePermit,
}

impl BrowserLease {
    pub fn id(&self) -> u64 {
        self.inner.as_ref().map(|b| b.id).unwrap_or(0)
    }

    /// Flag the instance as unusable (crashed renderer, stuck page). It will
    /// be destroyed on release.
    pub fn mark_faulted(&mut self) {
        self.faulted = true;
    }

    /// Navigate to a URL and hand back the settled page. A context drives at
    /// most one page at a time; the returned handle owns it.
    pub async fn load_page(&mut self, url: &str) -> Result<PageHandle> {
        let config = self.pool.config.clone();
        let browser = &self
            .inner
            .as_ref()
            .ok_or_else(|| PoolError::Navigation("lease already released".to_string()))?
            .browser;

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| PoolError::Navigation(e.to_string()))?;

        // Dropping the handle (on any early return below) closes the page in
        // the background.
        let handle = PageHandle { page };

        let navigation = async {
            handle
                .page
                .goto(url)
                .await
                .map_err(|e| PoolError::Navigation(e.to_string()))?;
            handle
                .page
                .wait_for_navigation()
                .await
                .map_err(|e| PoolError::Navigation(e.to_string()))?;
            Ok::<(), PoolError>(())
        };

        match tokio::time::timeout(config.page_load_timeout, navigation).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                // A page stuck mid-navigation can wedge the whole context.
                self.mark_faulted();
                return Err(PoolError::LoadTimeout(config.page_load_timeout));
            }
        }

        // Short settle window for late XHR-driven DOM updates.
        tokio::time::sleep(config.network_idle).await;

        handle.enforce_size_cap(config.max_page_bytes, url).await?;
        Ok(handle)
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        if let Some(browser) = self.inner.take() {
            Arc::clone(&self.pool).give_back(browser, self.faulted);
        }
    }
}

// =============================================================================
// Page handle
// =============================================================================

/// A loaded, settled page. Selector evaluation happens through JS snippets
/// supplied by the caller; the handle stays domain-agnostic. Dropping the
/// handle closes the page, including when a scrape future is cancelled
/// mid-extraction.
pub struct PageHandle {
    page: Page,
}

impl PageHandle {
    /// Evaluate a JS expression and deserialize its result as an optional
    /// string. A JS `null`/`undefined` comes back as `None`.
    pub async fn eval_string(&self, js: &str) -> Result<Option<String>> {
        let result = self
            .page
            .evaluate(js)
            .await
            .map_err(|e| PoolError::Navigation(format!("script evaluation failed: {e}")))?;
        Ok(result.into_value::<Option<String>>().unwrap_or(None))
    }

    /// Full serialized document, mostly useful for debugging.
    pub async fn content(&self) -> Result<String> {
        self.page
            .content()
            .await
            .map_err(|e| PoolError::Navigation(e.to_string()))
    }

    /// Drop trailing body children until the serialized document fits the
    /// byte budget. Keeps the DOM intact for selectors, unlike a raw
    /// string truncation.
    async fn enforce_size_cap(&self, max_bytes: usize, url: &str) -> Result<()> {
        let js = format!(
            r#"(() => {{
                const max = {max_bytes};
                const size = () => document.documentElement ? document.documentElement.outerHTML.length : 0;
                const total = size();
                let n = total;
                while (n > max && document.body && document.body.lastElementChild) {{
                    document.body.lastElementChild.remove();
                    n = size();
                }}
                return String(total);
            }})()"#
        );
        if let Some(total) = self.eval_string(&js).await? {
            if let Ok(total) = total.parse::<usize>() {
                if total > max_bytes {
                    warn!(url, total, max_bytes, "page exceeded size cap, body truncated");
                }
            }
        }
        Ok(())
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        let page = self.page.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = page.close().await;
            });
        }
    }
}
