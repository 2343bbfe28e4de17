use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Postgres
    pub database_url: String,

    // AI endpoint
    pub anthropic_api_key: String,
    /// Override for the Messages API base URL (tests, proxies).
    pub anthropic_base_url: Option<String>,
    pub ai_model: String,

    // Web server
    pub web_host: String,
    pub web_port: u16,

    // Pipeline sizing
    pub worker_parallelism: usize,
    pub browser_pool_size: usize,

    // Timeouts (seconds unless noted)
    pub lease_timeout_secs: u64,
    pub page_load_timeout_secs: u64,
    pub network_idle_ms: u64,
    pub scrape_deadline_secs: u64,
    pub synthesize_timeout_secs: u64,
    pub summarize_timeout_secs: u64,

    // Rate limit windows
    pub refresh_window_secs: u64,
    pub alert_window_secs: u64,

    // Health and backoff
    pub degraded_threshold: u32,
    pub backoff_cap: u32,

    // Page and retention limits
    pub max_page_bytes: usize,
    /// Events older than this are trimmed by the janitor. 0 keeps forever.
    pub retention_days: u32,

    pub scheduler_tick_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_env("DATABASE_URL"),
            anthropic_api_key: required_env("ANTHROPIC_API_KEY"),
            anthropic_base_url: env::var("ANTHROPIC_BASE_URL").ok(),
            ai_model: env::var("AI_MODEL")
                .unwrap_or_else(|_| "claude-haiku-4-5-20251001".to_string()),
            web_host: env::var("WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            web_port: parsed_env("WEB_PORT", 3000),
            worker_parallelism: parsed_env("WORKER_PARALLELISM", 4),
            browser_pool_size: parsed_env("BROWSER_POOL_SIZE", 10),
            lease_timeout_secs: parsed_env("LEASE_TIMEOUT_SECS", 10),
            page_load_timeout_secs: parsed_env("PAGE_LOAD_TIMEOUT_SECS", 30),
            network_idle_ms: parsed_env("NETWORK_IDLE_MS", 500),
            scrape_deadline_secs: parsed_env("SCRAPE_DEADLINE_SECS", 45),
            synthesize_timeout_secs: parsed_env("SYNTHESIZE_TIMEOUT_SECS", 20),
            summarize_timeout_secs: parsed_env("SUMMARIZE_TIMEOUT_SECS", 15),
            refresh_window_secs: parsed_env("REFRESH_WINDOW_SECS", 300),
            alert_window_secs: parsed_env("ALERT_WINDOW_SECS", 60),
            degraded_threshold: parsed_env("DEGRADED_THRESHOLD", 5),
            backoff_cap: parsed_env("BACKOFF_CAP", 32),
            max_page_bytes: parsed_env("MAX_PAGE_BYTES", 10 * 1024 * 1024),
            retention_days: parsed_env("RETENTION_DAYS", 90),
            scheduler_tick_ms: parsed_env("SCHEDULER_TICK_MS", 1000),
        }
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_secs(self.page_load_timeout_secs)
    }

    pub fn network_idle(&self) -> Duration {
        Duration::from_millis(self.network_idle_ms)
    }

    pub fn scrape_deadline(&self) -> Duration {
        Duration::from_secs(self.scrape_deadline_secs)
    }

    /// Log sensitive variables by length only.
    pub fn log_redacted(&self) {
        let vars = [
            ("DATABASE_URL", &self.database_url),
            ("ANTHROPIC_API_KEY", &self.anthropic_api_key),
        ];
        for (name, value) in vars {
            if value.is_empty() {
                tracing::info!("{name} = (empty)");
            } else {
                tracing::info!("{name} = ({} chars)", value.len());
            }
        }
        tracing::info!(
            workers = self.worker_parallelism,
            pool = self.browser_pool_size,
            tick_ms = self.scheduler_tick_ms,
            "pipeline sizing"
        );
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn parsed_env<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
