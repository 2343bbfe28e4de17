//! Retention janitor: trims events past the configured horizon.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::context::AppContext;

const SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 3600);

pub async fn run_janitor(ctx: Arc<AppContext>) {
    let retention_days = ctx.config.retention_days;
    if retention_days == 0 {
        info!("retention disabled, janitor idle");
        return;
    }

    info!(retention_days, "janitor running");
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tick.tick().await;
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        match ctx.store.trim_events_before(cutoff).await {
            Ok(0) => {}
            Ok(trimmed) => info!(trimmed, %cutoff, "old events trimmed"),
            Err(e) => warn!(error = %e, "retention sweep failed"),
        }
    }
}
