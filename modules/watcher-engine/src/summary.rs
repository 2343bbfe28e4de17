//! Lower-priority summary lane. Summaries are generated after the event is
//! durable and can never starve the extraction path; failures leave the
//! event without a summary, nothing more.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use watcher_common::StateMap;

use crate::context::AppContext;

#[derive(Debug)]
pub struct SummaryJob {
    pub event_id: Uuid,
    pub target_id: Uuid,
    pub owner_id: Uuid,
    pub prior: StateMap,
    pub current: StateMap,
    pub description: String,
}

pub async fn run_summary_worker(ctx: Arc<AppContext>, mut jobs: mpsc::Receiver<SummaryJob>) {
    info!("summary worker running");
    while let Some(job) = jobs.recv().await {
        let summary = ctx
            .assist
            .summarize_change(job.owner_id, &job.prior, &job.current, &job.description)
            .await;

        let Some(summary) = summary else {
            continue;
        };

        match ctx.store.set_event_summary(job.event_id, &summary).await {
            Ok(()) => {
                debug!(event_id = %job.event_id, "summary attached");
                // The feed shows the summary once re-rendered.
                ctx.feeds.cache().bump(job.target_id);
            }
            Err(e) => {
                warn!(event_id = %job.event_id, error = %e, "failed to attach summary");
            }
        }
    }
    info!("summary channel closed, summary worker stopping");
}
