//! Engine wiring: rebuild the scheduler from persisted state, start the
//! scheduler, worker pool, summary lane, and janitor, and hand the control
//! plane an intent sender.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use watcher_common::Target;

use crate::context::AppContext;
use crate::janitor::run_janitor;
use crate::scheduler::{
    jittered_first_due, rebuild_due, Intent, Scheduler, SchedulerState,
};
use crate::stats::run_stats_reporter;
use crate::summary::run_summary_worker;
use crate::worker::run_workers;

const INTENT_QUEUE: usize = 256;
const TASK_QUEUE: usize = 64;
const SUMMARY_QUEUE: usize = 256;

pub struct Engine;

/// The control plane's grip on the running pipeline.
#[derive(Clone)]
pub struct EngineHandle {
    intents: mpsc::Sender<Intent>,
}

impl EngineHandle {
    /// Begin (or re-begin) scheduling a target, jittered so batch creations
    /// spread out.
    pub async fn track_target(&self, target: &Target) -> Result<()> {
        self.intents
            .send(Intent::Track {
                target_id: target.id,
                interval: target.interval,
                consecutive_errors: target.consecutive_errors,
                first_due: jittered_first_due(Utc::now()),
            })
            .await?;
        Ok(())
    }

    /// Stop scheduling and cancel any in-flight scrape.
    pub async fn forget_target(&self, target_id: Uuid) -> Result<()> {
        self.intents.send(Intent::Forget { target_id }).await?;
        Ok(())
    }

    /// Manual refresh; single-flight still applies.
    pub async fn refresh_target(&self, target_id: Uuid) -> Result<()> {
        self.intents.send(Intent::Refresh { target_id }).await?;
        Ok(())
    }
}

impl Engine {
    /// Rebuild scheduling state from the store and spawn all pipeline tasks.
    /// The in-memory heap loses nothing an unclean restart cannot recompute
    /// from `last_scrape_end + interval`.
    pub async fn start(ctx: Arc<AppContext>) -> Result<EngineHandle> {
        let (intents_tx, intents_rx) = mpsc::channel(INTENT_QUEUE);
        let (tasks_tx, tasks_rx) = mpsc::channel(TASK_QUEUE);
        let (summary_tx, summary_rx) = mpsc::channel(SUMMARY_QUEUE);

        let mut state = SchedulerState::new(
            ctx.config.degraded_threshold,
            ctx.config.backoff_cap,
        );
        let now = Utc::now();
        let targets = ctx.store.list_active_targets().await?;
        for target in &targets {
            state.track(
                target.id,
                target.interval,
                target.consecutive_errors,
                rebuild_due(target.last_scrape_end, target.interval, now),
            );
        }
        info!(targets = targets.len(), "scheduler state rebuilt from store");

        let scheduler = Scheduler::new(
            state,
            intents_rx,
            tasks_tx,
            Duration::from_millis(ctx.config.scheduler_tick_ms),
        );
        tokio::spawn(scheduler.run());

        tokio::spawn(run_workers(
            Arc::clone(&ctx),
            tasks_rx,
            intents_tx.clone(),
            summary_tx,
            ctx.config.worker_parallelism,
        ));

        tokio::spawn(run_summary_worker(Arc::clone(&ctx), summary_rx));
        tokio::spawn(run_janitor(Arc::clone(&ctx)));
        tokio::spawn(run_stats_reporter(Arc::clone(&ctx)));

        Ok(EngineHandle {
            intents: intents_tx,
        })
    }
}
