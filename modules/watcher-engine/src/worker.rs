//! Workers: consume scrape tasks, drive the extractor, evaluate the change
//! detector, persist the outcome, and report back to the scheduler.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use watcher_common::{detect, AlertDraft, Detection, ExtractError, StateMap, Target};
use watcher_store::{InsertOutcome, NewChangeEvent};

use crate::context::AppContext;
use crate::scheduler::{Intent, ScrapeOutcome, ScrapeTask};
use crate::summary::SummaryJob;

/// Consume the task channel, running at most `parallelism` scrapes at once.
/// Each task reports its outcome to the scheduler when it finishes.
pub async fn run_workers(
    ctx: Arc<AppContext>,
    mut tasks: mpsc::Receiver<ScrapeTask>,
    intents: mpsc::Sender<Intent>,
    summaries: mpsc::Sender<SummaryJob>,
    parallelism: usize,
) {
    info!(parallelism, "worker pool running");
    let slots = Arc::new(Semaphore::new(parallelism.max(1)));

    while let Some(task) = tasks.recv().await {
        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
            break;
        };
        let ctx = Arc::clone(&ctx);
        let intents = intents.clone();
        let summaries = summaries.clone();

        tokio::spawn(async move {
            let target_id = task.target_id;
            let outcome = run_scrape(&ctx, &task, &summaries).await;
            drop(permit);
            if intents
                .send(Intent::Completed { target_id, outcome })
                .await
                .is_err()
            {
                warn!(%target_id, "scheduler gone, completion dropped");
            }
        });
    }
    info!("task channel closed, worker pool stopping");
}

async fn run_scrape(
    ctx: &AppContext,
    task: &ScrapeTask,
    summaries: &mpsc::Sender<SummaryJob>,
) -> ScrapeOutcome {
    let correlation_id = Uuid::new_v4();
    let target = match ctx.store.get_target(task.target_id).await {
        Ok(Some(target)) if target.active => target,
        Ok(_) => {
            // Deleted or paused between dispatch and execution.
            debug!(target_id = %task.target_id, "target gone or paused, skipping scrape");
            return ScrapeOutcome::Cancelled;
        }
        Err(e) => {
            error!(target_id = %task.target_id, %correlation_id, error = %e, "target load failed");
            return ScrapeOutcome::Requeue;
        }
    };

    let started_at = Utc::now();
    debug!(target_id = %target.id, manual = task.manual, %correlation_id, "scrape starting");

    let result = tokio::select! {
        biased;
        _ = task.cancel.cancelled() => Err(ExtractError::Cancelled),
        result = tokio::time::timeout(ctx.config.scrape_deadline(), ctx.extractor.extract(&target)) => {
            match result {
                Ok(inner) => inner,
                Err(_) => Err(ExtractError::DeadlineExceeded),
            }
        }
    };
    let finished_at = Utc::now();

    match result {
        Ok(state) => {
            match apply_success(ctx, &target, state, started_at, finished_at, summaries).await {
                Ok(()) => ScrapeOutcome::Success,
                Err(e) => {
                    error!(target_id = %target.id, %correlation_id, error = %e, "persisting scrape result failed");
                    ScrapeOutcome::Requeue
                }
            }
        }
        Err(e) if e.requeue() => {
            debug!(target_id = %target.id, "pool exhausted, task re-queued");
            ctx.stats.record_requeued();
            ScrapeOutcome::Requeue
        }
        Err(e) if !e.counts_against_target() => {
            // User-initiated cancellation: no error bump, no bookkeeping.
            debug!(target_id = %target.id, error = %e, "scrape abandoned without fault");
            ScrapeOutcome::Cancelled
        }
        Err(e) => {
            warn!(target_id = %target.id, %correlation_id, error = %e, "scrape failed");
            ctx.stats.record_failed();
            match ctx
                .store
                .record_scrape_failure(target.id, &e.to_string(), started_at, finished_at)
                .await
            {
                Ok(consecutive_errors) => {
                    if consecutive_errors == ctx.config.degraded_threshold {
                        warn!(target_id = %target.id, consecutive_errors, "target degraded");
                    }
                    ScrapeOutcome::Failure { consecutive_errors }
                }
                Err(store_err) => {
                    error!(target_id = %target.id, %correlation_id, error = %store_err, "failure bookkeeping failed");
                    ScrapeOutcome::Failure {
                        consecutive_errors: target.consecutive_errors + 1,
                    }
                }
            }
        }
    }
}

/// Persist the new baseline, run detection, and emit the event when the
/// policy and the spam guard both agree.
async fn apply_success(
    ctx: &AppContext,
    target: &Target,
    state: StateMap,
    started_at: chrono::DateTime<Utc>,
    finished_at: chrono::DateTime<Utc>,
    summaries: &mpsc::Sender<SummaryJob>,
) -> Result<(), watcher_common::WatcherError> {
    let detection = detect(target, &state);
    let prior = target.current_state.clone().unwrap_or_default();

    ctx.store
        .record_scrape_success(target.id, &state, started_at, finished_at)
        .await?;

    match detection {
        Detection::Baseline => {
            debug!(target_id = %target.id, keys = state.len(), "baseline established");
            ctx.stats.record_unchanged();
        }
        Detection::Unchanged => {
            ctx.stats.record_unchanged();
        }
        Detection::Silent { update_last_alert } => {
            if update_last_alert {
                ctx.store.set_last_alert_state(target.id, &state).await?;
            }
            ctx.stats.record_unchanged();
        }
        Detection::Alert(draft) => {
            emit_alert(ctx, target, draft, prior, state, started_at, summaries).await?;
            ctx.stats.record_changed();
        }
    }

    Ok(())
}

async fn emit_alert(
    ctx: &AppContext,
    target: &Target,
    draft: AlertDraft,
    prior: StateMap,
    current: StateMap,
    started_at: chrono::DateTime<Utc>,
    summaries: &mpsc::Sender<SummaryJob>,
) -> Result<(), watcher_common::WatcherError> {
    if draft.needs_judgment {
        let relevant = ctx
            .assist
            .judge_alert(target.owner_id, &prior, &current, &target.description)
            .await;
        if !relevant {
            debug!(target_id = %target.id, "diff judged irrelevant to intent");
            return Ok(());
        }
    }

    if draft.update_last_alert {
        ctx.store.set_last_alert_state(target.id, &current).await?;
    }

    // Spam guard: the baseline has already advanced, so a suppressed alert
    // costs nothing but the event row.
    if !ctx.alert_limiter.allow(target.id) {
        debug!(target_id = %target.id, "alert suppressed by spam guard");
        return Ok(());
    }

    let event = NewChangeEvent {
        target_id: target.id,
        ts: started_at,
        title: target.name.clone(),
        description: draft.description,
        permalink: target.url.clone(),
        prior_state: prior.clone(),
        current_state: current.clone(),
        fingerprint: draft.fingerprint,
    };

    match ctx
        .store
        .insert_event(&event, ctx.config.alert_window_secs as i64)
        .await?
    {
        InsertOutcome::Inserted(event_id) => {
            info!(target_id = %target.id, %event_id, "change event recorded");
            ctx.feeds.cache().bump(target.id);

            if target.summary_enabled {
                let job = SummaryJob {
                    event_id,
                    target_id: target.id,
                    owner_id: target.owner_id,
                    prior,
                    current,
                    description: target.description.clone(),
                };
                // The summary lane is best-effort; a full queue drops the job.
                if summaries.try_send(job).is_err() {
                    warn!(target_id = %target.id, %event_id, "summary queue full, event stays unsummarized");
                }
            }
        }
        InsertOutcome::Duplicate => {
            debug!(target_id = %target.id, "duplicate event suppressed");
        }
    }

    Ok(())
}
