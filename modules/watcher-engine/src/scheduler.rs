//! Scheduling: decide when each active target is scraped next, dispatch at
//! the right moment, and hold the single-flight invariant.
//!
//! One task owns the due heap. Everything else (workers, control plane)
//! posts intents over a channel; nothing shares the heap. Heap entries are
//! invalidated lazily through per-target generation counters and dropped on
//! pop.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use watcher_common::Interval;

// =============================================================================
// Wire types
// =============================================================================

/// A unit of work handed to the worker pool.
#[derive(Debug, Clone)]
pub struct ScrapeTask {
    pub target_id: Uuid,
    pub manual: bool,
    pub cancel: CancellationToken,
}

/// How a scrape ended, as the scheduler needs to see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeOutcome {
    Success,
    /// Counted failure; carries the updated consecutive error count so the
    /// backoff needs no database read.
    Failure { consecutive_errors: u32 },
    /// Capacity problem (pool exhausted): retry on the next cycle without
    /// touching the error counter.
    Requeue,
    /// User-initiated cancellation; rescheduling is governed by whatever
    /// triggered it (pause drops the target, deletion forgets it).
    Cancelled,
}

/// Intents posted to the scheduler task.
#[derive(Debug)]
pub enum Intent {
    /// Start (or restart) scheduling a target. Used at creation, resume,
    /// and interval change.
    Track {
        target_id: Uuid,
        interval: Interval,
        consecutive_errors: u32,
        first_due: DateTime<Utc>,
    },
    /// Stop scheduling and cancel any in-flight scrape (pause, delete).
    Forget { target_id: Uuid },
    /// Manual refresh: dispatch immediately, bypassing the heap but not the
    /// single-flight check.
    Refresh { target_id: Uuid },
    /// Worker completion report.
    Completed {
        target_id: Uuid,
        outcome: ScrapeOutcome,
    },
}

// =============================================================================
// Pure scheduling state
// =============================================================================

#[derive(Debug)]
struct DueEntry {
    due_at: DateTime<Utc>,
    target_id: Uuid,
    generation: u64,
}

impl PartialEq for DueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due_at == other.due_at && self.target_id == other.target_id
    }
}
impl Eq for DueEntry {}

impl Ord for DueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest due first.
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.target_id.cmp(&self.target_id))
    }
}
impl PartialOrd for DueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct TrackedTarget {
    interval: Interval,
    consecutive_errors: u32,
    generation: u64,
}

/// What `refresh` decided, so the task loop knows whether to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshDecision {
    Dispatch,
    AlreadyRunning,
    Unknown,
}

/// Heap + bookkeeping, free of channels and clocks so it unit-tests cleanly.
pub struct SchedulerState {
    heap: BinaryHeap<DueEntry>,
    targets: HashMap<Uuid, TrackedTarget>,
    in_flight: HashSet<Uuid>,
    degraded_threshold: u32,
    backoff_cap: u32,
}

impl SchedulerState {
    pub fn new(degraded_threshold: u32, backoff_cap: u32) -> Self {
        Self {
            heap: BinaryHeap::new(),
            targets: HashMap::new(),
            in_flight: HashSet::new(),
            degraded_threshold: degraded_threshold.max(1),
            backoff_cap: backoff_cap.max(1),
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.targets.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn track(
        &mut self,
        target_id: Uuid,
        interval: Interval,
        consecutive_errors: u32,
        first_due: DateTime<Utc>,
    ) {
        let generation = self
            .targets
            .get(&target_id)
            .map(|t| t.generation + 1)
            .unwrap_or(0);
        self.targets.insert(
            target_id,
            TrackedTarget {
                interval,
                consecutive_errors,
                generation,
            },
        );
        self.heap.push(DueEntry {
            due_at: first_due,
            target_id,
            generation,
        });
    }

    /// Returns true when a scrape is currently in flight (the caller should
    /// cancel its token).
    pub fn forget(&mut self, target_id: Uuid) -> bool {
        self.targets.remove(&target_id);
        // Heap entries for this target die lazily on pop.
        self.in_flight.contains(&target_id)
    }

    /// Pop every entry due by `now` and mark the dispatchable ones in
    /// flight. A target already executing is skipped and rescheduled a full
    /// interval out.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut dispatch = Vec::new();

        while let Some(peeked) = self.heap.peek() {
            if peeked.due_at > now {
                break;
            }
            let Some(entry) = self.heap.pop() else {
                break;
            };

            let Some(target) = self.targets.get(&entry.target_id) else {
                continue; // forgotten target, stale entry
            };
            if target.generation != entry.generation {
                continue; // superseded by a newer Track
            }

            if self.in_flight.contains(&entry.target_id) {
                // Manual refresh raced the tick. Skip dispatch, keep cadence.
                let due_at = now + target.interval.duration();
                let generation = target.generation;
                self.heap.push(DueEntry {
                    due_at,
                    target_id: entry.target_id,
                    generation,
                });
                continue;
            }

            self.in_flight.insert(entry.target_id);
            dispatch.push(entry.target_id);
        }

        dispatch
    }

    pub fn refresh(&mut self, target_id: Uuid) -> RefreshDecision {
        if !self.targets.contains_key(&target_id) {
            return RefreshDecision::Unknown;
        }
        if self.in_flight.contains(&target_id) {
            return RefreshDecision::AlreadyRunning;
        }
        self.in_flight.insert(target_id);
        RefreshDecision::Dispatch
    }

    /// Apply a completion and reinsert the target. Returns the next due
    /// time, or None when the target is no longer tracked.
    pub fn complete(
        &mut self,
        target_id: Uuid,
        outcome: ScrapeOutcome,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.in_flight.remove(&target_id);

        let degraded_threshold = self.degraded_threshold;
        let backoff_cap = self.backoff_cap;
        let target = self.targets.get_mut(&target_id)?;

        let next_due = match outcome {
            ScrapeOutcome::Success => {
                target.consecutive_errors = 0;
                now + target.interval.duration()
            }
            ScrapeOutcome::Failure { consecutive_errors } => {
                target.consecutive_errors = consecutive_errors;
                let multiplier = backoff_multiplier(
                    consecutive_errors,
                    degraded_threshold,
                    backoff_cap,
                );
                now + target.interval.duration() * multiplier as i32
            }
            // Pool pressure: back on the next cycle.
            ScrapeOutcome::Requeue => now,
            // Cancelled by the user; keep the plain cadence.
            ScrapeOutcome::Cancelled => now + target.interval.duration(),
        };

        let generation = target.generation;
        self.heap.push(DueEntry {
            due_at: next_due,
            target_id,
            generation,
        });
        Some(next_due)
    }
}

/// Bounded exponential backoff once a target is degraded: 2x at the
/// threshold, doubling per further failure, capped.
pub fn backoff_multiplier(consecutive_errors: u32, threshold: u32, cap: u32) -> u32 {
    if consecutive_errors < threshold {
        return 1;
    }
    let exponent = (consecutive_errors - threshold + 1).min(31);
    (1u32 << exponent).min(cap)
}

/// First due time for a fresh target: spread a batch of creations so they
/// don't thunder-herd the pool.
pub fn jittered_first_due(now: DateTime<Utc>) -> DateTime<Utc> {
    let jitter_secs = rand::rng().random_range(1..30);
    now + chrono::Duration::seconds(jitter_secs)
}

/// Start-up due time rebuilt from persisted scrape bookkeeping.
pub fn rebuild_due(
    last_scrape_end: Option<DateTime<Utc>>,
    interval: Interval,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    match last_scrape_end {
        Some(end) => (end + interval.duration()).max(now),
        None => jittered_first_due(now),
    }
}

// =============================================================================
// Scheduler task
// =============================================================================

pub struct Scheduler {
    state: SchedulerState,
    intents: mpsc::Receiver<Intent>,
    tasks: mpsc::Sender<ScrapeTask>,
    cancels: HashMap<Uuid, CancellationToken>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(
        state: SchedulerState,
        intents: mpsc::Receiver<Intent>,
        tasks: mpsc::Sender<ScrapeTask>,
        tick: Duration,
    ) -> Self {
        Self {
            state,
            intents,
            tasks,
            cancels: HashMap::new(),
            tick,
        }
    }

    pub async fn run(mut self) {
        info!(
            tracked = self.state.tracked_count(),
            tick_ms = self.tick.as_millis() as u64,
            "scheduler running"
        );
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let due = self.state.pop_due(Utc::now());
                    for target_id in due {
                        self.dispatch(target_id, false).await;
                    }
                }
                intent = self.intents.recv() => {
                    match intent {
                        Some(intent) => self.apply(intent).await,
                        None => {
                            info!("intent channel closed, scheduler stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn apply(&mut self, intent: Intent) {
        match intent {
            Intent::Track {
                target_id,
                interval,
                consecutive_errors,
                first_due,
            } => {
                debug!(%target_id, interval = interval.as_str(), %first_due, "tracking target");
                self.state
                    .track(target_id, interval, consecutive_errors, first_due);
            }
            Intent::Forget { target_id } => {
                let in_flight = self.state.forget(target_id);
                if in_flight {
                    if let Some(token) = self.cancels.get(&target_id) {
                        token.cancel();
                    }
                }
                debug!(%target_id, in_flight, "forgot target");
            }
            Intent::Refresh { target_id } => match self.state.refresh(target_id) {
                RefreshDecision::Dispatch => self.dispatch(target_id, true).await,
                RefreshDecision::AlreadyRunning => {
                    debug!(%target_id, "refresh skipped, scrape already in flight");
                }
                RefreshDecision::Unknown => {
                    warn!(%target_id, "refresh for untracked target ignored");
                }
            },
            Intent::Completed { target_id, outcome } => {
                self.cancels.remove(&target_id);
                let next = self.state.complete(target_id, outcome, Utc::now());
                debug!(%target_id, ?outcome, next_due = ?next, "scrape completed");
            }
        }
    }

    async fn dispatch(&mut self, target_id: Uuid, manual: bool) {
        let cancel = CancellationToken::new();
        self.cancels.insert(target_id, cancel.clone());

        let task = ScrapeTask {
            target_id,
            manual,
            cancel,
        };
        // Blocking send is the backpressure: a full worker queue pauses the
        // whole dispatch loop.
        if self.tasks.send(task).await.is_err() {
            warn!(%target_id, "worker channel closed, dropping dispatch");
            self.cancels.remove(&target_id);
            let _ = self
                .state
                .complete(target_id, ScrapeOutcome::Requeue, Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn due_targets_dispatch_once_and_hold_single_flight() {
        let mut state = SchedulerState::new(5, 32);
        let id = Uuid::new_v4();
        let t0 = now();

        state.track(id, Interval::Min15, 0, t0);

        let first = state.pop_due(t0);
        assert_eq!(first, vec![id]);
        assert_eq!(state.in_flight_count(), 1);

        // Still in flight: a raced entry must not double-dispatch.
        state.track(id, Interval::Min15, 0, t0);
        let second = state.pop_due(t0);
        assert!(second.is_empty(), "in-flight target is never re-dispatched");
    }

    #[test]
    fn not_yet_due_targets_stay_queued() {
        let mut state = SchedulerState::new(5, 32);
        let id = Uuid::new_v4();
        let t0 = now();

        state.track(id, Interval::Min15, 0, t0 + ChronoDuration::minutes(10));
        assert!(state.pop_due(t0).is_empty());
        assert!(!state.pop_due(t0 + ChronoDuration::minutes(9)).contains(&id));
        assert_eq!(
            state.pop_due(t0 + ChronoDuration::minutes(10)),
            vec![id]
        );
    }

    #[test]
    fn earliest_due_pops_first() {
        let mut state = SchedulerState::new(5, 32);
        let early = Uuid::new_v4();
        let late = Uuid::new_v4();
        let t0 = now();

        state.track(late, Interval::Min15, 0, t0 + ChronoDuration::seconds(30));
        state.track(early, Interval::Min15, 0, t0);

        assert_eq!(state.pop_due(t0), vec![early]);
    }

    #[test]
    fn forget_drops_pending_entries_lazily() {
        let mut state = SchedulerState::new(5, 32);
        let id = Uuid::new_v4();
        let t0 = now();

        state.track(id, Interval::Min15, 0, t0);
        let was_in_flight = state.forget(id);
        assert!(!was_in_flight);
        assert!(state.pop_due(t0).is_empty(), "stale entry dies on pop");
    }

    #[test]
    fn forget_reports_in_flight_for_cancellation() {
        let mut state = SchedulerState::new(5, 32);
        let id = Uuid::new_v4();
        let t0 = now();

        state.track(id, Interval::Min15, 0, t0);
        assert_eq!(state.pop_due(t0), vec![id]);
        assert!(state.forget(id), "caller must cancel the in-flight token");
    }

    #[test]
    fn stale_generation_entries_are_ignored() {
        let mut state = SchedulerState::new(5, 32);
        let id = Uuid::new_v4();
        let t0 = now();

        state.track(id, Interval::Min15, 0, t0 + ChronoDuration::minutes(5));
        // Interval change supersedes the pending entry.
        state.track(id, Interval::Hourly, 0, t0 + ChronoDuration::minutes(20));

        assert!(state.pop_due(t0 + ChronoDuration::minutes(5)).is_empty());
        assert_eq!(
            state.pop_due(t0 + ChronoDuration::minutes(20)),
            vec![id]
        );
    }

    #[test]
    fn success_reschedules_a_plain_interval_out() {
        let mut state = SchedulerState::new(5, 32);
        let id = Uuid::new_v4();
        let t0 = now();

        state.track(id, Interval::Min15, 4, t0);
        state.pop_due(t0);

        let next = state.complete(id, ScrapeOutcome::Success, t0).unwrap();
        assert_eq!(next, t0 + ChronoDuration::minutes(15), "success resets backoff");
        assert_eq!(state.in_flight_count(), 0);
    }

    #[test]
    fn degraded_backoff_schedule() {
        // 5 failures: 2x. 8 failures: 16x. Capped at 32x.
        assert_eq!(backoff_multiplier(0, 5, 32), 1);
        assert_eq!(backoff_multiplier(4, 5, 32), 1);
        assert_eq!(backoff_multiplier(5, 5, 32), 2);
        assert_eq!(backoff_multiplier(6, 5, 32), 4);
        assert_eq!(backoff_multiplier(8, 5, 32), 16);
        assert_eq!(backoff_multiplier(9, 5, 32), 32);
        assert_eq!(backoff_multiplier(40, 5, 32), 32, "cap holds far out");
    }

    #[test]
    fn failure_below_threshold_keeps_plain_cadence() {
        let mut state = SchedulerState::new(5, 32);
        let id = Uuid::new_v4();
        let t0 = now();

        state.track(id, Interval::Min15, 0, t0);
        state.pop_due(t0);

        let next = state
            .complete(
                id,
                ScrapeOutcome::Failure {
                    consecutive_errors: 3,
                },
                t0,
            )
            .unwrap();
        assert_eq!(next, t0 + ChronoDuration::minutes(15));
    }

    #[test]
    fn degraded_failure_scales_the_interval() {
        let mut state = SchedulerState::new(5, 32);
        let id = Uuid::new_v4();
        let t0 = now();

        state.track(id, Interval::Min15, 0, t0);
        state.pop_due(t0);
        let next = state
            .complete(
                id,
                ScrapeOutcome::Failure {
                    consecutive_errors: 5,
                },
                t0,
            )
            .unwrap();
        assert_eq!(next, t0 + ChronoDuration::minutes(30), "5th failure doubles");

        state.pop_due(next);
        let next = state
            .complete(
                id,
                ScrapeOutcome::Failure {
                    consecutive_errors: 8,
                },
                next,
            )
            .unwrap();
        let expected = t0 + ChronoDuration::minutes(30) + ChronoDuration::minutes(15 * 16);
        assert_eq!(next, expected, "8th failure runs at 16x");
    }

    #[test]
    fn requeue_comes_back_on_the_next_cycle() {
        let mut state = SchedulerState::new(5, 32);
        let id = Uuid::new_v4();
        let t0 = now();

        state.track(id, Interval::Daily, 0, t0);
        state.pop_due(t0);
        let next = state.complete(id, ScrapeOutcome::Requeue, t0).unwrap();
        assert_eq!(next, t0, "pool pressure retries immediately, not a day later");
    }

    #[test]
    fn completion_after_forget_does_not_resurrect() {
        let mut state = SchedulerState::new(5, 32);
        let id = Uuid::new_v4();
        let t0 = now();

        state.track(id, Interval::Min15, 0, t0);
        state.pop_due(t0);
        state.forget(id);

        assert_eq!(state.complete(id, ScrapeOutcome::Success, t0), None);
        assert!(state.pop_due(t0 + ChronoDuration::hours(1)).is_empty());
    }

    #[test]
    fn refresh_respects_single_flight() {
        let mut state = SchedulerState::new(5, 32);
        let id = Uuid::new_v4();
        let t0 = now();

        state.track(id, Interval::Min15, 0, t0 + ChronoDuration::minutes(15));
        assert_eq!(state.refresh(id), RefreshDecision::Dispatch);
        assert_eq!(state.refresh(id), RefreshDecision::AlreadyRunning);
        assert_eq!(state.refresh(Uuid::new_v4()), RefreshDecision::Unknown);
    }

    #[test]
    fn rebuild_due_clamps_overdue_to_now() {
        let t0 = now();
        let interval = Interval::Hourly;

        let overdue = rebuild_due(Some(t0 - ChronoDuration::hours(3)), interval, t0);
        assert_eq!(overdue, t0, "missed cycles collapse to one immediate scrape");

        let upcoming = rebuild_due(Some(t0 - ChronoDuration::minutes(10)), interval, t0);
        assert_eq!(upcoming, t0 + ChronoDuration::minutes(50));

        let fresh = rebuild_due(None, interval, t0);
        assert!(fresh > t0 && fresh <= t0 + ChronoDuration::seconds(30), "fresh targets get jitter");
    }
}
