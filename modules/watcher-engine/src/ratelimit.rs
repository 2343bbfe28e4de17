//! In-process rate limiting. Two shapes cover every limiter in the system:
//! a single-slot-per-window limiter (alert spam guard, manual refresh) and a
//! sliding-window counter (per-principal AI budgets).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// At most one admission per key per window. Used for the per-target alert
/// guard (60 s) and the manual-refresh guard (5 min).
pub struct RateLimiter {
    window: Duration,
    last: Mutex<HashMap<Uuid, Instant>>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: Uuid) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: Uuid, now: Instant) -> bool {
        let mut last = self.last.lock().unwrap();
        match last.get(&key) {
            Some(prev) if now.duration_since(*prev) < self.window => false,
            _ => {
                last.insert(key, now);
                true
            }
        }
    }

    /// Seconds until the key is admitted again; 0 when it would pass now.
    pub fn retry_after_secs(&self, key: Uuid) -> u64 {
        let last = self.last.lock().unwrap();
        match last.get(&key) {
            Some(prev) => {
                let elapsed = prev.elapsed();
                if elapsed >= self.window {
                    0
                } else {
                    (self.window - elapsed).as_secs().max(1)
                }
            }
            None => 0,
        }
    }

    pub fn forget(&self, key: Uuid) {
        self.last.lock().unwrap().remove(&key);
    }
}

/// At most `max` admissions per key per window, sliding.
pub struct SlidingWindow {
    window: Duration,
    max: usize,
    entries: Mutex<HashMap<Uuid, Vec<Instant>>>,
}

impl SlidingWindow {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            window,
            max,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: Uuid) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: Uuid, now: Instant) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let hits = entries.entry(key).or_default();
        hits.retain(|t| now.duration_since(*t) < self.window);
        if hits.len() >= self.max {
            return false;
        }
        hits.push(now);
        true
    }
}
