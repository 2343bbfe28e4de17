use std::time::Duration;

use thiserror::Error;

/// Errors surfaced at the control-plane boundary. Internal pipeline errors
/// are logged with a correlation id and translated into `last_error` on the
/// target; only these kinds reach callers.
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("database error: {0}")]
    Database(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("URL rejected: {0}")]
    SsrfRejected(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("config synthesis failed: {0}")]
    ConfigSynthesis(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Failure modes of a single scrape attempt, classified for retry and
/// error-counter semantics.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("page load timed out after {0:?}")]
    LoadTimeout(Duration),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("no configured selector matched anything on the page")]
    SelectorAllMissing,

    #[error("browser pool exhausted")]
    PoolExhausted,

    #[error("scrape cancelled")]
    Cancelled,

    #[error("scrape deadline exceeded")]
    DeadlineExceeded,

    #[error("URL rejected: {0}")]
    SsrfRejected(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExtractError {
    /// Whether this failure increments the target's consecutive error count.
    /// Pool exhaustion is a capacity signal, not a target fault, and a
    /// user-initiated cancellation is not the page's fault either.
    pub fn counts_against_target(&self) -> bool {
        !matches!(self, ExtractError::PoolExhausted | ExtractError::Cancelled)
    }

    /// Whether the worker should re-queue the task for the next scheduler
    /// cycle instead of rescheduling a full interval out.
    pub fn requeue(&self) -> bool {
        matches!(self, ExtractError::PoolExhausted)
    }
}
