use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(Error, Debug)]
pub enum PoolError {
    /// No context became available before the lease deadline.
    #[error("browser pool exhausted")]
    Exhausted,

    #[error("page load timed out after {0:?}")]
    LoadTimeout(Duration),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
