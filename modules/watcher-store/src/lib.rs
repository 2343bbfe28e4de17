//! Durable state behind the pipeline: targets, append-only change events,
//! per-principal read/star marks, subscriptions, and folders. Postgres via
//! sqlx; every query is a plain statement, no compile-time checking against
//! a live database.

pub mod events;
pub mod folders;
pub mod principals;
pub mod read_state;
pub mod retention;
pub mod subscriptions;
pub mod targets;

pub use events::{EventCursor, InsertOutcome, NewChangeEvent};
pub use folders::Folder;
pub use principals::Principal;
pub use read_state::UnreadCount;
pub use targets::NewTarget;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use watcher_common::WatcherError;

/// Handle over the connection pool. Cheap to clone; one per process.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Flatten driver errors into the boundary taxonomy.
pub(crate) fn db_err(e: sqlx::Error) -> WatcherError {
    WatcherError::Database(e.to_string())
}
