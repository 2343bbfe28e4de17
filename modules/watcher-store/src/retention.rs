//! Retention trim, run by the janitor task.

use chrono::{DateTime, Utc};

use watcher_common::WatcherError;

use crate::{db_err, Store};

impl Store {
    /// Delete change events older than the cutoff. Read states cascade with
    /// them. Returns the number of rows removed.
    pub async fn trim_events_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, WatcherError> {
        let result = sqlx::query("DELETE FROM change_events WHERE ts < $1")
            .bind(cutoff)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}
