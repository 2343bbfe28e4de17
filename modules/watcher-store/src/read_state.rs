//! Per-(principal, event) read and star marks. Rows are created lazily on
//! the first mark; updates are last-writer-wins.

use serde::Serialize;
use sqlx::Row;
use uuid::Uuid;

use watcher_common::WatcherError;

use crate::{db_err, Store};

/// One row of the unread aggregate, keyed by target and its folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreadCount {
    pub target_id: Uuid,
    pub folder_id: Option<Uuid>,
    pub unread: i64,
}

impl Store {
    pub async fn mark_read(
        &self,
        principal_id: Uuid,
        event_id: Uuid,
        read: bool,
    ) -> Result<(), WatcherError> {
        sqlx::query(
            r#"
            INSERT INTO read_states (principal_id, event_id, read, read_at)
            VALUES ($1, $2, $3, CASE WHEN $3 THEN now() ELSE NULL END)
            ON CONFLICT (principal_id, event_id)
            DO UPDATE SET read = $3, read_at = CASE WHEN $3 THEN now() ELSE NULL END
            "#,
        )
        .bind(principal_id)
        .bind(event_id)
        .bind(read)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Flip the star and return the new value.
    pub async fn toggle_star(
        &self,
        principal_id: Uuid,
        event_id: Uuid,
    ) -> Result<bool, WatcherError> {
        let row = sqlx::query(
            r#"
            INSERT INTO read_states (principal_id, event_id, starred, starred_at)
            VALUES ($1, $2, true, now())
            ON CONFLICT (principal_id, event_id)
            DO UPDATE SET starred = NOT read_states.starred,
                          starred_at = CASE WHEN read_states.starred THEN NULL ELSE now() END
            RETURNING starred
            "#,
        )
        .bind(principal_id)
        .bind(event_id)
        .fetch_one(self.pool())
        .await
        .map_err(db_err)?;

        row.try_get("starred").map_err(db_err)
    }

    /// Unread counts per target (with its folder) over everything the
    /// principal can observe: owned targets plus subscriptions. Owned-target
    /// subscriptions are forbidden upstream, so the OR cannot double-count.
    pub async fn unread_counts(
        &self,
        principal_id: Uuid,
    ) -> Result<Vec<UnreadCount>, WatcherError> {
        let rows = sqlx::query(
            r#"
            SELECT t.id AS target_id, t.folder_id, COUNT(e.id) AS unread
            FROM targets t
            JOIN change_events e ON e.target_id = t.id
            LEFT JOIN read_states r
                   ON r.event_id = e.id AND r.principal_id = $1
            WHERE (t.owner_id = $1
                   OR EXISTS (SELECT 1 FROM subscriptions s
                              WHERE s.target_id = t.id AND s.principal_id = $1))
              AND COALESCE(r.read, false) = false
            GROUP BY t.id, t.folder_id
            ORDER BY t.id
            "#,
        )
        .bind(principal_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                Ok(UnreadCount {
                    target_id: row.try_get("target_id")?,
                    folder_id: row.try_get("folder_id")?,
                    unread: row.try_get("unread")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(db_err)
    }
}
