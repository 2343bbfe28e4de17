//! Append-only change events with idempotent insertion.
//!
//! Duplicate suppression is two-layered: a sliding-window `NOT EXISTS` guard
//! for scrapes that observe the same transition moments apart, and the
//! unique `(target_id, fingerprint, ts_bucket)` index as the concurrency
//! backstop. Two racing inserts with the same fingerprint yield exactly one
//! `Inserted`.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use watcher_common::{ChangeEvent, StateMap, WatcherError};

use crate::{db_err, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Uuid),
    Duplicate,
}

/// Keyset cursor for newest-first pagination.
#[derive(Debug, Clone, Copy)]
pub struct EventCursor {
    pub ts: DateTime<Utc>,
    pub id: Uuid,
}

#[derive(Debug, Clone)]
pub struct NewChangeEvent {
    pub target_id: Uuid,
    pub ts: DateTime<Utc>,
    pub title: String,
    pub description: String,
    pub permalink: String,
    pub prior_state: StateMap,
    pub current_state: StateMap,
    pub fingerprint: String,
}

const EVENT_COLUMNS: &str =
    "id, target_id, ts, title, description, permalink, summary, prior_state, current_state, fingerprint";

pub(crate) fn event_from_row(row: &PgRow) -> Result<ChangeEvent, sqlx::Error> {
    let decode = |col: &str, msg: String| sqlx::Error::ColumnDecode {
        index: col.to_string(),
        source: msg.into(),
    };

    let state = |col: &str| -> Result<StateMap, sqlx::Error> {
        let value: serde_json::Value = row.try_get(col)?;
        serde_json::from_value(value).map_err(|e| decode(col, e.to_string()))
    };

    Ok(ChangeEvent {
        id: row.try_get("id")?,
        target_id: row.try_get("target_id")?,
        ts: row.try_get("ts")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        permalink: row.try_get("permalink")?,
        summary: row.try_get("summary")?,
        prior_state: state("prior_state")?,
        current_state: state("current_state")?,
        fingerprint: row.try_get("fingerprint")?,
    })
}

impl Store {
    /// Insert a change event unless an equal transition was already recorded
    /// within `window_secs`.
    pub async fn insert_event(
        &self,
        event: &NewChangeEvent,
        window_secs: i64,
    ) -> Result<InsertOutcome, WatcherError> {
        let id = Uuid::new_v4();
        let bucket = event.ts.timestamp() / window_secs.max(1);
        let prior = serde_json::to_value(&event.prior_state)
            .map_err(|e| WatcherError::Validation(e.to_string()))?;
        let current = serde_json::to_value(&event.current_state)
            .map_err(|e| WatcherError::Validation(e.to_string()))?;

        let row = sqlx::query(
            r#"
            INSERT INTO change_events (id, target_id, ts, ts_bucket, title, description,
                                       permalink, prior_state, current_state, fingerprint)
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
            WHERE NOT EXISTS (
                SELECT 1 FROM change_events
                WHERE target_id = $2 AND fingerprint = $10
                  AND ts > $3 - make_interval(secs => $11)
            )
            ON CONFLICT (target_id, fingerprint, ts_bucket) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(event.target_id)
        .bind(event.ts)
        .bind(bucket)
        .bind(&event.title)
        .bind(&event.description)
        .bind(&event.permalink)
        .bind(prior)
        .bind(current)
        .bind(&event.fingerprint)
        .bind(window_secs as f64)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => Ok(InsertOutcome::Inserted(row.try_get("id").map_err(db_err)?)),
            None => Ok(InsertOutcome::Duplicate),
        }
    }

    /// Patch the AI summary onto an already-persisted event.
    pub async fn set_event_summary(
        &self,
        event_id: Uuid,
        summary: &str,
    ) -> Result<(), WatcherError> {
        sqlx::query("UPDATE change_events SET summary = $2 WHERE id = $1")
            .bind(event_id)
            .bind(summary)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_event(&self, event_id: Uuid) -> Result<Option<ChangeEvent>, WatcherError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM change_events WHERE id = $1"
        ))
        .bind(event_id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;

        row.as_ref().map(event_from_row).transpose().map_err(db_err)
    }

    /// Newest-first events for one target with keyset pagination.
    pub async fn list_events(
        &self,
        target_id: Uuid,
        cursor: Option<EventCursor>,
        limit: i64,
    ) -> Result<Vec<ChangeEvent>, WatcherError> {
        let rows = match cursor {
            Some(cursor) => {
                sqlx::query(&format!(
                    r#"
                    SELECT {EVENT_COLUMNS} FROM change_events
                    WHERE target_id = $1 AND (ts, id) < ($2, $3)
                    ORDER BY ts DESC, id DESC
                    LIMIT $4
                    "#
                ))
                .bind(target_id)
                .bind(cursor.ts)
                .bind(cursor.id)
                .bind(limit)
                .fetch_all(self.pool())
                .await
            }
            None => {
                sqlx::query(&format!(
                    r#"
                    SELECT {EVENT_COLUMNS} FROM change_events
                    WHERE target_id = $1
                    ORDER BY ts DESC, id DESC
                    LIMIT $2
                    "#
                ))
                .bind(target_id)
                .bind(limit)
                .fetch_all(self.pool())
                .await
            }
        }
        .map_err(db_err)?;

        rows.iter().map(event_from_row).collect::<Result<_, _>>().map_err(db_err)
    }

    /// Audience-gated listing: owners and subscribers see events, everyone
    /// else gets an empty page (not an error, matching feed semantics).
    pub async fn list_events_for(
        &self,
        principal_id: Uuid,
        target_id: Uuid,
        cursor: Option<EventCursor>,
        limit: i64,
    ) -> Result<Vec<ChangeEvent>, WatcherError> {
        if !self.is_audience(principal_id, target_id).await? {
            return Ok(Vec::new());
        }
        self.list_events(target_id, cursor, limit).await
    }

    pub async fn latest_event_ts(
        &self,
        target_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>, WatcherError> {
        let row = sqlx::query("SELECT MAX(ts) AS ts FROM change_events WHERE target_id = $1")
            .bind(target_id)
            .fetch_one(self.pool())
            .await
            .map_err(db_err)?;
        row.try_get("ts").map_err(db_err)
    }
}
