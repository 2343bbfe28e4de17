//! Subscriptions: a principal following someone else's public target.

use sqlx::Row;
use uuid::Uuid;

use watcher_common::WatcherError;

use crate::{db_err, Store};

impl Store {
    /// Subscribe to a public target. Owners cannot subscribe to their own
    /// targets, and duplicates are rejected.
    pub async fn subscribe(
        &self,
        principal_id: Uuid,
        target_id: Uuid,
    ) -> Result<(), WatcherError> {
        let target = self
            .get_target(target_id)
            .await?
            .ok_or_else(|| WatcherError::NotFound(format!("target {target_id}")))?;

        if !target.visibility.is_public() {
            return Err(WatcherError::Validation(
                "only public targets can be subscribed to".to_string(),
            ));
        }
        if target.owner_id == principal_id {
            return Err(WatcherError::Validation(
                "owners are already the audience of their own targets".to_string(),
            ));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions (principal_id, target_id)
            VALUES ($1, $2)
            ON CONFLICT (principal_id, target_id) DO NOTHING
            "#,
        )
        .bind(principal_id)
        .bind(target_id)
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(WatcherError::Validation(
                "already subscribed".to_string(),
            ));
        }
        Ok(())
    }

    /// Remove the subscription row. Read states survive; the events belong
    /// to the target, not the subscriber.
    pub async fn unsubscribe(
        &self,
        principal_id: Uuid,
        target_id: Uuid,
    ) -> Result<(), WatcherError> {
        sqlx::query("DELETE FROM subscriptions WHERE principal_id = $1 AND target_id = $2")
            .bind(principal_id)
            .bind(target_id)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn is_subscribed(
        &self,
        principal_id: Uuid,
        target_id: Uuid,
    ) -> Result<bool, WatcherError> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM subscriptions WHERE principal_id = $1 AND target_id = $2) AS subscribed",
        )
        .bind(principal_id)
        .bind(target_id)
        .fetch_one(self.pool())
        .await
        .map_err(db_err)?;

        row.try_get("subscribed").map_err(db_err)
    }

    /// Owner or subscriber: the set of principals who may observe a
    /// target's events.
    pub async fn is_audience(
        &self,
        principal_id: Uuid,
        target_id: Uuid,
    ) -> Result<bool, WatcherError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM targets WHERE id = $2 AND owner_id = $1
                UNION ALL
                SELECT 1 FROM subscriptions WHERE target_id = $2 AND principal_id = $1
            ) AS audience
            "#,
        )
        .bind(principal_id)
        .bind(target_id)
        .fetch_one(self.pool())
        .await
        .map_err(db_err)?;

        row.try_get("audience").map_err(db_err)
    }
}
