//! Target persistence and the per-scrape bookkeeping the workers write.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use watcher_common::{
    AlertPolicy, ExtractionConfig, Interval, StateMap, Target, Visibility, WatcherError,
};

use crate::{db_err, Store};

/// Everything admission knows before the row exists. Targets are born
/// paused; activation happens once the config validates.
#[derive(Debug, Clone)]
pub struct NewTarget {
    pub owner_id: Uuid,
    pub url: String,
    pub name: String,
    pub description: String,
    pub config: ExtractionConfig,
    pub interval: Interval,
    pub alert_policy: AlertPolicy,
    pub summary_enabled: bool,
    pub visibility: Visibility,
    pub folder_id: Option<Uuid>,
}

const TARGET_COLUMNS: &str = "id, owner_id, url, name, description, config, cadence, \
     alert_policy, summary_enabled, active, visibility, slug, folder_id, current_state, \
     last_alert_state, last_scrape_at, last_scrape_end, last_error, consecutive_errors, created_at";

pub(crate) fn target_from_row(row: &PgRow) -> Result<Target, sqlx::Error> {
    let decode = |col: &str, msg: String| sqlx::Error::ColumnDecode {
        index: col.to_string(),
        source: msg.into(),
    };

    let cadence: String = row.try_get("cadence")?;
    let interval = Interval::parse(&cadence)
        .ok_or_else(|| decode("cadence", format!("unknown interval {cadence:?}")))?;

    let policy: String = row.try_get("alert_policy")?;
    let alert_policy = AlertPolicy::parse(&policy)
        .ok_or_else(|| decode("alert_policy", format!("unknown alert policy {policy:?}")))?;

    let visibility: String = row.try_get("visibility")?;
    let slug: Option<String> = row.try_get("slug")?;
    let visibility = match (visibility.as_str(), slug) {
        ("private", _) => Visibility::Private,
        ("public", Some(slug)) => Visibility::Public(slug),
        ("public", None) => {
            return Err(decode("slug", "public target without slug".to_string()))
        }
        (other, _) => return Err(decode("visibility", format!("unknown visibility {other:?}"))),
    };

    let config: serde_json::Value = row.try_get("config")?;
    let config: ExtractionConfig = serde_json::from_value(config)
        .map_err(|e| decode("config", e.to_string()))?;

    let state = |col: &str| -> Result<Option<StateMap>, sqlx::Error> {
        let value: Option<serde_json::Value> = row.try_get(col)?;
        value
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| decode(col, e.to_string()))
    };

    let consecutive_errors: i32 = row.try_get("consecutive_errors")?;

    Ok(Target {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        url: row.try_get("url")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        config,
        interval,
        alert_policy,
        summary_enabled: row.try_get("summary_enabled")?,
        active: row.try_get("active")?,
        visibility,
        folder_id: row.try_get("folder_id")?,
        current_state: state("current_state")?,
        last_alert_state: state("last_alert_state")?,
        last_scrape_at: row.try_get("last_scrape_at")?,
        last_scrape_end: row.try_get("last_scrape_end")?,
        last_error: row.try_get("last_error")?,
        consecutive_errors: consecutive_errors.max(0) as u32,
        created_at: row.try_get("created_at")?,
    })
}

impl Store {
    pub async fn create_target(&self, new: NewTarget) -> Result<Target, WatcherError> {
        let id = Uuid::new_v4();
        let config = serde_json::to_value(&new.config)
            .map_err(|e| WatcherError::Validation(e.to_string()))?;
        let (visibility, slug) = match &new.visibility {
            Visibility::Private => ("private", None),
            Visibility::Public(slug) => ("public", Some(slug.clone())),
        };

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO targets (id, owner_id, url, name, description, config, cadence,
                                 alert_policy, summary_enabled, active, visibility, slug, folder_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, false, $10, $11, $12)
            RETURNING {TARGET_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(new.owner_id)
        .bind(&new.url)
        .bind(&new.name)
        .bind(&new.description)
        .bind(config)
        .bind(new.interval.as_str())
        .bind(new.alert_policy.as_str())
        .bind(new.summary_enabled)
        .bind(visibility)
        .bind(slug)
        .bind(new.folder_id)
        .fetch_one(self.pool())
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                WatcherError::Validation("public slug is already taken".to_string())
            }
            _ => db_err(e),
        })?;

        target_from_row(&row).map_err(db_err)
    }

    pub async fn get_target(&self, id: Uuid) -> Result<Option<Target>, WatcherError> {
        let row = sqlx::query(&format!(
            "SELECT {TARGET_COLUMNS} FROM targets WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;

        row.as_ref().map(target_from_row).transpose().map_err(db_err)
    }

    pub async fn get_target_by_slug(&self, slug: &str) -> Result<Option<Target>, WatcherError> {
        let row = sqlx::query(&format!(
            "SELECT {TARGET_COLUMNS} FROM targets WHERE visibility = 'public' AND slug = $1"
        ))
        .bind(slug)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;

        row.as_ref().map(target_from_row).transpose().map_err(db_err)
    }

    /// Every active target, for the scheduler's start-up rebuild.
    pub async fn list_active_targets(&self) -> Result<Vec<Target>, WatcherError> {
        let rows = sqlx::query(&format!(
            "SELECT {TARGET_COLUMNS} FROM targets WHERE active ORDER BY created_at"
        ))
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.iter().map(target_from_row).collect::<Result<_, _>>().map_err(db_err)
    }

    pub async fn list_targets_by_owner(&self, owner_id: Uuid) -> Result<Vec<Target>, WatcherError> {
        let rows = sqlx::query(&format!(
            "SELECT {TARGET_COLUMNS} FROM targets WHERE owner_id = $1 ORDER BY created_at"
        ))
        .bind(owner_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.iter().map(target_from_row).collect::<Result<_, _>>().map_err(db_err)
    }

    pub async fn set_target_active(&self, id: Uuid, active: bool) -> Result<(), WatcherError> {
        sqlx::query("UPDATE targets SET active = $2 WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn update_target_config(
        &self,
        id: Uuid,
        config: &ExtractionConfig,
    ) -> Result<(), WatcherError> {
        let config = serde_json::to_value(config)
            .map_err(|e| WatcherError::Validation(e.to_string()))?;
        // A new config invalidates the old baseline; the next scrape
        // re-establishes it.
        sqlx::query(
            "UPDATE targets SET config = $2, current_state = NULL, last_alert_state = NULL WHERE id = $1",
        )
        .bind(id)
        .bind(config)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn set_target_visibility(
        &self,
        id: Uuid,
        visibility: &Visibility,
    ) -> Result<(), WatcherError> {
        let (kind, slug) = match visibility {
            Visibility::Private => ("private", None),
            Visibility::Public(slug) => ("public", Some(slug.clone())),
        };
        sqlx::query("UPDATE targets SET visibility = $2, slug = $3 WHERE id = $1")
            .bind(id)
            .bind(kind)
            .bind(slug)
            .execute(self.pool())
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    WatcherError::Validation("public slug is already taken".to_string())
                }
                _ => db_err(e),
            })?;
        Ok(())
    }

    pub async fn set_target_folder(
        &self,
        id: Uuid,
        folder_id: Option<Uuid>,
    ) -> Result<(), WatcherError> {
        sqlx::query("UPDATE targets SET folder_id = $2 WHERE id = $1")
            .bind(id)
            .bind(folder_id)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Successful scrape: new baseline, clean error slate.
    pub async fn record_scrape_success(
        &self,
        id: Uuid,
        state: &StateMap,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<(), WatcherError> {
        let state = serde_json::to_value(state)
            .map_err(|e| WatcherError::Validation(e.to_string()))?;
        sqlx::query(
            r#"
            UPDATE targets
            SET current_state = $2, last_scrape_at = $3, last_scrape_end = $4,
                last_error = NULL, consecutive_errors = 0
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(state)
        .bind(started_at)
        .bind(finished_at)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Failed scrape: record the error and return the new consecutive count.
    pub async fn record_scrape_failure(
        &self,
        id: Uuid,
        error: &str,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<u32, WatcherError> {
        let row = sqlx::query(
            r#"
            UPDATE targets
            SET last_error = $2, last_scrape_at = $3, last_scrape_end = $4,
                consecutive_errors = consecutive_errors + 1
            WHERE id = $1
            RETURNING consecutive_errors
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(started_at)
        .bind(finished_at)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;

        let count: i32 = match row {
            Some(row) => row.try_get("consecutive_errors").map_err(db_err)?,
            None => return Err(WatcherError::NotFound(format!("target {id}"))),
        };
        Ok(count.max(0) as u32)
    }

    pub async fn set_last_alert_state(
        &self,
        id: Uuid,
        state: &StateMap,
    ) -> Result<(), WatcherError> {
        let state = serde_json::to_value(state)
            .map_err(|e| WatcherError::Validation(e.to_string()))?;
        sqlx::query("UPDATE targets SET last_alert_state = $2 WHERE id = $1")
            .bind(id)
            .bind(state)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Removes the target; events, read states, and subscriptions go with it
    /// through the FK cascade.
    pub async fn delete_target(&self, id: Uuid) -> Result<(), WatcherError> {
        sqlx::query("DELETE FROM targets WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
