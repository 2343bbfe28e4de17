//! Principal-owned folders for organizing targets. Nesting is allowed;
//! deleting a folder detaches its targets rather than deleting them.

use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use watcher_common::WatcherError;

use crate::{db_err, Store};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Folder {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
}

fn folder_from_row(row: &PgRow) -> Result<Folder, sqlx::Error> {
    Ok(Folder {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        name: row.try_get("name")?,
        parent_id: row.try_get("parent_id")?,
    })
}

impl Store {
    pub async fn create_folder(
        &self,
        owner_id: Uuid,
        name: &str,
        parent_id: Option<Uuid>,
    ) -> Result<Folder, WatcherError> {
        if name.trim().is_empty() {
            return Err(WatcherError::Validation(
                "folder name cannot be empty".to_string(),
            ));
        }
        let row = sqlx::query(
            r#"
            INSERT INTO folders (id, owner_id, name, parent_id)
            VALUES ($1, $2, $3, $4)
            RETURNING id, owner_id, name, parent_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(name.trim())
        .bind(parent_id)
        .fetch_one(self.pool())
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                WatcherError::Validation(format!("folder {name:?} already exists"))
            }
            _ => db_err(e),
        })?;

        folder_from_row(&row).map_err(db_err)
    }

    pub async fn rename_folder(&self, id: Uuid, name: &str) -> Result<(), WatcherError> {
        sqlx::query("UPDATE folders SET name = $2 WHERE id = $1")
            .bind(id)
            .bind(name.trim())
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Targets inside keep existing with `folder_id = NULL` (FK SET NULL).
    pub async fn delete_folder(&self, id: Uuid) -> Result<(), WatcherError> {
        sqlx::query("DELETE FROM folders WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn list_folders(&self, owner_id: Uuid) -> Result<Vec<Folder>, WatcherError> {
        let rows = sqlx::query(
            "SELECT id, owner_id, name, parent_id FROM folders WHERE owner_id = $1 ORDER BY name",
        )
        .bind(owner_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.iter().map(folder_from_row).collect::<Result<_, _>>().map_err(db_err)
    }
}
