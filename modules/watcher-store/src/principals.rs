//! Principals and their opaque API tokens. Authentication proper lives
//! outside the core; the store only resolves tokens to identities.

use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use watcher_common::WatcherError;

use crate::{db_err, Store};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: Uuid,
    pub email: String,
    pub api_token: String,
}

fn principal_from_row(row: &PgRow) -> Result<Principal, sqlx::Error> {
    Ok(Principal {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        api_token: row.try_get("api_token")?,
    })
}

impl Store {
    pub async fn create_principal(&self, email: &str) -> Result<Principal, WatcherError> {
        let row = sqlx::query(
            r#"
            INSERT INTO principals (id, email, api_token)
            VALUES ($1, $2, $3)
            RETURNING id, email, api_token
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(Uuid::new_v4().simple().to_string())
        .fetch_one(self.pool())
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                WatcherError::Validation(format!("principal {email:?} already exists"))
            }
            _ => db_err(e),
        })?;

        principal_from_row(&row).map_err(db_err)
    }

    pub async fn principal_by_token(
        &self,
        token: &str,
    ) -> Result<Option<Principal>, WatcherError> {
        let row = sqlx::query("SELECT id, email, api_token FROM principals WHERE api_token = $1")
            .bind(token)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;

        row.as_ref().map(principal_from_row).transpose().map_err(db_err)
    }

    pub async fn principal_by_email(
        &self,
        email: &str,
    ) -> Result<Option<Principal>, WatcherError> {
        let row = sqlx::query("SELECT id, email, api_token FROM principals WHERE email = $1")
            .bind(email)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;

        row.as_ref().map(principal_from_row).transpose().map_err(db_err)
    }
}
