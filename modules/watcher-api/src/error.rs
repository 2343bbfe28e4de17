//! Boundary error mapping. Only the taxonomy's caller-facing kinds carry
//! their message out; storage and internal failures are logged with a
//! correlation id and surface as an opaque 500.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use tracing::error;
use uuid::Uuid;

use watcher_common::WatcherError;

pub struct ApiError(pub WatcherError);

impl From<WatcherError> for ApiError {
    fn from(e: WatcherError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            WatcherError::SsrfRejected(m) => (StatusCode::BAD_REQUEST, m.clone()),
            WatcherError::Validation(m) => (StatusCode::BAD_REQUEST, m.clone()),
            WatcherError::Unauthorized(m) => (StatusCode::FORBIDDEN, m.clone()),
            WatcherError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            WatcherError::RateLimited(m) => (StatusCode::TOO_MANY_REQUESTS, m.clone()),
            WatcherError::ConfigSynthesis(m) => (StatusCode::UNPROCESSABLE_ENTITY, m.clone()),
            WatcherError::Database(_) | WatcherError::Anyhow(_) => {
                let correlation_id = Uuid::new_v4();
                error!(%correlation_id, error = %self.0, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("internal error ({correlation_id})"),
                )
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
