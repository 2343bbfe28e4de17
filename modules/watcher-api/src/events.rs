//! Event reads and per-principal read/star state. Audience rule: owner or
//! subscriber; everyone else sees an empty page rather than an error, the
//! same shape an unsubscribed reader gets.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use watcher_common::WatcherError;
use watcher_store::EventCursor;

use crate::auth::authenticate;
use crate::error::ApiError;
use crate::SharedState;

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Keyset cursor: both halves or neither.
    #[serde(default)]
    pub cursor_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cursor_id: Option<Uuid>,
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn list_events(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(target_id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;

    let cursor = match (query.cursor_ts, query.cursor_id) {
        (Some(ts), Some(id)) => Some(EventCursor { ts, id }),
        (None, None) => None,
        _ => {
            return Err(WatcherError::Validation(
                "cursor_ts and cursor_id go together".to_string(),
            )
            .into())
        }
    };
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);

    let events = state
        .ctx
        .store
        .list_events_for(principal.id, target_id, cursor, limit)
        .await?;

    let next_cursor = events.last().map(|e| {
        json!({ "cursor_ts": e.ts, "cursor_id": e.id })
    });
    Ok(Json(json!({ "events": events, "next": next_cursor })))
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    #[serde(default = "default_true")]
    pub read: bool,
}

fn default_true() -> bool {
    true
}

pub async fn mark_read(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(event_id): Path<Uuid>,
    Json(req): Json<MarkReadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;
    require_event_audience(&state, principal.id, event_id).await?;

    state
        .ctx
        .store
        .mark_read(principal.id, event_id, req.read)
        .await?;
    Ok(Json(json!({ "read": req.read })))
}

pub async fn toggle_star(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(event_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;
    require_event_audience(&state, principal.id, event_id).await?;

    let starred = state.ctx.store.toggle_star(principal.id, event_id).await?;
    Ok(Json(json!({ "starred": starred })))
}

pub async fn unread_counts(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;
    let counts = state.ctx.store.unread_counts(principal.id).await?;
    Ok(Json(json!({ "unread": counts })))
}

async fn require_event_audience(
    state: &SharedState,
    principal_id: Uuid,
    event_id: Uuid,
) -> Result<(), WatcherError> {
    let event = state
        .ctx
        .store
        .get_event(event_id)
        .await?
        .ok_or_else(|| WatcherError::NotFound(format!("event {event_id}")))?;

    if !state
        .ctx
        .store
        .is_audience(principal_id, event.target_id)
        .await?
    {
        return Err(WatcherError::Unauthorized(
            "not in this target's audience".to_string(),
        ));
    }
    Ok(())
}
