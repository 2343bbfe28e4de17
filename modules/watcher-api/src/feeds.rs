//! RSS feed endpoints. Private feeds require the owner; public feeds are
//! open by design and addressed by slug.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use watcher_common::WatcherError;

use crate::auth::authenticate;
use crate::error::ApiError;
use crate::SharedState;

fn rss_response(xml: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/rss+xml; charset=utf-8")],
        xml,
    )
        .into_response()
}

pub async fn private_feed(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(target_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;
    let target = state
        .ctx
        .store
        .get_target(target_id)
        .await?
        .ok_or_else(|| WatcherError::NotFound(format!("target {target_id}")))?;

    if target.owner_id != principal.id {
        return Err(WatcherError::Unauthorized(
            "only the owner may fetch the private feed".to_string(),
        )
        .into());
    }

    let xml = state.ctx.feeds.feed_xml(&target).await?;
    Ok(rss_response(xml))
}

pub async fn public_feed(
    State(state): State<SharedState>,
    Path(slug): Path<String>,
) -> Result<Response, ApiError> {
    let target = state
        .ctx
        .store
        .get_target_by_slug(&slug)
        .await?
        .ok_or_else(|| WatcherError::NotFound(format!("feed {slug}")))?;

    let xml = state.ctx.feeds.feed_xml(&target).await?;
    Ok(rss_response(xml))
}
