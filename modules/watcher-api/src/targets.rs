//! Target lifecycle: admission, pause/resume, deletion, manual refresh,
//! config updates, visibility, and subscriptions.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use watcher_common::{
    check_url, resolve_and_check, AlertPolicy, ExtractionConfig, Interval, Target, Visibility,
    WatcherError,
};
use watcher_engine::SynthesisResult;
use watcher_store::NewTarget;

use crate::auth::{authenticate, require_owner};
use crate::error::ApiError;
use crate::SharedState;

#[derive(Debug, Deserialize)]
pub struct CreateTargetRequest {
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub interval: Interval,
    pub alert_policy: AlertPolicy,
    #[serde(default)]
    pub summary_enabled: bool,
    /// Present = public target with this slug.
    #[serde(default)]
    pub public_slug: Option<String>,
    #[serde(default)]
    pub folder_id: Option<Uuid>,
    /// Explicit config skips synthesis entirely.
    #[serde(default)]
    pub config: Option<ExtractionConfig>,
}

fn target_json(target: &Target, degraded_threshold: u32) -> serde_json::Value {
    json!({
        "target": target,
        "status": target.status(degraded_threshold),
    })
}

fn parse_slug(slug: &str) -> Result<String, WatcherError> {
    let slug = slug.trim().to_lowercase();
    if slug.is_empty()
        || slug.len() > 64
        || !slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(WatcherError::Validation(
            "slug must be lowercase letters, digits, and dashes".to_string(),
        ));
    }
    Ok(slug)
}

/// Admission: SSRF guard, config synthesis (unless supplied), persist
/// paused, activate once the config validated, start scheduling.
pub async fn create_target(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateTargetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;

    let url = check_url(&req.url)?;
    resolve_and_check(&url).await?;

    let config = match req.config {
        Some(config) => {
            config.validate()?;
            config
        }
        None => {
            let result = state
                .ctx
                .assist
                .synthesize_config(principal.id, url.as_str(), &req.description)
                .await?;
            if let SynthesisResult::Fallback(_) = &result {
                info!(url = %url, "accepting fallback whole-page config");
            }
            result.into_config()
        }
    };

    let visibility = match &req.public_slug {
        Some(slug) => Visibility::Public(parse_slug(slug)?),
        None => Visibility::Private,
    };

    let target = state
        .ctx
        .store
        .create_target(NewTarget {
            owner_id: principal.id,
            url: url.to_string(),
            name: req.name,
            description: req.description,
            config,
            interval: req.interval,
            alert_policy: req.alert_policy,
            summary_enabled: req.summary_enabled,
            visibility,
            folder_id: req.folder_id,
        })
        .await?;

    // The persisted config already validated, so the paused birth state is
    // immediately promoted.
    state.ctx.store.set_target_active(target.id, true).await?;
    state
        .engine
        .track_target(&target)
        .await
        .map_err(WatcherError::from)?;

    info!(target_id = %target.id, owner = %principal.id, "target created");
    let mut target = target;
    target.active = true;
    Ok((
        StatusCode::CREATED,
        Json(target_json(&target, state.ctx.config.degraded_threshold)),
    ))
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub url: String,
    #[serde(default)]
    pub description: String,
}

/// Synthesis preview: no persistence, caller inspects what the AI proposes.
pub async fn preview_config(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<PreviewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;
    let url = check_url(&req.url)?;

    let result = state
        .ctx
        .assist
        .synthesize_config(principal.id, url.as_str(), &req.description)
        .await?;

    let fallback = matches!(result, SynthesisResult::Fallback(_));
    Ok(Json(json!({
        "config": result.into_config(),
        "fallback": fallback,
    })))
}

pub async fn list_targets(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;
    let targets = state.ctx.store.list_targets_by_owner(principal.id).await?;
    let threshold = state.ctx.config.degraded_threshold;
    Ok(Json(json!({
        "targets": targets
            .iter()
            .map(|t| target_json(t, threshold))
            .collect::<Vec<_>>(),
    })))
}

pub async fn get_target(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;
    let target = fetch_owned(&state, &principal, id).await?;
    Ok(Json(target_json(&target, state.ctx.config.degraded_threshold)))
}

/// Manual refresh: rate-limited per target, then queued through the
/// scheduler so single-flight still holds.
pub async fn refresh_target(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;
    let target = fetch_owned(&state, &principal, id).await?;

    if !target.active {
        return Err(WatcherError::Validation("target is paused".to_string()).into());
    }
    if !state.ctx.refresh_limiter.allow(target.id) {
        let retry = state.ctx.refresh_limiter.retry_after_secs(target.id);
        return Err(WatcherError::RateLimited(format!(
            "manual refresh available again in {retry}s"
        ))
        .into());
    }

    state
        .engine
        .refresh_target(target.id)
        .await
        .map_err(WatcherError::from)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "queued": true }))))
}

pub async fn pause_target(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;
    let target = fetch_owned(&state, &principal, id).await?;

    state.ctx.store.set_target_active(target.id, false).await?;
    state
        .engine
        .forget_target(target.id)
        .await
        .map_err(WatcherError::from)?;
    Ok(Json(json!({ "active": false })))
}

pub async fn resume_target(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;
    let mut target = fetch_owned(&state, &principal, id).await?;

    state.ctx.store.set_target_active(target.id, true).await?;
    target.active = true;
    state
        .engine
        .track_target(&target)
        .await
        .map_err(WatcherError::from)?;
    Ok(Json(json!({ "active": true })))
}

pub async fn delete_target(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;
    let target = fetch_owned(&state, &principal, id).await?;

    state
        .engine
        .forget_target(target.id)
        .await
        .map_err(WatcherError::from)?;
    state.ctx.store.delete_target(target.id).await?;
    state.ctx.feeds.cache().evict(target.id);

    info!(target_id = %target.id, "target deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct UpdateConfigRequest {
    /// Explicit replacement config, or absent to re-synthesize.
    #[serde(default)]
    pub config: Option<ExtractionConfig>,
}

pub async fn update_config(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateConfigRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;
    let target = fetch_owned(&state, &principal, id).await?;

    let config = match req.config {
        Some(config) => {
            config.validate()?;
            config
        }
        None => state
            .ctx
            .assist
            .synthesize_config(principal.id, &target.url, &target.description)
            .await?
            .into_config(),
    };

    state.ctx.store.update_target_config(target.id, &config).await?;
    // Baseline was cleared; re-track so the next scrape re-establishes it.
    if target.active {
        let mut updated = target;
        updated.config = config.clone();
        state
            .engine
            .track_target(&updated)
            .await
            .map_err(WatcherError::from)?;
    }
    Ok(Json(json!({ "config": config })))
}

#[derive(Debug, Deserialize)]
pub struct VisibilityRequest {
    /// Present = make public under this slug; absent = make private.
    #[serde(default)]
    pub public_slug: Option<String>,
}

pub async fn set_visibility(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<VisibilityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;
    let target = fetch_owned(&state, &principal, id).await?;

    let visibility = match &req.public_slug {
        Some(slug) => Visibility::Public(parse_slug(slug)?),
        None => Visibility::Private,
    };
    state
        .ctx
        .store
        .set_target_visibility(target.id, &visibility)
        .await?;
    Ok(Json(json!({ "visibility": visibility })))
}

#[derive(Debug, Deserialize)]
pub struct FolderAssignRequest {
    #[serde(default)]
    pub folder_id: Option<Uuid>,
}

pub async fn set_folder(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<FolderAssignRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;
    let target = fetch_owned(&state, &principal, id).await?;

    state
        .ctx
        .store
        .set_target_folder(target.id, req.folder_id)
        .await?;
    Ok(Json(json!({ "folder_id": req.folder_id })))
}

pub async fn target_health(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;
    let target = fetch_owned(&state, &principal, id).await?;
    let threshold = state.ctx.config.degraded_threshold;

    Ok(Json(json!({
        "status": target.status(threshold),
        "healthy": target.healthy(threshold),
        "consecutive_errors": target.consecutive_errors,
        "last_error": target.last_error,
        "last_scrape_at": target.last_scrape_at,
    })))
}

pub async fn subscribe(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;
    state.ctx.store.subscribe(principal.id, id).await?;
    Ok(StatusCode::CREATED)
}

pub async fn unsubscribe(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;
    state.ctx.store.unsubscribe(principal.id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn fetch_owned(
    state: &SharedState,
    principal: &watcher_store::Principal,
    target_id: Uuid,
) -> Result<Target, WatcherError> {
    let target = state
        .ctx
        .store
        .get_target(target_id)
        .await?
        .ok_or_else(|| WatcherError::NotFound(format!("target {target_id}")))?;
    require_owner(principal, &target)?;
    Ok(target)
}
