//! Folder CRUD. Folders are per-owner organization only; deleting one
//! detaches its targets.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use watcher_common::WatcherError;

use crate::auth::authenticate;
use crate::error::ApiError;
use crate::SharedState;

#[derive(Debug, Deserialize)]
pub struct FolderRequest {
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
}

pub async fn create_folder(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<FolderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;
    let folder = state
        .ctx
        .store
        .create_folder(principal.id, &req.name, req.parent_id)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "folder": folder }))))
}

pub async fn list_folders(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;
    let folders = state.ctx.store.list_folders(principal.id).await?;
    Ok(Json(json!({ "folders": folders })))
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

pub async fn rename_folder(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<RenameRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;
    require_folder_owner(&state, principal.id, id).await?;
    state.ctx.store.rename_folder(id, &req.name).await?;
    Ok(Json(json!({ "renamed": true })))
}

pub async fn delete_folder(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state.ctx.store, &headers).await?;
    require_folder_owner(&state, principal.id, id).await?;
    state.ctx.store.delete_folder(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn require_folder_owner(
    state: &SharedState,
    principal_id: Uuid,
    folder_id: Uuid,
) -> Result<(), WatcherError> {
    let folders = state.ctx.store.list_folders(principal_id).await?;
    if !folders.iter().any(|f| f.id == folder_id) {
        return Err(WatcherError::NotFound(format!("folder {folder_id}")));
    }
    Ok(())
}
