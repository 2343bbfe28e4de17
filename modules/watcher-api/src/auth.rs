//! Principal resolution from the opaque bearer token. Session management
//! lives outside the core; the control plane only needs an identity to
//! enforce ownership and audience rules against.

use axum::http::HeaderMap;

use watcher_common::{Target, WatcherError};
use watcher_store::{Principal, Store};

pub async fn authenticate(store: &Store, headers: &HeaderMap) -> Result<Principal, WatcherError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| WatcherError::Unauthorized("missing bearer token".to_string()))?;

    store
        .principal_by_token(token)
        .await?
        .ok_or_else(|| WatcherError::Unauthorized("unknown token".to_string()))
}

/// Owner-only mutation guard.
pub fn require_owner(principal: &Principal, target: &Target) -> Result<(), WatcherError> {
    if target.owner_id != principal.id {
        return Err(WatcherError::Unauthorized(
            "only the owner may do this".to_string(),
        ));
    }
    Ok(())
}
