//! Control plane: target admission and lifecycle, manual refresh, feeds,
//! read/star/subscription state, and health, all over the shared engine
//! context. Authentication here is deliberately thin (opaque bearer
//! tokens); real session management is an outer concern.

pub mod auth;
pub mod error;
pub mod events;
pub mod feeds;
pub mod folders;
pub mod targets;

use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use watcher_engine::{AppContext, EngineHandle};

pub struct AppState {
    pub ctx: Arc<AppContext>,
    pub engine: EngineHandle,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Liveness
        .route("/", get(|| async { "ok" }))
        // Targets
        .route("/targets", post(targets::create_target).get(targets::list_targets))
        .route("/targets/preview", post(targets::preview_config))
        .route(
            "/targets/{id}",
            get(targets::get_target).delete(targets::delete_target),
        )
        .route("/targets/{id}/refresh", post(targets::refresh_target))
        .route("/targets/{id}/pause", post(targets::pause_target))
        .route("/targets/{id}/resume", post(targets::resume_target))
        .route("/targets/{id}/config", put(targets::update_config))
        .route("/targets/{id}/visibility", put(targets::set_visibility))
        .route("/targets/{id}/folder", put(targets::set_folder))
        .route("/targets/{id}/health", get(targets::target_health))
        .route(
            "/targets/{id}/subscribe",
            post(targets::subscribe).delete(targets::unsubscribe),
        )
        // Events and read state
        .route("/targets/{id}/events", get(events::list_events))
        .route("/events/{id}/read", post(events::mark_read))
        .route("/events/{id}/star", post(events::toggle_star))
        .route("/unread", get(events::unread_counts))
        // Folders
        .route("/folders", post(folders::create_folder).get(folders::list_folders))
        .route(
            "/folders/{id}",
            put(folders::rename_folder).delete(folders::delete_folder),
        )
        // Feeds
        .route("/feeds/private/{target_id}", get(feeds::private_feed))
        .route("/feeds/public/{slug}", get(feeds::public_feed))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub type SharedState = Arc<AppState>;
