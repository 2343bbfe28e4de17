use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use watcher_api::{router, AppState};
use watcher_common::Config;
use watcher_engine::{AppContext, Engine};
use watcher_store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("watcher=info".parse()?))
        .init();

    let config = Config::from_env();
    config.log_redacted();

    let store = Store::connect(&config.database_url).await?;
    store.migrate().await?;

    let host = config.web_host.clone();
    let port = config.web_port;

    let ctx = AppContext::new(config, store);
    let engine = Engine::start(Arc::clone(&ctx)).await?;

    let state = Arc::new(AppState { ctx, engine });
    let app = router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "control plane listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
