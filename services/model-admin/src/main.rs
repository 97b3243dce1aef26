mod config;
mod state;
mod routes_models;
mod routes_settings;
mod routes_downloads;
mod routes_ws;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::AppConfig;
use crate::state::{AppState, SharedState};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = AppConfig::from_env()?;
    info!(models_dir=%cfg.models_dir.display(), registry=%cfg.registry_path.display(), "model-admin: config loaded");

    let st: SharedState = Arc::new(AppState::new(cfg));

    // Pick up models copied into the models dir while we were down
    let added = st.scanner.discover(&st.registry).await;
    info!(added = added.len(), "startup discovery done");
    st.activation.sync_from_registry().await;

    let app = router(st.clone());

    let addr = &st.cfg.bind_addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("model-admin listening on http://{addr}");

    let downloads = st.downloads.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl_c handler failed: {e}");
            }
            info!("model-admin: shutting down, cancelling downloads");
            downloads.cancel_all().await;
        })
        .await
        .context("server error")?;

    Ok(())
}

fn router(st: SharedState) -> Router {
    use crate::routes_downloads::*;
    use crate::routes_models::*;
    use crate::routes_settings::*;

    let max_upload = st.cfg.max_upload_bytes;

    Router::new()
        .route("/health", get(|| async { Json(serde_json::json!({"status": "ok"})) }))
        .route("/api/v1/models", get(get_models))
        .route("/api/v1/models/search", get(get_search))
        .route(
            "/api/v1/models/upload",
            post(post_upload).layer(DefaultBodyLimit::max(max_upload)),
        )
        .route("/api/v1/models/scan", post(post_scan))
        .route("/api/v1/models/installed", get(get_installed))
        .route("/api/v1/models/settings/:backend", get(get_settings).put(put_settings))
        .route("/api/v1/models/overrides", get(get_overrides).post(post_overrides))
        .route("/api/v1/models/download", post(post_download))
        .route("/api/v1/models/downloads", get(get_downloads))
        .route("/api/v1/models/downloads/:task_id", get(get_download))
        .route("/api/v1/models/downloads/:task_id/cancel", post(post_cancel))
        .route("/api/v1/models/download-progress", get(get_download_progress))
        .route("/api/v1/models/activate", post(post_activate))
        .route("/api/v1/models/activation/:backend", get(get_activation))
        .route("/api/v1/models/delete", post(post_delete))
        .route("/api/v1/models/config", axum::routing::put(put_config))
        .route(
            "/api/v1/models/registry-settings",
            get(get_registry_settings).put(put_registry_settings),
        )
        .route("/api/v1/models/estimate-memory", post(post_estimate_memory))
        .route("/ws", get(crate::routes_ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(st)
}
