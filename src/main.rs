mod aggregator;
mod artifacts;
mod config;
mod errors;
mod models;
mod openai;
mod routes;
mod service;
mod session;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::{routing::get, routing::post, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::artifacts::ArtifactCache;
use crate::config::Settings;
use crate::openai::OpenAiClient;
use crate::routes::api_routes::{health_handler, list_turns_handler, upload_datasets_handler};
use crate::routes::page_routes::{app_js, index_handler, session_handler, style_css};
use crate::routes::ws_routes::ws_chat_handler;
use crate::service::analysis_service::AnalysisService;
use crate::session::SessionStore;

const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dice=debug,tower_http=debug".into()),
        )
        .init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let settings = Settings::from_env()?;
    tokio::fs::create_dir_all(&settings.artifacts_dir).await?;

    // ── Dependency wiring ─────────────────────────────────────────────────────
    let backend = Arc::new(OpenAiClient::new(&settings)?);
    let artifacts = Arc::new(ArtifactCache::new(
        backend.clone(),
        settings.artifacts_dir.clone(),
    ));
    let store = SessionStore::new();
    let service = AnalysisService::new(
        store,
        backend,
        artifacts,
        settings.assistant_id.clone(),
        settings.stream_idle_timeout,
    );

    // ── Router ────────────────────────────────────────────────────────────────
    let app = Router::new()
        // Page routes
        .route("/", get(index_handler))
        .route("/session/{id}", get(session_handler))
        .route("/static/app.js", get(app_js))
        .route("/static/style.css", get(style_css))
        // API routes
        .route("/api/sessions/{id}/datasets", post(upload_datasets_handler))
        .route("/api/sessions/{id}/turns", get(list_turns_handler))
        .route("/health", get(health_handler))
        // WebSocket streaming
        .route("/ws/chat", get(ws_chat_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service);

    // ── Listen ────────────────────────────────────────────────────────────────
    let addr = format!("0.0.0.0:{}", settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{addr}/");

    axum::serve(listener, app).await?;
    Ok(())
}
