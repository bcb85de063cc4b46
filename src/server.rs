//! HTTP API server
use crate::commands::{chat, documents};
use crate::config::Config;
use crate::db::Database;
use crate::error::AppError;
use crate::llm::OpenAiClient;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared by every handler. Holds no open connection: each request opens its own.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub llm: OpenAiClient,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, AppError> {
        config.ensure_dirs()?;
        let db = Database::new(&config.database_path())?;
        let llm = OpenAiClient::new(config.llm.clone())?;
        Ok(Self {
            config: Arc::new(config),
            db,
            llm,
        })
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/api/upload-pdf", post(documents::upload_pdf))
        .route("/api/chat", post(chat::chat))
        .route("/api/history", get(chat::history))
        .route("/api/sessions/:id", delete(chat::delete_session))
        .route("/api/documents", get(documents::list_documents))
        .route("/api/documents/:id", delete(documents::delete_document))
        .route("/api/documents/:id/pages", get(documents::document_pages))
        .route("/api/image/:document_id/:image_name", get(documents::image))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState) -> Result<(), AppError> {
    let addr = state.config.bind_addr;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
