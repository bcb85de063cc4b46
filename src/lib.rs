pub mod annotator;
pub mod commands;
pub mod config;
pub mod context;
pub mod db;
pub mod doc_processor;
pub mod error;
pub mod llm;
pub mod server;

use config::Config;
use error::AppError;
use server::AppState;

/// Load configuration, open the store and serve the API until shutdown.
pub async fn run() -> Result<(), AppError> {
    let config = Config::from_env()?;
    tracing::info!(data_dir = %config.data_dir.display(), model = %config.llm.model, "starting pdf-chat");
    let state = AppState::new(config)?;
    server::serve(state).await
}
