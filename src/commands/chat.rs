use crate::annotator;
use crate::context;
use crate::db::models::Role;
use crate::error::AppError;
use crate::server::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Characters of the first message used as the session title.
const TITLE_CHARS: usize = 50;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    pub message: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub response: String,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub session_id: Option<String>,
}

fn session_title(message: &str) -> String {
    message.trim().chars().take(TITLE_CHARS).collect()
}

/// `POST /api/chat`
pub async fn chat(
    State(state): State<AppState>,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Json<ChatReply>, AppError> {
    let Json(body) = body.map_err(|e| AppError::Validation(e.body_text()))?;
    let message = body
        .message
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| AppError::Validation("A message is required".into()))?;

    send_message(&state, &message, body.session_id.as_deref())
        .await
        .map(Json)
}

/// One chat turn: persist the user message, assemble context, call the
/// model, annotate the reply and persist it.
///
/// API-level failures become the visible reply. Transport failures abort the
/// turn; the user message stays stored.
pub async fn send_message(
    state: &AppState,
    content: &str,
    session_id: Option<&str>,
) -> Result<ChatReply, AppError> {
    let store = state.db.open()?;

    // 1. Resolve or lazily create the session
    let session_id = match session_id {
        Some(id) => store
            .get_session(id)?
            .ok_or_else(|| AppError::NotFound(format!("Session not found: {}", id)))?
            .id,
        None => store.create_session(&session_title(content))?.id,
    };

    // 2. Save user message and build the turns
    let ctx = context::assemble(&store, &session_id, content)?;

    // 3. Call the model
    let raw = match state.llm.complete(&ctx.turns).await {
        Ok(text) => text,
        Err(e) => match e.as_reply() {
            Some(reply) => {
                tracing::warn!(session_id = %session_id, error = %e, "completion API error returned to user");
                reply
            }
            None => return Err(e.into()),
        },
    };

    // 4. Inline page images and save the assistant message
    let response = annotator::annotate(&raw, &ctx.catalog);
    store.add_message(&session_id, Role::Assistant, &response)?;

    tracing::info!(session_id = %session_id, reply_chars = response.chars().count(), "chat turn completed");
    Ok(ChatReply {
        response,
        session_id,
    })
}

/// `GET /api/history` — messages of one session, or every session.
pub async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, AppError> {
    let store = state.db.open()?;
    match query.session_id.filter(|id| !id.is_empty()) {
        Some(id) => Ok(Json(json!({ "messages": store.get_messages(&id)? }))),
        None => Ok(Json(json!({ "sessions": store.list_sessions()? }))),
    }
}

/// `DELETE /api/sessions/{id}`
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let store = state.db.open()?;
    if store.delete_session(&id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Session not found: {}", id)))
    }
}
