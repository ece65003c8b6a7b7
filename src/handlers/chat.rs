use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::models::{normalize_user_id, ConversationContext};
use crate::services::conversation;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub context: serde_json::Value,
    pub user_id: String,
}

fn context_summary(ctx: &ConversationContext) -> serde_json::Value {
    serde_json::json!({
        "stage": ctx.stage.as_str(),
        "slots": ctx.slots,
        "appointment_id": ctx.appointment_id,
        "history_len": ctx.history.len(),
    })
}

// POST /api/chat — direct conversation access without the Twilio leg.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    if req.user_id.trim().is_empty() {
        return Err(AppError::InvalidInput("user_id must not be empty".into()));
    }
    if req.message.trim().is_empty() {
        return Err(AppError::InvalidInput("message must not be empty".into()));
    }

    let response = conversation::process_message(&state, &req.user_id, req.message.trim(), None)
        .await
        .map_err(AppError::Internal)?;

    let user_id = normalize_user_id(&req.user_id);
    let context = state
        .store
        .get(&user_id)?
        .map(|ctx| context_summary(&ctx))
        .unwrap_or(serde_json::Value::Null);

    Ok(Json(ChatResponse {
        response,
        context,
        user_id,
    }))
}

// GET /api/context/:user_id
pub async fn get_context(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<ConversationContext>, AppError> {
    let user_id = normalize_user_id(&user_id);
    match state.store.get(&user_id)? {
        Some(ctx) => Ok(Json(ctx)),
        None => Err(AppError::NotFound(format!(
            "no conversation for user {user_id}"
        ))),
    }
}

// POST /api/context/:user_id/reset
pub async fn reset_context(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let user_id = normalize_user_id(&user_id);

    // Serialize against in-flight turns for the same user.
    let lock = state.user_lock(&user_id);
    let _guard = lock.lock().await;

    if !state.store.reset(&user_id, true)? {
        return Err(AppError::NotFound(format!(
            "no conversation for user {user_id}"
        )));
    }

    Ok(Json(serde_json::json!({
        "message": "Your conversation has been reset. How can I help you today?",
        "user_id": user_id,
    })))
}
