use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::state::AppState;

fn check_auth(headers: &HeaderMap, expected_token: &str) -> Result<(), AppError> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or("");
    if token.is_empty() || token != expected_token {
        return Err(AppError::Unauthorized);
    }
    Ok(())
}

#[derive(Deserialize, Default)]
pub struct CleanupRequest {
    pub days: Option<i64>,
}

#[derive(Serialize)]
pub struct CleanupResponse {
    pub purged: usize,
    pub days: i64,
}

// POST /api/admin/cleanup — purge contexts inactive for `days` (default TTL).
pub async fn cleanup(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CleanupRequest>,
) -> Result<Json<CleanupResponse>, AppError> {
    check_auth(&headers, &state.config.admin_token)?;

    let days = req.days.unwrap_or(state.config.context_ttl_days);
    if days <= 0 {
        return Err(AppError::InvalidInput(
            "days must be a positive number".into(),
        ));
    }

    let cutoff = Utc::now().naive_utc() - Duration::days(days);
    let purged = state.store.sweep(cutoff)?;
    tracing::info!(purged, days, "admin cleanup");

    Ok(Json(CleanupResponse { purged, days }))
}
