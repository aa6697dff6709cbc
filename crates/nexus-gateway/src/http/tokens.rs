use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

#[derive(Deserialize)]
pub struct CurrentWindowQuery {
    #[serde(rename = "accountId")]
    account_id: String,
    window: Option<i64>,
}

/// GET /api/token-usage/current?accountId=&window= — rolling-window totals (C8, spec §6).
pub async fn handle_current_window(
    State(state): State<Arc<AppState>>,
    Query(q): Query<CurrentWindowQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let window_minutes = q.window.unwrap_or(state.config.tokens.window_minutes);
    let usage = state.reader.current_window(&q.account_id, window_minutes).map_err(|e| {
        (
            StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(json!({ "error": { "type": e.code(), "message": e.to_string() } })),
        )
    })?;

    Ok(Json(json!({
        "input": usage.input_tokens,
        "output": usage.output_tokens,
        "total": usage.total(),
    })))
}

#[derive(Deserialize)]
pub struct DailyQuery {
    #[serde(rename = "accountId")]
    account_id: String,
    days: Option<i64>,
}

/// GET /api/token-usage/daily?accountId=&days= — per-day series (C8, spec §6).
pub async fn handle_daily(
    State(state): State<Arc<AppState>>,
    Query(q): Query<DailyQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let days = q.days.unwrap_or(30);
    let series = state.reader.daily(&q.account_id, days).map_err(|e| {
        (
            StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(json!({ "error": { "type": e.code(), "message": e.to_string() } })),
        )
    })?;

    Ok(Json(json!(series)))
}
