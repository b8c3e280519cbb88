//! REST endpoints: health, conversation management, metrics.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use tether_core::ids::ConversationId;

use crate::auth::RequireBearer;
use crate::state::AppState;

fn bad_request(detail: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, detail.into()).into_response()
}

fn not_found(detail: &str) -> Response {
    (StatusCode::NOT_FOUND, detail.to_owned()).into_response()
}

fn internal(e: impl std::fmt::Display) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

fn parse_id(raw: &str) -> Result<ConversationId, Response> {
    raw.parse().map_err(|e| bad_request(format!("{e}")))
}

/// `GET /health` — liveness, no auth.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// `GET /conversations` — all conversations, most recent first.
pub async fn list_conversations(
    _auth: RequireBearer,
    State(state): State<AppState>,
) -> Result<Json<Value>, Response> {
    let conversations = state.store.list_conversations().map_err(internal)?;
    Ok(Json(json!({ "conversations": conversations })))
}

/// `GET /conversations/{id}/history` — full message history.
pub async fn history(
    _auth: RequireBearer,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Response> {
    let id = parse_id(&id)?;
    if state
        .store
        .get_conversation(&id)
        .map_err(internal)?
        .is_none()
    {
        return Err(not_found("Conversation not found"));
    }
    let history = state.store.history(&id).map_err(internal)?;
    Ok(Json(json!({ "history": history })))
}

/// `DELETE /conversations/{id}` — cancel any in-flight turn, drop gate
/// state, delete metadata and history.
pub async fn delete_conversation(
    _auth: RequireBearer,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Response> {
    let id = parse_id(&id)?;
    state.gate.remove(&id);
    if state.store.delete_conversation(&id).map_err(internal)? {
        Ok(Json(json!({ "deleted": id })))
    } else {
        Err(not_found("Conversation not found"))
    }
}

/// `GET /conversations/active` — ids with a live agent process.
pub async fn active_conversations(
    _auth: RequireBearer,
    State(state): State<AppState>,
) -> Json<Value> {
    Json(json!({ "active_conversation_ids": state.gate.active_conversations() }))
}

/// `GET /metrics` — Prometheus text format, no auth (scrape target).
pub async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}
