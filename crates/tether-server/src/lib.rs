//! # tether-server
//!
//! The network face of the Tether bridge: an axum application exposing
//! the `/ws/chat` WebSocket endpoint for streaming conversations and a
//! small bearer-authenticated REST surface for conversation management,
//! plus `/metrics` for Prometheus.
//!
//! The turn runner is wired to the WebSocket layer through
//! [`ws::broadcast::BroadcastSink`], which fans every event out to all
//! authenticated connections without ever blocking a turn.

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod metrics;
pub mod rest;
pub mod state;
pub mod ws;

use axum::Router;
use axum::routing::{delete, get};
use tower_http::trace::TraceLayer;

pub use config::ServerConfig;
pub use state::AppState;

/// Build the complete axum application.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(rest::health))
        .route("/conversations", get(rest::list_conversations))
        .route("/conversations/active", get(rest::active_conversations))
        .route("/conversations/{id}", delete(rest::delete_conversation))
        .route("/conversations/{id}/history", get(rest::history))
        .route("/metrics", get(rest::metrics))
        .route("/ws/chat", get(ws::handler::ws_chat))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
