//! WebSocket endpoint: auth handshake, ping loop, event dispatch.
//!
//! The receive loop must never block behind a turn: `message` events are
//! dispatched as detached tasks so cancels and other conversations'
//! messages keep flowing while a long turn streams.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use tether_agent::MessageRequest;
use tether_core::events::{ClientEvent, ServerEvent};
use tether_store::CreateConversationOptions;

use crate::auth;
use crate::state::AppState;
use crate::ws::connection::{ClientConnection, OUTBOUND_BUFFER};

/// Keep-alive cadence; dead clients stop answering within two probes.
const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Close code for failed handshakes.
const CLOSE_POLICY_VIOLATION: u16 = 4001;

/// Tools clients may grant. Wildcarded externals are configured
/// server-side, never granted from the wire.
const VALID_TOOL_NAMES: &[&str] = &[
    "Read", "Write", "Edit", "Bash", "Glob", "Grep", "WebSearch", "WebFetch",
];

static TOOL_SPEC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z_]+)(\(.+\))?$").expect("tool spec regex"));

/// Validate a tool spec like `Bash` or `Bash(git:*)`.
fn valid_tool_spec(spec: &str) -> bool {
    TOOL_SPEC_RE
        .captures(spec)
        .and_then(|c| c.get(1))
        .is_some_and(|base| VALID_TOOL_NAMES.contains(&base.as_str()))
}

/// `/ws/chat` upgrade handler.
pub async fn ws_chat(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    counter!("ws_connections_total").increment(1);
    let (mut ws_tx, mut ws_rx) = socket.split();

    // The first event on a connection must be a valid auth.
    let rejection = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(raw))) => {
                match serde_json::from_str::<ClientEvent>(raw.as_str()) {
                    Ok(ClientEvent::Auth { token }) if auth::verify_token(&state, &token) => {
                        break None;
                    }
                    Ok(ClientEvent::Auth { .. }) => break Some("Invalid token"),
                    Ok(_) | Err(_) => break Some("Not authenticated"),
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            _ => return,
        }
    };
    if let Some(reason) = rejection {
        let _ = ws_tx
            .send(Message::Text(
                serde_json::to_string(&ServerEvent::error(reason)).unwrap_or_default().into(),
            ))
            .await;
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_POLICY_VIOLATION,
                reason: reason.into(),
            })))
            .await;
        return;
    }

    let (tx, mut rx) = mpsc::channel::<Arc<String>>(OUTBOUND_BUFFER);
    let conn = Arc::new(ClientConnection::new(
        uuid::Uuid::now_v7().to_string(),
        tx,
    ));
    let _ = conn.send_event(&ServerEvent::AuthOk);
    state.broadcast.add(Arc::clone(&conn));
    info!(conn_id = %conn.id, "client authenticated");

    // Writer: drain the bounded channel into the socket.
    let writer = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_tx
                .send(Message::Text(payload.as_str().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Keep-alive probes; a full channel just skips a beat.
    let ping_conn = Arc::clone(&conn);
    let ping = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let _ = ping_conn.send_event(&ServerEvent::Ping);
        }
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(raw)) => match serde_json::from_str::<ClientEvent>(raw.as_str()) {
                Ok(event) => dispatch_event(&state, &conn, event),
                Err(e) => {
                    debug!(conn_id = %conn.id, error = %e, "unrecognized client event");
                    let _ = conn.send_event(&ServerEvent::error(format!(
                        "unrecognized event: {e}"
                    )));
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    info!(conn_id = %conn.id, "client disconnected");
    state.broadcast.remove(&conn.id);
    ping.abort();
    writer.abort();
}

/// Handle one authenticated client event.
///
/// Direct acknowledgements go to the requesting connection; everything a
/// turn produces goes through the broadcast sink.
pub(crate) fn dispatch_event(state: &AppState, conn: &ClientConnection, event: ClientEvent) {
    match event {
        // Re-auth on an authenticated connection is a harmless ack.
        ClientEvent::Auth { .. } => {
            let _ = conn.send_event(&ServerEvent::AuthOk);
        }
        ClientEvent::Pong => {}

        ClientEvent::Message {
            conversation_id,
            text,
            session_id,
            image_paths,
        } => {
            let runner = Arc::clone(&state.runner);
            let _ = tokio::spawn(async move {
                runner
                    .handle_message(MessageRequest {
                        conversation_id,
                        text,
                        session_id,
                        image_paths,
                    })
                    .await;
            });
        }

        ClientEvent::NewConversation {
            conversation_id,
            name,
            working_dir,
            allowed_tools,
        } => {
            let result = state.store.create_conversation(
                &conversation_id,
                &CreateConversationOptions {
                    name: &name,
                    working_dir: working_dir.as_deref(),
                    allowed_tools: allowed_tools.as_deref(),
                },
            );
            match result {
                Ok(row) => {
                    info!(conversation_id = %row.id, name = %row.name, "conversation created");
                    let _ = conn.send_event(&ServerEvent::ConversationCreated {
                        conversation_id: row.id,
                        name: row.name,
                    });
                }
                Err(e) => {
                    let _ = conn.send_event(&ServerEvent::error_for(
                        conversation_id,
                        e.to_string(),
                    ));
                }
            }
        }

        ClientEvent::UpdatePermissions {
            conversation_id,
            allowed_tools,
        } => {
            let invalid: Vec<&str> = allowed_tools
                .iter()
                .filter(|spec| !valid_tool_spec(spec))
                .map(String::as_str)
                .collect();
            if !invalid.is_empty() {
                let _ = conn.send_event(&ServerEvent::error_for(
                    conversation_id,
                    format!("invalid tools: {invalid:?}"),
                ));
                return;
            }
            match state
                .store
                .update_allowed_tools(&conversation_id, &allowed_tools)
            {
                Ok(true) => {
                    let _ = conn.send_event(&ServerEvent::PermissionsUpdated {
                        conversation_id,
                        allowed_tools,
                    });
                }
                Ok(false) => {
                    let _ = conn.send_event(&ServerEvent::error_for(
                        conversation_id,
                        "conversation not found",
                    ));
                }
                Err(e) => {
                    let _ = conn.send_event(&ServerEvent::error_for(
                        conversation_id,
                        e.to_string(),
                    ));
                }
            }
        }

        ClientEvent::Cancel { conversation_id } => match conversation_id {
            Some(id) => {
                // The cancelled turn itself broadcasts the `cancelled`
                // terminal event; only the failure needs a direct reply.
                if !state.gate.cancel(&id) {
                    let _ = conn.send_event(&ServerEvent::error_for(
                        id,
                        "no active process for this conversation",
                    ));
                }
            }
            None => {
                let active = state.gate.active_conversations();
                if active.is_empty() {
                    let _ = conn.send_event(&ServerEvent::error("no active process to cancel"));
                }
                for id in active {
                    let _ = state.gate.cancel(&id);
                }
            }
        },
    }
}
