//! End-to-end test: WebSocket chat against a scripted agent binary,
//! then REST reads of the persisted state.

use std::io::Write;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

use tether_agent::AgentSettings;
use tether_server::{AppState, ServerConfig, app};
use tether_store::ConversationStore;

const TOKEN: &str = "integration-test-token";

/// Shell script standing in for the agent CLI. Records its argv and
/// emits one text delta plus a result line.
fn fake_agent(dir: &tempfile::TempDir) -> (String, std::path::PathBuf) {
    let args_path = dir.path().join("recorded-args.txt");
    let script_path = dir.path().join("fake-agent.sh");
    let mut file = std::fs::File::create(&script_path).unwrap();
    writeln!(
        file,
        "#!/bin/sh\n\
         printf '%s\\n' \"$@\" >> {args}\n\
         printf '{{\"type\":\"content_block_delta\",\"delta\":{{\"type\":\"text_delta\",\"text\":\"hello from agent\"}}}}\\n'\n\
         printf '{{\"type\":\"result\",\"is_error\":false,\"session_id\":\"sess-e2e\"}}\\n'",
        args = args_path.display(),
    )
    .unwrap();
    drop(file);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    (script_path.to_string_lossy().into_owned(), args_path)
}

async fn start_server(binary: String) -> SocketAddr {
    let config = ServerConfig {
        auth_token: TOKEN.into(),
        agent: AgentSettings {
            binary,
            workspace_root: std::env::temp_dir(),
            ..Default::default()
        },
        ..Default::default()
    };
    let state = AppState::new(config, ConversationStore::in_memory().unwrap());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _ = tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });
    addr
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(addr: SocketAddr) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/chat"))
        .await
        .unwrap();
    ws
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

/// Next JSON event, skipping keep-alive pings.
async fn recv_json(ws: &mut WsStream) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = message {
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            if value["type"] != "ping" {
                return value;
            }
        }
    }
}

#[tokio::test]
async fn invalid_token_is_rejected_with_close() {
    let dir = tempfile::tempdir().unwrap();
    let (binary, _) = fake_agent(&dir);
    let addr = start_server(binary).await;

    let mut ws = connect(addr).await;
    send_json(&mut ws, json!({"type": "auth", "token": "wrong"})).await;

    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["detail"], "Invalid token");

    // The server closes after the error.
    loop {
        match tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for close")
        {
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(_)) => break,
        }
    }
}

#[tokio::test]
async fn first_event_must_be_auth() {
    let dir = tempfile::tempdir().unwrap();
    let (binary, _) = fake_agent(&dir);
    let addr = start_server(binary).await;

    let mut ws = connect(addr).await;
    send_json(
        &mut ws,
        json!({"type": "message", "conversation_id": "c1", "text": "hi"}),
    )
    .await;

    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["detail"], "Not authenticated");
}

#[tokio::test]
async fn chat_flow_streams_persists_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let (binary, args_path) = fake_agent(&dir);
    let addr = start_server(binary).await;

    let mut ws = connect(addr).await;
    send_json(&mut ws, json!({"type": "auth", "token": TOKEN})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "auth_ok");

    send_json(
        &mut ws,
        json!({"type": "new_conversation", "conversation_id": "e2e-1", "name": "E2E"}),
    )
    .await;
    let created = recv_json(&mut ws).await;
    assert_eq!(created["type"], "conversation_created");
    assert_eq!(created["conversation_id"], "e2e-1");

    // First message: no stored token, so no --resume.
    send_json(
        &mut ws,
        json!({"type": "message", "conversation_id": "e2e-1", "text": "hello"}),
    )
    .await;

    let mut saw_delta = false;
    loop {
        let event = recv_json(&mut ws).await;
        match event["type"].as_str().unwrap() {
            "text_delta" => {
                assert_eq!(event["text"], "hello from agent");
                assert_eq!(event["conversation_id"], "e2e-1");
                saw_delta = true;
            }
            "message_complete" => {
                assert_eq!(event["session_id"], "sess-e2e");
                break;
            }
            // Auto-title chatter may interleave.
            _ => {}
        }
    }
    assert!(saw_delta);

    // Second message: the stored token must be passed via --resume.
    send_json(
        &mut ws,
        json!({"type": "message", "conversation_id": "e2e-1", "text": "again"}),
    )
    .await;
    loop {
        let event = recv_json(&mut ws).await;
        if event["type"] == "message_complete" {
            break;
        }
    }
    let recorded = std::fs::read_to_string(&args_path).unwrap();
    assert!(recorded.contains("--resume"));
    assert!(recorded.contains("sess-e2e"));

    // REST: history shows the full exchange.
    let client = reqwest::Client::new();
    let history: Value = client
        .get(format!("http://{addr}/conversations/e2e-1/history"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = history["history"].as_array().unwrap();
    assert!(entries.len() >= 4);
    assert_eq!(entries[0]["role"], "user");
    assert_eq!(entries[0]["text"], "hello");
    assert_eq!(entries[1]["role"], "assistant");
    assert_eq!(entries[1]["text"], "hello from agent");

    // REST: the conversation is listed.
    let listed: Value = client
        .get(format!("http://{addr}/conversations"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(
        listed["conversations"]
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c["id"] == "e2e-1")
    );
}

#[tokio::test]
async fn rest_requires_bearer_auth() {
    let dir = tempfile::tempdir().unwrap();
    let (binary, _) = fake_agent(&dir);
    let addr = start_server(binary).await;
    let client = reqwest::Client::new();

    // Health is open.
    let health = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);

    // Conversation endpoints are not.
    let missing = client
        .get(format!("http://{addr}/conversations"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 401);

    let wrong = client
        .get(format!("http://{addr}/conversations"))
        .bearer_auth("nope")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 403);
}

#[tokio::test]
async fn delete_conversation_via_rest() {
    let dir = tempfile::tempdir().unwrap();
    let (binary, _) = fake_agent(&dir);
    let addr = start_server(binary).await;

    let mut ws = connect(addr).await;
    send_json(&mut ws, json!({"type": "auth", "token": TOKEN})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "auth_ok");
    send_json(
        &mut ws,
        json!({"type": "new_conversation", "conversation_id": "gone-1", "name": "Doomed"}),
    )
    .await;
    assert_eq!(recv_json(&mut ws).await["type"], "conversation_created");

    let client = reqwest::Client::new();
    let deleted = client
        .delete(format!("http://{addr}/conversations/gone-1"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 200);

    let again = client
        .delete(format!("http://{addr}/conversations/gone-1"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 404);
}
