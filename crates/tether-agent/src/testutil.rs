//! Test doubles shared across the crate's test modules.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use tether_core::events::ServerEvent;
use tether_core::ids::ConversationId;

use crate::errors::LaunchError;
use crate::launcher::{AgentLauncher, LaunchedTurn, ProcessControl, TurnExit, TurnRequest};
use crate::sink::EventSink;

/// Builds a stream-json text delta line.
pub fn text_line(text: &str) -> String {
    serde_json::json!({
        "type": "content_block_delta",
        "delta": {"type": "text_delta", "text": text},
    })
    .to_string()
}

/// Builds a successful terminal result line.
pub fn result_line(session_id: &str) -> String {
    serde_json::json!({
        "type": "result", "is_error": false, "session_id": session_id,
    })
    .to_string()
}

/// Builds the stale-resume error result the agent emits for dead tokens.
pub fn stale_result_line(token: &str) -> String {
    serde_json::json!({
        "type": "result", "is_error": true,
        "result": format!("No conversation found with session ID: {token}"),
    })
    .to_string()
}

/// Sink recording every event it sees.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ServerEvent>>,
}

impl RecordingSink {
    /// All recorded events.
    pub fn events(&self) -> Vec<ServerEvent> {
        self.events.lock().clone()
    }

    /// Wire type strings of the recorded events, in order.
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(ServerEvent::event_type).collect()
    }
}

impl EventSink for RecordingSink {
    fn send(&self, event: &ServerEvent) {
        self.events.lock().push(event.clone());
    }
}

/// One scripted process run.
struct ScriptedRun {
    lines: Vec<String>,
    exit: TurnExit,
    /// Keep the stream open after the lines until terminated.
    hang: bool,
}

/// Launcher yielding pre-scripted runs, keyed per conversation.
#[derive(Default)]
pub struct ScriptedLauncher {
    runs: Mutex<HashMap<ConversationId, VecDeque<ScriptedRun>>>,
    requests: Mutex<Vec<TurnRequest>>,
    oneshot_prompts: Mutex<Vec<String>>,
    oneshot_reply: Mutex<Option<String>>,
}

impl ScriptedLauncher {
    /// Queue a run for a conversation.
    pub fn push_run(&self, id: &ConversationId, lines: Vec<String>, exit: TurnExit, hang: bool) {
        self.runs
            .lock()
            .entry(id.clone())
            .or_default()
            .push_back(ScriptedRun { lines, exit, hang });
    }

    /// Every `TurnRequest` this launcher has seen.
    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().clone()
    }

    /// Prompts passed to `oneshot`.
    pub fn oneshot_prompts(&self) -> Vec<String> {
        self.oneshot_prompts.lock().clone()
    }

    /// Set the reply for future `oneshot` calls (None = timeout).
    pub fn set_oneshot_reply(&self, reply: Option<&str>) {
        *self.oneshot_reply.lock() = reply.map(str::to_owned);
    }
}

#[async_trait]
impl AgentLauncher for ScriptedLauncher {
    async fn launch(&self, request: &TurnRequest) -> Result<LaunchedTurn, LaunchError> {
        self.requests.lock().push(request.clone());
        let run = self
            .runs
            .lock()
            .get_mut(&request.conversation_id)
            .and_then(VecDeque::pop_front);
        let Some(run) = run else {
            return Err(LaunchError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no scripted run queued",
            )));
        };
        Ok(scripted_turn(run))
    }

    async fn oneshot(
        &self,
        prompt: &str,
        timeout: std::time::Duration,
    ) -> Result<String, LaunchError> {
        self.oneshot_prompts.lock().push(prompt.to_owned());
        self.oneshot_reply
            .lock()
            .clone()
            .ok_or(LaunchError::Timeout(timeout))
    }
}

fn scripted_turn(run: ScriptedRun) -> LaunchedTurn {
    let term = CancellationToken::new();
    let control = Arc::new(ScriptedControl {
        exit: Mutex::new(run.exit),
        term: term.clone(),
        terminated: AtomicBool::new(false),
    });
    let lines = run.lines;
    let hang = run.hang;
    let stream = async_stream::stream! {
        for line in lines {
            yield Ok::<String, LaunchError>(line);
        }
        if hang {
            term.cancelled().await;
        }
    };
    LaunchedTurn {
        lines: Box::pin(stream),
        control,
    }
}

struct ScriptedControl {
    exit: Mutex<TurnExit>,
    term: CancellationToken,
    terminated: AtomicBool,
}

#[async_trait]
impl ProcessControl for ScriptedControl {
    async fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.term.cancel();
    }

    async fn finish(&self) -> TurnExit {
        if self.terminated.load(Ordering::SeqCst) {
            TurnExit::Terminated
        } else {
            self.exit.lock().clone()
        }
    }
}
