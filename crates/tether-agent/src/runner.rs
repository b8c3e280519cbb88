//! End-to-end turn execution.
//!
//! One `TurnRunner::handle_message` call takes an inbound message through
//! the whole per-turn state machine: persist the user's words, acquire
//! the conversation gate, drive the resume controller, stream normalized
//! events to the sink, persist the assistant's output, and finish with
//! exactly one terminal event — `message_complete`, `cancelled`, `busy`,
//! or `error`. Never silence.
//!
//! Client connections are irrelevant to turn progress: a turn started is
//! a turn finished and persisted, whether or not anyone is listening.
//! Only an explicit cancel or a superseding message stops it.

use std::path::PathBuf;
use std::sync::Arc;

use metrics::counter;
use tracing::{info, instrument, warn};

use tether_core::events::ServerEvent;
use tether_core::ids::ConversationId;
use tether_core::text::clip;
use tether_store::{ConversationStore, CreateConversationOptions};

use crate::errors::TurnError;
use crate::gate::{ConversationGate, GateError};
use crate::launcher::{AgentLauncher, TurnRequest};
use crate::resume::{ResumeController, TurnOutcome};
use crate::settings::AgentSettings;
use crate::sink::EventSink;
use crate::title::spawn_title_task;

/// Auto-created conversations are named from the message prefix.
const AUTO_NAME_MAX: usize = 50;

/// An inbound `message` event, ready to run.
#[derive(Clone, Debug)]
pub struct MessageRequest {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Message text (may be empty when only images are attached).
    pub text: String,
    /// Explicit resume token override.
    pub session_id: Option<String>,
    /// Attached image paths.
    pub image_paths: Vec<String>,
}

/// The per-turn orchestrator.
pub struct TurnRunner {
    settings: Arc<AgentSettings>,
    gate: Arc<ConversationGate>,
    store: Arc<ConversationStore>,
    launcher: Arc<dyn AgentLauncher>,
    sink: Arc<dyn EventSink>,
}

impl TurnRunner {
    /// Assemble a runner from its collaborators.
    #[must_use]
    pub fn new(
        settings: Arc<AgentSettings>,
        gate: Arc<ConversationGate>,
        store: Arc<ConversationStore>,
        launcher: Arc<dyn AgentLauncher>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            settings,
            gate,
            store,
            launcher,
            sink,
        }
    }

    /// The conversation gate (cancel/supersede entry points).
    #[must_use]
    pub fn gate(&self) -> &Arc<ConversationGate> {
        &self.gate
    }

    /// Run one message to its terminal event. Infallible from the
    /// caller's perspective; every failure becomes an `error` event.
    #[instrument(skip(self, msg), fields(conversation_id = %msg.conversation_id))]
    pub async fn handle_message(&self, msg: MessageRequest) {
        let id = msg.conversation_id.clone();
        if let Err(e) = self.run(msg).await {
            warn!(conversation_id = %id, error = %e, "turn failed");
            counter!("agent_turns_total", "outcome" => "failed").increment(1);
            self.sink.send(&ServerEvent::error_for(id, e.to_string()));
        }
    }

    async fn run(&self, msg: MessageRequest) -> Result<(), TurnError> {
        let id = msg.conversation_id.clone();

        if msg.text.is_empty() && msg.image_paths.is_empty() {
            self.sink
                .send(&ServerEvent::error_for(id, "empty message"));
            return Ok(());
        }

        // Persist the user's words before anything can fail: input is
        // never lost even when the agent is.
        let conversation = match self.store.get_conversation(&id)? {
            Some(existing) => existing,
            None => self.store.create_conversation(&id, &CreateConversationOptions {
                name: auto_name(&msg.text),
                ..Default::default()
            })?,
        };
        let user_text = if msg.text.is_empty() {
            "[image]"
        } else {
            msg.text.as_str()
        };
        self.store.append_user_turn(&id, user_text)?;

        // A newer message takes over a mid-turn conversation: cancel its
        // process (that conversation only), then wait for the lock.
        self.gate.supersede(&id);
        let permit = match self.gate.acquire(&id).await {
            Ok(permit) => permit,
            Err(GateError::Busy) => {
                counter!("agent_turns_total", "outcome" => "busy").increment(1);
                self.sink.send(&ServerEvent::Busy {
                    conversation_id: id,
                    detail: "conversation is still finishing".into(),
                });
                return Ok(());
            }
        };

        let prior_token = msg
            .session_id
            .clone()
            .or_else(|| conversation.resume_token.clone());
        let first_turn = prior_token.is_none();
        let working_dir = conversation
            .working_dir
            .as_ref()
            .map_or_else(|| self.settings.workspace_root.clone(), PathBuf::from);

        let request = TurnRequest {
            conversation_id: id.clone(),
            prompt: build_prompt(&msg.text, &msg.image_paths),
            resume_token: prior_token.clone(),
            working_dir,
            allowed_tools: self
                .settings
                .effective_tools(conversation.allowed_tools.as_deref()),
            max_turns: self.settings.max_turns,
        };

        let controller = ResumeController::new(&*self.launcher, &self.store, &self.settings);
        let finished = controller.run(request, &permit, &*self.sink).await?;

        // Persist whatever the agent produced, including partial output
        // from cancelled or failed turns.
        for record in &finished.turn.records {
            self.store
                .append_assistant_segment(&id, &record.segment, &record.image_paths)?;
        }

        match finished.outcome {
            TurnOutcome::Cancelled => {
                counter!("agent_turns_total", "outcome" => "cancelled").increment(1);
                info!(conversation_id = %id, "turn cancelled");
                self.sink.send(&ServerEvent::Cancelled {
                    conversation_id: id,
                });
            }
            TurnOutcome::Failed { detail } => {
                counter!("agent_turns_total", "outcome" => "failed").increment(1);
                warn!(conversation_id = %id, detail, "turn failed");
                self.sink.send(&ServerEvent::error_for(id, detail));
            }
            TurnOutcome::Completed => {
                counter!("agent_turns_total", "outcome" => "completed").increment(1);
                // An omitted token falls back to the one we resumed from,
                // unless recovery proved that one dead.
                let session_id = finished.turn.session_id.clone().or_else(|| {
                    if finished.retried_fresh {
                        None
                    } else {
                        prior_token
                    }
                });
                match session_id {
                    Some(token) => {
                        let _ = self.store.set_resume_token(&id, &token)?;
                        self.sink.send(&ServerEvent::MessageComplete {
                            conversation_id: id.clone(),
                            session_id: Some(token),
                        });
                        if first_turn {
                            // Detached and outside the lock; its failure
                            // is silent.
                            let _ = spawn_title_task(
                                Arc::clone(&self.launcher),
                                Arc::clone(&self.store),
                                Arc::clone(&self.sink),
                                id,
                                msg.text.clone(),
                                self.settings.title_timeout(),
                            );
                        }
                    }
                    None => {
                        self.sink.send(&ServerEvent::error_for(
                            id,
                            "agent completed without reporting a session id",
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Display name for an auto-created conversation.
fn auto_name(text: &str) -> &str {
    if text.is_empty() {
        "New conversation"
    } else {
        clip(text, AUTO_NAME_MAX)
    }
}

/// Prompt text with attached images prepended as inline file pointers.
/// Images are never binary-embedded; the agent reads them itself.
fn build_prompt(text: &str, image_paths: &[String]) -> String {
    if image_paths.is_empty() {
        return text.to_owned();
    }
    let pointers: Vec<String> = image_paths
        .iter()
        .map(|path| format!("[The user attached an image. View it by reading this file: {path}]"))
        .collect();
    let block = pointers.join("\n");
    if text.is_empty() {
        block.replace(
            "attached an image. View it by reading",
            "sent you an image. View and describe it by reading",
        )
    } else {
        format!("{block}\n\n{text}")
    }
}
