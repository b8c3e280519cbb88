//! Stale-resume recovery.
//!
//! A stored resume token can outlive the agent-side session it names
//! (agent upgrades, pruned state). The controller hides that from the
//! caller: launch with the stored token, and when the failure carries a
//! recognized stale-resume signature, clear the token and launch exactly
//! once more without it. A second failure is a deeper fault and escalates
//! unchanged. Never more than one retry.

use futures::StreamExt;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tether_store::ConversationStore;

use crate::errors::TurnError;
use crate::gate::TurnPermit;
use crate::launcher::{AgentLauncher, TurnExit, TurnRequest};
use crate::normalize::{NormalizedTurn, Normalizer};
use crate::settings::AgentSettings;
use crate::sink::EventSink;

/// How a turn ended, from the client's point of view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Process ran to completion with a non-error result.
    Completed,
    /// Terminated by cancel or supersession.
    Cancelled,
    /// Unrecoverable failure (after any stale-resume retry).
    Failed {
        /// Human-readable description for the `error` event.
        detail: String,
    },
}

/// Result of driving a turn through launch, streaming, and retry.
#[derive(Debug)]
pub struct FinishedTurn {
    /// Terminal outcome.
    pub outcome: TurnOutcome,
    /// Accumulated output of the final attempt.
    pub turn: NormalizedTurn,
    /// Whether the stored token was cleared and a fresh launch happened.
    pub retried_fresh: bool,
}

/// Configurable predicate recognizing stale-resume failures.
///
/// Matched case-insensitively against the process's exit text (stderr
/// plus the terminal result's error payload), and only when the attempt
/// actually passed `--resume`.
pub struct StaleResumePolicy {
    signatures: Vec<String>,
}

impl StaleResumePolicy {
    /// Build a policy from configured signature substrings.
    #[must_use]
    pub fn new(signatures: &[String]) -> Self {
        Self {
            signatures: signatures.iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    /// Whether this attempt failed because its resume token went stale.
    #[must_use]
    pub fn is_stale(&self, used_resume: bool, exit: &TurnExit, turn: &NormalizedTurn) -> bool {
        if !used_resume || matches!(exit, TurnExit::Terminated) {
            return false;
        }
        if !turn.result_error && matches!(exit, TurnExit::Clean { .. }) {
            return false;
        }
        let mut haystack = exit.stderr().to_lowercase();
        if let Some(detail) = &turn.error_detail {
            haystack.push('\n');
            haystack.push_str(&detail.to_lowercase());
        }
        self.signatures.iter().any(|sig| haystack.contains(sig))
    }
}

/// Drives one logical turn: launch, stream, classify, retry-once.
pub struct ResumeController<'a> {
    launcher: &'a dyn AgentLauncher,
    store: &'a ConversationStore,
    settings: &'a AgentSettings,
}

impl<'a> ResumeController<'a> {
    /// Create a controller borrowing the runner's collaborators.
    #[must_use]
    pub fn new(
        launcher: &'a dyn AgentLauncher,
        store: &'a ConversationStore,
        settings: &'a AgentSettings,
    ) -> Self {
        Self {
            launcher,
            store,
            settings,
        }
    }

    /// Run the turn to a terminal outcome, forwarding events as they
    /// stream. Stale-resume staleness is handled internally and never
    /// surfaces to the client.
    pub async fn run(
        &self,
        mut request: TurnRequest,
        permit: &TurnPermit,
        sink: &dyn EventSink,
    ) -> Result<FinishedTurn, TurnError> {
        let policy = StaleResumePolicy::new(&self.settings.stale_resume_signatures);
        let mut retried_fresh = false;
        loop {
            let used_resume = request.resume_token.is_some();
            let (exit, turn) = self.attempt(&request, permit, sink).await?;

            if matches!(exit, TurnExit::Terminated) {
                return Ok(FinishedTurn {
                    outcome: TurnOutcome::Cancelled,
                    turn,
                    retried_fresh,
                });
            }

            if !retried_fresh && policy.is_stale(used_resume, &exit, &turn) {
                counter!("agent_stale_resume_retries_total").increment(1);
                warn!(
                    conversation_id = %request.conversation_id,
                    "stale resume token detected, clearing and retrying fresh"
                );
                let _ = self.store.clear_resume_token(&request.conversation_id)?;
                request.resume_token = None;
                retried_fresh = true;
                continue;
            }

            let outcome = classify(&exit, &turn);
            return Ok(FinishedTurn {
                outcome,
                turn,
                retried_fresh,
            });
        }
    }

    /// One launch: spawn, register cancellation, stream to the sink.
    async fn attempt(
        &self,
        request: &TurnRequest,
        permit: &TurnPermit,
        sink: &dyn EventSink,
    ) -> Result<(TurnExit, NormalizedTurn), TurnError> {
        let mut launched = self.launcher.launch(request).await?;
        let cancel = CancellationToken::new();
        permit.set_active(cancel.clone());

        let mut normalizer = Normalizer::new(
            request.conversation_id.clone(),
            request.working_dir.clone(),
            self.settings.screenshot_tools.clone(),
        );

        let mut termination_requested = false;
        let mut read_error: Option<String> = None;
        loop {
            tokio::select! {
                () = cancel.cancelled(), if !termination_requested => {
                    // Cooperative: ask the process to die, then keep
                    // draining until the stream ends on its own.
                    termination_requested = true;
                    launched.control.terminate().await;
                }
                line = launched.lines.next() => match line {
                    Some(Ok(line)) => {
                        for event in normalizer.handle_line(&line) {
                            sink.send(&event);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(
                            conversation_id = %request.conversation_id,
                            error = %e,
                            "agent output read error, abandoning stream"
                        );
                        // Kill the process; with its stdout unread it
                        // could otherwise outlive the turn and block
                        // finish() below forever.
                        read_error = Some(e.to_string());
                        launched.control.terminate().await;
                        break;
                    }
                    None => break,
                }
            }
        }

        let mut exit = launched.control.finish().await;
        if let Some(detail) = read_error {
            if !termination_requested {
                exit = TurnExit::Failed {
                    code: None,
                    stderr: format!("output read error: {detail}"),
                };
            }
        }
        permit.clear_active();
        debug!(conversation_id = %request.conversation_id, ?exit, "attempt finished");
        Ok((exit, normalizer.finish()))
    }
}

fn classify(exit: &TurnExit, turn: &NormalizedTurn) -> TurnOutcome {
    match exit {
        TurnExit::Terminated => TurnOutcome::Cancelled,
        TurnExit::Failed { code, stderr } => TurnOutcome::Failed {
            detail: turn
                .error_detail
                .clone()
                .or_else(|| {
                    let s = stderr.trim();
                    (!s.is_empty()).then(|| s.to_owned())
                })
                .unwrap_or_else(|| format!("agent process exited with status {code:?}")),
        },
        TurnExit::Clean { .. } if turn.result_error => TurnOutcome::Failed {
            detail: turn
                .error_detail
                .clone()
                .unwrap_or_else(|| "agent reported an error".to_owned()),
        },
        TurnExit::Clean { .. } => TurnOutcome::Completed,
    }
}
