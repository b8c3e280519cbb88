//! Per-conversation concurrency gate.
//!
//! One async lock plus one active-turn slot per conversation id. Exactly
//! one turn may hold a conversation's lock at a time; turns on different
//! conversations never contend. The registry is an owned object injected
//! into the runner, with lifecycle tied to server startup/shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::gauge;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tether_core::ids::ConversationId;

/// Gate acquisition failure.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    /// The lock was not acquired within the configured timeout. The
    /// caller reports this to the client; it is never retried here.
    #[error("conversation is busy")]
    Busy,
}

/// Per-conversation state: the turn lock and the active-process slot.
struct GateEntry {
    lock: Arc<tokio::sync::Mutex<()>>,
    /// Cancellation token of the in-flight turn, if one is registered.
    active: Mutex<Option<CancellationToken>>,
}

/// Registry of per-conversation locks and active-turn slots.
pub struct ConversationGate {
    entries: Mutex<HashMap<ConversationId, Arc<GateEntry>>>,
    acquire_timeout: Duration,
}

impl ConversationGate {
    /// Create a gate with the given lock-acquisition timeout.
    #[must_use]
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            acquire_timeout,
        }
    }

    fn entry(&self, id: &ConversationId) -> Arc<GateEntry> {
        let mut entries = self.entries.lock();
        Arc::clone(entries.entry(id.clone()).or_insert_with(|| {
            Arc::new(GateEntry {
                lock: Arc::new(tokio::sync::Mutex::new(())),
                active: Mutex::new(None),
            })
        }))
    }

    /// Acquire the turn lock for a conversation.
    ///
    /// Lazily creates state for unseen ids. Waits at most the configured
    /// timeout; on expiry returns [`GateError::Busy`] without queueing.
    /// The returned permit releases the lock and clears the active slot
    /// on drop through any path.
    pub async fn acquire(&self, id: &ConversationId) -> Result<TurnPermit, GateError> {
        let entry = self.entry(id);
        let lock = Arc::clone(&entry.lock);
        let guard = tokio::time::timeout(self.acquire_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                warn!(conversation_id = %id, timeout = ?self.acquire_timeout, "lock acquisition timed out");
                GateError::Busy
            })?;
        debug!(conversation_id = %id, "turn lock acquired");
        Ok(TurnPermit {
            entry,
            _guard: guard,
        })
    }

    /// Cancel the in-flight turn so a newer message can take its place.
    ///
    /// This does not bypass the lock: the superseded turn observes the
    /// cancellation, terminates its process, and releases normally.
    /// No-op when the conversation has no active turn.
    pub fn supersede(&self, id: &ConversationId) {
        if self.signal_cancel(id) {
            debug!(conversation_id = %id, "superseding in-flight turn");
        }
    }

    /// Cancel the in-flight turn on explicit client request.
    ///
    /// Returns whether a turn was actually cancelled.
    pub fn cancel(&self, id: &ConversationId) -> bool {
        let cancelled = self.signal_cancel(id);
        if cancelled {
            debug!(conversation_id = %id, "turn cancelled by request");
        }
        cancelled
    }

    fn signal_cancel(&self, id: &ConversationId) -> bool {
        let entry = {
            let entries = self.entries.lock();
            entries.get(id).cloned()
        };
        let Some(entry) = entry else { return false };
        let active = entry.active.lock();
        match active.as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether the conversation currently has an active turn registered.
    #[must_use]
    pub fn is_active(&self, id: &ConversationId) -> bool {
        let entries = self.entries.lock();
        entries
            .get(id)
            .is_some_and(|entry| entry.active.lock().is_some())
    }

    /// Ids of every conversation with an active turn.
    #[must_use]
    pub fn active_conversations(&self) -> Vec<ConversationId> {
        let entries = self.entries.lock();
        entries
            .iter()
            .filter(|(_, entry)| entry.active.lock().is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Drop a conversation's gate state (conversation deletion).
    pub fn remove(&self, id: &ConversationId) {
        let removed = self.entries.lock().remove(id);
        if let Some(entry) = removed {
            if let Some(token) = entry.active.lock().as_ref() {
                token.cancel();
            }
        }
    }

    /// Cancel every active turn (server shutdown).
    pub fn shutdown(&self) {
        let entries = self.entries.lock();
        for entry in entries.values() {
            if let Some(token) = entry.active.lock().as_ref() {
                token.cancel();
            }
        }
    }
}

/// Held for the duration of one turn; releases the conversation on drop.
pub struct TurnPermit {
    entry: Arc<GateEntry>,
    _guard: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for TurnPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnPermit").finish_non_exhaustive()
    }
}

impl TurnPermit {
    /// Register the turn's cancellation token in the active slot.
    ///
    /// At most one active process per conversation: the permit holder is
    /// the only code that can reach this slot while the lock is held.
    pub fn set_active(&self, token: CancellationToken) {
        *self.entry.active.lock() = Some(token);
        gauge!("agent_turns_active").increment(1.0);
    }

    /// Clear the active slot after the process has exited.
    pub fn clear_active(&self) {
        if self.entry.active.lock().take().is_some() {
            gauge!("agent_turns_active").decrement(1.0);
        }
    }
}

impl Drop for TurnPermit {
    fn drop(&mut self) {
        self.clear_active();
    }
}
