//! Detached conversation auto-titling.
//!
//! After the first completed turn of a conversation the runner spawns
//! this task outside the conversation's lock, so it never blocks later
//! turns. It asks the agent for a short title via a non-streaming
//! invocation; every failure path is silent and non-fatal.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_core::events::ServerEvent;
use tether_core::ids::ConversationId;
use tether_core::text::clip;
use tether_store::ConversationStore;

use crate::launcher::AgentLauncher;
use crate::sink::EventSink;

/// Titles longer than this are rejected as model rambling.
const MAX_TITLE_LEN: usize = 80;

/// Prompt asking for a title from the user's first message.
fn title_prompt(user_text: &str) -> String {
    format!(
        "Generate a very short title (under 50 characters) for this conversation. \
         Be specific and concise, like a commit message or task title. \
         Examples: 'Fix WebSocket buffer overflow', 'Add dark mode toggle', \
         'Debug login crash'. Just output the title, nothing else.\n\n\
         User: {}",
        clip(user_text, 500)
    )
}

/// Whether a generated title is worth keeping.
fn acceptable(title: &str) -> bool {
    !title.is_empty() && title.len() < MAX_TITLE_LEN && !title.to_lowercase().starts_with("error")
}

/// Spawn the best-effort title task for a newly started conversation.
pub fn spawn_title_task(
    launcher: Arc<dyn AgentLauncher>,
    store: Arc<ConversationStore>,
    sink: Arc<dyn EventSink>,
    conversation_id: ConversationId,
    user_text: String,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if user_text.is_empty() || user_text == "[image]" {
            return;
        }
        let title = match launcher.oneshot(&title_prompt(&user_text), timeout).await {
            Ok(title) => title,
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "title generation failed");
                return;
            }
        };
        if !acceptable(&title) {
            debug!(conversation_id = %conversation_id, title, "title rejected");
            return;
        }
        match store.rename_conversation(&conversation_id, &title) {
            Ok(true) => {
                info!(conversation_id = %conversation_id, title, "conversation auto-titled");
                sink.send(&ServerEvent::ConversationRenamed {
                    conversation_id,
                    name: title,
                });
            }
            Ok(false) => {}
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "failed to store title");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{RecordingSink, ScriptedLauncher};
    use tether_store::CreateConversationOptions;

    fn cid(raw: &str) -> ConversationId {
        raw.parse().unwrap()
    }

    fn fixture() -> (Arc<ScriptedLauncher>, Arc<ConversationStore>, Arc<RecordingSink>) {
        let store = Arc::new(ConversationStore::in_memory().unwrap());
        let _ = store
            .create_conversation(&cid("c1"), &CreateConversationOptions {
                name: "New conversation",
                ..Default::default()
            })
            .unwrap();
        (
            Arc::new(ScriptedLauncher::default()),
            store,
            Arc::new(RecordingSink::default()),
        )
    }

    #[tokio::test]
    async fn renames_and_notifies_on_success() {
        let (launcher, store, sink) = fixture();
        launcher.set_oneshot_reply(Some("Fix login crash"));

        spawn_title_task(
            launcher.clone(),
            store.clone(),
            sink.clone(),
            cid("c1"),
            "my login screen crashes on submit".into(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(
            store.get_conversation(&cid("c1")).unwrap().unwrap().name,
            "Fix login crash"
        );
        assert_eq!(sink.event_types(), vec!["conversation_renamed"]);
    }

    #[tokio::test]
    async fn failure_is_silent() {
        let (launcher, store, sink) = fixture();
        launcher.set_oneshot_reply(None); // times out

        spawn_title_task(
            launcher,
            store.clone(),
            sink.clone(),
            cid("c1"),
            "hello".into(),
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        assert_eq!(
            store.get_conversation(&cid("c1")).unwrap().unwrap().name,
            "New conversation"
        );
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn rejects_overlong_and_error_titles() {
        let (launcher, store, sink) = fixture();
        launcher.set_oneshot_reply(Some(&"x".repeat(200)));
        spawn_title_task(
            launcher.clone(),
            store.clone(),
            sink.clone(),
            cid("c1"),
            "hello".into(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        launcher.set_oneshot_reply(Some("Error: no credits"));
        spawn_title_task(
            launcher,
            store.clone(),
            sink.clone(),
            cid("c1"),
            "hello".into(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(
            store.get_conversation(&cid("c1")).unwrap().unwrap().name,
            "New conversation"
        );
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn image_only_message_skips_generation() {
        let (launcher, store, sink) = fixture();
        launcher.set_oneshot_reply(Some("A title"));
        spawn_title_task(
            launcher.clone(),
            store,
            sink,
            cid("c1"),
            "[image]".into(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(launcher.oneshot_prompts().is_empty());
    }

    #[test]
    fn prompt_clips_long_messages() {
        let prompt = title_prompt(&"y".repeat(2000));
        assert!(prompt.len() < 1200);
        assert!(prompt.contains("Just output the title"));
    }
}
