//! Wire protocol events.
//!
//! Two event families, both externally tagged on `"type"`:
//!
//! - **[`ClientEvent`]**: messages a connected client sends over the
//!   WebSocket (authenticate, send a message, create a conversation,
//!   change permissions, cancel).
//! - **[`ServerEvent`]**: everything the server pushes back — streamed
//!   agent output, turn lifecycle terminals, conversation notifications,
//!   and transport frames (`auth_ok`, `ping`).
//!
//! Every conversation-scoped `ServerEvent` carries its conversation id so
//! a single multiplexed connection can route events client-side. The set
//! of terminal events is closed: each submitted message produces exactly
//! one of `message_complete`, `cancelled`, `busy`, or `error`.

use serde::{Deserialize, Serialize};

use crate::ids::ConversationId;

/// Messages received from a client connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Bearer-token handshake; must be the first event on a connection.
    Auth {
        /// The bearer token.
        token: String,
    },

    /// Submit a user message, starting a turn.
    Message {
        /// Target conversation.
        conversation_id: ConversationId,
        /// Message text (may be empty when only images are attached).
        #[serde(default)]
        text: String,
        /// Explicit resume token override; normally resolved from the store.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Server-local paths of attached images.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        image_paths: Vec<String>,
    },

    /// Create a conversation up front (before the first message).
    NewConversation {
        /// Id chosen by the client.
        conversation_id: ConversationId,
        /// Display name.
        name: String,
        /// Working directory for the agent process, if project-scoped.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
        /// Initial tool allow-list; server default when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        allowed_tools: Option<Vec<String>>,
    },

    /// Replace a conversation's tool allow-list.
    UpdatePermissions {
        /// Target conversation.
        conversation_id: ConversationId,
        /// New allow-list (tool specs like `Bash` or `Bash(git:*)`).
        allowed_tools: Vec<String>,
    },

    /// Cancel the in-flight turn. Without an id, cancels every active turn.
    Cancel {
        /// Target conversation, or all when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
    },

    /// Reply to a server `ping`.
    Pong,
}

/// Events pushed to client connections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Handshake accepted.
    AuthOk,

    /// Keep-alive probe; clients answer with `pong`.
    Ping,

    /// Conversation created (reply to `new_conversation`).
    ConversationCreated {
        /// The conversation.
        conversation_id: ConversationId,
        /// Its display name.
        name: String,
    },

    /// Conversation renamed (auto-title or explicit).
    ConversationRenamed {
        /// The conversation.
        conversation_id: ConversationId,
        /// The new name.
        name: String,
    },

    /// Tool allow-list updated (reply to `update_permissions`).
    PermissionsUpdated {
        /// The conversation.
        conversation_id: ConversationId,
        /// The allow-list now in effect.
        allowed_tools: Vec<String>,
    },

    /// Incremental assistant text.
    TextDelta {
        /// The conversation.
        conversation_id: ConversationId,
        /// Exact text fragment — no re-segmentation.
        text: String,
    },

    /// A tool invocation started.
    ToolStart {
        /// The conversation.
        conversation_id: ConversationId,
        /// Tool name.
        tool: String,
        /// Short digest of the tool input, never the raw payload.
        input_summary: String,
    },

    /// The in-flight tool invocation finished.
    ToolDone {
        /// The conversation.
        conversation_id: ConversationId,
    },

    /// A tool produced an image the client should fetch and display.
    Image {
        /// The conversation.
        conversation_id: ConversationId,
        /// Server-local path of the image file.
        path: String,
    },

    /// Turn finished successfully. Terminal.
    MessageComplete {
        /// The conversation.
        conversation_id: ConversationId,
        /// Resume token for the next turn.
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Lock not acquired within the timeout; no process was started. Terminal.
    Busy {
        /// The conversation.
        conversation_id: ConversationId,
        /// Human-readable reason.
        detail: String,
    },

    /// Turn cancelled by explicit request or supersession. Terminal.
    Cancelled {
        /// The conversation.
        conversation_id: ConversationId,
    },

    /// Unrecoverable failure. Terminal when conversation-scoped.
    Error {
        /// The conversation, when the error is scoped to one.
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
        /// Human-readable description.
        detail: String,
    },
}

impl ServerEvent {
    /// The conversation this event belongs to, if any.
    #[must_use]
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::AuthOk | Self::Ping => None,
            Self::Error {
                conversation_id, ..
            } => conversation_id.as_ref(),
            Self::ConversationCreated {
                conversation_id, ..
            }
            | Self::ConversationRenamed {
                conversation_id, ..
            }
            | Self::PermissionsUpdated {
                conversation_id, ..
            }
            | Self::TextDelta {
                conversation_id, ..
            }
            | Self::ToolStart {
                conversation_id, ..
            }
            | Self::ToolDone { conversation_id }
            | Self::Image {
                conversation_id, ..
            }
            | Self::MessageComplete {
                conversation_id, ..
            }
            | Self::Busy {
                conversation_id, ..
            }
            | Self::Cancelled { conversation_id } => Some(conversation_id),
        }
    }

    /// The wire type string (for logging and metrics labels).
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AuthOk => "auth_ok",
            Self::Ping => "ping",
            Self::ConversationCreated { .. } => "conversation_created",
            Self::ConversationRenamed { .. } => "conversation_renamed",
            Self::PermissionsUpdated { .. } => "permissions_updated",
            Self::TextDelta { .. } => "text_delta",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolDone { .. } => "tool_done",
            Self::Image { .. } => "image",
            Self::MessageComplete { .. } => "message_complete",
            Self::Busy { .. } => "busy",
            Self::Cancelled { .. } => "cancelled",
            Self::Error { .. } => "error",
        }
    }

    /// Build an error event scoped to a conversation.
    #[must_use]
    pub fn error_for(conversation_id: ConversationId, detail: impl Into<String>) -> Self {
        Self::Error {
            conversation_id: Some(conversation_id),
            detail: detail.into(),
        }
    }

    /// Build an error event with no conversation scope.
    #[must_use]
    pub fn error(detail: impl Into<String>) -> Self {
        Self::Error {
            conversation_id: None,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cid(raw: &str) -> ConversationId {
        raw.parse().unwrap()
    }

    // ── ClientEvent ──────────────────────────────────────────────────────

    #[test]
    fn client_auth_parses() {
        let event: ClientEvent =
            serde_json::from_value(json!({"type": "auth", "token": "tok"})).unwrap();
        assert_eq!(
            event,
            ClientEvent::Auth {
                token: "tok".into()
            }
        );
    }

    #[test]
    fn client_message_defaults() {
        let event: ClientEvent =
            serde_json::from_value(json!({"type": "message", "conversation_id": "c1", "text": "hi"}))
                .unwrap();
        let ClientEvent::Message {
            conversation_id,
            text,
            session_id,
            image_paths,
        } = event
        else {
            panic!("expected message");
        };
        assert_eq!(conversation_id, cid("c1"));
        assert_eq!(text, "hi");
        assert!(session_id.is_none());
        assert!(image_paths.is_empty());
    }

    #[test]
    fn client_message_with_images_and_session() {
        let event: ClientEvent = serde_json::from_value(json!({
            "type": "message",
            "conversation_id": "c1",
            "text": "",
            "session_id": "sess-9",
            "image_paths": ["/tmp/a.png"],
        }))
        .unwrap();
        let ClientEvent::Message {
            session_id,
            image_paths,
            ..
        } = event
        else {
            panic!("expected message");
        };
        assert_eq!(session_id.as_deref(), Some("sess-9"));
        assert_eq!(image_paths, vec!["/tmp/a.png"]);
    }

    #[test]
    fn client_cancel_without_id() {
        let event: ClientEvent = serde_json::from_value(json!({"type": "cancel"})).unwrap();
        assert_eq!(
            event,
            ClientEvent::Cancel {
                conversation_id: None
            }
        );
    }

    #[test]
    fn client_rejects_unknown_type() {
        let result: Result<ClientEvent, _> =
            serde_json::from_value(json!({"type": "does_not_exist"}));
        assert!(result.is_err());
    }

    #[test]
    fn client_rejects_invalid_conversation_id() {
        let result: Result<ClientEvent, _> = serde_json::from_value(
            json!({"type": "message", "conversation_id": "../escape", "text": "hi"}),
        );
        assert!(result.is_err());
    }

    // ── ServerEvent ──────────────────────────────────────────────────────

    #[test]
    fn text_delta_wire_shape() {
        let event = ServerEvent::TextDelta {
            conversation_id: cid("c1"),
            text: "hel".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "text_delta");
        assert_eq!(json["conversation_id"], "c1");
        assert_eq!(json["text"], "hel");
    }

    #[test]
    fn tool_start_wire_shape() {
        let event = ServerEvent::ToolStart {
            conversation_id: cid("c1"),
            tool: "Bash".into(),
            input_summary: "ls -la".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool_start");
        assert_eq!(json["tool"], "Bash");
        assert_eq!(json["input_summary"], "ls -la");
    }

    #[test]
    fn message_complete_omits_absent_session() {
        let event = ServerEvent::MessageComplete {
            conversation_id: cid("c1"),
            session_id: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("session_id").is_none());

        let event = ServerEvent::MessageComplete {
            conversation_id: cid("c1"),
            session_id: Some("sess-1".into()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["session_id"], "sess-1");
    }

    #[test]
    fn conversation_id_accessor() {
        assert!(ServerEvent::AuthOk.conversation_id().is_none());
        assert!(ServerEvent::Ping.conversation_id().is_none());
        assert_eq!(
            ServerEvent::Cancelled {
                conversation_id: cid("c7")
            }
            .conversation_id(),
            Some(&cid("c7"))
        );
        assert_eq!(ServerEvent::error("boom").conversation_id(), None);
        assert_eq!(
            ServerEvent::error_for(cid("c7"), "boom").conversation_id(),
            Some(&cid("c7"))
        );
    }

    #[test]
    fn event_types_are_distinct() {
        let events = [
            ServerEvent::AuthOk,
            ServerEvent::Ping,
            ServerEvent::ConversationCreated {
                conversation_id: cid("c"),
                name: "n".into(),
            },
            ServerEvent::ConversationRenamed {
                conversation_id: cid("c"),
                name: "n".into(),
            },
            ServerEvent::PermissionsUpdated {
                conversation_id: cid("c"),
                allowed_tools: vec![],
            },
            ServerEvent::TextDelta {
                conversation_id: cid("c"),
                text: "t".into(),
            },
            ServerEvent::ToolStart {
                conversation_id: cid("c"),
                tool: "t".into(),
                input_summary: "s".into(),
            },
            ServerEvent::ToolDone {
                conversation_id: cid("c"),
            },
            ServerEvent::Image {
                conversation_id: cid("c"),
                path: "p".into(),
            },
            ServerEvent::MessageComplete {
                conversation_id: cid("c"),
                session_id: None,
            },
            ServerEvent::Busy {
                conversation_id: cid("c"),
                detail: "d".into(),
            },
            ServerEvent::Cancelled {
                conversation_id: cid("c"),
            },
            ServerEvent::error("e"),
        ];
        let mut types: Vec<&str> = events.iter().map(ServerEvent::event_type).collect();
        let total = types.len();
        types.sort_unstable();
        types.dedup();
        assert_eq!(types.len(), total);
    }

    #[test]
    fn server_event_round_trip() {
        let event = ServerEvent::Busy {
            conversation_id: cid("c1"),
            detail: "conversation is still finishing".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: ServerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
