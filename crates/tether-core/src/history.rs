//! Persisted turn segments.
//!
//! An assistant reply is stored as an ordered sequence of segments, split
//! wherever a tool invocation happened, so readers can reconstruct the
//! interleaving of text and tool activity. User turns are a single text
//! segment.

use serde::{Deserialize, Serialize};

/// Who produced a history entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The remote user.
    User,
    /// The agent.
    Assistant,
}

impl Role {
    /// Stable string form used in the database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One segment of a turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Segment {
    /// A run of assistant (or user) text.
    Text {
        /// The text content.
        text: String,
    },
    /// A tool invocation.
    ToolUse {
        /// Tool name as reported by the agent.
        tool: String,
        /// Short human-readable digest of the tool input.
        input_summary: String,
    },
}

impl Segment {
    /// Convenience constructor for a text segment.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Convenience constructor for a tool-use segment.
    #[must_use]
    pub fn tool_use(tool: impl Into<String>, input_summary: impl Into<String>) -> Self {
        Self::ToolUse {
            tool: tool.into(),
            input_summary: input_summary.into(),
        }
    }

    /// Whether this segment carries no content worth persisting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text { text } => text.trim().is_empty(),
            Self::ToolUse { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_strings() {
        assert_eq!(Role::User.as_str(), "user");
        assert_eq!(Role::Assistant.as_str(), "assistant");
    }

    #[test]
    fn text_segment_serde() {
        let seg = Segment::text("hello");
        let json = serde_json::to_value(&seg).unwrap();
        assert_eq!(json["kind"], "text");
        assert_eq!(json["text"], "hello");
        let back: Segment = serde_json::from_value(json).unwrap();
        assert_eq!(back, seg);
    }

    #[test]
    fn tool_use_segment_serde() {
        let seg = Segment::tool_use("Bash", "cargo build");
        let json = serde_json::to_value(&seg).unwrap();
        assert_eq!(json["kind"], "tool_use");
        assert_eq!(json["tool"], "Bash");
        assert_eq!(json["input_summary"], "cargo build");
    }

    #[test]
    fn blank_text_is_empty() {
        assert!(Segment::text("  \n ").is_empty());
        assert!(!Segment::text("x").is_empty());
        assert!(!Segment::tool_use("Read", "").is_empty());
    }
}
