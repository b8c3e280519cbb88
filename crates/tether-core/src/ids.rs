//! Validated conversation identifier.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a conversation id fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "invalid conversation id '{0}': must be 1-128 alphanumeric characters, hyphens, or underscores"
)]
pub struct InvalidConversationId(pub String);

/// A conversation identifier.
///
/// Conversation ids come from clients and end up in SQL keys and URLs, so
/// the accepted alphabet is restricted: the first character must be ASCII
/// alphanumeric, the rest alphanumeric plus `-` / `_`, 128 chars max.
/// Construction always validates — a held `ConversationId` is known-good.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationId(String);

impl ConversationId {
    /// Maximum accepted length in bytes.
    pub const MAX_LEN: usize = 128;

    /// Validate and wrap a raw id.
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidConversationId> {
        let raw = raw.into();
        if Self::is_valid(&raw) {
            Ok(Self(raw))
        } else {
            Err(InvalidConversationId(raw))
        }
    }

    /// Whether `raw` is an acceptable conversation id.
    #[must_use]
    pub fn is_valid(raw: &str) -> bool {
        let mut chars = raw.chars();
        let Some(first) = chars.next() else {
            return false;
        };
        raw.len() <= Self::MAX_LEN
            && first.is_ascii_alphanumeric()
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ConversationId {
    type Error = InvalidConversationId;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl FromStr for ConversationId {
    type Err = InvalidConversationId;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::new(raw)
    }
}

impl From<ConversationId> for String {
    fn from(id: ConversationId) -> Self {
        id.0
    }
}

impl AsRef<str> for ConversationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
