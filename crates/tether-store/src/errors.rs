//! Store error type.

use tether_core::ids::ConversationId;

/// Errors surfaced by the conversation store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool exhausted or broken.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A JSON column failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Append targeted a conversation that does not exist.
    #[error("conversation '{0}' not found")]
    NotFound(ConversationId),
}

/// Store result alias.
pub type Result<T> = std::result::Result<T, StoreError>;
