//! High-level conversation store API.
//!
//! All writes run under an in-process write lock plus SQLite's own
//! `busy_timeout`, which keeps the append path simple: compute the next
//! sequence number and insert without observable races.

use parking_lot::Mutex;
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use std::path::Path;

use tether_core::history::{Role, Segment};
use tether_core::ids::ConversationId;

use crate::connection::{
    ConnectionPool, PooledConnection, new_file_pool, new_in_memory_pool, run_migrations,
};
use crate::errors::{Result, StoreError};

/// A conversation's metadata row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConversationRow {
    /// Conversation id.
    pub id: ConversationId,
    /// Display name.
    pub name: String,
    /// Working directory for the agent process, if project-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Resume token from the last successful turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    /// Tool allow-list override; `None` means the server default applies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// RFC 3339 time of the last appended turn.
    pub last_message_at: String,
}

/// One persisted history record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    /// Position within the conversation (0-based, monotonic).
    pub seq: i64,
    /// Who produced the record.
    pub role: Role,
    /// The content — text or a tool invocation.
    #[serde(flatten)]
    pub segment: Segment,
    /// Image files attached to this record.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub image_paths: Vec<String>,
    /// RFC 3339 append time.
    pub created_at: String,
}

/// Options for creating a conversation.
#[derive(Debug, Default)]
pub struct CreateConversationOptions<'a> {
    /// Display name.
    pub name: &'a str,
    /// Working directory, if project-scoped.
    pub working_dir: Option<&'a str>,
    /// Initial tool allow-list.
    pub allowed_tools: Option<&'a [String]>,
}

/// SQLite-backed conversation store.
pub struct ConversationStore {
    pool: ConnectionPool,
    write_lock: Mutex<()>,
    /// Keeps the shared in-memory database alive for tests. Mutex-wrapped
    /// only because `Connection` is not `Sync`; it is never used.
    _anchor: Option<Mutex<rusqlite::Connection>>,
}

impl ConversationStore {
    /// Open (or create) the store at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let pool = new_file_pool(path)?;
        {
            let conn = pool.get()?;
            run_migrations(&conn)?;
        }
        info!(path = %path.display(), "conversation store ready");
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
            _anchor: None,
        })
    }

    /// Open an in-memory store (tests).
    pub fn in_memory() -> Result<Self> {
        let (pool, anchor) = new_in_memory_pool()?;
        {
            let conn = pool.get()?;
            run_migrations(&conn)?;
        }
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
            _anchor: Some(Mutex::new(anchor)),
        })
    }

    fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    /// Create a conversation.
    ///
    /// Idempotent: if the id already exists the stored row is returned
    /// untouched. Duplicate `new_conversation` messages (client races,
    /// reconnect replays) must never destroy an existing resume token.
    pub fn create_conversation(
        &self,
        id: &ConversationId,
        opts: &CreateConversationOptions<'_>,
    ) -> Result<ConversationRow> {
        let _guard = self.write_lock.lock();
        if let Some(existing) = self.get_conversation(id)? {
            return Ok(existing);
        }
        let now = now_rfc3339();
        let allowed_tools_json = opts
            .allowed_tools
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn()?;
        let _ = conn.execute(
            "INSERT INTO conversations
                 (id, name, working_dir, resume_token, allowed_tools, created_at, last_message_at)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?5)",
            params![id.as_str(), opts.name, opts.working_dir, allowed_tools_json, now],
        )?;
        debug!(conversation_id = %id, name = opts.name, "conversation created");
        Ok(ConversationRow {
            id: id.clone(),
            name: opts.name.to_owned(),
            working_dir: opts.working_dir.map(String::from),
            resume_token: None,
            allowed_tools: opts.allowed_tools.map(<[String]>::to_vec),
            created_at: now.clone(),
            last_message_at: now,
        })
    }

    /// Get a conversation by id.
    pub fn get_conversation(&self, id: &ConversationId) -> Result<Option<ConversationRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, name, working_dir, resume_token, allowed_tools,
                        created_at, last_message_at
                 FROM conversations WHERE id = ?1",
                params![id.as_str()],
                row_to_conversation,
            )
            .optional()?;
        row.map(finish_conversation_row).transpose()
    }

    /// List all conversations, most recently active first.
    pub fn list_conversations(&self) -> Result<Vec<ConversationRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, working_dir, resume_token, allowed_tools,
                    created_at, last_message_at
             FROM conversations ORDER BY last_message_at DESC, id ASC",
        )?;
        let rows = stmt
            .query_map([], row_to_conversation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(finish_conversation_row).collect()
    }

    /// Rename a conversation. Returns false when the id is unknown.
    pub fn rename_conversation(&self, id: &ConversationId, name: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE conversations SET name = ?2 WHERE id = ?1",
            params![id.as_str(), name],
        )?;
        Ok(changed > 0)
    }

    /// Replace a conversation's tool allow-list. Returns false when unknown.
    pub fn update_allowed_tools(&self, id: &ConversationId, tools: &[String]) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let json = serde_json::to_string(tools)?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE conversations SET allowed_tools = ?2 WHERE id = ?1",
            params![id.as_str(), json],
        )?;
        Ok(changed > 0)
    }

    /// Delete a conversation and its history. Returns false when unknown.
    pub fn delete_conversation(&self, id: &ConversationId) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM conversations WHERE id = ?1",
            params![id.as_str()],
        )?;
        if changed > 0 {
            info!(conversation_id = %id, "conversation deleted");
        }
        Ok(changed > 0)
    }

    /// The stored resume token, if any.
    pub fn resume_token(&self, id: &ConversationId) -> Result<Option<String>> {
        let conn = self.conn()?;
        let token = conn
            .query_row(
                "SELECT resume_token FROM conversations WHERE id = ?1",
                params![id.as_str()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(token.flatten())
    }

    /// Store the resume token from a successful turn and bump activity.
    pub fn set_resume_token(&self, id: &ConversationId, token: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE conversations SET resume_token = ?2, last_message_at = ?3 WHERE id = ?1",
            params![id.as_str(), token, now_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    /// Drop the stored resume token (stale-resume recovery).
    pub fn clear_resume_token(&self, id: &ConversationId) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE conversations SET resume_token = NULL WHERE id = ?1",
            params![id.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Append the user's message to history.
    pub fn append_user_turn(&self, id: &ConversationId, text: &str) -> Result<()> {
        self.append(id, Role::User, &Segment::text(text), &[])
    }

    /// Append one assistant segment (text or tool use) to history.
    pub fn append_assistant_segment(
        &self,
        id: &ConversationId,
        segment: &Segment,
        image_paths: &[String],
    ) -> Result<()> {
        self.append(id, Role::Assistant, segment, image_paths)
    }

    fn append(
        &self,
        id: &ConversationId,
        role: Role,
        segment: &Segment,
        image_paths: &[String],
    ) -> Result<()> {
        let _guard = self.write_lock.lock();
        let conn = self.conn()?;
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM conversations WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound(id.clone()));
        }

        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM history WHERE conversation_id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        let (kind, text, tool_name, input_summary) = match segment {
            Segment::Text { text } => ("text", Some(text.as_str()), None, None),
            Segment::ToolUse {
                tool,
                input_summary,
            } => (
                "tool_use",
                None,
                Some(tool.as_str()),
                Some(input_summary.as_str()),
            ),
        };
        let images_json = if image_paths.is_empty() {
            None
        } else {
            Some(serde_json::to_string(image_paths)?)
        };
        let now = now_rfc3339();
        let _ = conn.execute(
            "INSERT INTO history
                 (id, conversation_id, seq, role, kind, text, tool_name, input_summary,
                  image_paths, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                format!("h_{}", Uuid::now_v7()),
                id.as_str(),
                seq,
                role.as_str(),
                kind,
                text,
                tool_name,
                input_summary,
                images_json,
                now,
            ],
        )?;
        let _ = conn.execute(
            "UPDATE conversations SET last_message_at = ?2 WHERE id = ?1",
            params![id.as_str(), now],
        )?;
        Ok(())
    }

    /// Full history for a conversation in append order.
    pub fn history(&self, id: &ConversationId) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT seq, role, kind, text, tool_name, input_summary, image_paths, created_at
             FROM history WHERE conversation_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![id.as_str()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(seq, role, kind, text, tool_name, input_summary, images_json, created_at)| {
                    let role = match role.as_str() {
                        "user" => Role::User,
                        _ => Role::Assistant,
                    };
                    let segment = if kind == "tool_use" {
                        Segment::ToolUse {
                            tool: tool_name.unwrap_or_default(),
                            input_summary: input_summary.unwrap_or_default(),
                        }
                    } else {
                        Segment::Text {
                            text: text.unwrap_or_default(),
                        }
                    };
                    let image_paths = images_json
                        .map(|j| serde_json::from_str::<Vec<String>>(&j))
                        .transpose()?
                        .unwrap_or_default();
                    Ok(HistoryEntry {
                        seq,
                        role,
                        segment,
                        image_paths,
                        created_at,
                    })
                },
            )
            .collect()
    }
}

/// Raw row before JSON columns are decoded.
type RawConversation = (
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawConversation> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn finish_conversation_row(raw: RawConversation) -> Result<ConversationRow> {
    let (id, name, working_dir, resume_token, allowed_tools_json, created_at, last_message_at) =
        raw;
    let allowed_tools = allowed_tools_json
        .map(|j| serde_json::from_str::<Vec<String>>(&j))
        .transpose()?;
    // Ids were validated on the way in; a corrupt row is a database-level fault.
    let id = ConversationId::new(id).map_err(|e| {
        StoreError::Sqlite(rusqlite::Error::InvalidColumnName(e.to_string()))
    })?;
    Ok(ConversationRow {
        id,
        name,
        working_dir,
        resume_token,
        allowed_tools,
        created_at,
        last_message_at,
    })
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
