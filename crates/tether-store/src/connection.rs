//! SQLite connection pool and migrations.

use std::path::Path;

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use crate::errors::Result;

/// Pool of SQLite connections.
pub type ConnectionPool = r2d2::Pool<SqliteConnectionManager>;
/// A checked-out pool connection.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Per-connection pragmas applied by the pool.
#[derive(Debug)]
struct PragmaCustomizer {
    /// WAL only makes sense for file-backed databases.
    wal: bool,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        if self.wal {
            let _: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get(0)
            })?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
        }
        Ok(())
    }
}

/// Open a file-backed pool, creating the database if needed.
pub fn new_file_pool(path: &Path) -> Result<ConnectionPool> {
    let manager = SqliteConnectionManager::file(path);
    let pool = r2d2::Pool::builder()
        .max_size(8)
        .connection_customizer(Box::new(PragmaCustomizer { wal: true }))
        .build(manager)?;
    debug!(path = %path.display(), "opened conversation database");
    Ok(pool)
}

/// Open a shared in-memory pool for tests.
///
/// Plain `:memory:` gives every pooled connection its own database, so a
/// named shared-cache URI is used instead. The returned anchor connection
/// must stay alive for the database to persist across pool churn.
pub fn new_in_memory_pool() -> Result<(ConnectionPool, Connection)> {
    let uri = format!("file:tether-mem-{}?mode=memory&cache=shared", uuid::Uuid::now_v7());
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let anchor = Connection::open_with_flags(&uri, flags)?;
    let manager = SqliteConnectionManager::file(&uri).with_flags(flags);
    let pool = r2d2::Pool::builder()
        .max_size(4)
        .connection_customizer(Box::new(PragmaCustomizer { wal: false }))
        .build(manager)?;
    Ok((pool, anchor))
}

/// Create the schema. Idempotent; runs at startup.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
             id              TEXT PRIMARY KEY,
             name            TEXT NOT NULL,
             working_dir     TEXT,
             resume_token    TEXT,
             allowed_tools   TEXT,
             created_at      TEXT NOT NULL,
             last_message_at TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS history (
             id              TEXT PRIMARY KEY,
             conversation_id TEXT NOT NULL
                 REFERENCES conversations(id) ON DELETE CASCADE,
             seq             INTEGER NOT NULL,
             role            TEXT NOT NULL,
             kind            TEXT NOT NULL,
             text            TEXT,
             tool_name       TEXT,
             input_summary   TEXT,
             image_paths     TEXT,
             created_at      TEXT NOT NULL,
             UNIQUE (conversation_id, seq)
         );
         CREATE INDEX IF NOT EXISTS idx_history_conversation
             ON history (conversation_id, seq);",
    )?;
    Ok(())
}
