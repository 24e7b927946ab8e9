// SQLite database module for conversation history

use rusqlite::Connection;
use std::path::Path;

/// Open (or create) the database at `path` and make sure the schema exists.
pub fn init_db(path: impl AsRef<Path>) -> rusqlite::Result<Connection> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!("Failed to create database directory {:?}: {}", parent, e);
            }
        }
    }

    let conn = Connection::open(path)?;
    create_schema(&conn)?;

    tracing::info!("SQLite database initialized at {:?}", path);
    Ok(conn)
}

/// In-memory database with the same schema, used by tests and throwaway runs.
pub fn init_memory_db() -> rusqlite::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    create_schema(&conn)?;
    Ok(conn)
}

fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            last_updated INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, timestamp, id)",
        [],
    )?;

    Ok(())
}
