// Durable conversation store backed by SQLite

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use super::{generate_conversation_id, Conversation, ConversationStore, Message, Role, StoreResult};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = crate::db::init_db(path)?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = crate::db::init_memory_db()?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

impl ConversationStore for SqliteStore {
    fn get(&self, id: &str) -> StoreResult<Conversation> {
        let id = if id.is_empty() {
            generate_conversation_id()
        } else {
            id.to_string()
        };

        let conn = self.conn.lock();

        let last_updated: Option<i64> = conn
            .query_row(
                "SELECT last_updated FROM conversations WHERE id = ?1",
                [&id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(last_updated) = last_updated else {
            // Create the row up front so later message rows always have a parent.
            let now = Utc::now();
            conn.execute(
                "INSERT OR IGNORE INTO conversations (id, last_updated) VALUES (?1, ?2)",
                params![id, now.timestamp_millis()],
            )?;
            tracing::debug!("Created conversation {}", id);
            return Ok(Conversation {
                id,
                messages: Vec::new(),
                last_updated: now,
            });
        };

        let mut stmt = conn.prepare(
            "SELECT role, content FROM messages WHERE conversation_id = ?1
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map([&id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (role, content) = row?;
            messages.push(Message::new(role.parse()?, content));
        }

        Ok(Conversation {
            id,
            messages,
            last_updated: from_millis(last_updated),
        })
    }

    fn append(&self, id: &str, role: Role, content: &str) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let now = Utc::now().timestamp_millis();

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO conversations (id, last_updated) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET last_updated = excluded.last_updated",
            params![id, now],
        )?;
        tx.execute(
            "INSERT INTO messages (conversation_id, role, content, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, role.as_str(), content, now],
        )?;
        tx.commit()?;

        tracing::debug!("Appended {} message to conversation {}", role, id);
        Ok(())
    }

    fn delete(&self, id: &str) -> StoreResult<bool> {
        let mut conn = self.conn.lock();

        let tx = conn.transaction()?;
        tx.execute("DELETE FROM messages WHERE conversation_id = ?1", [id])?;
        let removed = tx.execute("DELETE FROM conversations WHERE id = ?1", [id])?;
        tx.commit()?;

        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    #[test]
    fn test_sqlite_store_contract() {
        contract::run_all(&SqliteStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.append("persisted", Role::System, "be brief").unwrap();
            store.append("persisted", Role::User, "hi").unwrap();
            store.append("persisted", Role::Assistant, "hello").unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let conv = store.get("persisted").unwrap();
        assert_eq!(
            conv.messages,
            vec![
                Message::new(Role::System, "be brief"),
                Message::new(Role::User, "hi"),
                Message::new(Role::Assistant, "hello"),
            ]
        );
    }

    #[test]
    fn test_same_millisecond_appends_keep_insert_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        for i in 0..20 {
            store.append("burst", Role::User, &i.to_string()).unwrap();
        }
        let contents: Vec<String> = store
            .get("burst")
            .unwrap()
            .messages
            .into_iter()
            .map(|m| m.content)
            .collect();
        let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(contents, expected);
    }

    #[test]
    fn test_get_creates_conversation_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conv = store.get("").unwrap();

        let conn = store.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM conversations WHERE id = ?1",
                [&conv.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
