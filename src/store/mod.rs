// Conversation store - server-held chat history keyed by conversation id

pub mod memory;
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("unknown role in stored message: {0}")]
    UnknownRole(String),

    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    #[serde(alias = "developer")]
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" | "developer" => Ok(Role::System),
            other => Err(StoreError::UnknownRole(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub messages: Vec<Message>,
    pub last_updated: DateTime<Utc>,
}

impl Conversation {
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            messages: Vec::new(),
            last_updated: Utc::now(),
        }
    }
}

/// Storage contract shared by the volatile and durable backends.
///
/// `get` never fails for an unknown id: it creates an empty conversation,
/// generating a fresh id when `id` is empty. `append` always bumps
/// `last_updated`, even for empty content.
pub trait ConversationStore: Send + Sync {
    fn get(&self, id: &str) -> StoreResult<Conversation>;

    fn append(&self, id: &str, role: Role, content: &str) -> StoreResult<()>;

    /// Remove a conversation and its messages. Returns whether it existed.
    fn delete(&self, id: &str) -> StoreResult<bool>;
}

pub(crate) fn generate_conversation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
