// Volatile conversation store - history is lost on restart

use chrono::Utc;
use dashmap::DashMap;

use super::{generate_conversation_id, Conversation, ConversationStore, Message, Role, StoreResult};

#[derive(Debug, Default)]
pub struct MemoryStore {
    conversations: DashMap<String, Conversation>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

impl ConversationStore for MemoryStore {
    fn get(&self, id: &str) -> StoreResult<Conversation> {
        let id = if id.is_empty() {
            generate_conversation_id()
        } else {
            id.to_string()
        };

        let entry = self
            .conversations
            .entry(id.clone())
            .or_insert_with(|| Conversation::empty(id));
        Ok(entry.value().clone())
    }

    fn append(&self, id: &str, role: Role, content: &str) -> StoreResult<()> {
        // The shard write lock is held for the whole mutation, so concurrent
        // appends to one id are serialized and readers see complete entries.
        let mut entry = self
            .conversations
            .entry(id.to_string())
            .or_insert_with(|| Conversation::empty(id));
        entry.messages.push(Message::new(role, content));
        entry.last_updated = Utc::now();
        Ok(())
    }

    fn delete(&self, id: &str) -> StoreResult<bool> {
        Ok(self.conversations.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;
    use std::sync::Arc;

    #[test]
    fn test_memory_store_contract() {
        contract::run_all(&MemoryStore::new());
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store
                            .append("shared", Role::User, &format!("{}-{}", t, i))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let conv = store.get("shared").unwrap();
        assert_eq!(conv.messages.len(), 400);
        // Per-writer order is preserved.
        let first_writer: Vec<&str> = conv
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .filter(|c| c.starts_with("0-"))
            .collect();
        let expected: Vec<String> = (0..50).map(|i| format!("0-{}", i)).collect();
        assert_eq!(first_writer, expected);
    }

    #[test]
    fn test_get_creates_entry() {
        let store = MemoryStore::new();
        assert!(store.is_empty());
        let conv = store.get("").unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&conv.id).unwrap().id, conv.id);
        assert_eq!(store.len(), 1);
    }
}
