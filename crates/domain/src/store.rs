//! The message-store seam.
//!
//! Thread/message persistence belongs to an external database; the runtime
//! only reads and appends through this trait. The in-memory implementation
//! backs tests and local development.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::message::{Message, MessageType};

/// Append/read access to thread history.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message; the store assigns id and timestamp.
    async fn add_message(
        &self,
        thread_id: Uuid,
        message_type: MessageType,
        content: Value,
        is_llm_message: bool,
        metadata: Value,
    ) -> Result<Message>;

    /// All messages of a thread, in insertion order.
    async fn get_messages(&self, thread_id: Uuid) -> Result<Vec<Message>>;

    async fn get_message(&self, message_id: Uuid) -> Result<Option<Message>>;

    async fn delete_message(&self, message_id: Uuid) -> Result<()>;
}

/// Test/local implementation keeping everything in process memory.
#[derive(Default)]
pub struct InMemoryMessageStore {
    threads: RwLock<HashMap<Uuid, Vec<Message>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn add_message(
        &self,
        thread_id: Uuid,
        message_type: MessageType,
        content: Value,
        is_llm_message: bool,
        metadata: Value,
    ) -> Result<Message> {
        let message = Message {
            message_id: Uuid::new_v4(),
            thread_id,
            message_type,
            is_llm_message,
            content,
            metadata,
            created_at: Utc::now(),
        };
        self.threads
            .write()
            .entry(thread_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn get_messages(&self, thread_id: Uuid) -> Result<Vec<Message>> {
        Ok(self
            .threads
            .read()
            .get(&thread_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_message(&self, message_id: Uuid) -> Result<Option<Message>> {
        Ok(self
            .threads
            .read()
            .values()
            .flatten()
            .find(|m| m.message_id == message_id)
            .cloned())
    }

    async fn delete_message(&self, message_id: Uuid) -> Result<()> {
        let mut threads = self.threads.write();
        for messages in threads.values_mut() {
            if let Some(pos) = messages.iter().position(|m| m.message_id == message_id) {
                messages.remove(pos);
                return Ok(());
            }
        }
        Err(Error::NotFound(format!("message {message_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_and_list_preserves_order() {
        let store = InMemoryMessageStore::new();
        let thread_id = Uuid::new_v4();
        for i in 0..3 {
            store
                .add_message(
                    thread_id,
                    MessageType::User,
                    serde_json::json!({ "role": "user", "content": format!("m{i}") }),
                    true,
                    Value::Null,
                )
                .await
                .unwrap();
        }
        let messages = store.get_messages(thread_id).await.unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content["content"], "m0");
        assert_eq!(messages[2].content["content"], "m2");
    }

    #[tokio::test]
    async fn get_and_delete_by_id() {
        let store = InMemoryMessageStore::new();
        let thread_id = Uuid::new_v4();
        let stored = store
            .add_message(
                thread_id,
                MessageType::ImageContext,
                serde_json::json!({ "image": "ref-1" }),
                false,
                Value::Null,
            )
            .await
            .unwrap();

        let found = store.get_message(stored.message_id).await.unwrap();
        assert!(found.is_some());

        store.delete_message(stored.message_id).await.unwrap();
        assert!(store.get_message(stored.message_id).await.unwrap().is_none());
        assert!(store.delete_message(stored.message_id).await.is_err());
    }
}
