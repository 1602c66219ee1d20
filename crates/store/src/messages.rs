//! The Message Store Facade — semantic operations over a thread's
//! append-only message log. No query language leaks through this boundary.

use async_trait::async_trait;
use uuid::Uuid;

use relay_domain::error::Result;
use relay_domain::message::{Message, MessageKind};

/// Append/query contract every message store backend satisfies.
///
/// Implementations must preserve two properties:
/// - messages are append-only and totally ordered by
///   `(created_at, message_id)`;
/// - `list_llm` is prefix-stable: absent deletions, a later call returns
///   any earlier result as a prefix.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(
        &self,
        thread_id: Uuid,
        kind: MessageKind,
        content: serde_json::Value,
        is_llm_message: bool,
        metadata: serde_json::Value,
    ) -> Result<Message>;

    /// All messages of a thread, ordered.
    async fn list(&self, thread_id: Uuid) -> Result<Vec<Message>>;

    /// Messages participating in the LLM prompt, ordered.
    async fn list_llm(&self, thread_id: Uuid) -> Result<Vec<Message>>;

    /// Delete every message of one kind; returns how many were removed.
    /// Only `Summary` and `Status` records are ever deleted this way.
    async fn delete_by_kind(&self, thread_id: Uuid, kind: MessageKind) -> Result<usize>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use parking_lot::RwLock;
use std::collections::HashMap;

/// Ordered in-process store, the default for tests and single-node runs.
#[derive(Default)]
pub struct InMemoryMessageStore {
    threads: RwLock<HashMap<Uuid, Vec<Message>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(mut messages: Vec<Message>) -> Vec<Message> {
        messages.sort_by_key(|m| m.sort_key());
        messages
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(
        &self,
        thread_id: Uuid,
        kind: MessageKind,
        content: serde_json::Value,
        is_llm_message: bool,
        metadata: serde_json::Value,
    ) -> Result<Message> {
        let message = Message::new(thread_id, kind, content, is_llm_message, metadata);
        self.threads
            .write()
            .entry(thread_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn list(&self, thread_id: Uuid) -> Result<Vec<Message>> {
        let messages = self
            .threads
            .read()
            .get(&thread_id)
            .cloned()
            .unwrap_or_default();
        Ok(Self::sorted(messages))
    }

    async fn list_llm(&self, thread_id: Uuid) -> Result<Vec<Message>> {
        let messages = self.list(thread_id).await?;
        Ok(messages.into_iter().filter(|m| m.is_llm_message).collect())
    }

    async fn delete_by_kind(&self, thread_id: Uuid, kind: MessageKind) -> Result<usize> {
        let mut threads = self.threads.write();
        let Some(messages) = threads.get_mut(&thread_id) else {
            return Ok(0);
        };
        let before = messages.len();
        messages.retain(|m| m.kind != kind);
        Ok(before - messages.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryMessageStore {
        InMemoryMessageStore::new()
    }

    #[tokio::test]
    async fn append_and_list_ordered() {
        let store = store();
        let thread = Uuid::new_v4();

        for i in 0..5 {
            store
                .append(thread, MessageKind::User, format!("m{i}").into(), true, serde_json::Value::Null)
                .await
                .unwrap();
        }

        let messages = store.list(thread).await.unwrap();
        assert_eq!(messages.len(), 5);
        for pair in messages.windows(2) {
            assert!(pair[0].sort_key() < pair[1].sort_key());
        }
    }

    #[tokio::test]
    async fn list_llm_filters_non_llm() {
        let store = store();
        let thread = Uuid::new_v4();

        store
            .append(thread, MessageKind::User, "visible".into(), true, serde_json::Value::Null)
            .await
            .unwrap();
        store
            .append(thread, MessageKind::Status, "hidden".into(), false, serde_json::Value::Null)
            .await
            .unwrap();

        let llm = store.list_llm(thread).await.unwrap();
        assert_eq!(llm.len(), 1);
        assert_eq!(llm[0].text(), "visible");
    }

    #[tokio::test]
    async fn list_llm_is_prefix_stable() {
        let store = store();
        let thread = Uuid::new_v4();

        store
            .append(thread, MessageKind::User, "a".into(), true, serde_json::Value::Null)
            .await
            .unwrap();
        let first = store.list_llm(thread).await.unwrap();

        store
            .append(thread, MessageKind::Assistant, "b".into(), true, serde_json::Value::Null)
            .await
            .unwrap();
        let second = store.list_llm(thread).await.unwrap();

        assert_eq!(second.len(), 2);
        let prefix_ids: Vec<_> = second.iter().take(first.len()).map(|m| m.message_id).collect();
        let first_ids: Vec<_> = first.iter().map(|m| m.message_id).collect();
        assert_eq!(prefix_ids, first_ids);
    }

    #[tokio::test]
    async fn delete_by_kind_counts() {
        let store = store();
        let thread = Uuid::new_v4();

        store
            .append(thread, MessageKind::Summary, "s1".into(), true, serde_json::Value::Null)
            .await
            .unwrap();
        store
            .append(thread, MessageKind::Summary, "s2".into(), true, serde_json::Value::Null)
            .await
            .unwrap();
        store
            .append(thread, MessageKind::User, "keep".into(), true, serde_json::Value::Null)
            .await
            .unwrap();

        let n = store.delete_by_kind(thread, MessageKind::Summary).await.unwrap();
        assert_eq!(n, 2);
        let remaining = store.list(thread).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].kind, MessageKind::User);
    }

    #[tokio::test]
    async fn delete_from_unknown_thread_is_zero() {
        let store = store();
        let n = store.delete_by_kind(Uuid::new_v4(), MessageKind::Summary).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn threads_are_isolated() {
        let store = store();
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();

        store
            .append(t1, MessageKind::User, "one".into(), true, serde_json::Value::Null)
            .await
            .unwrap();

        assert_eq!(store.list(t1).await.unwrap().len(), 1);
        assert!(store.list(t2).await.unwrap().is_empty());
    }
}
