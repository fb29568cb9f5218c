use tracing::debug;

use crate::error::StoreResult;
use crate::event::ChatEvent;
use crate::store::StoreHandle;

/// Store-backed log of the most recent serialized chat messages, shared by
/// every relay process.
#[derive(Clone)]
pub struct HistoryBuffer {
    store: StoreHandle,
    key: String,
    limit: usize,
}

impl HistoryBuffer {
    pub fn new(store: StoreHandle, key: impl Into<String>, limit: usize) -> Self {
        Self {
            store,
            key: key.into(),
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Push then trim. The two steps are separately visible, so a concurrent
    /// reader may briefly see more than `limit` entries.
    pub async fn append(&self, serialized: &str) -> StoreResult<()> {
        self.store.rpush(&self.key, serialized).await?;
        self.store
            .ltrim(&self.key, -(self.limit as isize), -1)
            .await
    }

    /// Stored entries, oldest first.
    pub async fn recent(&self) -> StoreResult<Vec<String>> {
        self.store.lrange(&self.key, 0, -1).await
    }

    /// Entries suitable for replay to a joining connection: only `message`
    /// events, in stored order, capped at `limit`.
    pub async fn replay(&self) -> StoreResult<Vec<String>> {
        let entries = self.recent().await?;
        let skip = entries.len().saturating_sub(self.limit);
        Ok(entries
            .into_iter()
            .skip(skip)
            .filter(|entry| match ChatEvent::decode(entry) {
                Ok(event) => event.is_message(),
                Err(err) => {
                    debug!(error = %err, "skipping undecodable history entry");
                    false
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBody;
    use crate::store::{MemoryStore, Store};
    use std::sync::Arc;

    fn message(id: u64) -> String {
        ChatEvent::new(
            id,
            "1",
            "abc",
            EventBody::Message {
                user_name: "Ash".into(),
                message: format!("msg {id}"),
            },
        )
        .encode()
        .unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn keeps_only_the_most_recent_entries() {
        let history = HistoryBuffer::new(Arc::new(MemoryStore::new()), "chat_history", 100);
        for id in 0..130 {
            history.append(&message(id)).await.unwrap();
        }
        let recent = history.recent().await.unwrap();
        assert_eq!(recent.len(), 100);
        assert_eq!(recent.first().unwrap(), &message(30));
        assert_eq!(recent.last().unwrap(), &message(129));
    }

    #[test_timeout::tokio_timeout_test]
    async fn replay_filters_non_message_entries() {
        let store = MemoryStore::new();
        let history = HistoryBuffer::new(Arc::new(store.clone()), "chat_history", 100);
        let user_name = ChatEvent::new(
            1,
            "1",
            "abc",
            EventBody::UserName {
                user_name: "Ash".into(),
            },
        )
        .encode()
        .unwrap();
        let init = ChatEvent::new(2, "1", "abc", EventBody::SessionInit)
            .encode()
            .unwrap();

        // Older relays appended every event type; replay must still hide them.
        store.rpush("chat_history", &user_name).await.unwrap();
        history.append(&message(3)).await.unwrap();
        store.rpush("chat_history", &init).await.unwrap();
        store.rpush("chat_history", "{broken").await.unwrap();
        history.append(&message(4)).await.unwrap();

        assert_eq!(history.replay().await.unwrap(), vec![message(3), message(4)]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn replay_caps_an_untrimmed_list() {
        let store = MemoryStore::new();
        let history = HistoryBuffer::new(Arc::new(store.clone()), "chat_history", 3);
        for id in 0..5 {
            store.rpush("chat_history", &message(id)).await.unwrap();
        }
        assert_eq!(
            history.replay().await.unwrap(),
            vec![message(2), message(3), message(4)]
        );
    }
}
