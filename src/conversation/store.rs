//! Conversation store with per-customer serialization.
//!
//! Every read-modify-write runs under the customer's lock so concurrent
//! appends never race on `seq` and metadata merges never lose writes.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::conversation::model::{
    Conversation, ConversationStatus, ConversationSummary, MessageRecord, MetadataPatch,
    NewMessage, normalize_customer_id,
};
use crate::error::StoreError;
use crate::locks::KeyedLocks;
use crate::store::Database;

pub struct ConversationStore {
    db: Arc<dyn Database>,
    locks: KeyedLocks,
}

impl ConversationStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            locks: KeyedLocks::new(),
        }
    }

    /// Return the customer's conversation, creating an empty open one if absent.
    pub async fn get_or_create(&self, customer_id: &str) -> Result<Conversation, StoreError> {
        let key = normalize_customer_id(customer_id);
        let _guard = self.locks.lock(&key).await;

        if let Some(existing) = self.db.load_conversation(&key).await? {
            return Ok(existing);
        }

        let fresh = Conversation::new(&key);
        self.db.insert_conversation_if_absent(&fresh).await?;
        // Another process may have won the insert; reload the persisted row.
        let conversation = self
            .db
            .load_conversation(&key)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                customer_id: key.clone(),
            })?;
        if conversation.id == fresh.id {
            info!(customer = %key, id = %conversation.id, "New conversation");
        }
        Ok(conversation)
    }

    pub async fn get(&self, customer_id: &str) -> Result<Option<Conversation>, StoreError> {
        let key = normalize_customer_id(customer_id);
        Ok(self.db.load_conversation(&key).await?)
    }

    /// Append a message at the next sequence number.
    pub async fn append_message(
        &self,
        customer_id: &str,
        message: NewMessage,
    ) -> Result<Conversation, StoreError> {
        let key = normalize_customer_id(customer_id);
        let _guard = self.locks.lock(&key).await;

        let mut conversation = self.load_existing(&key).await?;
        let record = MessageRecord::from_new(conversation.next_seq(), message);
        self.db.insert_message(conversation.id, &record).await?;

        debug!(
            customer = %key,
            seq = record.seq,
            direction = record.direction.as_str(),
            "Message appended"
        );
        conversation.updated_at = Utc::now();
        conversation.messages.push(record);
        Ok(conversation)
    }

    /// Merge a metadata patch. Keys absent from the patch are untouched.
    pub async fn update_metadata(
        &self,
        customer_id: &str,
        patch: MetadataPatch,
    ) -> Result<Conversation, StoreError> {
        let key = normalize_customer_id(customer_id);
        let _guard = self.locks.lock(&key).await;

        let mut conversation = self.load_existing(&key).await?;
        if patch.is_empty() {
            return Ok(conversation);
        }
        patch.apply(&mut conversation.metadata);
        conversation.updated_at = Utc::now();
        self.db
            .save_metadata(conversation.id, &conversation.metadata, conversation.updated_at)
            .await?;
        Ok(conversation)
    }

    /// Move to `status` if the transition table allows it.
    ///
    /// Setting the current status again is a no-op.
    pub async fn set_status(
        &self,
        customer_id: &str,
        status: ConversationStatus,
    ) -> Result<Conversation, StoreError> {
        let key = normalize_customer_id(customer_id);
        let _guard = self.locks.lock(&key).await;

        let mut conversation = self.load_existing(&key).await?;
        if conversation.status == status {
            return Ok(conversation);
        }
        if !conversation.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: conversation.status,
                to: status,
            });
        }

        let from = conversation.status;
        conversation.status = status;
        conversation.updated_at = Utc::now();
        self.db
            .save_status(conversation.id, status, conversation.updated_at)
            .await?;
        info!(customer = %key, %from, to = %status, "Conversation status changed");
        Ok(conversation)
    }

    /// Remember the latest mail thread identifier for this customer.
    pub async fn set_thread_id(
        &self,
        customer_id: &str,
        thread_id: &str,
    ) -> Result<Conversation, StoreError> {
        let key = normalize_customer_id(customer_id);
        let _guard = self.locks.lock(&key).await;

        let mut conversation = self.load_existing(&key).await?;
        if conversation.thread_id.as_deref() == Some(thread_id) {
            return Ok(conversation);
        }
        conversation.thread_id = Some(thread_id.to_string());
        conversation.updated_at = Utc::now();
        self.db
            .save_thread_id(conversation.id, thread_id, conversation.updated_at)
            .await?;
        Ok(conversation)
    }

    pub async fn list(
        &self,
        customer_filter: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let filter = customer_filter.map(normalize_customer_id);
        Ok(self.db.list_conversations(filter.as_deref(), limit).await?)
    }

    async fn load_existing(&self, key: &str) -> Result<Conversation, StoreError> {
        self.db
            .load_conversation(key)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                customer_id: key.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::EFFECTS_KEY;
    use crate::store::LibSqlBackend;

    async fn test_store() -> Arc<ConversationStore> {
        let db = LibSqlBackend::new_memory().await.unwrap();
        Arc::new(ConversationStore::new(Arc::new(db)))
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let store = test_store().await;
        let first = store.get_or_create("a@x.com").await.unwrap();
        let second = store.get_or_create("A@X.com ").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.status, ConversationStatus::Open);
        assert!(first.messages.is_empty());
    }

    #[tokio::test]
    async fn concurrent_get_or_create_yields_one_conversation() {
        let store = test_store().await;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.get_or_create("a@x.com").await.unwrap().id
            }));
        }
        let ids: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.list(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_appends_get_contiguous_seqs() {
        let store = test_store().await;
        store.get_or_create("a@x.com").await.unwrap();

        let n = 20;
        let mut handles = Vec::new();
        for i in 0..n {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .append_message("a@x.com", NewMessage::inbound(format!("msg {i}")))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let conv = store.get("a@x.com").await.unwrap().unwrap();
        let seqs: Vec<u32> = conv.messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, (1..=n).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn append_without_conversation_is_not_found() {
        let store = test_store().await;
        let err = store
            .append_message("ghost@x.com", NewMessage::inbound("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn update_metadata_without_conversation_is_not_found() {
        let store = test_store().await;
        let err = store
            .update_metadata("ghost@x.com", MetadataPatch::new().set("k", "v"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn metadata_merges_and_persists() {
        let store = test_store().await;
        store.get_or_create("a@x.com").await.unwrap();
        store
            .update_metadata(
                "a@x.com",
                MetadataPatch::new().set("order_id", "GPA.1").set("subject", "Help"),
            )
            .await
            .unwrap();
        store
            .update_metadata(
                "a@x.com",
                MetadataPatch::new()
                    .set("order_id", "GPA.2")
                    .set(EFFECTS_KEY, serde_json::json!({"subscription:GPA.2": "t"})),
            )
            .await
            .unwrap();

        let conv = store.get("a@x.com").await.unwrap().unwrap();
        assert_eq!(conv.metadata_str("order_id"), Some("GPA.2"));
        assert_eq!(conv.metadata_str("subject"), Some("Help"));
        assert_eq!(conv.effect_marker("subscription:GPA.2"), Some("t"));
    }

    #[tokio::test]
    async fn status_transitions_follow_table() {
        let store = test_store().await;
        store.get_or_create("a@x.com").await.unwrap();

        let conv = store
            .set_status("a@x.com", ConversationStatus::AwaitingInfo)
            .await
            .unwrap();
        assert_eq!(conv.status, ConversationStatus::AwaitingInfo);

        store.set_status("a@x.com", ConversationStatus::Open).await.unwrap();
        store
            .set_status("a@x.com", ConversationStatus::Resolved)
            .await
            .unwrap();

        let err = store
            .set_status("a@x.com", ConversationStatus::AwaitingInfo)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: ConversationStatus::Resolved,
                to: ConversationStatus::AwaitingInfo
            }
        ));

        let conv = store.get("a@x.com").await.unwrap().unwrap();
        assert_eq!(conv.status, ConversationStatus::Resolved);
    }

    #[tokio::test]
    async fn same_status_is_noop() {
        let store = test_store().await;
        store.get_or_create("a@x.com").await.unwrap();
        store.set_status("a@x.com", ConversationStatus::Resolved).await.unwrap();
        let conv = store
            .set_status("a@x.com", ConversationStatus::Resolved)
            .await
            .unwrap();
        assert_eq!(conv.status, ConversationStatus::Resolved);
    }

    #[tokio::test]
    async fn thread_id_is_recorded() {
        let store = test_store().await;
        store.get_or_create("a@x.com").await.unwrap();
        store.set_thread_id("a@x.com", "<t1@mail>").await.unwrap();
        let conv = store.get("a@x.com").await.unwrap().unwrap();
        assert_eq!(conv.thread_id.as_deref(), Some("<t1@mail>"));
    }

    #[tokio::test]
    async fn list_filters_by_customer() {
        let store = test_store().await;
        store.get_or_create("a@x.com").await.unwrap();
        store.get_or_create("b@x.com").await.unwrap();

        assert_eq!(store.list(None, 10).await.unwrap().len(), 2);
        let filtered = store.list(Some("B@X.COM"), 10).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].customer_id, "b@x.com");
    }
}
