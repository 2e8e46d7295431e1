//! `Database` trait: single async interface for conversation persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::conversation::{Conversation, ConversationStatus, ConversationSummary, Metadata, MessageRecord};
use crate::error::DatabaseError;

/// Backend-agnostic persistence for conversation records.
///
/// Implementations do no locking of their own beyond what the storage engine
/// provides; read-modify-write sequences are serialized by `ConversationStore`.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Insert an empty conversation for `customer_id` unless one exists.
    async fn insert_conversation_if_absent(
        &self,
        conversation: &Conversation,
    ) -> Result<(), DatabaseError>;

    /// Load a conversation with its full message history (ordered by `seq`).
    async fn load_conversation(
        &self,
        customer_id: &str,
    ) -> Result<Option<Conversation>, DatabaseError>;

    /// Persist one message. `(conversation_id, seq)` is unique.
    async fn insert_message(
        &self,
        conversation_id: Uuid,
        message: &MessageRecord,
    ) -> Result<(), DatabaseError>;

    /// Replace the stored metadata object.
    async fn save_metadata(
        &self,
        conversation_id: Uuid,
        metadata: &Metadata,
        updated_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn save_status(
        &self,
        conversation_id: Uuid,
        status: ConversationStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn save_thread_id(
        &self,
        conversation_id: Uuid,
        thread_id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Most recently active conversations first.
    async fn list_conversations(
        &self,
        customer_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>, DatabaseError>;
}
