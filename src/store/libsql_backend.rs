//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::conversation::{
    Conversation, ConversationStatus, ConversationSummary, Direction, Metadata, MessageRecord,
};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests and throwaway interactive sessions).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn load_messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM conversation_messages
                     WHERE conversation_id = ?1 ORDER BY seq ASC"
                ),
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load_messages: {e}")))?
        {
            messages.push(
                row_to_message(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            );
        }
        Ok(messages)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_status(s: &str) -> ConversationStatus {
    s.parse().unwrap_or_else(|e| {
        tracing::warn!("{e}; treating as open");
        ConversationStatus::Open
    })
}

fn parse_json_object(s: &str) -> serde_json::Value {
    serde_json::from_str(s).unwrap_or_else(|_| serde_json::json!({}))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const CONVERSATION_COLUMNS: &str =
    "id, customer_id, thread_id, status, metadata, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "seq, direction, body, external_id, subject, metadata, sent_at";

/// Map a row (CONVERSATION_COLUMNS order) to a conversation without messages.
///
/// Unreadable metadata is an error: saving an emptied map back would drop
/// every effect marker.
fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, DatabaseError> {
    let column = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));
    let id_str: String = row.get(0).map_err(column)?;
    let customer_id: String = row.get(1).map_err(column)?;
    let status_str: String = row.get(3).map_err(column)?;
    let metadata_str: String = row.get(4).map_err(column)?;
    let created_str: String = row.get(5).map_err(column)?;
    let updated_str: String = row.get(6).map_err(column)?;

    let metadata: Metadata = serde_json::from_str(&metadata_str).map_err(|e| {
        DatabaseError::Serialization(format!("metadata of conversation {customer_id}: {e}"))
    })?;
    let id = Uuid::parse_str(&id_str).map_err(|e| {
        DatabaseError::Serialization(format!("id of conversation {customer_id}: {e}"))
    })?;

    Ok(Conversation {
        id,
        customer_id,
        thread_id: row.get(2).ok(),
        status: parse_status(&status_str),
        metadata,
        messages: Vec::new(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a row (MESSAGE_COLUMNS order) to a message record.
fn row_to_message(row: &libsql::Row) -> Result<MessageRecord, libsql::Error> {
    let seq: i64 = row.get(0)?;
    let direction: String = row.get(1)?;
    let metadata_str: String = row.get(5)?;
    let sent_str: String = row.get(6)?;

    Ok(MessageRecord {
        seq: seq as u32,
        direction: Direction::parse(&direction),
        timestamp: parse_datetime(&sent_str),
        body: row.get(2)?,
        external_id: row.get(3).ok(),
        subject: row.get(4).ok(),
        metadata: parse_json_object(&metadata_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn insert_conversation_if_absent(
        &self,
        conversation: &Conversation,
    ) -> Result<(), DatabaseError> {
        let metadata = serde_json::to_string(&conversation.metadata)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO conversations (id, customer_id, thread_id, status, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (customer_id) DO NOTHING",
                params![
                    conversation.id.to_string(),
                    conversation.customer_id.clone(),
                    opt_text(conversation.thread_id.as_deref()),
                    conversation.status.as_str(),
                    metadata,
                    conversation.created_at.to_rfc3339(),
                    conversation.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_conversation: {e}")))?;

        if inserted > 0 {
            debug!(customer = %conversation.customer_id, id = %conversation.id, "Conversation created");
        }
        Ok(())
    }

    async fn load_conversation(
        &self,
        customer_id: &str,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE customer_id = ?1"),
                params![customer_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_conversation: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("load_conversation: {e}"))),
        };

        let mut conversation = row_to_conversation(&row)?;
        conversation.messages = self.load_messages(&conversation.id.to_string()).await?;
        Ok(Some(conversation))
    }

    async fn insert_message(
        &self,
        conversation_id: Uuid,
        message: &MessageRecord,
    ) -> Result<(), DatabaseError> {
        let metadata = serde_json::to_string(&message.metadata)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO conversation_messages (id, conversation_id, seq, direction, body, external_id, subject, metadata, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                Uuid::new_v4().to_string(),
                conversation_id.to_string(),
                i64::from(message.seq),
                message.direction.as_str(),
                message.body.clone(),
                opt_text(message.external_id.as_deref()),
                opt_text(message.subject.as_deref()),
                metadata,
                message.timestamp.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_message: {e}")))?;

        conn.execute(
            "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
            params![conversation_id.to_string(), Utc::now().to_rfc3339()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("touch conversation: {e}")))?;

        debug!(conversation = %conversation_id, seq = message.seq, "Message stored");
        Ok(())
    }

    async fn save_metadata(
        &self,
        conversation_id: Uuid,
        metadata: &Metadata,
        updated_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let meta_str = serde_json::to_string(metadata)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "UPDATE conversations SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
                params![meta_str, updated_at.to_rfc3339(), conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_metadata: {e}")))?;
        Ok(())
    }

    async fn save_status(
        &self,
        conversation_id: Uuid,
        status: ConversationStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE conversations SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), updated_at.to_rfc3339(), conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_status: {e}")))?;

        debug!(conversation = %conversation_id, status = %status, "Status updated in DB");
        Ok(())
    }

    async fn save_thread_id(
        &self,
        conversation_id: Uuid,
        thread_id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE conversations SET thread_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![thread_id, updated_at.to_rfc3339(), conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_thread_id: {e}")))?;
        Ok(())
    }

    async fn list_conversations(
        &self,
        customer_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS},
                        (SELECT COUNT(*) FROM conversation_messages m WHERE m.conversation_id = c.id)
                     FROM conversations c
                     WHERE ?1 IS NULL OR customer_id = ?1
                     ORDER BY updated_at DESC LIMIT ?2"
                ),
                params![opt_text(customer_id), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_conversations: {e}")))?;

        let mut summaries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_conversation(&row) {
                Ok(conv) => {
                    let count: i64 = row.get(7).unwrap_or(0);
                    summaries.push(ConversationSummary {
                        subject: conv.metadata_str("subject").map(str::to_string),
                        customer_id: conv.customer_id,
                        thread_id: conv.thread_id,
                        status: conv.status,
                        message_count: count as u32,
                        created_at: conv.created_at,
                        updated_at: conv.updated_at,
                    });
                }
                Err(e) => tracing::warn!("Skipping conversation row: {e}"),
            }
        }
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::NewMessage;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    #[tokio::test]
    async fn insert_and_load_conversation() {
        let db = test_db().await;
        let conv = Conversation::new("a@x.com");
        db.insert_conversation_if_absent(&conv).await.unwrap();

        let loaded = db.load_conversation("a@x.com").await.unwrap().unwrap();
        assert_eq!(loaded.id, conv.id);
        assert_eq!(loaded.status, ConversationStatus::Open);
        assert!(loaded.messages.is_empty());
        assert!(loaded.metadata.is_empty());
    }

    #[tokio::test]
    async fn corrupt_metadata_is_an_error() {
        let db = test_db().await;
        let conv = Conversation::new("a@x.com");
        db.insert_conversation_if_absent(&conv).await.unwrap();
        db.conn()
            .execute(
                "UPDATE conversations SET metadata = '{not json' WHERE customer_id = ?1",
                params!["a@x.com"],
            )
            .await
            .unwrap();

        let err = db.load_conversation("a@x.com").await.unwrap_err();
        assert!(matches!(err, DatabaseError::Serialization(ref m) if m.contains("a@x.com")));
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let db = test_db().await;
        assert!(db.load_conversation("nobody@x.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_if_absent_keeps_first() {
        let db = test_db().await;
        let first = Conversation::new("a@x.com");
        let second = Conversation::new("a@x.com");
        db.insert_conversation_if_absent(&first).await.unwrap();
        db.insert_conversation_if_absent(&second).await.unwrap();

        let loaded = db.load_conversation("a@x.com").await.unwrap().unwrap();
        assert_eq!(loaded.id, first.id);
    }

    #[tokio::test]
    async fn messages_come_back_in_seq_order() {
        let db = test_db().await;
        let conv = Conversation::new("a@x.com");
        db.insert_conversation_if_absent(&conv).await.unwrap();

        // Insert out of order on purpose.
        for seq in [2_u32, 1, 3] {
            let rec = MessageRecord::from_new(
                seq,
                NewMessage::inbound(format!("body {seq}"))
                    .with_external_id(format!("<{seq}@mail>"))
                    .with_subject("Certificate"),
            );
            db.insert_message(conv.id, &rec).await.unwrap();
        }

        let loaded = db.load_conversation("a@x.com").await.unwrap().unwrap();
        let seqs: Vec<u32> = loaded.messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(loaded.messages[0].body, "body 1");
        assert_eq!(loaded.messages[0].external_id.as_deref(), Some("<1@mail>"));
        assert_eq!(loaded.messages[0].subject.as_deref(), Some("Certificate"));
    }

    #[tokio::test]
    async fn duplicate_seq_is_rejected() {
        let db = test_db().await;
        let conv = Conversation::new("a@x.com");
        db.insert_conversation_if_absent(&conv).await.unwrap();

        let rec = MessageRecord::from_new(1, NewMessage::inbound("one"));
        db.insert_message(conv.id, &rec).await.unwrap();
        assert!(db.insert_message(conv.id, &rec).await.is_err());
    }

    #[tokio::test]
    async fn metadata_status_thread_roundtrip() {
        let db = test_db().await;
        let conv = Conversation::new("a@x.com");
        db.insert_conversation_if_absent(&conv).await.unwrap();

        let mut meta = Metadata::new();
        meta.insert("order_id".into(), serde_json::json!("GPA.1234"));
        db.save_metadata(conv.id, &meta, Utc::now()).await.unwrap();
        db.save_status(conv.id, ConversationStatus::AwaitingInfo, Utc::now())
            .await
            .unwrap();
        db.save_thread_id(conv.id, "<root@mail>", Utc::now()).await.unwrap();

        let loaded = db.load_conversation("a@x.com").await.unwrap().unwrap();
        assert_eq!(loaded.metadata["order_id"], "GPA.1234");
        assert_eq!(loaded.status, ConversationStatus::AwaitingInfo);
        assert_eq!(loaded.thread_id.as_deref(), Some("<root@mail>"));
    }

    #[tokio::test]
    async fn list_filters_and_counts() {
        let db = test_db().await;
        let a = Conversation::new("a@x.com");
        let b = Conversation::new("b@x.com");
        db.insert_conversation_if_absent(&a).await.unwrap();
        db.insert_conversation_if_absent(&b).await.unwrap();
        db.insert_message(a.id, &MessageRecord::from_new(1, NewMessage::inbound("hi")))
            .await
            .unwrap();

        let all = db.list_conversations(None, 10).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_a = db.list_conversations(Some("a@x.com"), 10).await.unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].message_count, 1);

        let limited = db.list_conversations(None, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn open_local_file_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("crm.db");
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        db.insert_conversation_if_absent(&Conversation::new("a@x.com"))
            .await
            .unwrap();
        assert!(path.exists());
    }
}
