//! Shared types for the support pipeline.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conversation::normalize_customer_id;
use crate::error::ChannelError;

// ── Inbound email ───────────────────────────────────────────────────

/// A customer email as delivered by the mail service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEmail {
    /// Mailbox-local handle used to mark the message seen (IMAP UID).
    pub uid: String,
    /// RFC 5322 Message-ID, the channel-native message id.
    pub message_id: String,
    pub sender: String,
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    /// Plain-text body (HTML already stripped).
    pub body: String,
    pub in_reply_to: Option<String>,
    /// Message-IDs from the References header, oldest first.
    #[serde(default)]
    pub references: Vec<String>,
    /// Attachment file names.
    #[serde(default)]
    pub attachments: Vec<String>,
    pub received_at: DateTime<Utc>,
}

impl InboundEmail {
    /// Minimal email, mostly for the interactive mode and tests.
    pub fn new(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            uid: String::new(),
            message_id: format!("<{}@crm-agent.local>", uuid::Uuid::new_v4()),
            sender: sender.into(),
            sender_name: None,
            subject: None,
            body: body.into(),
            in_reply_to: None,
            references: Vec::new(),
            attachments: Vec::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = id.into();
        self
    }

    pub fn customer_id(&self) -> String {
        normalize_customer_id(&self.sender)
    }

    /// Root of the mail thread: first reference, else the replied-to id, else ourselves.
    pub fn thread_id(&self) -> &str {
        self.references
            .first()
            .or(self.in_reply_to.as_ref())
            .unwrap_or(&self.message_id)
    }

    /// Per-message metadata recorded alongside the body.
    pub fn message_metadata(&self) -> serde_json::Value {
        let mut meta = serde_json::Map::new();
        if let Some(ref name) = self.sender_name {
            meta.insert("sender_name".into(), name.clone().into());
        }
        if !self.attachments.is_empty() {
            meta.insert("attachments".into(), self.attachments.clone().into());
        }
        if let Some(ref irt) = self.in_reply_to {
            meta.insert("in_reply_to".into(), irt.clone().into());
        }
        serde_json::Value::Object(meta)
    }
}

// ── Outbound reply ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundReply {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    /// Files sent along with the body (certificates, receipt guides).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<PathBuf>,
}

impl OutboundReply {
    /// Reply threaded under `original`.
    pub fn to_email(original: &InboundEmail, body: impl Into<String>) -> Self {
        let subject = match original.subject.as_deref().map(str::trim) {
            Some(s) if s.to_lowercase().starts_with("re:") => s.to_string(),
            Some(s) if !s.is_empty() => format!("Re: {s}"),
            _ => "Re: Your support request".to_string(),
        };
        let mut references = original.references.clone();
        if !references.contains(&original.message_id) {
            references.push(original.message_id.clone());
        }
        Self {
            to: original.sender.clone(),
            subject,
            body: body.into(),
            in_reply_to: Some(original.message_id.clone()),
            references,
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<PathBuf>) -> Self {
        self.attachments = attachments;
        self
    }
}

// ── Mail service trait ──────────────────────────────────────────────

/// Mail transport, pure I/O. Classification and actions live in the processor.
#[async_trait]
pub trait MailService: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch messages not yet marked seen. Does not mark them.
    async fn fetch_unseen(&self) -> Result<Vec<InboundEmail>, ChannelError>;

    /// Mark messages seen by `uid`.
    async fn mark_seen(&self, uids: &[String]) -> Result<(), ChannelError>;

    /// Send a reply; returns the Message-ID assigned to it.
    async fn send_reply(&self, reply: &OutboundReply) -> Result<String, ChannelError>;

    async fn health_check(&self) -> Result<(), ChannelError>;
}
