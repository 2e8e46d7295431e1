//! Conversation records: one per customer, append-only message history.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form key/value metadata accumulated across turns.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Metadata key holding the map of completed side effects (effect key → RFC 3339 timestamp).
pub const EFFECTS_KEY: &str = "effects";

/// Metadata key holding the intent decided for each inbound message (Message-ID → intent).
pub const INTENTS_KEY: &str = "message_intents";

/// Map-valued keys merged entry by entry instead of replaced.
const MERGED_KEYS: [&str; 2] = [EFFECTS_KEY, INTENTS_KEY];

/// Normalize an email address into a customer id.
pub fn normalize_customer_id(email: &str) -> String {
    email.trim().to_lowercase()
}

// ── Status ──────────────────────────────────────────────────────────

/// Where a conversation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    AwaitingInfo,
    Resolved,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::AwaitingInfo => "awaiting_info",
            Self::Resolved => "resolved",
        }
    }

    /// Whether `self → next` is in the transition table.
    ///
    /// open → awaiting_info | resolved, awaiting_info → open | resolved.
    /// `resolved` is terminal.
    pub fn can_transition_to(&self, next: ConversationStatus) -> bool {
        use ConversationStatus::*;
        matches!(
            (self, next),
            (Open, AwaitingInfo) | (Open, Resolved) | (AwaitingInfo, Open) | (AwaitingInfo, Resolved)
        )
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "awaiting_info" => Ok(Self::AwaitingInfo),
            "resolved" => Ok(Self::Resolved),
            other => Err(format!("unknown conversation status: '{other}'")),
        }
    }
}

// ── Messages ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "outbound" {
            Self::Outbound
        } else {
            Self::Inbound
        }
    }
}

/// A message about to be appended.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub body: String,
    /// Channel-native id (email Message-ID).
    pub external_id: Option<String>,
    pub subject: Option<String>,
    /// Extracted metadata: order id, attachment names, …
    pub metadata: serde_json::Value,
}

impl NewMessage {
    pub fn inbound(body: impl Into<String>) -> Self {
        Self::new(Direction::Inbound, body)
    }

    pub fn outbound(body: impl Into<String>) -> Self {
        Self::new(Direction::Outbound, body)
    }

    fn new(direction: Direction, body: impl Into<String>) -> Self {
        Self {
            direction,
            timestamp: Utc::now(),
            body: body.into(),
            external_id: None,
            subject: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = ts;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A persisted message. `seq` is the 1-based arrival position in its conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub seq: u32,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub body: String,
    pub external_id: Option<String>,
    pub subject: Option<String>,
    pub metadata: serde_json::Value,
}

impl MessageRecord {
    pub fn from_new(seq: u32, msg: NewMessage) -> Self {
        Self {
            seq,
            direction: msg.direction,
            timestamp: msg.timestamp,
            body: msg.body,
            external_id: msg.external_id,
            subject: msg.subject,
            metadata: msg.metadata,
        }
    }
}

// ── Metadata patch ──────────────────────────────────────────────────

/// Partial metadata update: `set` overwrites per key, `clear` removes keys.
///
/// Keys not mentioned are left untouched. A key present in both is cleared
/// first and then set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataPatch {
    pub set: Metadata,
    pub clear: Vec<String>,
}

impl MetadataPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.set.insert(key.into(), value.into());
        self
    }

    pub fn clear(mut self, key: impl Into<String>) -> Self {
        self.clear.push(key.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.clear.is_empty()
    }

    /// Fold another patch into this one; later values win.
    pub fn merge(mut self, other: MetadataPatch) -> Self {
        self.clear.extend(other.clear);
        self.set.extend(other.set);
        self
    }

    pub fn apply(&self, metadata: &mut Metadata) {
        for key in &self.clear {
            metadata.remove(key);
        }
        for (key, value) in &self.set {
            if MERGED_KEYS.contains(&key.as_str())
                && let (Some(serde_json::Value::Object(existing)), serde_json::Value::Object(new)) =
                    (metadata.get_mut(key), value)
            {
                for (k, v) in new {
                    existing.insert(k.clone(), v.clone());
                }
                continue;
            }
            metadata.insert(key.clone(), value.clone());
        }
    }
}

// ── Conversation ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub customer_id: String,
    pub thread_id: Option<String>,
    pub status: ConversationStatus,
    pub metadata: Metadata,
    pub messages: Vec<MessageRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// An empty, open conversation.
    pub fn new(customer_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            customer_id: normalize_customer_id(customer_id),
            thread_id: None,
            status: ConversationStatus::Open,
            metadata: Metadata::new(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sequence number the next appended message gets.
    pub fn next_seq(&self) -> u32 {
        self.messages.last().map_or(1, |m| m.seq + 1)
    }

    /// The last `n` messages, oldest first.
    pub fn recent_messages(&self, n: usize) -> &[MessageRecord] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    /// Whether a message with this channel-native id was already recorded.
    pub fn has_message(&self, external_id: &str) -> bool {
        self.messages
            .iter()
            .any(|m| m.external_id.as_deref() == Some(external_id))
    }

    /// Timestamp of a completed side effect, if recorded.
    pub fn effect_marker(&self, effect_key: &str) -> Option<&str> {
        self.metadata
            .get(EFFECTS_KEY)
            .and_then(|e| e.get(effect_key))
            .and_then(|v| v.as_str())
    }

    /// The intent recorded when this message was first processed.
    pub fn recorded_intent(&self, message_id: &str) -> Option<&serde_json::Value> {
        self.metadata.get(INTENTS_KEY).and_then(|m| m.get(message_id))
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// Row shape for listing conversations.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub customer_id: String,
    pub thread_id: Option<String>,
    pub status: ConversationStatus,
    pub subject: Option<String>,
    pub message_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
