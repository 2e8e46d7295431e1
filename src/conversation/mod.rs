//! Conversation state: the per-customer record and its store.

pub mod model;
pub mod store;

pub use model::{
    Conversation, ConversationStatus, ConversationSummary, Direction, EFFECTS_KEY, INTENTS_KEY,
    MessageRecord, Metadata, MetadataPatch, NewMessage, normalize_customer_id,
};
pub use store::ConversationStore;
