//! Support pipeline.
//!
//! Every inbound email flows through:
//! 1. `MailService::fetch_unseen()`: channel I/O
//! 2. `IntentClassifier::classify()`: one LLM call, strict decode
//! 3. `ActionExecutor::execute()`: one idempotent side effect
//! 4. Ledger row and `Responder` reply, both best-effort
//!
//! `SupportProcessor` runs steps 2-4 for one email under the customer's lock.

pub mod classifier;
pub mod processor;
pub mod responder;
pub mod types;

pub use classifier::{Intent, IntentClassifier};
pub use processor::{ProcessOutcome, SupportProcessor};
pub use responder::Responder;
pub use types::{InboundEmail, MailService, OutboundReply};
