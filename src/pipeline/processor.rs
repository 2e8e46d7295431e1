//! Support processor: runs one inbound email end to end.
//!
//! Flow, under the customer's unit lock:
//! 1. Load or create the conversation, record the thread, reopen if we were waiting
//! 2. Append the inbound message (skipped on redelivery)
//! 3. Classify (a redelivery reuses the recorded intent) → execute → merge metadata → move status
//! 4. Ledger row and reply, both best-effort

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::actions::{ActionContext, ActionExecutor, ActionOutcome, ActionResult};
use crate::conversation::{
    ConversationStatus, ConversationStore, INTENTS_KEY, MetadataPatch, NewMessage,
};
use crate::error::{PipelineError, ServiceError, StoreError};
use crate::locks::KeyedLocks;
use crate::pipeline::classifier::{Intent, IntentClassifier};
use crate::pipeline::responder::Responder;
use crate::pipeline::types::InboundEmail;
use crate::services::{LedgerRow, LedgerWriter};

/// Metadata flag set when a message needs a human.
pub const MANUAL_REVIEW_KEY: &str = "needs_manual_review";

/// What happened to one inbound email.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub customer_id: String,
    pub message_id: String,
    pub intent: Intent,
    pub result: ActionResult,
    pub already_done: bool,
    /// The message had been recorded before (redelivery).
    pub redelivered: bool,
    pub status: ConversationStatus,
    pub manual_review: bool,
    pub ledger_written: bool,
    pub reply_sent: bool,
    /// Reply text, whether or not it was delivered.
    pub reply: String,
}

pub struct SupportProcessor {
    store: Arc<ConversationStore>,
    classifier: IntentClassifier,
    executor: ActionExecutor,
    ledger: Arc<dyn LedgerWriter>,
    responder: Responder,
    app_name: String,
    ledger_timeout: Duration,
    unit_locks: KeyedLocks,
}

impl SupportProcessor {
    pub fn new(
        store: Arc<ConversationStore>,
        classifier: IntentClassifier,
        executor: ActionExecutor,
        ledger: Arc<dyn LedgerWriter>,
        responder: Responder,
        app_name: impl Into<String>,
        ledger_timeout: Duration,
    ) -> Self {
        Self {
            store,
            classifier,
            executor,
            ledger,
            responder,
            app_name: app_name.into(),
            ledger_timeout,
            unit_locks: KeyedLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn ledger_name(&self) -> &str {
        self.ledger.name()
    }

    /// Process one inbound email. Errors abort only this unit of work.
    pub async fn process(&self, email: InboundEmail) -> Result<ProcessOutcome, PipelineError> {
        let customer = email.customer_id();
        let _unit = self.unit_locks.lock(&customer).await;

        info!(customer = %customer, message_id = %email.message_id, "Processing email");

        // 1. Conversation, thread, reopen.
        self.store.get_or_create(&customer).await?;
        let mut conversation = self.store.set_thread_id(&customer, email.thread_id()).await?;
        if conversation.status == ConversationStatus::AwaitingInfo {
            conversation = self
                .store
                .set_status(&customer, ConversationStatus::Open)
                .await?;
        }

        // 2. Record the inbound message once.
        let redelivered = conversation.has_message(&email.message_id);
        if redelivered {
            info!(customer = %customer, message_id = %email.message_id, "Redelivered message, not appending");
        } else {
            let mut message = NewMessage::inbound(&email.body)
                .with_external_id(&email.message_id)
                .with_timestamp(email.received_at)
                .with_metadata(email.message_metadata());
            if let Some(ref subject) = email.subject {
                message = message.with_subject(subject);
            }
            conversation = self.store.append_message(&customer, message).await?;
        }

        // 3. Classify and act. The intent is recorded per message so a
        // redelivery derives the same effect key whatever the model says now.
        let recorded = if redelivered {
            conversation
                .recorded_intent(&email.message_id)
                .and_then(|v| serde_json::from_value::<Intent>(v.clone()).ok())
        } else {
            None
        };
        let intent = match recorded {
            Some(intent) => {
                info!(
                    customer = %customer,
                    message_id = %email.message_id,
                    intent = intent.label(),
                    "Reusing intent recorded at first delivery"
                );
                intent
            }
            None => {
                let intent = attach_screenshot(
                    self.classifier.classify(&email.body, &conversation).await,
                    &email,
                );
                if let Ok(value) = serde_json::to_value(&intent) {
                    let mut entry = serde_json::Map::new();
                    entry.insert(email.message_id.clone(), value);
                    conversation = self
                        .store
                        .update_metadata(
                            &customer,
                            MetadataPatch::new().set(INTENTS_KEY, serde_json::Value::Object(entry)),
                        )
                        .await?;
                }
                intent
            }
        };
        let outcome = self
            .executor
            .execute(
                &intent,
                &ActionContext {
                    conversation: &conversation,
                    message_id: &email.message_id,
                    message_body: &email.body,
                },
            )
            .await;

        let mut patch = outcome.patch.clone().set("last_intent", intent.label());
        if conversation.metadata_str("subject").is_none()
            && let Some(ref subject) = email.subject
        {
            patch = patch.set("subject", subject.clone());
        }
        if let Some(name) = email.sender_name.as_deref().filter(|n| !n.trim().is_empty()) {
            patch = patch.set("customer_name", name.trim());
        }
        self.store.update_metadata(&customer, patch).await?;

        let (status, manual_review) = match self
            .store
            .set_status(&customer, outcome.target_status)
            .await
        {
            Ok(conv) => (conv.status, false),
            // The first delivery already moved the conversation on.
            Err(StoreError::InvalidTransition { from, to }) if redelivered => {
                info!(customer = %customer, %from, %to, "Redelivery leaves status unchanged");
                (from, false)
            }
            Err(StoreError::InvalidTransition { from, to }) => {
                error!(
                    customer = %customer,
                    %from,
                    %to,
                    intent = intent.label(),
                    "Invalid status transition, flagging for manual review"
                );
                self.store
                    .update_metadata(&customer, MetadataPatch::new().set(MANUAL_REVIEW_KEY, true))
                    .await?;
                (from, true)
            }
            Err(e) => return Err(e.into()),
        };

        // 4. Best-effort sinks.
        let ledger_written = self.write_ledger(&email, &outcome, status).await;

        let reply = self.responder.compose(&email, &outcome, manual_review);
        let attachments = self.responder.attachments(&outcome, manual_review);
        let reply_sent = match self.responder.send(&email, reply.clone(), attachments).await {
            Ok((sent, message_id)) => {
                let message = NewMessage::outbound(&sent.body)
                    .with_external_id(message_id)
                    .with_subject(&sent.subject);
                if let Err(e) = self.store.append_message(&customer, message).await {
                    warn!(customer = %customer, error = %e, "Reply sent but not recorded");
                }
                true
            }
            Err(e) => {
                warn!(customer = %customer, error = %e, "Reply not sent");
                false
            }
        };

        info!(
            customer = %customer,
            intent = intent.label(),
            status = %status,
            already_done = outcome.already_done,
            manual_review,
            reply_sent,
            "Email processed"
        );

        Ok(ProcessOutcome {
            customer_id: customer,
            message_id: email.message_id,
            intent,
            result: outcome.result,
            already_done: outcome.already_done,
            redelivered,
            status,
            manual_review,
            ledger_written,
            reply_sent,
            reply,
        })
    }

    async fn write_ledger(
        &self,
        email: &InboundEmail,
        outcome: &ActionOutcome,
        status: ConversationStatus,
    ) -> bool {
        let row = LedgerRow {
            timestamp: Utc::now(),
            issue_type: outcome.intent.issue_type().to_string(),
            app_name: self.app_name.clone(),
            email: email.customer_id(),
            initial_message: email.body.clone(),
            status: status.to_string(),
        };
        let result = tokio::time::timeout(self.ledger_timeout, self.ledger.append(&row))
            .await
            .unwrap_or_else(|_| Err(ServiceError::timeout("ledger", self.ledger_timeout)));
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(customer = %row.email, error = %e, "Ledger row not written");
                false
            }
        }
    }
}

/// A technical issue without a named screenshot picks up the first attachment.
fn attach_screenshot(intent: Intent, email: &InboundEmail) -> Intent {
    match intent {
        Intent::TechnicalIssue {
            description,
            attachment_ref: None,
        } => Intent::TechnicalIssue {
            description,
            attachment_ref: email.attachments.first().cloned(),
        },
        other => other,
    }
}
