//! Action executor: one side effect per intent, guarded by effect markers.
//!
//! The executor never writes the store. It returns the metadata patch and the
//! status the conversation should move to; the processor applies both under
//! the customer's unit lock, so the marker check and the marker write cannot
//! interleave with another unit of work for the same customer.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::conversation::{Conversation, ConversationStatus, EFFECTS_KEY, MetadataPatch};
use crate::error::ServiceError;
use crate::pipeline::classifier::Intent;
use crate::services::{
    CertificateService, SubscriptionService, Ticket, TicketCategory, TicketService,
};

/// What the executor did (or found already done).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ActionResult {
    CertificateIssued {
        course: String,
        name: String,
        /// The generated document, when it is known.
        #[serde(skip_serializing_if = "Option::is_none")]
        file: Option<PathBuf>,
    },
    SubscriptionActivated { order_id: String },
    TicketLogged { attachment_ref: Option<String> },
    RefundLogged { order_id: String },
    /// Nothing to act on yet; ask the customer for details.
    NeedsInfo,
    Failed { action: String, reason: String },
}

/// Result of executing one intent.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub intent: Intent,
    pub result: ActionResult,
    /// The effect marker was present, so the side effect was skipped.
    pub already_done: bool,
    /// Status the conversation should move to.
    pub target_status: ConversationStatus,
    /// Metadata to merge into the conversation.
    pub patch: MetadataPatch,
}

impl ActionOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.result, ActionResult::Failed { .. })
    }

    fn done(intent: &Intent, result: ActionResult, status: ConversationStatus, patch: MetadataPatch) -> Self {
        Self {
            intent: intent.clone(),
            result,
            already_done: false,
            target_status: status,
            patch,
        }
    }

    fn skipped(intent: &Intent, result: ActionResult, status: ConversationStatus) -> Self {
        Self {
            intent: intent.clone(),
            result,
            already_done: true,
            target_status: status,
            patch: MetadataPatch::new(),
        }
    }

    fn failed(intent: &Intent, action: &str, error: ServiceError) -> Self {
        Self {
            intent: intent.clone(),
            result: ActionResult::Failed {
                action: action.to_string(),
                reason: error.to_string(),
            },
            already_done: false,
            target_status: ConversationStatus::AwaitingInfo,
            patch: MetadataPatch::new().set("last_action_error", error.to_string()),
        }
    }
}

/// Effect key for an intent, if it has a side effect.
pub fn effect_key(intent: &Intent, message_id: &str) -> Option<String> {
    let norm = |s: &str| s.trim().to_lowercase();
    match intent {
        Intent::CertificateRequest { course, name } => {
            Some(format!("certificate:{}:{}", norm(course), norm(name)))
        }
        Intent::SubscriptionActivation { order_id } => Some(format!("subscription:{}", norm(order_id))),
        Intent::TechnicalIssue { .. } => Some(format!("ticket:technical:{message_id}")),
        Intent::Refund { order_id, .. } => Some(format!("refund:{}", norm(order_id))),
        Intent::Unclassified => None,
    }
}

/// Per-message facts the side effects need.
#[derive(Debug, Clone)]
pub struct ActionContext<'a> {
    pub conversation: &'a Conversation,
    /// Message-ID of the message being processed.
    pub message_id: &'a str,
    pub message_body: &'a str,
}

pub struct ActionExecutor {
    certificates: Arc<dyn CertificateService>,
    subscriptions: Arc<dyn SubscriptionService>,
    tickets: Arc<dyn TicketService>,
    app_name: String,
    timeout: Duration,
}

impl ActionExecutor {
    pub fn new(
        certificates: Arc<dyn CertificateService>,
        subscriptions: Arc<dyn SubscriptionService>,
        tickets: Arc<dyn TicketService>,
        app_name: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            certificates,
            subscriptions,
            tickets,
            app_name: app_name.into(),
            timeout,
        }
    }

    /// Execute the side effect for `intent` unless its marker is already set.
    pub async fn execute(&self, intent: &Intent, ctx: &ActionContext<'_>) -> ActionOutcome {
        let customer = &ctx.conversation.customer_id;
        let key = effect_key(intent, ctx.message_id);

        if let Some(ref key) = key
            && let Some(done_at) = ctx.conversation.effect_marker(key)
        {
            info!(customer = %customer, effect = %key, done_at, "Side effect already done, skipping");
            return ActionOutcome::skipped(intent, expected_result(intent, ctx), target_status(intent));
        }

        let outcome = match intent {
            Intent::CertificateRequest { course, name } => {
                match self.call("certificate", self.certificates.issue(name, course)).await {
                    Ok(issued) => {
                        let patch = MetadataPatch::new()
                            .set("certificate_issued_at", Utc::now().to_rfc3339())
                            .set("certificate_course", course.clone())
                            .set("certificate_name", name.clone())
                            .set("certificate_file", issued.file.display().to_string());
                        self.record(Ticket {
                            category: TicketCategory::Certificate,
                            app_name: self.app_name.clone(),
                            email: customer.clone(),
                            description: ctx.message_body.to_string(),
                            order_id: None,
                            attachment_ref: None,
                            course: Some(course.clone()),
                            certificate_name: Some(name.clone()),
                            status: ConversationStatus::Resolved.to_string(),
                        })
                        .await;
                        ActionOutcome::done(
                            intent,
                            ActionResult::CertificateIssued {
                                course: course.clone(),
                                name: name.clone(),
                                file: Some(issued.file),
                            },
                            ConversationStatus::Resolved,
                            patch,
                        )
                    }
                    Err(e) => ActionOutcome::failed(intent, "certificate", e),
                }
            }
            Intent::SubscriptionActivation { order_id } => {
                match self.call("subscription", self.subscriptions.activate(customer, order_id)).await {
                    Ok(()) => {
                        self.record(Ticket {
                            category: TicketCategory::Subscription,
                            app_name: self.app_name.clone(),
                            email: customer.clone(),
                            description: ctx.message_body.to_string(),
                            order_id: Some(order_id.clone()),
                            attachment_ref: None,
                            course: None,
                            certificate_name: None,
                            status: ConversationStatus::Resolved.to_string(),
                        })
                        .await;
                        ActionOutcome::done(
                            intent,
                            ActionResult::SubscriptionActivated {
                                order_id: order_id.clone(),
                            },
                            ConversationStatus::Resolved,
                            MetadataPatch::new()
                                .set("subscription_activated_at", Utc::now().to_rfc3339())
                                .set("order_id", order_id.clone()),
                        )
                    }
                    Err(e) => ActionOutcome::failed(intent, "subscription", e),
                }
            }
            Intent::TechnicalIssue {
                description,
                attachment_ref,
            } => {
                let ticket = Ticket {
                    category: TicketCategory::Technical,
                    app_name: self.app_name.clone(),
                    email: customer.clone(),
                    description: description.clone(),
                    order_id: None,
                    attachment_ref: attachment_ref.clone(),
                    course: None,
                    certificate_name: None,
                    status: ConversationStatus::Open.to_string(),
                };
                match self.call("ticket", self.tickets.log_ticket(&ticket)).await {
                    Ok(()) => {
                        let mut patch =
                            MetadataPatch::new().set("ticket_logged_at", Utc::now().to_rfc3339());
                        if let Some(a) = attachment_ref {
                            patch = patch.set("attachment_ref", a.clone());
                        }
                        ActionOutcome::done(
                            intent,
                            ActionResult::TicketLogged {
                                attachment_ref: attachment_ref.clone(),
                            },
                            ConversationStatus::Open,
                            patch,
                        )
                    }
                    Err(e) => ActionOutcome::failed(intent, "ticket", e),
                }
            }
            Intent::Refund { order_id, reason } => {
                let ticket = Ticket {
                    category: TicketCategory::Refund,
                    app_name: self.app_name.clone(),
                    email: customer.clone(),
                    description: reason.clone().unwrap_or_else(|| ctx.message_body.to_string()),
                    order_id: Some(order_id.clone()),
                    attachment_ref: None,
                    course: None,
                    certificate_name: None,
                    status: ConversationStatus::Open.to_string(),
                };
                match self.call("refund", self.tickets.log_ticket(&ticket)).await {
                    Ok(()) => ActionOutcome::done(
                        intent,
                        ActionResult::RefundLogged {
                            order_id: order_id.clone(),
                        },
                        ConversationStatus::Open,
                        MetadataPatch::new()
                            .set("refund_logged_at", Utc::now().to_rfc3339())
                            .set("order_id", order_id.clone()),
                    ),
                    Err(e) => ActionOutcome::failed(intent, "refund", e),
                }
            }
            Intent::Unclassified => ActionOutcome::done(
                intent,
                ActionResult::NeedsInfo,
                ConversationStatus::AwaitingInfo,
                MetadataPatch::new(),
            ),
        };

        if let ActionResult::Failed { action, reason } = &outcome.result {
            warn!(customer = %customer, action = %action, reason = %reason, "Action failed");
            return outcome;
        }
        let Some(key) = key else {
            return outcome;
        };

        info!(customer = %customer, effect = %key, "Side effect done");
        let mut effects = serde_json::Map::new();
        effects.insert(key, Utc::now().to_rfc3339().into());
        let marker = MetadataPatch::new().set(EFFECTS_KEY, serde_json::Value::Object(effects));
        ActionOutcome {
            patch: outcome.patch.clone().clear("last_action_error").merge(marker),
            ..outcome
        }
    }

    /// Log a record of a completed action. The action stands even if this fails.
    async fn record(&self, ticket: Ticket) {
        let tab = ticket.category.tab();
        if let Err(e) = self.call("ticket", self.tickets.log_ticket(&ticket)).await {
            warn!(customer = %ticket.email, tab, error = %e, "Action record not logged");
        }
    }

    /// Run one external call under the per-call timeout.
    async fn call<T>(
        &self,
        service: &str,
        fut: impl Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, ServiceError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ServiceError::timeout(service, self.timeout))?
    }
}

/// The result an already-completed effect reports.
fn expected_result(intent: &Intent, ctx: &ActionContext<'_>) -> ActionResult {
    match intent {
        Intent::CertificateRequest { course, name } => ActionResult::CertificateIssued {
            course: course.clone(),
            name: name.clone(),
            file: issued_file(ctx.conversation, course, name),
        },
        Intent::SubscriptionActivation { order_id } => ActionResult::SubscriptionActivated {
            order_id: order_id.clone(),
        },
        Intent::TechnicalIssue { attachment_ref, .. } => ActionResult::TicketLogged {
            attachment_ref: attachment_ref.clone(),
        },
        Intent::Refund { order_id, .. } => ActionResult::RefundLogged {
            order_id: order_id.clone(),
        },
        Intent::Unclassified => ActionResult::NeedsInfo,
    }
}

/// File of the last issued certificate, if it was for this course and name.
fn issued_file(conversation: &Conversation, course: &str, name: &str) -> Option<PathBuf> {
    let same = |key: &str, want: &str| {
        conversation
            .metadata_str(key)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case(want.trim()))
    };
    if same("certificate_course", course) && same("certificate_name", name) {
        conversation.metadata_str("certificate_file").map(PathBuf::from)
    } else {
        None
    }
}

fn target_status(intent: &Intent) -> ConversationStatus {
    match intent {
        Intent::CertificateRequest { .. } | Intent::SubscriptionActivation { .. } => {
            ConversationStatus::Resolved
        }
        Intent::TechnicalIssue { .. } | Intent::Refund { .. } => ConversationStatus::Open,
        Intent::Unclassified => ConversationStatus::AwaitingInfo,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::IssuedCertificate;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockCertificates {
        calls: AtomicUsize,
        fail: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl CertificateService for MockCertificates {
        async fn issue(&self, name: &str, course: &str) -> Result<IssuedCertificate, ServiceError> {
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ServiceError::external("certificate", "portal down"));
            }
            Ok(IssuedCertificate {
                file: PathBuf::from(format!("/tmp/certificate_{name}_{course}.pdf")),
            })
        }
    }

    #[derive(Default)]
    struct MockSubscriptions {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SubscriptionService for MockSubscriptions {
        async fn activate(&self, _email: &str, _order_id: &str) -> Result<(), ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockTickets {
        tickets: Mutex<Vec<Ticket>>,
    }

    #[async_trait]
    impl TicketService for MockTickets {
        async fn log_ticket(&self, ticket: &Ticket) -> Result<(), ServiceError> {
            self.tickets.lock().unwrap().push(ticket.clone());
            Ok(())
        }
    }

    struct Fixture {
        certs: Arc<MockCertificates>,
        subs: Arc<MockSubscriptions>,
        tickets: Arc<MockTickets>,
        executor: ActionExecutor,
    }

    fn fixture(certs: MockCertificates) -> Fixture {
        let certs = Arc::new(certs);
        let subs = Arc::new(MockSubscriptions::default());
        let tickets = Arc::new(MockTickets::default());
        let executor = ActionExecutor::new(
            certs.clone(),
            subs.clone(),
            tickets.clone(),
            "Programming Hub",
            Duration::from_millis(100),
        );
        Fixture {
            certs,
            subs,
            tickets,
            executor,
        }
    }

    fn ctx(conv: &Conversation) -> ActionContext<'_> {
        ActionContext {
            conversation: conv,
            message_id: "<m1@x>",
            message_body: "please help",
        }
    }

    fn certificate() -> Intent {
        Intent::CertificateRequest {
            course: "Course101".into(),
            name: "Alex".into(),
        }
    }

    #[test]
    fn effect_keys() {
        assert_eq!(
            effect_key(&certificate(), "<m>").as_deref(),
            Some("certificate:course101:alex")
        );
        assert_eq!(
            effect_key(&Intent::TechnicalIssue { description: "d".into(), attachment_ref: None }, "<m>")
                .as_deref(),
            Some("ticket:technical:<m>")
        );
        assert!(effect_key(&Intent::Unclassified, "<m>").is_none());
    }

    #[tokio::test]
    async fn certificate_issued_with_markers() {
        let f = fixture(MockCertificates::default());
        let conv = Conversation::new("a@x.com");
        let outcome = f.executor.execute(&certificate(), &ctx(&conv)).await;

        assert_eq!(f.certs.calls.load(Ordering::SeqCst), 1);
        assert!(!outcome.already_done);
        assert_eq!(outcome.target_status, ConversationStatus::Resolved);
        assert!(outcome.patch.set.contains_key("certificate_issued_at"));
        assert_eq!(outcome.patch.set["certificate_course"], "Course101");
        assert!(outcome.patch.set[EFFECTS_KEY].get("certificate:course101:alex").is_some());
        assert!(matches!(
            outcome.result,
            ActionResult::CertificateIssued { file: Some(ref path), .. }
                if path == &PathBuf::from("/tmp/certificate_Alex_Course101.pdf")
        ));

        let tickets = f.tickets.tickets.lock().unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].category, TicketCategory::Certificate);
        assert_eq!(tickets[0].course.as_deref(), Some("Course101"));
        assert_eq!(tickets[0].certificate_name.as_deref(), Some("Alex"));
    }

    #[tokio::test]
    async fn skipped_certificate_still_points_at_its_file() {
        let f = fixture(MockCertificates::default());
        let mut conv = Conversation::new("a@x.com");
        let first = f.executor.execute(&certificate(), &ctx(&conv)).await;
        first.patch.apply(&mut conv.metadata);

        let again = Intent::CertificateRequest {
            course: "course101".into(),
            name: "ALEX".into(),
        };
        let second = f.executor.execute(&again, &ctx(&conv)).await;
        assert!(second.already_done);
        assert!(matches!(
            second.result,
            ActionResult::CertificateIssued { file: Some(_), .. }
        ));
    }

    #[tokio::test]
    async fn marker_present_skips_side_effect() {
        let f = fixture(MockCertificates::default());
        let mut conv = Conversation::new("a@x.com");
        let first = f.executor.execute(&certificate(), &ctx(&conv)).await;
        first.patch.apply(&mut conv.metadata);

        let second = f.executor.execute(&certificate(), &ctx(&conv)).await;
        assert_eq!(f.certs.calls.load(Ordering::SeqCst), 1);
        assert!(second.already_done);
        assert_eq!(second.result, first.result);
        assert!(second.patch.is_empty());
    }

    #[tokio::test]
    async fn failure_records_no_marker() {
        let f = fixture(MockCertificates {
            fail: true,
            ..Default::default()
        });
        let conv = Conversation::new("a@x.com");
        let outcome = f.executor.execute(&certificate(), &ctx(&conv)).await;

        assert!(outcome.is_failure());
        assert_eq!(outcome.target_status, ConversationStatus::AwaitingInfo);
        assert!(!outcome.patch.set.contains_key(EFFECTS_KEY));
        assert!(!outcome.patch.set.contains_key("certificate_issued_at"));
    }

    #[tokio::test]
    async fn slow_service_times_out() {
        let f = fixture(MockCertificates {
            delay: Some(Duration::from_secs(2)),
            ..Default::default()
        });
        let conv = Conversation::new("a@x.com");
        let outcome = f.executor.execute(&certificate(), &ctx(&conv)).await;
        match outcome.result {
            ActionResult::Failed { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscription_sets_order_id() {
        let f = fixture(MockCertificates::default());
        let conv = Conversation::new("a@x.com");
        let intent = Intent::SubscriptionActivation {
            order_id: "GPA.1".into(),
        };
        let outcome = f.executor.execute(&intent, &ctx(&conv)).await;
        assert_eq!(f.subs.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.patch.set["order_id"], "GPA.1");
        let tickets = f.tickets.tickets.lock().unwrap();
        assert_eq!(tickets[0].category, TicketCategory::Subscription);
        assert_eq!(tickets[0].order_id.as_deref(), Some("GPA.1"));
        assert!(outcome.patch.set.contains_key("subscription_activated_at"));
        assert_eq!(outcome.target_status, ConversationStatus::Resolved);
    }

    #[tokio::test]
    async fn technical_issue_logs_ticket_and_stays_open() {
        let f = fixture(MockCertificates::default());
        let conv = Conversation::new("a@x.com");
        let intent = Intent::TechnicalIssue {
            description: "video won't load".into(),
            attachment_ref: Some("screen.png".into()),
        };
        let outcome = f.executor.execute(&intent, &ctx(&conv)).await;

        let tickets = f.tickets.tickets.lock().unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].category, TicketCategory::Technical);
        assert_eq!(tickets[0].app_name, "Programming Hub");
        assert_eq!(outcome.target_status, ConversationStatus::Open);
        assert_eq!(outcome.patch.set["attachment_ref"], "screen.png");
    }

    #[tokio::test]
    async fn refund_without_reason_uses_message_body() {
        let f = fixture(MockCertificates::default());
        let conv = Conversation::new("a@x.com");
        let intent = Intent::Refund {
            order_id: "GPA.2".into(),
            reason: None,
        };
        let outcome = f.executor.execute(&intent, &ctx(&conv)).await;

        let tickets = f.tickets.tickets.lock().unwrap();
        assert_eq!(tickets[0].category, TicketCategory::Refund);
        assert_eq!(tickets[0].description, "please help");
        assert!(outcome.patch.set.contains_key("refund_logged_at"));
    }

    #[tokio::test]
    async fn unclassified_has_no_side_effect() {
        let f = fixture(MockCertificates::default());
        let conv = Conversation::new("a@x.com");
        let outcome = f.executor.execute(&Intent::Unclassified, &ctx(&conv)).await;

        assert_eq!(outcome.result, ActionResult::NeedsInfo);
        assert_eq!(outcome.target_status, ConversationStatus::AwaitingInfo);
        assert!(outcome.patch.is_empty());
        assert_eq!(f.certs.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.subs.calls.load(Ordering::SeqCst), 0);
        assert!(f.tickets.tickets.lock().unwrap().is_empty());
    }
}
