//! Shared harness: a processor wired to in-memory storage and mock services.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crm_agent::actions::ActionExecutor;
use crm_agent::conversation::ConversationStore;
use crm_agent::error::{ChannelError, LlmError, ServiceError};
use crm_agent::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use crm_agent::pipeline::{
    InboundEmail, IntentClassifier, MailService, OutboundReply, Responder, SupportProcessor,
};
use crm_agent::services::{
    CertificateService, IssuedCertificate, LedgerRow, LedgerWriter, SubscriptionService, Ticket,
    TicketService,
};
use crm_agent::store::LibSqlBackend;

pub const APP: &str = "Programming Hub";

// ── LLM ─────────────────────────────────────────────────────────────

/// Answers every prompt with the same text after an optional delay.
pub struct ScriptedLlm {
    reply: Mutex<String>,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: Mutex::new(reply.to_string()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn slow(reply: &str, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(reply)
        }
    }

    pub fn set_reply(&self, reply: &str) {
        *self.reply.lock().unwrap() = reply.to_string();
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(CompletionResponse {
            content: self.reply.lock().unwrap().clone(),
            input_tokens: 10,
            output_tokens: 10,
            finish_reason: FinishReason::Stop,
        })
    }
}

// ── Services ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct CountingCertificates {
    pub issued: Mutex<Vec<(String, String)>>,
}

impl CountingCertificates {
    pub fn count(&self) -> usize {
        self.issued.lock().unwrap().len()
    }
}

#[async_trait]
impl CertificateService for CountingCertificates {
    async fn issue(&self, name: &str, course: &str) -> Result<IssuedCertificate, ServiceError> {
        // Yield so concurrent callers would interleave without the unit lock.
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.issued
            .lock()
            .unwrap()
            .push((name.to_string(), course.to_string()));
        Ok(IssuedCertificate {
            file: PathBuf::from(format!("certificate_{name}_{course}.pdf")),
        })
    }
}

#[derive(Default)]
pub struct CountingSubscriptions {
    pub calls: AtomicUsize,
}

#[async_trait]
impl SubscriptionService for CountingSubscriptions {
    async fn activate(&self, _email: &str, _order_id: &str) -> Result<(), ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingTickets {
    pub tickets: Mutex<Vec<Ticket>>,
}

#[async_trait]
impl TicketService for RecordingTickets {
    async fn log_ticket(&self, ticket: &Ticket) -> Result<(), ServiceError> {
        self.tickets.lock().unwrap().push(ticket.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingLedger {
    pub rows: Mutex<Vec<LedgerRow>>,
}

#[async_trait]
impl LedgerWriter for RecordingLedger {
    fn name(&self) -> &str {
        "recording"
    }

    async fn append(&self, row: &LedgerRow) -> Result<(), ServiceError> {
        self.rows.lock().unwrap().push(row.clone());
        Ok(())
    }
}

// ── Mail ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingMail {
    pub inbox: Mutex<Vec<InboundEmail>>,
    pub sent: Mutex<Vec<OutboundReply>>,
    pub seen: Mutex<Vec<String>>,
    pub fail_fetch: bool,
}

impl RecordingMail {
    pub fn failing() -> Self {
        Self {
            fail_fetch: true,
            ..Self::default()
        }
    }

    pub fn deliver(&self, email: InboundEmail) {
        self.inbox.lock().unwrap().push(email);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl MailService for RecordingMail {
    fn name(&self) -> &str {
        "recording"
    }

    async fn fetch_unseen(&self) -> Result<Vec<InboundEmail>, ChannelError> {
        if self.fail_fetch {
            return Err(ChannelError::FetchFailed {
                name: "recording".into(),
                reason: "mailbox offline".into(),
            });
        }
        let seen = self.seen.lock().unwrap().clone();
        Ok(self
            .inbox
            .lock()
            .unwrap()
            .iter()
            .filter(|e| !seen.contains(&e.uid))
            .cloned()
            .collect())
    }

    async fn mark_seen(&self, uids: &[String]) -> Result<(), ChannelError> {
        self.seen.lock().unwrap().extend(uids.iter().cloned());
        Ok(())
    }

    async fn send_reply(&self, reply: &OutboundReply) -> Result<String, ChannelError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(reply.clone());
        Ok(format!("<reply-{}@app.com>", sent.len()))
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        if self.fail_fetch {
            Err(ChannelError::HealthCheckFailed {
                name: "recording".into(),
            })
        } else {
            Ok(())
        }
    }
}

// ── Harness ─────────────────────────────────────────────────────────

pub struct Harness {
    pub processor: Arc<SupportProcessor>,
    pub store: Arc<ConversationStore>,
    pub llm: Arc<ScriptedLlm>,
    pub certificates: Arc<CountingCertificates>,
    pub subscriptions: Arc<CountingSubscriptions>,
    pub tickets: Arc<RecordingTickets>,
    pub ledger: Arc<RecordingLedger>,
    pub mail: Arc<RecordingMail>,
}

impl Harness {
    pub async fn new(llm: ScriptedLlm) -> Self {
        Self::build(llm, RecordingMail::default(), Duration::from_secs(5)).await
    }

    pub async fn build(llm: ScriptedLlm, mail: RecordingMail, classifier_timeout: Duration) -> Self {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let store = Arc::new(ConversationStore::new(Arc::new(db)));
        let llm = Arc::new(llm);
        let certificates = Arc::new(CountingCertificates::default());
        let subscriptions = Arc::new(CountingSubscriptions::default());
        let tickets = Arc::new(RecordingTickets::default());
        let ledger = Arc::new(RecordingLedger::default());
        let mail = Arc::new(mail);

        let classifier = IntentClassifier::new(llm.clone(), APP, 10, classifier_timeout);
        let executor = ActionExecutor::new(
            certificates.clone(),
            subscriptions.clone(),
            tickets.clone(),
            APP,
            Duration::from_secs(5),
        );
        let responder = Responder::new(mail.clone(), APP, Duration::from_secs(5));
        let processor = Arc::new(SupportProcessor::new(
            store.clone(),
            classifier,
            executor,
            ledger.clone(),
            responder,
            APP,
            Duration::from_secs(5),
        ));

        Self {
            processor,
            store,
            llm,
            certificates,
            subscriptions,
            tickets,
            ledger,
            mail,
        }
    }

    pub fn mail_service(&self) -> Arc<dyn MailService> {
        self.mail.clone()
    }
}

pub fn certificate_reply(course: &str, name: &str) -> String {
    format!(r#"{{"intent": "certificate_request", "course": "{course}", "name": "{name}"}}"#)
}

pub fn email(sender: &str, uid: &str, body: &str) -> InboundEmail {
    let mut email = InboundEmail::new(sender, body)
        .with_message_id(format!("<{uid}.{}@mail.test>", sender.replace('@', ".")))
        .with_subject("Support");
    email.uid = uid.to_string();
    email
}
