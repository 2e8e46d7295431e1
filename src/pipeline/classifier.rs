//! Intent classifier: one LLM call, strict tagged decode.
//!
//! Anything that does not decode into a known variant with its required
//! fields becomes `Intent::Unclassified`. So does a timeout or provider error.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::conversation::{Conversation, Direction};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};

/// Max tokens for the classification call.
const CLASSIFY_MAX_TOKENS: u32 = 400;

const CLASSIFY_TEMPERATURE: f32 = 0.0;

/// Characters of the current message sent to the model.
const MESSAGE_PREVIEW_CHARS: usize = 2000;

/// Characters of each history entry sent to the model.
const HISTORY_PREVIEW_CHARS: usize = 300;

/// The classified purpose of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum Intent {
    CertificateRequest {
        course: String,
        name: String,
    },
    SubscriptionActivation {
        order_id: String,
    },
    TechnicalIssue {
        description: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment_ref: Option<String>,
    },
    Refund {
        order_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Unclassified,
}

impl Intent {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::CertificateRequest { .. } => "certificate_request",
            Self::SubscriptionActivation { .. } => "subscription_activation",
            Self::TechnicalIssue { .. } => "technical_issue",
            Self::Refund { .. } => "refund",
            Self::Unclassified => "unclassified",
        }
    }

    /// Issue type as it appears in the ledger.
    pub fn issue_type(&self) -> &'static str {
        match self {
            Self::CertificateRequest { .. } => "Certificate Issue",
            Self::SubscriptionActivation { .. } => "Premium Access",
            Self::TechnicalIssue { .. } => "Technical Issue",
            Self::Refund { .. } => "Refund",
            Self::Unclassified => "Unclassified",
        }
    }
}

/// Classifies customer messages into an `Intent`.
pub struct IntentClassifier {
    llm: Arc<dyn LlmProvider>,
    app_name: String,
    history_limit: usize,
    timeout: Duration,
}

impl IntentClassifier {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        app_name: impl Into<String>,
        history_limit: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            llm,
            app_name: app_name.into(),
            history_limit,
            timeout,
        }
    }

    /// Classify `message` in the context of `conversation`.
    ///
    /// Never fails: every failure mode degrades to `Unclassified`.
    pub async fn classify(&self, message: &str, conversation: &Conversation) -> Intent {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt(&self.app_name)),
            ChatMessage::user(build_user_prompt(message, conversation, self.history_limit)),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let response = match tokio::time::timeout(self.timeout, self.llm.complete(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(customer = %conversation.customer_id, error = %e, "Classifier call failed");
                return Intent::Unclassified;
            }
            Err(_) => {
                warn!(
                    customer = %conversation.customer_id,
                    timeout_secs = self.timeout.as_secs_f32(),
                    "Classifier call timed out"
                );
                return Intent::Unclassified;
            }
        };

        match parse_intent(&response.content) {
            Ok(intent) => {
                info!(customer = %conversation.customer_id, intent = intent.label(), "Classified");
                intent
            }
            Err(e) => {
                warn!(
                    customer = %conversation.customer_id,
                    raw_response = %response.content,
                    error = %e,
                    "Undecodable classifier output"
                );
                Intent::Unclassified
            }
        }
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt(app_name: &str) -> String {
    format!(
        "You classify customer support emails for the educational app \"{app_name}\".\n\n\
         Intents:\n\
         - \"certificate_request\": the customer wants a course certificate issued or reissued. \
         Fields: course, name (the name to print on the certificate).\n\
         - \"subscription_activation\": the customer paid but premium is not active. Fields: order_id.\n\
         - \"technical_issue\": the app crashes, content does not load, progress is lost. \
         Fields: description, attachment_ref (screenshot file name, optional).\n\
         - \"refund\": the customer wants money back. Fields: order_id, reason (optional).\n\
         - \"unclassified\": anything else, or a required field is missing from the conversation.\n\n\
         Respond with ONLY a JSON object, for example:\n\
         {{\"intent\": \"certificate_request\", \"course\": \"Python 101\", \"name\": \"Alex Doe\"}}\n\n\
         Rules:\n\
         - Use details from earlier messages when the current one omits them\n\
         - Never invent order ids, names or courses\n\
         - When a required field is unknown, answer {{\"intent\": \"unclassified\"}}"
    )
}

fn build_user_prompt(message: &str, conversation: &Conversation, history_limit: usize) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(&format!("Customer: {}\n", conversation.customer_id));

    let known: Vec<String> = conversation
        .metadata
        .iter()
        .filter(|(_, v)| v.is_string())
        .filter_map(|(k, v)| v.as_str().map(|s| format!("{k}={s}")))
        .collect();
    if !known.is_empty() {
        prompt.push_str(&format!("Known details: {}\n", known.join(", ")));
    }

    // The current message is usually already the last stored one.
    let history = conversation.recent_messages(history_limit + 1);
    let history = match history.last() {
        Some(last) if last.direction == Direction::Inbound && last.body == message => {
            &history[..history.len() - 1]
        }
        _ => &history[history.len().saturating_sub(history_limit)..],
    };
    if !history.is_empty() {
        prompt.push_str("\nEarlier messages:\n");
        for msg in history {
            let who = match msg.direction {
                Direction::Inbound => "customer",
                Direction::Outbound => "support",
            };
            let preview: String = msg.body.chars().take(HISTORY_PREVIEW_CHARS).collect();
            prompt.push_str(&format!("  [{}] {who}: {preview}\n", msg.seq));
        }
    }

    let preview: String = message.chars().take(MESSAGE_PREVIEW_CHARS).collect();
    prompt.push_str(&format!("\nCurrent message:\n{preview}"));
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

/// Decode the model reply into an `Intent`, rejecting blank required fields.
pub fn parse_intent(raw: &str) -> Result<Intent, String> {
    let json_str = extract_json_object(raw);
    let intent: Intent =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let blank = |s: &str| s.trim().is_empty();
    let missing = match &intent {
        Intent::CertificateRequest { course, name } => {
            (blank(course) || blank(name)).then_some("course/name")
        }
        Intent::SubscriptionActivation { order_id } | Intent::Refund { order_id, .. } => {
            blank(order_id).then_some("order_id")
        }
        Intent::TechnicalIssue { description, .. } => blank(description).then_some("description"),
        Intent::Unclassified => None,
    };
    if let Some(field) = missing {
        return Err(format!("{} has empty {field}", intent.label()));
    }

    debug!(intent = intent.label(), "Decoded classifier output");
    Ok(normalize(intent))
}

/// Trim fields and drop empty optionals.
fn normalize(intent: Intent) -> Intent {
    let opt = |s: Option<String>| s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    match intent {
        Intent::CertificateRequest { course, name } => Intent::CertificateRequest {
            course: course.trim().to_string(),
            name: name.trim().to_string(),
        },
        Intent::SubscriptionActivation { order_id } => Intent::SubscriptionActivation {
            order_id: order_id.trim().to_string(),
        },
        Intent::TechnicalIssue {
            description,
            attachment_ref,
        } => Intent::TechnicalIssue {
            description: description.trim().to_string(),
            attachment_ref: opt(attachment_ref),
        },
        Intent::Refund { order_id, reason } => Intent::Refund {
            order_id: order_id.trim().to_string(),
            reason: opt(reason),
        },
        Intent::Unclassified => Intent::Unclassified,
    }
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    for fence in ["```json", "```"] {
        if let Some(start) = trimmed.find(fence) {
            let after = &trimmed[start + fence.len()..];
            if let Some(end) = after.find("```") {
                let inner = after[..end].trim();
                if inner.starts_with('{') {
                    return inner.to_string();
                }
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
