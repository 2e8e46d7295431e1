//! Responder: turns an action outcome into a reply and sends it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::actions::{ActionOutcome, ActionResult};
use crate::channels::email::is_valid_address;
use crate::error::{ChannelError, ServiceError};
use crate::pipeline::types::{InboundEmail, MailService, OutboundReply};

pub struct Responder {
    mail: Arc<dyn MailService>,
    app_name: String,
    timeout: Duration,
    /// Images showing where to find an order id, sent when we ask for one.
    receipt_guides: Vec<PathBuf>,
}

impl Responder {
    pub fn new(mail: Arc<dyn MailService>, app_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            mail,
            app_name: app_name.into(),
            timeout,
            receipt_guides: Vec::new(),
        }
    }

    pub fn with_receipt_guides(mut self, guides: Vec<PathBuf>) -> Self {
        self.receipt_guides = guides;
        self
    }

    /// Files to send with the reply for an outcome.
    pub fn attachments(&self, outcome: &ActionOutcome, manual_review: bool) -> Vec<PathBuf> {
        if manual_review {
            return Vec::new();
        }
        match &outcome.result {
            ActionResult::CertificateIssued { file: Some(file), .. } => vec![file.clone()],
            ActionResult::NeedsInfo => self.receipt_guides.clone(),
            _ => Vec::new(),
        }
    }

    /// Reply body for an outcome. `manual_review` overrides the outcome text.
    pub fn compose(&self, email: &InboundEmail, outcome: &ActionOutcome, manual_review: bool) -> String {
        let greeting = match email.sender_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => format!("Hi {name},"),
            _ => "Hi,".to_string(),
        };

        let body = if manual_review {
            "Thanks for getting back to us. A member of our support team will review your \
             message personally and reply shortly."
                .to_string()
        } else if outcome.result == ActionResult::NeedsInfo && !self.receipt_guides.is_empty() {
            format!(
                "{} The attached images show where to find the order id on your receipt.",
                compose_body(&outcome.result, outcome.already_done)
            )
        } else {
            compose_body(&outcome.result, outcome.already_done)
        };

        format!(
            "{greeting}\n\n{body}\n\nBest regards,\n{} Support Team",
            self.app_name
        )
    }

    /// Send `body` as a threaded reply to `email`.
    ///
    /// Returns the reply and the Message-ID the mail service assigned.
    pub async fn send(
        &self,
        email: &InboundEmail,
        body: String,
        attachments: Vec<PathBuf>,
    ) -> Result<(OutboundReply, String), ServiceError> {
        if !is_valid_address(&email.sender) {
            warn!(recipient = %email.sender, "Invalid recipient, reply not sent");
            return Err(ChannelError::InvalidRecipient(email.sender.clone()).into());
        }

        let reply = OutboundReply::to_email(email, body).with_attachments(attachments);
        let sent = tokio::time::timeout(self.timeout, self.mail.send_reply(&reply))
            .await
            .map_err(|_| ServiceError::timeout("mail", self.timeout))?;
        let message_id = sent?;

        info!(to = %reply.to, message_id = %message_id, "Reply sent");
        Ok((reply, message_id))
    }
}

fn compose_body(result: &ActionResult, already_done: bool) -> String {
    match result {
        ActionResult::CertificateIssued { course, name, file } if already_done => {
            let copy = if file.is_some() {
                "A copy is attached to this email."
            } else {
                "Please check your inbox and spam folder for our earlier email."
            };
            format!(
                "Your certificate for \"{course}\" under the name \"{name}\" was already \
                 issued. {copy}"
            )
        }
        ActionResult::CertificateIssued { course, name, file } => {
            let delivery = if file.is_some() {
                "is attached to this email"
            } else {
                "will follow in a separate email"
            };
            format!(
                "Your certificate for \"{course}\" has been generated under the name \"{name}\" \
                 and {delivery}."
            )
        }
        ActionResult::SubscriptionActivated { .. } if already_done => {
            "Premium access is already active on your account. Please restart the app and \
             sign in again if you do not see the premium features."
                .to_string()
        }
        ActionResult::SubscriptionActivated { order_id } => format!(
            "Premium access has been activated for your account (order {order_id}). It is \
             valid for 12 months. Please restart the app to see the premium features."
        ),
        ActionResult::TicketLogged { attachment_ref } => {
            let attachment = match attachment_ref {
                Some(name) => format!(" We have attached your screenshot ({name}) to the report."),
                None => String::new(),
            };
            format!(
                "Sorry about the trouble. We have logged the issue with our technical team and \
                 will get back to you once it is fixed.{attachment}"
            )
        }
        ActionResult::RefundLogged { order_id } => format!(
            "We have received your refund request for order {order_id}. Our billing team will \
             review it and contact you within 3-5 business days."
        ),
        ActionResult::NeedsInfo => {
            "Thanks for reaching out. Could you tell us a bit more so we can help? For a \
             certificate, include the course name and the name to print on it. For premium \
             access or refunds, include your order id. For app problems, describe what \
             happened and attach a screenshot if you can."
                .to_string()
        }
        ActionResult::Failed { .. } => {
            "We are sorry, we could not complete your request right now. Our team has been \
             notified and will follow up with you shortly."
                .to_string()
        }
    }
}
