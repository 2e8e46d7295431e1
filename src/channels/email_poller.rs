//! Inbox poller: fetches unseen mail and hands it to the processor.
//!
//! One cycle:
//! 1. Fetch unseen messages from the mailbox
//! 2. Drop self-sent, disallowed, and automated senders
//! 3. Process the rest concurrently (same-customer work serializes in the processor)
//! 4. Mark every handled UID \Seen

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::email::{EmailConfig, is_automated_sender, is_sender_allowed};
use crate::error::PipelineError;
use crate::pipeline::{InboundEmail, MailService, SupportProcessor};

/// Sender filtering and cadence for the poller.
#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub from_address: String,
    pub allowed_senders: Vec<String>,
    pub poll_interval: Duration,
}

impl PollerSettings {
    pub fn from_email_config(config: &EmailConfig) -> Self {
        Self {
            from_address: config.from_address.clone(),
            allowed_senders: config.allowed_senders.clone(),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
        }
    }

    fn accepts(&self, email: &InboundEmail) -> bool {
        let sender = email.sender.trim();
        if sender.eq_ignore_ascii_case(&self.from_address) {
            debug!(sender = %sender, "Skipping self-sent email");
            return false;
        }
        if !is_sender_allowed(&self.allowed_senders, sender) {
            warn!(sender = %sender, "Blocked email from sender outside allowlist");
            return false;
        }
        if is_automated_sender(sender) {
            debug!(sender = %sender, "Skipping automated sender");
            return false;
        }
        true
    }
}

/// Counters for one poll cycle.
#[derive(Debug, Clone, Serialize)]
pub struct PollReport {
    pub emails_found: usize,
    pub emails_processed: usize,
    pub responses_sent: usize,
    pub errors: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl PollReport {
    fn new(emails_found: usize) -> Self {
        Self {
            emails_found,
            emails_processed: 0,
            responses_sent: 0,
            errors: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Run a single poll cycle: fetch unseen → process → mark \Seen.
///
/// Only a failed fetch is an error; per-message failures land in the report.
pub async fn poll_once(
    mail: &Arc<dyn MailService>,
    processor: &Arc<SupportProcessor>,
    settings: &PollerSettings,
) -> Result<PollReport, PipelineError> {
    let messages = mail
        .fetch_unseen()
        .await
        .map_err(|e| PipelineError::ChannelFetch(e.to_string()))?;

    let mut report = PollReport::new(messages.len());
    if messages.is_empty() {
        return Ok(report);
    }
    debug!(count = messages.len(), "Fetched unseen emails");

    let mut uids_to_mark: Vec<String> = Vec::with_capacity(messages.len());
    let mut handles = Vec::new();

    for email in messages {
        if !settings.accepts(&email) {
            uids_to_mark.push(email.uid);
            continue;
        }
        let uid = email.uid.clone();
        let message_id = email.message_id.clone();
        let processor = Arc::clone(processor);
        let handle = tokio::spawn(async move { processor.process(email).await });
        handles.push((uid, message_id, handle));
    }

    let (meta, joins): (Vec<_>, Vec<_>) = handles
        .into_iter()
        .map(|(uid, message_id, handle)| ((uid, message_id), handle))
        .unzip();
    let results = futures::future::join_all(joins).await;

    for ((uid, message_id), joined) in meta.into_iter().zip(results) {
        match joined {
            Ok(Ok(outcome)) => {
                report.emails_processed += 1;
                if outcome.reply_sent {
                    report.responses_sent += 1;
                }
                uids_to_mark.push(uid);
            }
            Ok(Err(e)) => {
                error!(message_id = %message_id, error = %e, "Failed to process email");
                report.errors.push(format!("{message_id}: {e}"));
                // Left unseen so the next cycle retries it.
            }
            Err(e) => {
                error!(message_id = %message_id, error = %e, "Processing task panicked");
                report.errors.push(format!("{message_id}: task failed"));
            }
        }
    }

    if !uids_to_mark.is_empty()
        && let Err(e) = mail.mark_seen(&uids_to_mark).await
    {
        warn!(error = %e, "Failed to mark emails as seen");
        report.errors.push(format!("mark seen: {e}"));
    }

    info!(
        found = report.emails_found,
        processed = report.emails_processed,
        replied = report.responses_sent,
        errors = report.errors.len(),
        "Poll cycle finished"
    );
    Ok(report)
}

/// Spawn a background task that polls the mailbox until shutdown.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling.
pub fn spawn_email_poller(
    mail: Arc<dyn MailService>,
    processor: Arc<SupportProcessor>,
    settings: PollerSettings,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            interval_secs = settings.poll_interval.as_secs(),
            mailbox = mail.name(),
            "Email poller started"
        );

        let mut tick = tokio::time::interval(settings.poll_interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Email poller shutting down");
                return;
            }

            if let Err(e) = poll_once(&mail, &processor, &settings).await {
                error!(error = %e, "Email poll failed");
            }
        }
    });

    (handle, shutdown_flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(allowed: &[&str]) -> PollerSettings {
        PollerSettings {
            from_address: "support@app.com".into(),
            allowed_senders: allowed.iter().map(|s| s.to_string()).collect(),
            poll_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn filter_skips_self_sent() {
        let s = settings(&["*"]);
        assert!(!s.accepts(&InboundEmail::new("Support@App.com", "loop")));
        assert!(s.accepts(&InboundEmail::new("student@school.edu", "hi")));
    }

    #[test]
    fn filter_applies_allowlist() {
        let s = settings(&["@school.edu"]);
        assert!(s.accepts(&InboundEmail::new("student@school.edu", "hi")));
        assert!(!s.accepts(&InboundEmail::new("x@other.com", "hi")));
        assert!(!settings(&[]).accepts(&InboundEmail::new("student@school.edu", "hi")));
    }

    #[test]
    fn filter_skips_automated() {
        let s = settings(&["*"]);
        assert!(!s.accepts(&InboundEmail::new("noreply@store.com", "receipt")));
    }

    #[test]
    fn settings_from_email_config() {
        let cfg = EmailConfig::from_lookup(|k| match k {
            "EMAIL_IMAP_HOST" => Some("imap.app.com".into()),
            "EMAIL_FROM_ADDRESS" => Some("support@app.com".into()),
            "EMAIL_POLL_INTERVAL_SECS" => Some("0".into()),
            _ => None,
        })
        .unwrap();
        let s = PollerSettings::from_email_config(&cfg);
        assert_eq!(s.from_address, "support@app.com");
        assert_eq!(s.poll_interval, Duration::from_secs(1));
    }
}
