//! Console mailbox: stdin/stdout REPL for local testing.
//!
//! Each line typed is processed as an email from one fixed sender; replies
//! are printed instead of mailed.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use crate::error::ChannelError;
use crate::pipeline::{InboundEmail, MailService, OutboundReply, SupportProcessor};

const EXIT_WORDS: [&str; 3] = ["exit", "quit", "bye"];

/// Mailbox that prints replies to stdout and never has unseen mail.
#[derive(Debug, Default)]
pub struct ConsoleMailbox;

#[async_trait]
impl MailService for ConsoleMailbox {
    fn name(&self) -> &str {
        "console"
    }

    async fn fetch_unseen(&self) -> Result<Vec<InboundEmail>, ChannelError> {
        Ok(Vec::new())
    }

    async fn mark_seen(&self, _uids: &[String]) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn send_reply(&self, reply: &OutboundReply) -> Result<String, ChannelError> {
        println!("\n{}\n", reply.body);
        Ok(format!("<console-{}@crm-agent.local>", Uuid::new_v4()))
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// True for the words that end an interactive session.
pub fn is_exit_command(line: &str) -> bool {
    let line = line.trim();
    EXIT_WORDS.iter().any(|w| line.eq_ignore_ascii_case(w))
}

/// Read stdin line by line and process each as a message from `sender`.
///
/// Every message joins `thread_id` when given, otherwise the first message
/// starts the thread. Returns on EOF or an exit word.
pub async fn run_interactive(
    processor: Arc<SupportProcessor>,
    sender: String,
    thread_id: Option<String>,
) -> Result<(), ChannelError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut thread = thread_id;

    eprintln!("Chatting as {sender}. Type exit, quit, or bye to leave.");
    eprint!("> ");

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "Error reading stdin");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            eprint!("> ");
            continue;
        }
        if is_exit_command(line) {
            break;
        }

        let mut email = InboundEmail::new(sender.clone(), line);
        if let Some(ref root) = thread {
            email.references = vec![root.clone()];
            email.in_reply_to = Some(root.clone());
        } else {
            thread = Some(email.message_id.clone());
        }

        match processor.process(email).await {
            Ok(outcome) => {
                tracing::debug!(intent = outcome.intent.label(), status = %outcome.status, "Processed");
            }
            Err(e) => eprintln!("Error: {e}"),
        }
        eprint!("> ");
    }

    eprintln!("Goodbye.");
    Ok(())
}
