//! Mail I/O: the IMAP/SMTP mailbox, a console stand-in, and the poller
//! that feeds the processor.

pub mod console;
pub mod email;
pub mod email_poller;

pub use console::{ConsoleMailbox, run_interactive};
pub use email::{EmailConfig, ImapSmtpMailbox};
pub use crate::pipeline::types::MailService;
pub use email_poller::{PollReport, PollerSettings, poll_once, spawn_email_poller};
