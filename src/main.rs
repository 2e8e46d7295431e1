use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use crm_agent::actions::ActionExecutor;
use crm_agent::channels::{
    ConsoleMailbox, ImapSmtpMailbox, PollerSettings, poll_once, run_interactive, spawn_email_poller,
};
use crm_agent::config::AppConfig;
use crm_agent::conversation::ConversationStore;
use crm_agent::http::{self, AppState};
use crm_agent::llm::create_provider;
use crm_agent::pipeline::{IntentClassifier, MailService, Responder, SupportProcessor};
use crm_agent::services::{
    CertificateClient, LedgerWriter, SheetsClient, SubscriptionClient, TicketService, TracingLedger,
};
use crm_agent::store::{Database, LibSqlBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// HTTP API plus the background inbox poller
    Serve,
    /// Process the inbox once and print the report
    Poll,
    /// Chat from the terminal as one customer
    Interactive,
    /// Print stored conversations
    List,
}

#[derive(Debug, Parser)]
#[command(
    name = "crm-agent",
    version,
    about = "Support inbox agent: classify, act once, log, reply",
    after_help = "Examples:\n  crm-agent --mode serve\n  crm-agent --mode interactive --email alex@example.com\n  crm-agent --mode list --limit 5"
)]
struct Cli {
    #[arg(long, value_enum, default_value_t = Mode::Serve)]
    mode: Mode,

    #[arg(long, help = "Customer address (interactive sender, list filter)")]
    email: Option<String>,

    #[arg(long, help = "Thread to continue in interactive mode")]
    thread_id: Option<String>,

    #[arg(long, default_value_t = 20, help = "Maximum conversations to list")]
    limit: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Install rustls crypto provider before any TLS usage; a second install is harmless.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    tracing::info!(version = env!("CARGO_PKG_VERSION"), mode = ?cli.mode, "crm-agent starting");

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    let store = Arc::new(ConversationStore::new(db));

    if cli.mode == Mode::List {
        return list_conversations(&store, cli.email.as_deref(), cli.limit).await;
    }

    // ── Collaborators ────────────────────────────────────────────────────
    let llm = create_provider(config.require_llm()?)?;

    let mail: Arc<dyn MailService> = match (cli.mode, &config.email) {
        (Mode::Interactive, _) => Arc::new(ConsoleMailbox),
        (_, Some(email)) => Arc::new(ImapSmtpMailbox::new(email.clone())),
        (_, None) => anyhow::bail!("EMAIL_IMAP_HOST must be set for --mode serve or poll"),
    };

    let (ledger, tickets) = match config.sheets.clone() {
        Some(sheets) => {
            let client = Arc::new(SheetsClient::new(sheets)?);
            if let Err(e) = client.initialize().await {
                tracing::warn!(error = %e, "Spreadsheet tabs not initialized, appends may fail");
            }
            let ledger: Arc<dyn LedgerWriter> = client.clone();
            let tickets: Arc<dyn TicketService> = client;
            (ledger, tickets)
        }
        None => {
            tracing::warn!("SHEETS_SPREADSHEET_ID not set, ledger rows and tickets go to the log");
            let ledger: Arc<dyn LedgerWriter> = Arc::new(TracingLedger);
            let tickets: Arc<dyn TicketService> = Arc::new(TracingLedger);
            (ledger, tickets)
        }
    };

    let pipeline = &config.pipeline;
    let executor = ActionExecutor::new(
        Arc::new(CertificateClient::new(config.certificate.clone())?),
        Arc::new(SubscriptionClient::new(config.subscription.clone())?),
        tickets,
        &pipeline.app_name,
        pipeline.action_timeout,
    );
    let classifier = IntentClassifier::new(
        llm.clone(),
        &pipeline.app_name,
        pipeline.history_limit,
        pipeline.classifier_timeout,
    );
    let responder = Responder::new(mail.clone(), &pipeline.app_name, pipeline.mail_timeout)
        .with_receipt_guides(pipeline.receipt_guides.clone());
    let processor = Arc::new(SupportProcessor::new(
        store,
        classifier,
        executor,
        ledger,
        responder,
        &pipeline.app_name,
        pipeline.ledger_timeout,
    ));

    match cli.mode {
        Mode::Interactive => {
            let sender = cli
                .email
                .context("--email is required in interactive mode")?;
            run_interactive(processor, sender, cli.thread_id).await?;
        }
        Mode::Poll => {
            let settings = poller_settings(&config);
            let report = poll_once(&mail, &processor, &settings).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Mode::Serve => {
            let settings = poller_settings(&config);
            let (poller, shutdown) =
                spawn_email_poller(mail.clone(), processor.clone(), settings.clone());

            let state = AppState {
                processor,
                mail,
                llm_model: llm.model_name().to_string(),
                poller: settings,
            };

            tokio::select! {
                served = http::serve(config.http_port, state) => {
                    served.with_context(|| format!("HTTP server on port {} failed", config.http_port))?;
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown requested");
                }
            }

            shutdown.store(true, Ordering::Relaxed);
            poller.abort();
        }
        Mode::List => {}
    }

    Ok(())
}

fn poller_settings(config: &AppConfig) -> PollerSettings {
    match config.email {
        Some(ref email) => PollerSettings::from_email_config(email),
        None => PollerSettings {
            from_address: String::new(),
            allowed_senders: vec!["*".to_string()],
            poll_interval: std::time::Duration::from_secs(60),
        },
    }
}

/// Logs go to stderr; with a log dir, also to a daily rolling file.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "crm-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

async fn list_conversations(
    store: &ConversationStore,
    email: Option<&str>,
    limit: usize,
) -> anyhow::Result<()> {
    let conversations = store.list(email, limit).await?;
    if conversations.is_empty() {
        println!("No conversations found.");
        return Ok(());
    }

    println!(
        "{:<32} {:<14} {:>5}  {:<20} SUBJECT",
        "CUSTOMER", "STATUS", "MSGS", "UPDATED"
    );
    for c in conversations {
        println!(
            "{:<32} {:<14} {:>5}  {:<20} {}",
            c.customer_id,
            c.status.to_string(),
            c.message_count,
            c.updated_at.format("%Y-%m-%d %H:%M:%S"),
            c.subject.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
