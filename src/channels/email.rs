//! Email mailbox: IMAP over rustls for inbound, SMTP via lettre for outbound.
//!
//! IMAP is spoken directly over a blocking TLS stream (run in `spawn_blocking`).
//! Messages are fetched with `BODY.PEEK[]` so they stay unseen until the
//! poller marks them after processing.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::{HeaderValue, MessageParser, MimeHeaders};
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::error::ChannelError;
use crate::pipeline::types::{InboundEmail, MailService, OutboundReply};

const CHANNEL: &str = "email";

// ── Configuration ───────────────────────────────────────────────────

/// Mailbox configuration.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub poll_interval_secs: u64,
    pub allowed_senders: Vec<String>,
}

impl EmailConfig {
    /// Build config from a variable lookup.
    /// Returns `None` if `EMAIL_IMAP_HOST` is not set (mailbox disabled).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let imap_host = lookup("EMAIL_IMAP_HOST")?;

        let imap_port: u16 = lookup("EMAIL_IMAP_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let smtp_host = lookup("EMAIL_SMTP_HOST").unwrap_or_else(|| imap_host.replace("imap", "smtp"));

        let smtp_port: u16 = lookup("EMAIL_SMTP_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = lookup("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(lookup("EMAIL_PASSWORD").unwrap_or_default());
        let from_address = lookup("EMAIL_FROM_ADDRESS").unwrap_or_else(|| username.clone());

        let poll_interval_secs: u64 = lookup("EMAIL_POLL_INTERVAL_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let allowed_senders: Vec<String> = lookup("EMAIL_ALLOWED_SENDERS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Some(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
            poll_interval_secs,
            allowed_senders,
        })
    }

    /// Domain part of the from address, used for generated Message-IDs.
    fn from_domain(&self) -> &str {
        self.from_address
            .rsplit_once('@')
            .map_or("localhost", |(_, domain)| domain)
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────

/// IMAP + SMTP mailbox.
pub struct ImapSmtpMailbox {
    config: Arc<EmailConfig>,
}

impl ImapSmtpMailbox {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &EmailConfig {
        &self.config
    }
}

#[async_trait]
impl MailService for ImapSmtpMailbox {
    fn name(&self) -> &str {
        CHANNEL
    }

    async fn fetch_unseen(&self) -> Result<Vec<InboundEmail>, ChannelError> {
        let cfg = Arc::clone(&self.config);
        let fetched = tokio::task::spawn_blocking(move || fetch_unseen_imap(&cfg))
            .await
            .map_err(|e| fetch_failed(format!("IMAP task panicked: {e}")))?
            .map_err(|e| fetch_failed(e.to_string()))?;

        Ok(fetched
            .into_iter()
            .filter_map(|raw| parse_email(&raw.uid, &raw.bytes))
            .collect())
    }

    async fn mark_seen(&self, uids: &[String]) -> Result<(), ChannelError> {
        if uids.is_empty() {
            return Ok(());
        }
        let cfg = Arc::clone(&self.config);
        let uids = uids.to_vec();
        tokio::task::spawn_blocking(move || mark_seen_imap(&cfg, &uids))
            .await
            .map_err(|e| fetch_failed(format!("IMAP task panicked: {e}")))?
            .map_err(|e| fetch_failed(format!("mark seen: {e}")))
    }

    async fn send_reply(&self, reply: &OutboundReply) -> Result<String, ChannelError> {
        let cfg = Arc::clone(&self.config);
        let reply = reply.clone();
        tokio::task::spawn_blocking(move || send_email(&cfg, &reply))
            .await
            .map_err(|e| send_failed(format!("SMTP task panicked: {e}")))?
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        let cfg = Arc::clone(&self.config);
        let ok = tokio::task::spawn_blocking(move || {
            TcpStream::connect((&*cfg.imap_host, cfg.imap_port)).is_ok()
        })
        .await
        .unwrap_or(false);

        if ok {
            Ok(())
        } else {
            Err(ChannelError::HealthCheckFailed {
                name: CHANNEL.into(),
            })
        }
    }
}

fn fetch_failed(reason: String) -> ChannelError {
    ChannelError::FetchFailed {
        name: CHANNEL.into(),
        reason,
    }
}

fn send_failed(reason: String) -> ChannelError {
    ChannelError::SendFailed {
        name: CHANNEL.into(),
        reason,
    }
}

// ── SMTP ────────────────────────────────────────────────────────────

/// Send a threaded reply via SMTP (blocking; run in spawn_blocking).
fn send_email(config: &EmailConfig, reply: &OutboundReply) -> Result<String, ChannelError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    // 465 is implicit TLS; everything else upgrades with STARTTLS.
    let builder = if config.smtp_port == 465 {
        SmtpTransport::relay(&config.smtp_host)
    } else {
        SmtpTransport::starttls_relay(&config.smtp_host)
    };
    let transport = builder
        .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?
        .port(config.smtp_port)
        .credentials(creds)
        .build();

    let message_id = format!("<{}@{}>", Uuid::new_v4(), config.from_domain());
    let email = build_message(config, reply, &message_id)?;

    transport
        .send(&email)
        .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;

    tracing::info!(to = %reply.to, "Email sent");
    Ok(message_id)
}

/// Assemble the reply. With attachments the body becomes the first part of a
/// multipart/mixed message; unreadable files are skipped.
fn build_message(
    config: &EmailConfig,
    reply: &OutboundReply,
    message_id: &str,
) -> Result<Message, ChannelError> {
    let mut builder = Message::builder()
        .from(
            config
                .from_address
                .parse()
                .map_err(|e| send_failed(format!("Invalid from address: {e}")))?,
        )
        .to(reply
            .to
            .parse()
            .map_err(|_| ChannelError::InvalidRecipient(reply.to.clone()))?)
        .subject(&reply.subject)
        .message_id(Some(message_id.to_string()));
    if let Some(ref irt) = reply.in_reply_to {
        builder = builder.in_reply_to(irt.clone());
    }
    if !reply.references.is_empty() {
        builder = builder.references(reply.references.join(" "));
    }

    let parts: Vec<SinglePart> = reply
        .attachments
        .iter()
        .filter_map(|path| attachment_part(path))
        .collect();

    let built = if parts.is_empty() {
        builder
            .header(ContentType::TEXT_PLAIN)
            .body(reply.body.clone())
    } else {
        let multipart = parts.into_iter().fold(
            MultiPart::mixed().singlepart(SinglePart::plain(reply.body.clone())),
            |mp, part| mp.singlepart(part),
        );
        builder.multipart(multipart)
    };
    built.map_err(|e| send_failed(format!("Failed to build email: {e}")))
}

fn attachment_part(path: &Path) -> Option<SinglePart> {
    let filename = path.file_name()?.to_string_lossy().into_owned();
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Attachment unreadable, skipping");
            return None;
        }
    };
    let mime = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    };
    let content_type = ContentType::parse(mime).ok()?;
    Some(Attachment::new(filename).body(bytes, content_type))
}

// ── Helpers (public for testing) ────────────────────────────────────

/// Check if a sender email is in the allowlist.
///
/// - Empty list → deny all
/// - `*` in list → allow all
/// - `@domain.com` or `domain.com` → domain match
/// - `user@domain.com` → exact email match
pub fn is_sender_allowed(allowed: &[String], email: &str) -> bool {
    if allowed.is_empty() {
        return false;
    }
    if allowed.iter().any(|a| a == "*") {
        return true;
    }
    let email_lower = email.to_lowercase();
    allowed.iter().any(|a| {
        if a.starts_with('@') {
            email_lower.ends_with(&a.to_lowercase())
        } else if a.contains('@') {
            a.eq_ignore_ascii_case(email)
        } else {
            email_lower.ends_with(&format!("@{}", a.to_lowercase()))
        }
    })
}

static ADDRESS_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").ok());

/// `user@domain.tld` shape check for reply recipients.
pub fn is_valid_address(email: &str) -> bool {
    ADDRESS_RE
        .as_ref()
        .is_some_and(|re| re.is_match(email.trim()))
}

static AUTOMATED_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)^(no[\-_.]?reply|do[\-_.]?not[\-_.]?reply|mailer[\-_]?daemon|postmaster)@").ok()
});

/// Bounces and no-reply robots; answering them only loops mail.
pub fn is_automated_sender(email: &str) -> bool {
    AUTOMATED_RE
        .as_ref()
        .is_some_and(|re| re.is_match(email.trim()))
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// mail-parser drops the angle brackets from message ids; put them back.
fn bracket_id(id: &str) -> String {
    let id = id.trim();
    if id.starts_with('<') {
        id.to_string()
    } else {
        format!("<{id}>")
    }
}

fn header_ids(value: &HeaderValue) -> Vec<String> {
    match value {
        HeaderValue::Text(id) => vec![bracket_id(id)],
        HeaderValue::TextList(ids) => ids.iter().map(|id| bracket_id(id)).collect(),
        _ => Vec::new(),
    }
}

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    "(no readable content)".to_string()
}

/// Parse a raw RFC 822 message into an `InboundEmail`.
pub fn parse_email(uid: &str, raw: &[u8]) -> Option<InboundEmail> {
    let parsed = MessageParser::default().parse(raw)?;

    let from = parsed.from().and_then(|addr| addr.first());
    let sender = from.and_then(|a| a.address())?.to_string();
    let sender_name = from.and_then(|a| a.name()).map(str::to_string);

    let body = extract_text(&parsed);
    let date = parsed.date().map(|d| d.to_timestamp());

    // Without a Message-ID the id must still be stable across re-fetches.
    let message_id = parsed.message_id().map(bracket_id).unwrap_or_else(|| {
        let name = format!("{uid}\n{sender}\n{}\n{body}", date.unwrap_or_default());
        format!(
            "<gen-{}@crm-agent.local>",
            Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
        )
    });

    let received_at = date
        .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
        .unwrap_or_else(chrono::Utc::now);

    let attachments = parsed
        .attachments()
        .filter_map(|part| MimeHeaders::attachment_name(part).map(str::to_string))
        .collect();

    Some(InboundEmail {
        uid: uid.to_string(),
        message_id,
        sender,
        sender_name,
        subject: parsed.subject().map(str::to_string),
        body,
        in_reply_to: header_ids(parsed.in_reply_to()).into_iter().next(),
        references: header_ids(parsed.references()),
        attachments,
        received_at,
    })
}

// ── IMAP ────────────────────────────────────────────────────────────

/// An unparsed message straight off the wire.
struct RawEmail {
    uid: String,
    bytes: Vec<u8>,
}

/// Error type for IMAP operations.
type ImapError = Box<dyn std::error::Error + Send + Sync>;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Open an authenticated IMAP session with INBOX selected.
fn imap_connect(config: &EmailConfig) -> Result<TlsStream, ImapError> {
    let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))?;
    tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls_pki_types::ServerName::try_from(config.imap_host.clone())?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)?;
    let mut tls = rustls::StreamOwned::new(conn, tcp);

    let _greeting = read_line(&mut tls)?;

    let login = send_cmd(
        &mut tls,
        "A1",
        &format!(
            "LOGIN \"{}\" \"{}\"",
            config.username,
            config.password.expose_secret()
        ),
    )?;
    if !login.last().is_some_and(|l| l.contains("OK")) {
        return Err("IMAP login failed".into());
    }

    let _select = send_cmd(&mut tls, "A2", "SELECT \"INBOX\"")?;
    Ok(tls)
}

fn read_line(tls: &mut TlsStream) -> Result<String, ImapError> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match std::io::Read::read(tls, &mut byte) {
            Ok(0) => return Err("IMAP connection closed".into()),
            Ok(_) => {
                buf.push(byte[0]);
                if buf.ends_with(b"\r\n") {
                    return Ok(String::from_utf8_lossy(&buf).to_string());
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn send_cmd(tls: &mut TlsStream, tag: &str, cmd: &str) -> Result<Vec<String>, ImapError> {
    IoWrite::write_all(tls, format!("{tag} {cmd}\r\n").as_bytes())?;
    IoWrite::flush(tls)?;
    let mut lines = Vec::new();
    loop {
        let line = read_line(tls)?;
        let done = line.starts_with(tag);
        lines.push(line);
        if done {
            break;
        }
    }
    Ok(lines)
}

/// UIDs from `* SEARCH 1 2 3` lines.
fn parse_search_uids(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter(|l| l.starts_with("* SEARCH"))
        .flat_map(|l| l.split_whitespace().skip(2).map(str::to_string))
        .collect()
}

/// Size of the `{N}` literal announced at the end of a FETCH line.
fn literal_size(line: &str) -> Option<usize> {
    let trimmed = line.trim_end();
    let open = trimmed.rfind('{')?;
    trimmed
        .strip_suffix('}')
        .and_then(|s| s.get(open + 1..))
        .and_then(|n| n.parse().ok())
}

/// Reassemble the message literal from a FETCH response.
fn fetch_literal(lines: &[String]) -> Option<Vec<u8>> {
    let start = lines.iter().position(|l| literal_size(l).is_some())?;
    let size = literal_size(&lines[start])?;
    let mut bytes = Vec::with_capacity(size);
    for line in &lines[start + 1..] {
        if bytes.len() >= size {
            break;
        }
        bytes.extend_from_slice(line.as_bytes());
    }
    bytes.truncate(size);
    Some(bytes)
}

/// Fetch unseen emails without setting `\Seen` (blocking; run in spawn_blocking).
fn fetch_unseen_imap(config: &EmailConfig) -> Result<Vec<RawEmail>, ImapError> {
    let mut tls = imap_connect(config)?;

    let search = send_cmd(&mut tls, "A3", "UID SEARCH UNSEEN")?;
    let uids = parse_search_uids(&search);

    let mut results = Vec::with_capacity(uids.len());
    let mut tag_counter = 4_u32;
    for uid in uids {
        let tag = format!("A{tag_counter}");
        tag_counter += 1;
        let resp = send_cmd(&mut tls, &tag, &format!("UID FETCH {uid} BODY.PEEK[]"))?;
        match fetch_literal(&resp) {
            Some(bytes) => results.push(RawEmail { uid, bytes }),
            None => tracing::warn!(uid = %uid, "FETCH response had no message literal"),
        }
    }

    let _ = send_cmd(&mut tls, &format!("A{tag_counter}"), "LOGOUT");
    Ok(results)
}

/// Set `\Seen` on the given UIDs (blocking; run in spawn_blocking).
fn mark_seen_imap(config: &EmailConfig, uids: &[String]) -> Result<(), ImapError> {
    let mut tls = imap_connect(config)?;
    let tag = "A3";
    let resp = send_cmd(
        &mut tls,
        tag,
        &format!("UID STORE {} +FLAGS (\\Seen)", uids.join(",")),
    )?;
    let _ = send_cmd(&mut tls, "A4", "LOGOUT");
    if !resp.last().is_some_and(|l| l.contains("OK")) {
        return Err("UID STORE rejected".into());
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────
