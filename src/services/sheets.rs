//! Google Sheets client: the ledger and ticket tabs live in one spreadsheet.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::error::ServiceError;
use crate::services::ledger::{LedgerRow, LedgerWriter};
use crate::services::{Ticket, TicketCategory, TicketService};

const SERVICE: &str = "sheets";

/// Tab holding one row per processed message.
pub const LEDGER_TAB: &str = "All-Logs";

const LEDGER_HEADERS: [&str; 6] = [
    "Timestamp",
    "Issue Type",
    "App Name",
    "Email",
    "Initial Message",
    "Status",
];

const NOT_PROVIDED: &str = "Not provided";

#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub spreadsheet_id: String,
    /// OAuth bearer token with the spreadsheets scope.
    pub access_token: SecretString,
    /// `https://sheets.googleapis.com` outside tests.
    pub base_url: String,
    pub timeout: Duration,
}

pub struct SheetsClient {
    client: reqwest::Client,
    config: SheetsConfig,
}

impl SheetsClient {
    pub fn new(config: SheetsConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ServiceError::external(SERVICE, format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn append_url(&self, tab: &str) -> String {
        format!(
            "{}/v4/spreadsheets/{}/values/{tab}!A:Z:append?valueInputOption=RAW&insertDataOption=INSERT_ROWS",
            self.config.base_url.trim_end_matches('/'),
            self.config.spreadsheet_id
        )
    }

    fn spreadsheet_url(&self) -> String {
        format!(
            "{}/v4/spreadsheets/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.spreadsheet_id
        )
    }

    fn map_send_error(&self, e: reqwest::Error) -> ServiceError {
        if e.is_timeout() {
            ServiceError::timeout(SERVICE, self.config.timeout)
        } else {
            ServiceError::external(SERVICE, format!("HTTP request failed: {e}"))
        }
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response, ServiceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ServiceError::external(
            SERVICE,
            format!("{what} returned {status}: {body}"),
        ))
    }

    /// Create any missing ledger or ticket tab and write its header row.
    ///
    /// Tabs that already have a full header row are left alone. Returns the
    /// tabs that were created.
    pub async fn initialize(&self) -> Result<Vec<String>, ServiceError> {
        let existing = self.existing_tabs().await?;
        let mut created = Vec::new();

        let mut tabs: Vec<(&str, &[&str])> = vec![(LEDGER_TAB, &LEDGER_HEADERS[..])];
        tabs.extend(TicketCategory::ALL.iter().map(|c| (c.tab(), c.headers())));

        for (tab, headers) in tabs {
            if !existing.iter().any(|t| t == tab) {
                self.add_tab(tab).await?;
                created.push(tab.to_string());
            }
            self.ensure_headers(tab, headers).await?;
        }

        info!(created = ?created, "Spreadsheet tabs initialized");
        Ok(created)
    }

    async fn existing_tabs(&self) -> Result<Vec<String>, ServiceError> {
        let response = self
            .client
            .get(self.spreadsheet_url())
            .query(&[("fields", "sheets.properties.title")])
            .bearer_auth(self.config.access_token.expose_secret())
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let body: serde_json::Value = Self::check(response, "spreadsheet lookup")
            .await?
            .json()
            .await
            .map_err(|e| ServiceError::external(SERVICE, format!("invalid spreadsheet JSON: {e}")))?;

        Ok(body["sheets"]
            .as_array()
            .map(|sheets| {
                sheets
                    .iter()
                    .filter_map(|s| s["properties"]["title"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn add_tab(&self, tab: &str) -> Result<(), ServiceError> {
        let request = serde_json::json!({
            "requests": [{ "addSheet": { "properties": { "title": tab } } }]
        });
        let response = self
            .client
            .post(format!("{}:batchUpdate", self.spreadsheet_url()))
            .bearer_auth(self.config.access_token.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        Self::check(response, &format!("creating tab {tab}")).await?;
        info!(tab, "Created spreadsheet tab");
        Ok(())
    }

    async fn ensure_headers(&self, tab: &str, headers: &[&str]) -> Result<(), ServiceError> {
        let range_url = format!("{}/values/{tab}!A1:Z1", self.spreadsheet_url());
        let response = self
            .client
            .get(&range_url)
            .bearer_auth(self.config.access_token.expose_secret())
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let body: serde_json::Value = Self::check(response, &format!("reading {tab} headers"))
            .await?
            .json()
            .await
            .map_err(|e| ServiceError::external(SERVICE, format!("invalid range JSON: {e}")))?;

        let present = body["values"][0].as_array().map_or(0, Vec::len);
        if present >= headers.len() {
            debug!(tab, "Headers already present");
            return Ok(());
        }

        let response = self
            .client
            .put(format!("{}/values/{tab}!A1", self.spreadsheet_url()))
            .query(&[("valueInputOption", "RAW")])
            .bearer_auth(self.config.access_token.expose_secret())
            .json(&serde_json::json!({ "values": [headers] }))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        Self::check(response, &format!("writing {tab} headers")).await?;
        debug!(tab, "Headers written");
        Ok(())
    }

    /// Append one row to `tab`.
    pub async fn append_row(&self, tab: &str, values: Vec<String>) -> Result<(), ServiceError> {
        let response = self
            .client
            .post(self.append_url(tab))
            .bearer_auth(self.config.access_token.expose_secret())
            .json(&serde_json::json!({ "values": [values] }))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        Self::check(response, &format!("append to {tab}")).await?;
        debug!(tab, "Row appended");
        Ok(())
    }
}

/// Cell values for a ticket, in the column order of its tab.
fn ticket_values(ticket: &Ticket) -> Vec<String> {
    let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let or_default = |v: &Option<String>| v.clone().unwrap_or_else(|| NOT_PROVIDED.to_string());
    match ticket.category {
        // Device, OS and app version are not extracted from mail.
        TicketCategory::Technical => vec![
            timestamp,
            ticket.app_name.clone(),
            ticket.email.clone(),
            ticket.description.clone(),
            NOT_PROVIDED.to_string(),
            NOT_PROVIDED.to_string(),
            NOT_PROVIDED.to_string(),
            or_default(&ticket.attachment_ref),
        ],
        TicketCategory::Refund | TicketCategory::Subscription => vec![
            timestamp,
            ticket.app_name.clone(),
            ticket.email.clone(),
            or_default(&ticket.order_id),
            ticket.status.clone(),
        ],
        TicketCategory::Certificate => vec![
            timestamp,
            ticket.app_name.clone(),
            ticket.email.clone(),
            or_default(&ticket.course),
            or_default(&ticket.certificate_name),
        ],
    }
}

#[async_trait]
impl LedgerWriter for SheetsClient {
    fn name(&self) -> &str {
        "sheets"
    }

    async fn append(&self, row: &LedgerRow) -> Result<(), ServiceError> {
        self.append_row(LEDGER_TAB, row.to_values()).await
    }
}

#[async_trait]
impl TicketService for SheetsClient {
    async fn log_ticket(&self, ticket: &Ticket) -> Result<(), ServiceError> {
        let tab = ticket.category.tab();
        self.append_row(tab, ticket_values(ticket)).await?;
        info!(tab, email = %ticket.email, "Ticket logged");
        Ok(())
    }
}
