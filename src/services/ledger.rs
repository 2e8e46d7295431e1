//! Interaction ledger: one row per processed message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ServiceError;
use crate::services::{Ticket, TicketService};

/// A row of the `All-Logs` tab.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerRow {
    pub timestamp: DateTime<Utc>,
    pub issue_type: String,
    pub app_name: String,
    pub email: String,
    pub initial_message: String,
    pub status: String,
}

impl LedgerRow {
    /// Cell values in column order.
    pub fn to_values(&self) -> Vec<String> {
        vec![
            self.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            self.issue_type.clone(),
            self.app_name.clone(),
            self.email.clone(),
            self.initial_message.clone(),
            self.status.clone(),
        ]
    }
}

/// Append-only sink for ledger rows.
#[async_trait]
pub trait LedgerWriter: Send + Sync {
    fn name(&self) -> &str;

    async fn append(&self, row: &LedgerRow) -> Result<(), ServiceError>;
}

/// Ledger that only emits a structured log line.
#[derive(Debug, Default)]
pub struct TracingLedger;

#[async_trait]
impl LedgerWriter for TracingLedger {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn append(&self, row: &LedgerRow) -> Result<(), ServiceError> {
        tracing::info!(
            target: "ledger",
            issue_type = %row.issue_type,
            app = %row.app_name,
            email = %row.email,
            status = %row.status,
            "Interaction logged"
        );
        Ok(())
    }
}

#[async_trait]
impl TicketService for TracingLedger {
    async fn log_ticket(&self, ticket: &Ticket) -> Result<(), ServiceError> {
        tracing::info!(
            target: "ledger",
            tab = ticket.category.tab(),
            app = %ticket.app_name,
            email = %ticket.email,
            order_id = ticket.order_id.as_deref().unwrap_or("-"),
            "Ticket logged"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> LedgerRow {
        LedgerRow {
            timestamp: DateTime::parse_from_rfc3339("2026-03-01T10:20:30Z")
                .unwrap()
                .with_timezone(&Utc),
            issue_type: "Unclassified".into(),
            app_name: "Programming Hub".into(),
            email: "a@x.com".into(),
            initial_message: "hello".into(),
            status: "awaiting_info".into(),
        }
    }

    #[test]
    fn values_follow_column_order() {
        assert_eq!(
            row().to_values(),
            vec![
                "2026-03-01 10:20:30",
                "Unclassified",
                "Programming Hub",
                "a@x.com",
                "hello",
                "awaiting_info"
            ]
        );
    }

    #[tokio::test]
    async fn tracing_ledger_never_fails() {
        assert!(TracingLedger.append(&row()).await.is_ok());
    }

    #[tokio::test]
    async fn tracing_ledger_accepts_tickets() {
        let ticket = Ticket {
            category: crate::services::TicketCategory::Refund,
            app_name: "Programming Hub".into(),
            email: "a@x.com".into(),
            description: "charged twice".into(),
            order_id: Some("GPA.1".into()),
            attachment_ref: None,
            course: None,
            certificate_name: None,
            status: "open".into(),
        };
        assert!(TracingLedger.log_ticket(&ticket).await.is_ok());
    }
}
