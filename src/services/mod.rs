//! Clients for the external collaborators the executor and ledger talk to.
//!
//! Each concern is a trait so the pipeline can run against mocks in tests.

pub mod certificate;
pub mod ledger;
pub mod sheets;
pub mod subscription;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ServiceError;

pub use certificate::{CertificateClient, CertificateConfig};
pub use ledger::{LedgerRow, LedgerWriter, TracingLedger};
pub use sheets::{SheetsClient, SheetsConfig};
pub use subscription::{SubscriptionClient, SubscriptionConfig};

/// A generated certificate document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub file: PathBuf,
}

#[async_trait]
pub trait CertificateService: Send + Sync {
    async fn issue(&self, name: &str, course: &str) -> Result<IssuedCertificate, ServiceError>;
}

#[async_trait]
pub trait SubscriptionService: Send + Sync {
    /// Grant premium access to the account behind `email`.
    async fn activate(&self, email: &str, order_id: &str) -> Result<(), ServiceError>;
}

/// Spreadsheet tab a ticket lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TicketCategory {
    Technical,
    Refund,
    Certificate,
    Subscription,
}

impl TicketCategory {
    pub const ALL: [TicketCategory; 4] = [
        Self::Technical,
        Self::Refund,
        Self::Certificate,
        Self::Subscription,
    ];

    pub fn tab(&self) -> &'static str {
        match self {
            Self::Technical => "Technical_Issues",
            Self::Refund => "Refund",
            Self::Certificate => "Certificate_Issues",
            Self::Subscription => "Subscription_Issues",
        }
    }

    /// Header row of the tab.
    pub fn headers(&self) -> &'static [&'static str] {
        match self {
            Self::Technical => &[
                "Timestamp",
                "App Name",
                "Email",
                "Issue Description",
                "Device",
                "OS Version",
                "App Version",
                "Screenshot",
            ],
            Self::Refund | Self::Subscription => {
                &["Timestamp", "App Name", "Email", "Order ID", "Status"]
            }
            Self::Certificate => &["Timestamp", "App Name", "Email", "Course", "New Name"],
        }
    }
}

/// A support ticket for a human to follow up on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ticket {
    pub category: TicketCategory,
    pub app_name: String,
    pub email: String,
    pub description: String,
    pub order_id: Option<String>,
    pub attachment_ref: Option<String>,
    /// Certificate tickets: the course and the name printed on it.
    pub course: Option<String>,
    pub certificate_name: Option<String>,
    pub status: String,
}

#[async_trait]
pub trait TicketService: Send + Sync {
    async fn log_ticket(&self, ticket: &Ticket) -> Result<(), ServiceError>;
}
