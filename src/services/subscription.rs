//! Premium activation client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::ServiceError;
use crate::services::SubscriptionService;

const SERVICE: &str = "subscription";

/// Premium grants last a year.
const GRANT_DAYS: i64 = 365;

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub url: String,
    pub promo_code: String,
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ActivationPayload<'a> {
    code_type: &'static str,
    email: &'a str,
    /// Unix epoch milliseconds.
    expiry_time: i64,
    promo_code: &'a str,
}

pub struct SubscriptionClient {
    client: reqwest::Client,
    config: SubscriptionConfig,
}

impl SubscriptionClient {
    pub fn new(config: SubscriptionConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ServiceError::external(SERVICE, format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl SubscriptionService for SubscriptionClient {
    async fn activate(&self, email: &str, order_id: &str) -> Result<(), ServiceError> {
        let expiry = Utc::now() + chrono::Duration::days(GRANT_DAYS);
        let payload = ActivationPayload {
            code_type: "ONETIME",
            email,
            expiry_time: expiry.timestamp_millis(),
            promo_code: &self.config.promo_code,
        };

        let response = self
            .client
            .post(&self.config.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ServiceError::timeout(SERVICE, self.config.timeout)
                } else {
                    ServiceError::external(SERVICE, format!("HTTP request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            info!(order_id, "Premium activated");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or(body);
        warn!(status = %status, order_id, "Premium activation rejected");
        Err(ServiceError::external(
            SERVICE,
            format!("activation returned {status}: {message}"),
        ))
    }
}
