//! HTTP surface: health and on-demand inbox processing.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::channels::email_poller::{PollerSettings, poll_once};
use crate::pipeline::{MailService, SupportProcessor};

/// Shared state for the HTTP routes.
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<SupportProcessor>,
    pub mail: Arc<dyn MailService>,
    /// Model the classifier talks to, reported by `/health`.
    pub llm_model: String,
    pub poller: PollerSettings,
}

/// GET /health
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mail_ok = state.mail.health_check().await.is_ok();
    Json(serde_json::json!({
        "status": if mail_ok { "healthy" } else { "degraded" },
        "timestamp": Utc::now(),
        "services": {
            "mail": if mail_ok { "connected" } else { "unreachable" },
            "llm": state.llm_model,
            "ledger": state.processor.ledger_name(),
        },
    }))
}

/// GET|POST /process-emails
///
/// Runs one poll cycle and reports what it did.
async fn process_emails(State(state): State<AppState>) -> impl IntoResponse {
    match poll_once(&state.mail, &state.processor, &state.poller).await {
        Ok(report) => Json(serde_json::json!({
            "status": "success",
            "emails_found": report.emails_found,
            "emails_processed": report.emails_processed,
            "responses_sent": report.responses_sent,
            "errors": report.errors,
            "timestamp": report.timestamp,
        }))
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Inbox processing failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({
                    "status": "error",
                    "error": e.to_string(),
                    "timestamp": Utc::now(),
                })),
            )
                .into_response()
        }
    }
}

/// Build the service routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/process-emails", get(process_emails).post(process_emails))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind `0.0.0.0:port` and serve until the process exits.
pub async fn serve(port: u16, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "HTTP server listening");
    axum::serve(listener, router(state)).await
}
