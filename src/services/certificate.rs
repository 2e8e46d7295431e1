//! Certificate portal client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::services::{CertificateService, IssuedCertificate};

const SERVICE: &str = "certificate";

#[derive(Debug, Clone)]
pub struct CertificateConfig {
    /// Portal endpoint that renders a certificate PDF.
    pub url: String,
    /// Where generated PDFs are written.
    pub output_dir: PathBuf,
    pub timeout: Duration,
}

/// Request body the portal expects.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CertificatePayload<'a> {
    today: String,
    name: &'a str,
    user_id: String,
    subject: &'a str,
    sample: bool,
    excellence: bool,
    pre_excellence: bool,
    #[serde(rename = "type")]
    kind: &'static str,
    final_certificate: bool,
}

pub struct CertificateClient {
    client: reqwest::Client,
    config: CertificateConfig,
}

impl CertificateClient {
    pub fn new(config: CertificateConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ServiceError::external(SERVICE, format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }
}

/// Stable per-name id the portal uses to dedupe certificates.
fn user_id_for(name: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.trim().to_lowercase().as_bytes()).to_string()
}

/// File-system safe fragment: spaces become underscores, separators are dropped.
fn file_fragment(s: &str) -> String {
    s.trim()
        .chars()
        .filter_map(|c| match c {
            ' ' => Some('_'),
            '/' | '\\' | ':' | '\0' => None,
            c => Some(c),
        })
        .collect()
}

fn certificate_path(dir: &Path, name: &str, course: &str) -> PathBuf {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    dir.join(format!(
        "certificate_{}_{}_{timestamp}.pdf",
        file_fragment(name),
        file_fragment(course)
    ))
}

#[async_trait]
impl CertificateService for CertificateClient {
    async fn issue(&self, name: &str, course: &str) -> Result<IssuedCertificate, ServiceError> {
        let payload = CertificatePayload {
            today: Utc::now().format("%Y-%m-%d").to_string(),
            name,
            user_id: user_id_for(name),
            subject: course,
            sample: false,
            excellence: true,
            pre_excellence: false,
            kind: "pdf",
            final_certificate: true,
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
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Certificate portal rejected request");
            return Err(ServiceError::external(
                SERVICE,
                format!("portal returned {status}: {body}"),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ServiceError::external(SERVICE, format!("failed to read body: {e}")))?;

        tokio::fs::create_dir_all(&self.config.output_dir)
            .await
            .map_err(|e| ServiceError::external(SERVICE, format!("cannot create output dir: {e}")))?;
        let file = certificate_path(&self.config.output_dir, name, course);
        tokio::fs::write(&file, &bytes)
            .await
            .map_err(|e| ServiceError::external(SERVICE, format!("cannot write PDF: {e}")))?;

        info!(course, file = %file.display(), bytes = bytes.len(), "Certificate issued");
        Ok(IssuedCertificate { file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, dir: &Path) -> CertificateClient {
        CertificateClient::new(CertificateConfig {
            url: format!("{}/certificate/getfile/PH", server.uri()),
            output_dir: dir.to_path_buf(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn user_id_is_stable_per_name() {
        assert_eq!(user_id_for("Alex"), user_id_for(" alex "));
        assert_ne!(user_id_for("Alex"), user_id_for("Sam"));
    }

    #[test]
    fn path_uses_underscored_fragments() {
        let p = certificate_path(Path::new("/tmp/certs"), "Alex Doe", "Python 101/Intro");
        let name = p.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("certificate_Alex_Doe_Python_101Intro_"));
        assert!(name.ends_with(".pdf"));
    }

    #[tokio::test]
    async fn issue_writes_pdf() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/certificate/getfile/PH"))
            .and(body_partial_json(serde_json::json!({
                "name": "Alex",
                "subject": "Course101",
                "type": "pdf",
                "finalCertificate": true,
                "sample": false
            })))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.4 fake".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let issued = client(&server, dir.path()).issue("Alex", "Course101").await.unwrap();
        let written = std::fs::read(&issued.file).unwrap();
        assert_eq!(written, b"%PDF-1.4 fake");
    }

    #[tokio::test]
    async fn issue_surfaces_portal_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("down"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let err = client(&server, dir.path()).issue("Alex", "C1").await.unwrap_err();
        assert!(matches!(err, ServiceError::External { .. }));
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}
