//! Configuration types.
//!
//! `AppConfig` is read once at startup and handed to each collaborator.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::channels::email::EmailConfig;
use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};
use crate::services::{CertificateConfig, SheetsConfig, SubscriptionConfig};

const DEFAULT_CERTIFICATE_URL: &str =
    "https://certificationportal-h72gj5jcwq-uc.a.run.app/certificate/getfile/PH";
const DEFAULT_SUBSCRIPTION_URL: &str = "https://api-prod.programminghub.io/v5/api/auth/pro/add";
const DEFAULT_SHEETS_URL: &str = "https://sheets.googleapis.com";

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Product name used in prompts, replies, and the ledger.
    pub app_name: String,
    /// Prior messages shown to the classifier.
    pub history_limit: usize,
    pub classifier_timeout: Duration,
    pub action_timeout: Duration,
    pub ledger_timeout: Duration,
    pub mail_timeout: Duration,
    /// Receipt screenshots attached when a reply asks for an order id.
    pub receipt_guides: Vec<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            app_name: "Programming Hub".to_string(),
            history_limit: 10,
            classifier_timeout: Duration::from_secs(30),
            action_timeout: Duration::from_secs(30),
            ledger_timeout: Duration::from_secs(15),
            mail_timeout: Duration::from_secs(30),
            receipt_guides: Vec::new(),
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    /// `None` when `LLM_API_KEY` is unset; see [`AppConfig::require_llm`].
    pub llm: Option<LlmConfig>,
    /// `None` when no mailbox is configured.
    pub email: Option<EmailConfig>,
    /// `None` falls back to logging ledger rows.
    pub sheets: Option<SheetsConfig>,
    pub certificate: CertificateConfig,
    pub subscription: SubscriptionConfig,
    pub pipeline: PipelineConfig,
    pub http_port: u16,
    /// Daily rolling log files go here when set.
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from any variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            app_name: get("APP_NAME").unwrap_or(defaults.app_name),
            history_limit: parse_or(&get, "CRM_HISTORY_LIMIT", defaults.history_limit)?,
            classifier_timeout: secs_or(&get, "CRM_CLASSIFIER_TIMEOUT_SECS", defaults.classifier_timeout)?,
            action_timeout: secs_or(&get, "CRM_ACTION_TIMEOUT_SECS", defaults.action_timeout)?,
            ledger_timeout: secs_or(&get, "CRM_LEDGER_TIMEOUT_SECS", defaults.ledger_timeout)?,
            mail_timeout: secs_or(&get, "CRM_MAIL_TIMEOUT_SECS", defaults.mail_timeout)?,
            receipt_guides: get("ORDER_RECEIPT_IMAGES")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(PathBuf::from)
                        .collect()
                })
                .unwrap_or(defaults.receipt_guides),
        };

        let backend: LlmBackend = match get("LLM_BACKEND") {
            Some(raw) => raw.parse().map_err(|message| ConfigError::InvalidValue {
                key: "LLM_BACKEND".into(),
                message,
            })?,
            None => LlmBackend::Anthropic,
        };
        let default_model = match backend {
            LlmBackend::Anthropic => "claude-sonnet-4-20250514",
            LlmBackend::OpenAi => "gpt-4o",
        };
        let llm = get("LLM_API_KEY").map(|key| LlmConfig {
            backend,
            api_key: SecretString::from(key),
            model: get("LLM_MODEL").unwrap_or_else(|| default_model.to_string()),
        });

        let sheets = match get("SHEETS_SPREADSHEET_ID") {
            Some(spreadsheet_id) => Some(SheetsConfig {
                spreadsheet_id,
                access_token: SecretString::from(
                    get("SHEETS_ACCESS_TOKEN")
                        .ok_or_else(|| ConfigError::MissingEnvVar("SHEETS_ACCESS_TOKEN".into()))?,
                ),
                base_url: get("SHEETS_BASE_URL").unwrap_or_else(|| DEFAULT_SHEETS_URL.to_string()),
                timeout: pipeline.ledger_timeout,
            }),
            None => None,
        };

        let certificate = CertificateConfig {
            url: get("CERTIFICATE_URL").unwrap_or_else(|| DEFAULT_CERTIFICATE_URL.to_string()),
            output_dir: PathBuf::from(get("CERTIFICATE_PATH").unwrap_or_else(|| "./certificates".into())),
            timeout: pipeline.action_timeout,
        };

        let subscription = SubscriptionConfig {
            url: get("SUBSCRIPTION_URL").unwrap_or_else(|| DEFAULT_SUBSCRIPTION_URL.to_string()),
            promo_code: get("SUBSCRIPTION_PROMO_CODE").unwrap_or_default(),
            timeout: pipeline.action_timeout,
        };

        Ok(Self {
            db_path: PathBuf::from(get("CRM_AGENT_DB_PATH").unwrap_or_else(|| "./data/crm-agent.db".into())),
            llm,
            email: EmailConfig::from_lookup(&get),
            sheets,
            certificate,
            subscription,
            pipeline,
            http_port: parse_or(&get, "PORT", 8080)?,
            log_dir: get("CRM_AGENT_LOG_DIR").map(PathBuf::from),
        })
    }
}

impl AppConfig {
    /// LLM settings for the modes that classify mail.
    pub fn require_llm(&self) -> Result<&LlmConfig, ConfigError> {
        self.llm
            .as_ref()
            .ok_or_else(|| ConfigError::MissingEnvVar("LLM_API_KEY".into()))
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn secs_or(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn missing_api_key_is_reported_on_use() {
        let cfg = config(&[]).unwrap();
        assert!(cfg.llm.is_none());
        let err = cfg.require_llm().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "LLM_API_KEY"));

        let blank = config(&[("LLM_API_KEY", "  ")]).unwrap();
        assert!(matches!(blank.require_llm(), Err(ConfigError::MissingEnvVar(_))));
    }

    #[test]
    fn listing_needs_no_api_key() {
        let cfg = config(&[("CRM_AGENT_DB_PATH", "/tmp/list.db")]).unwrap();
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/list.db"));
    }

    #[test]
    fn defaults_apply() {
        let cfg = config(&[("LLM_API_KEY", "sk-test")]).unwrap();
        let llm = cfg.require_llm().unwrap();
        assert_eq!(llm.backend, LlmBackend::Anthropic);
        assert_eq!(llm.api_key.expose_secret(), "sk-test");
        assert_eq!(cfg.pipeline.app_name, "Programming Hub");
        assert_eq!(cfg.pipeline.history_limit, 10);
        assert_eq!(cfg.pipeline.classifier_timeout, Duration::from_secs(30));
        assert_eq!(cfg.http_port, 8080);
        assert!(cfg.email.is_none());
        assert!(cfg.sheets.is_none());
        assert!(cfg.log_dir.is_none());
        assert!(cfg.pipeline.receipt_guides.is_empty());
        assert_eq!(cfg.certificate.output_dir, PathBuf::from("./certificates"));
    }

    #[test]
    fn overrides_apply() {
        let cfg = config(&[
            ("LLM_API_KEY", "sk-test"),
            ("LLM_BACKEND", "openai"),
            ("APP_NAME", "Learn Python"),
            ("CRM_CLASSIFIER_TIMEOUT_SECS", "5"),
            ("PORT", "9000"),
            ("EMAIL_IMAP_HOST", "imap.app.com"),
            ("SHEETS_SPREADSHEET_ID", "sheet-1"),
            ("SHEETS_ACCESS_TOKEN", "tok"),
            ("CRM_AGENT_LOG_DIR", "/tmp/logs"),
            ("ORDER_RECEIPT_IMAGES", "guides/android.png, guides/ios.png,"),
        ])
        .unwrap();
        assert_eq!(
            cfg.pipeline.receipt_guides,
            vec![PathBuf::from("guides/android.png"), PathBuf::from("guides/ios.png")]
        );
        let llm = cfg.require_llm().unwrap();
        assert_eq!(llm.backend, LlmBackend::OpenAi);
        assert_eq!(llm.model, "gpt-4o");
        assert_eq!(cfg.pipeline.app_name, "Learn Python");
        assert_eq!(cfg.pipeline.classifier_timeout, Duration::from_secs(5));
        assert_eq!(cfg.http_port, 9000);
        assert_eq!(cfg.email.unwrap().imap_host, "imap.app.com");
        let sheets = cfg.sheets.unwrap();
        assert_eq!(sheets.spreadsheet_id, "sheet-1");
        assert_eq!(sheets.base_url, DEFAULT_SHEETS_URL);
        assert_eq!(cfg.log_dir, Some(PathBuf::from("/tmp/logs")));
    }

    #[test]
    fn invalid_values_rejected() {
        let err = config(&[("LLM_API_KEY", "k"), ("PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "PORT"));

        let err = config(&[("LLM_API_KEY", "k"), ("LLM_BACKEND", "llama")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "LLM_BACKEND"));
    }

    #[test]
    fn sheets_requires_token() {
        let err = config(&[("LLM_API_KEY", "k"), ("SHEETS_SPREADSHEET_ID", "s")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "SHEETS_ACCESS_TOKEN"));
    }
}
