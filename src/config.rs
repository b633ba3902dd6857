use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_DATABASE_URL: &str = "sqlite://donations.db?mode=rwc";
const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 20;
const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;

/// Thresholds and code lists used by attempt retryability and fraud scoring.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// `multiple_failures` fires when the failed-attempt count is greater than this
    #[serde(default = "default_failed_attempts_threshold")]
    pub failed_attempts_threshold: usize,

    /// `rapid_attempts` fires when the mean interval between attempts is below this
    #[serde(default = "default_rapid_attempts_window_secs")]
    #[validate(range(min = 1))]
    pub rapid_attempts_window_secs: u64,

    /// `multiple_ips` fires when the distinct caller IP count is greater than this
    #[serde(default = "default_distinct_ip_threshold")]
    pub distinct_ip_threshold: usize,

    #[serde(default = "default_suspicious_error_codes")]
    pub suspicious_error_codes: Vec<String>,

    /// Error codes that make a failed attempt non-retryable
    #[serde(default = "default_permanent_error_codes")]
    pub permanent_error_codes: Vec<String>,

    /// Attempts older than this are eligible for purging
    #[serde(default = "default_retention_days")]
    #[validate(range(min = 1))]
    pub retention_days: i64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            failed_attempts_threshold: default_failed_attempts_threshold(),
            rapid_attempts_window_secs: default_rapid_attempts_window_secs(),
            distinct_ip_threshold: default_distinct_ip_threshold(),
            suspicious_error_codes: default_suspicious_error_codes(),
            permanent_error_codes: default_permanent_error_codes(),
            retention_days: default_retention_days(),
        }
    }
}

impl AuditConfig {
    pub fn is_permanent_error(&self, code: &str) -> bool {
        self.permanent_error_codes
            .iter()
            .any(|c| c.eq_ignore_ascii_case(code))
    }

    pub fn is_suspicious_error(&self, code: &str) -> bool {
        self.suspicious_error_codes
            .iter()
            .any(|c| c.eq_ignore_ascii_case(code))
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// Application environment
    #[validate(custom = "validate_environment")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// Base64-encoded 32-byte key sealing gateway credentials at rest
    #[validate(custom = "validate_encryption_key")]
    pub encryption_key: String,

    /// Upper bound on every outbound gateway call
    #[serde(default = "default_gateway_timeout_secs")]
    #[validate(range(min = 10, max = 30))]
    pub gateway_timeout_secs: u64,

    /// Accepted clock skew for timestamped webhook signatures
    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: u64,

    #[serde(default)]
    #[validate]
    pub audit: AuditConfig,
}

impl AppConfig {
    pub fn new(database_url: String, encryption_key: String, environment: String) -> Self {
        Self {
            database_url,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            encryption_key,
            gateway_timeout_secs: DEFAULT_GATEWAY_TIMEOUT_SECS,
            webhook_tolerance_secs: DEFAULT_WEBHOOK_TOLERANCE_SECS,
            audit: AuditConfig::default(),
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_gateway_timeout_secs() -> u64 {
    DEFAULT_GATEWAY_TIMEOUT_SECS
}
fn default_webhook_tolerance_secs() -> u64 {
    DEFAULT_WEBHOOK_TOLERANCE_SECS
}
fn default_failed_attempts_threshold() -> usize {
    2
}
fn default_rapid_attempts_window_secs() -> u64 {
    30
}
fn default_distinct_ip_threshold() -> usize {
    1
}
fn default_retention_days() -> i64 {
    365
}
fn default_suspicious_error_codes() -> Vec<String> {
    ["card_declined", "insufficient_funds", "expired_card"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_permanent_error_codes() -> Vec<String> {
    [
        "card_declined",
        "insufficient_funds",
        "invalid_card",
        "expired_card",
        "authentication_required",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_ascii_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => {
            let mut err = ValidationError::new("log_level");
            err.message = Some("Log level must be one of trace, debug, info, warn, error".into());
            Err(err)
        }
    }
}

fn validate_environment(environment: &str) -> Result<(), ValidationError> {
    match environment {
        "development" | "test" | "staging" | "production" => Ok(()),
        _ => {
            let mut err = ValidationError::new("environment");
            err.message =
                Some("Environment must be one of development, test, staging, production".into());
            Err(err)
        }
    }
}

fn validate_encryption_key(key: &str) -> Result<(), ValidationError> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    match STANDARD.decode(key.trim()) {
        Ok(bytes) if bytes.len() == 32 => Ok(()),
        _ => {
            let mut err = ValidationError::new("encryption_key");
            err.message = Some("Encryption key must be base64 encoding of exactly 32 bytes".into());
            Err(err)
        }
    }
}

/// Installs the global tracing subscriber. Safe to call more than once.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("donation_payments={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    load_config_from(CONFIG_DIR, &run_env)
}

pub(crate) fn load_config_from(config_dir: &str, run_env: &str) -> Result<AppConfig, AppConfigError> {
    // encryption_key has no default: gateway secrets must never be sealed with a built-in key.
    let config = Config::builder()
        .set_default("database_url", DEFAULT_DATABASE_URL)?
        .set_default("environment", run_env)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
        .add_source(File::with_name(&format!("{}/{}", config_dir, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("encryption_key").is_err() {
        error!("Encryption key is not configured. Set APP__ENCRYPTION_KEY to a base64-encoded 32-byte key.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "encryption_key is required but not configured. Set APP__ENCRYPTION_KEY environment variable."
                .into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const TEST_KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

    fn write_config(dir: &TempDir, filename: &str, content: &str) {
        let mut file = std::fs::File::create(dir.path().join(filename)).unwrap();
        writeln!(file, "{}", content).unwrap();
    }

    #[test]
    fn audit_defaults_match_documented_thresholds() {
        let audit = AuditConfig::default();
        assert_eq!(audit.failed_attempts_threshold, 2);
        assert_eq!(audit.rapid_attempts_window_secs, 30);
        assert_eq!(audit.distinct_ip_threshold, 1);
        assert!(audit.is_permanent_error("CARD_DECLINED"));
        assert!(audit.is_permanent_error("authentication_required"));
        assert!(!audit.is_permanent_error("processing_error"));
        assert!(audit.is_suspicious_error("expired_card"));
        assert!(!audit.is_suspicious_error("invalid_card"));
    }

    #[test]
    fn loads_layered_file_config() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            "default.toml",
            &format!(
                r#"
                database_url = "sqlite::memory:"
                encryption_key = "{}"
                gateway_timeout_secs = 15

                [audit]
                failed_attempts_threshold = 4
                "#,
                TEST_KEY
            ),
        );
        write_config(&dir, "test.toml", r#"log_level = "debug""#);

        let cfg = load_config_from(dir.path().to_str().unwrap(), "test").unwrap();
        assert_eq!(cfg.database_url, "sqlite::memory:");
        assert_eq!(cfg.environment, "test");
        assert_eq!(cfg.log_level(), "debug");
        assert_eq!(cfg.gateway_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.audit.failed_attempts_threshold, 4);
        assert_eq!(cfg.audit.rapid_attempts_window_secs, 30);
    }

    #[test]
    fn rejects_short_encryption_key() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            "default.toml",
            r#"
            encryption_key = "c2hvcnQ="
            "#,
        );

        let result = load_config_from(dir.path().to_str().unwrap(), "development");
        match result {
            Err(AppConfigError::Validation(errors)) => {
                assert!(errors.field_errors().contains_key("encryption_key"));
            }
            other => panic!("expected validation error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rejects_gateway_timeout_outside_range() {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".into(),
            TEST_KEY.into(),
            "development".into(),
        );
        assert!(cfg.validate().is_ok());

        cfg.gateway_timeout_secs = 90;
        assert!(cfg.validate().is_err());
    }
}
