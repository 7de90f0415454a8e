use std::env;
use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationErrors};

const CONFIG_DIR: &str = "config";
const DEFAULT_ENV: &str = "development";

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    #[validate(length(min = 1, message = "queueUrl is required"))]
    pub queue_url: String,
    #[validate(length(min = 1, message = "dlqUrl is required"))]
    pub dlq_url: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[validate(range(min = 1, max = 10))]
    #[serde(default = "default_max_messages_per_batch")]
    pub max_messages_per_batch: u32,
    #[validate(range(min = 1))]
    #[serde(default = "default_visibility_timeout_seconds")]
    pub visibility_timeout_seconds: u32,
    #[validate(range(min = 0.01, max = 1.0))]
    #[serde(default = "default_visibility_extend_threshold_ratio")]
    pub visibility_extend_threshold_ratio: f64,
    #[validate(range(min = 1))]
    #[serde(default = "default_max_receives")]
    pub max_receives: u32,
    /// Consecutive `receive` transport failures tolerated before the poller
    /// escalates to a fatal shutdown (spec §7).
    #[validate(range(min = 1))]
    #[serde(default = "default_max_consecutive_transport_failures")]
    pub max_consecutive_transport_failures: u32,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_max_messages_per_batch() -> u32 {
    10
}
fn default_visibility_timeout_seconds() -> u32 {
    30
}
fn default_visibility_extend_threshold_ratio() -> f64 {
    0.5
}
fn default_max_receives() -> u32 {
    3
}
fn default_max_consecutive_transport_failures() -> u32 {
    10
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    #[validate(range(min = 1))]
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_shutdown_grace_period_secs")]
    pub shutdown_grace_period_secs: u64,
    #[serde(default = "default_max_order_total")]
    pub max_order_total: Decimal,
}

fn default_concurrency() -> usize {
    10
}
fn default_shutdown_grace_period_secs() -> u64 {
    30
}
fn default_max_order_total() -> Decimal {
    Decimal::new(1_000_000_00, 2)
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct DbSettingsConfig {
    #[serde(default = "default_db_min")]
    pub min: u32,
    #[validate(range(min = 1))]
    #[serde(default = "default_db_max")]
    pub max: u32,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_db_min() -> u32 {
    1
}
fn default_db_max() -> u32 {
    10
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_acquire_timeout_secs() -> u64 {
    8
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct BreakerSettingsConfig {
    #[validate(range(min = 1))]
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_secs() -> u64 {
    30
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SecretsConfig {
    #[validate(length(min = 1, message = "secretName is required"))]
    pub secret_name: String,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[validate(range(min = 1))]
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_backoff_ms() -> u64 {
    200
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_max_attempts() -> u32 {
    10
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[validate(custom = "validate_log_format")]
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub collector_endpoint: Option<String>,
}

fn default_service_name() -> String {
    "order-worker".to_string()
}
fn default_log_format() -> String {
    "human".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

fn validate_log_format(value: &str) -> Result<(), validator::ValidationError> {
    match value {
        "human" | "json" => Ok(()),
        _ => Err(validator::ValidationError::new("log_format must be human or json")),
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    #[validate(length(min = 1))]
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[validate]
    pub queue: QueueConfig,
    #[validate]
    pub worker: WorkerConfig,
    #[serde(default)]
    #[validate]
    pub db: DbSettingsConfig,
    #[serde(default)]
    #[validate]
    pub breaker: BreakerSettingsConfig,
    #[validate]
    pub secrets: SecretsConfig,
    #[serde(default)]
    #[validate]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    #[validate]
    pub http: HttpConfig,
}

impl Default for DbSettingsConfig {
    fn default() -> Self {
        Self {
            min: default_db_min(),
            max: default_db_max(),
            idle_timeout_secs: default_idle_timeout_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl Default for BreakerSettingsConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_format: default_log_format(),
            log_level: default_log_level(),
            collector_endpoint: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),
    #[error("configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Layers `config/default.toml` -> `config/{env}.toml` -> environment
/// variables prefixed `ORDER_WORKER__` (double underscore nesting
/// separator), the same shape the rest of this stack already uses for its
/// own configuration surface.
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("ORDER_WORKER_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!(env = %run_env, "loading configuration");

    if !Path::new(CONFIG_DIR).exists() {
        info!("config directory '{}' not found; relying on defaults and environment variables", CONFIG_DIR);
    }

    let builder = Config::builder()
        .add_source(File::with_name(&format!("{CONFIG_DIR}/default")).required(false))
        .add_source(File::with_name(&format!("{CONFIG_DIR}/{run_env}")).required(false))
        .add_source(Environment::with_prefix("ORDER_WORKER").separator("__"));

    let config = builder.build()?;
    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|err| {
        error!(error = ?err, "configuration validation failed");
        AppConfigError::Validation(err)
    })?;

    info!("configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            queue: QueueConfig {
                queue_url: "https://sqs.example/orders".to_string(),
                dlq_url: "https://sqs.example/orders-dlq".to_string(),
                poll_interval_ms: default_poll_interval_ms(),
                max_messages_per_batch: default_max_messages_per_batch(),
                visibility_timeout_seconds: default_visibility_timeout_seconds(),
                visibility_extend_threshold_ratio: default_visibility_extend_threshold_ratio(),
                max_receives: default_max_receives(),
                max_consecutive_transport_failures: default_max_consecutive_transport_failures(),
            },
            worker: WorkerConfig {
                concurrency: default_concurrency(),
                shutdown_grace_period_secs: default_shutdown_grace_period_secs(),
                max_order_total: default_max_order_total(),
            },
            db: DbSettingsConfig::default(),
            breaker: BreakerSettingsConfig::default(),
            secrets: SecretsConfig {
                secret_name: "order-worker/db".to_string(),
                initial_backoff_ms: default_initial_backoff_ms(),
                max_backoff_ms: default_max_backoff_ms(),
                max_attempts: default_max_attempts(),
            },
            observability: ObservabilityConfig::default(),
            http: HttpConfig::default(),
        }
    }

    #[test]
    fn well_formed_config_validates() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn empty_queue_url_fails_validation() {
        let mut cfg = valid_config();
        cfg.queue.queue_url = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_secret_name_fails_validation() {
        let mut cfg = valid_config();
        cfg.secrets.secret_name = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unrecognized_log_format_fails_validation() {
        let mut cfg = valid_config();
        cfg.observability.log_format = "xml".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_concurrency_fails_validation() {
        let mut cfg = valid_config();
        cfg.worker.concurrency = 0;
        assert!(cfg.validate().is_err());
    }
}
