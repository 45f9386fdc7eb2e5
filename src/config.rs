use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::idempotency::{ActivationStrategy, CoordinatorConfig, SpecificationConfig};
use crate::observability::LogConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub idempotency: IdempotencySettings,
    pub redis: RedisSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// `pretty`, `json` or `compact`
    pub log_format: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Which backend holds idempotency records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencySettings {
    pub header_name: String,
    /// `always` or `opt-in`
    pub activation: String,
    pub key_prefix: String,
    /// Unset: held locks are never taken over.
    pub lock_timeout_seconds: Option<i64>,
    /// Zero or negative keeps records forever.
    pub record_ttl_seconds: i64,
    pub max_body_bytes: usize,
    pub status_header: bool,
    pub fingerprint_headers: Vec<String>,
    pub canonicalize_json: bool,
    pub store: StoreKind,
    /// How often the memory store drops expired records.
    pub purge_interval_seconds: u64,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            header_name: "idempotency-key".to_string(),
            activation: "always".to_string(),
            key_prefix: "idem".to_string(),
            lock_timeout_seconds: None,
            record_ttl_seconds: 86400, // 24 hours
            max_body_bytes: 1024 * 1024,
            status_header: true,
            fingerprint_headers: vec!["content-type".to_string()],
            canonicalize_json: true,
            store: StoreKind::Memory,
            purge_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
    /// Namespace for record hashes, ahead of the lookup key.
    pub key_prefix: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "idempotency".to_string(),
        }
    }
}

impl Settings {
    /// Loads `config/default`, then `config/local`, then `APP__*` variables.
    pub fn new() -> std::result::Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("idempotency.fingerprint_headers"),
            );

        builder.build()?.try_deserialize()
    }

    pub fn from_toml(source: &str) -> std::result::Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig::new(&self.application.log_level, &self.application.log_format)
    }

    pub fn specification_config(&self) -> SpecificationConfig {
        SpecificationConfig {
            header_name: self.idempotency.header_name.clone(),
            key_prefix: self.idempotency.key_prefix.clone(),
            fingerprint_headers: self.idempotency.fingerprint_headers.clone(),
            canonicalize_json: self.idempotency.canonicalize_json,
        }
    }

    pub fn coordinator_config(&self) -> Result<CoordinatorConfig> {
        let settings = &self.idempotency;

        let header_name = http::HeaderName::from_bytes(
            settings.header_name.trim().to_ascii_lowercase().as_bytes(),
        )
        .map_err(|e| {
            AppError::Configuration(format!(
                "invalid idempotency header name '{}': {}",
                settings.header_name, e
            ))
        })?;

        let activation = settings.activation.parse::<ActivationStrategy>()?;

        let lock_timeout = match settings.lock_timeout_seconds {
            Some(seconds) if seconds <= 0 => {
                return Err(AppError::Configuration(
                    "lock_timeout_seconds must be positive".to_string(),
                ))
            }
            Some(seconds) => Some(bounded_duration("lock_timeout_seconds", seconds)?),
            None => None,
        };

        if settings.max_body_bytes == 0 {
            return Err(AppError::Configuration(
                "max_body_bytes must be positive".to_string(),
            ));
        }

        Ok(CoordinatorConfig {
            header_name,
            activation,
            lock_timeout,
            status_header: settings.status_header,
            max_body_bytes: settings.max_body_bytes,
        })
    }

    /// `record_ttl_seconds` as a duration; zero disables expiry.
    pub fn record_ttl(&self) -> Result<Option<chrono::Duration>> {
        match self.idempotency.record_ttl_seconds {
            0 => Ok(None),
            seconds if seconds < 0 => Err(AppError::Configuration(
                "record_ttl_seconds must not be negative".to_string(),
            )),
            seconds => bounded_duration("record_ttl_seconds", seconds).map(Some),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.application.host, self.application.port)
    }
}

/// Longest accepted TTL or lock timeout. Keeps `created_at + ttl` in range.
const MAX_DURATION_SECONDS: i64 = 100 * 365 * 24 * 60 * 60;

fn bounded_duration(setting: &str, seconds: i64) -> Result<chrono::Duration> {
    if seconds > MAX_DURATION_SECONDS {
        return Err(AppError::Configuration(format!(
            "{} must be at most {} seconds",
            setting, MAX_DURATION_SECONDS
        )));
    }
    Ok(chrono::Duration::seconds(seconds))
}
