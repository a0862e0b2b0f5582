//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing. The
//! database URL is wrapped in `secrecy::SecretString` to keep credentials
//! out of logs.

use std::time::Duration;

use secrecy::SecretString;

use crate::engine::DispatcherConfig;
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Deliveries before a failing trigger job is buried.
    pub trigger_max_attempts: Option<u32>,
    /// Dispatcher poll interval in seconds.
    pub trigger_poll_secs: Option<u64>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            trigger_max_attempts: optional_parsed("TRIGGER_MAX_ATTEMPTS")?,
            trigger_poll_secs: optional_parsed("TRIGGER_POLL_SECS")?,
        })
    }

    /// Dispatcher settings: defaults, overridden by the environment.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let mut config = DispatcherConfig::default();
        if let Some(max_attempts) = self.trigger_max_attempts {
            config.max_attempts = max_attempts;
        }
        if let Some(poll_secs) = self.trigger_poll_secs {
            config.poll_interval = Duration::from_secs(poll_secs);
        }
        config
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("cannot parse {name}: {raw:?}"))),
        Err(_) => Ok(None),
    }
}
