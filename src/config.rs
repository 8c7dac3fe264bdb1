//! Process configuration from `BOOKD_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::notify::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}={value:?} is not a valid value: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub catalog_path: Option<PathBuf>,
    pub notify_max_attempts: u32,
    pub notify_retry_base: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            catalog_path: None,
            notify_max_attempts: 5,
            notify_retry_base: Duration::from_millis(200),
        }
    }
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset keys keep their defaults; set but unparseable keys are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(bind) = lookup("BOOKD_BIND") {
            config.bind = bind;
        }
        if let Some(port) = parsed(&lookup, "BOOKD_PORT")? {
            config.port = port;
        }
        if let Some(dir) = lookup("BOOKD_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config.metrics_port = parsed(&lookup, "BOOKD_METRICS_PORT")?;
        if let Some(threshold) = parsed(&lookup, "BOOKD_COMPACT_THRESHOLD")? {
            config.compact_threshold = threshold;
        }
        config.catalog_path = lookup("BOOKD_CATALOG").map(PathBuf::from);
        if let Some(attempts) = parsed::<u32>(&lookup, "BOOKD_NOTIFY_MAX_ATTEMPTS")? {
            if attempts == 0 {
                return Err(ConfigError::Invalid {
                    key: "BOOKD_NOTIFY_MAX_ATTEMPTS",
                    value: attempts.to_string(),
                    reason: "must be at least 1".into(),
                });
            }
            config.notify_max_attempts = attempts;
        }
        if let Some(ms) = parsed(&lookup, "BOOKD_NOTIFY_RETRY_BASE_MS")? {
            config.notify_retry_base = Duration::from_millis(ms);
        }
        Ok(config)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.notify_max_attempts,
            base_delay: self.notify_retry_base,
        }
    }
}
