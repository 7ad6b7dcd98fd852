use std::env;
use std::time::Duration;

use dotenvy::dotenv;

use crate::backoff::BackoffSeries;
use crate::error::{OutboxError, OutboxResult};

/// Environment variable toggling delivery on or off.
pub const ENV_ENABLED: &str = "OUTBOX_ENABLED";
/// Environment variable holding the tick period in milliseconds.
pub const ENV_DISPATCH_INTERVAL_MS: &str = "OUTBOX_DISPATCH_INTERVAL_MS";
/// Environment variable holding the comma-separated backoff series in milliseconds.
pub const ENV_BACKOFF_SERIES: &str = "OUTBOX_BACKOFF_SERIES";
/// Environment variable holding the number of attempts before archival.
pub const ENV_MAX_ATTEMPTS: &str = "OUTBOX_MAX_ATTEMPTS";

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// When false, every tick is a no-op and entries accumulate untouched.
    pub enabled: bool,
    /// Period between ticks.
    pub dispatch_interval: Duration,
    /// Delay applied after each failed attempt.
    pub backoff: BackoffSeries,
    /// Attempts allowed before an entry is archived as failed.
    pub max_attempts: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dispatch_interval: Duration::from_millis(1000),
            backoff: BackoffSeries::default(),
            max_attempts: 5,
        }
    }
}

impl DispatcherConfig {
    /// Load configuration from environment variables.
    ///
    /// Reads a `.env` file first if present. Unset variables keep their defaults.
    pub fn from_env() -> OutboxResult<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key/value source using the `OUTBOX_*` names.
    pub fn from_lookup<F>(lookup: F) -> OutboxResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let enabled = match lookup(ENV_ENABLED) {
            Some(value) => parse_bool(ENV_ENABLED, &value)?,
            None => defaults.enabled,
        };

        let dispatch_interval = match lookup(ENV_DISPATCH_INTERVAL_MS) {
            Some(value) => Duration::from_millis(parse_number::<u64>(ENV_DISPATCH_INTERVAL_MS, &value)?),
            None => defaults.dispatch_interval,
        };

        let backoff = match lookup(ENV_BACKOFF_SERIES) {
            Some(value) => BackoffSeries::parse(&value)?,
            None => defaults.backoff,
        };

        let max_attempts = match lookup(ENV_MAX_ATTEMPTS) {
            Some(value) => parse_number::<u32>(ENV_MAX_ATTEMPTS, &value)?,
            None => defaults.max_attempts,
        };

        let config = Self {
            enabled,
            dispatch_interval,
            backoff,
            max_attempts,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffSeries) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Reject configurations the dispatcher cannot run with.
    pub fn validate(&self) -> OutboxResult<()> {
        if self.dispatch_interval.is_zero() {
            return Err(OutboxError::config("dispatch interval must be greater than zero"));
        }
        if self.max_attempts == 0 {
            return Err(OutboxError::config("max attempts must be at least 1"));
        }
        if self.backoff.is_empty() {
            return Err(OutboxError::config("backoff series must not be empty"));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> OutboxResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(OutboxError::config(format!(
            "{} must be a boolean, got {:?}",
            key, other
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> OutboxResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| OutboxError::config(format!("{} must be a valid number, got {:?}", key, value)))
}
