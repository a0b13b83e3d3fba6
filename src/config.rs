//! Process configuration read from the environment.
//!
//! `DATABASE_URL` and `JWT_SECRET` are required. Numeric knobs fall back to
//! their default when unset or unparsable. `SYNC_INTERVAL` takes a duration
//! string such as `30s`, `500ms`, or `1m30s`; a bare number means seconds.

use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_APP_ENV: &str = "production";
pub const DEFAULT_AUTH_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{key} has invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub port: u16,
    pub sync_interval: Duration,
    pub app_env: String,
    pub auth_timeout: Duration,
    pub client_queue_capacity: usize,
    pub db_max_connections: u32,
}

impl Config {
    /// Read configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or `SYNC_INTERVAL`
    /// cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`Config::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        let sync_interval = match lookup("SYNC_INTERVAL") {
            Some(raw) => parse_duration(&raw).ok_or(ConfigError::Invalid { key: "SYNC_INTERVAL", value: raw })?,
            None => DEFAULT_SYNC_INTERVAL,
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            jwt_secret: required("JWT_SECRET")?,
            port: env_parse(&lookup, "PORT", DEFAULT_PORT),
            sync_interval,
            app_env: lookup("APP_ENV").unwrap_or_else(|| DEFAULT_APP_ENV.to_owned()),
            auth_timeout: Duration::from_millis(env_parse(&lookup, "AUTH_TIMEOUT_MS", DEFAULT_AUTH_TIMEOUT_MS)),
            client_queue_capacity: env_parse(&lookup, "CLIENT_QUEUE_CAPACITY", DEFAULT_CLIENT_QUEUE_CAPACITY).max(1),
            db_max_connections: env_parse(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS).max(1),
        })
    }

    /// Development mode clears every buffered stream at startup.
    #[must_use]
    pub fn is_dev(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("dev")
    }
}

fn env_parse<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + Copy,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Parse `500ms`, `30s`, `5m`, `1h`, compounds like `1m30s`, or bare
/// seconds. Zero and unknown units yield `None`.
#[must_use]
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return (secs > 0).then(|| Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = raw;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60)?),
            "h" => Duration::from_secs(value.checked_mul(3600)?),
            _ => return None,
        };
        total = total.checked_add(part)?;
        rest = &rest[unit_len..];
    }

    (!total.is_zero()).then_some(total)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
