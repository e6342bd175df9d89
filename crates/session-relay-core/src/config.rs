//! Relay configuration loaded from the environment.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use thiserror::Error;

/// Primary broker URL variable.
pub const BROKER_URL_VAR: &str = "REDIS_URL";
/// Fallback broker URL variable.
pub const BROKER_URL_FALLBACK_VAR: &str = "KV_URL";
/// Listen address variable.
pub const BIND_ADDR_VAR: &str = "RELAY_BIND_ADDR";
/// Platform execution limit, in seconds.
pub const EXECUTION_LIMIT_VAR: &str = "RELAY_EXECUTION_LIMIT_SECS";
/// Margin kept free for cleanup, in seconds.
pub const SAFETY_MARGIN_VAR: &str = "RELAY_SAFETY_MARGIN_SECS";
/// Follow-up response timeout, in seconds.
pub const RESPONSE_TIMEOUT_VAR: &str = "RELAY_RESPONSE_TIMEOUT_SECS";

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_EXECUTION_LIMIT: Duration = Duration::from_secs(800);
const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(5);
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("REDIS_URL environment variable is not set")]
    MissingBrokerUrl,
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Broker connection URL.
    pub broker_url: String,
    /// Address the HTTP surface listens on.
    pub bind_addr: SocketAddr,
    /// Hard execution limit of the hosting platform.
    pub execution_limit: Duration,
    /// Time reserved after the session deadline for cleanup.
    pub safety_margin: Duration,
    /// How long a follow-up request waits for its response.
    pub response_timeout: Duration,
}

impl RelayConfig {
    /// Build a config with defaults for everything but the broker URL.
    #[must_use]
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            execution_limit: DEFAULT_EXECUTION_LIMIT,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Load from process environment variables.
    ///
    /// # Errors
    /// Returns error if the broker URL is missing or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using an arbitrary variable lookup.
    ///
    /// # Errors
    /// Returns error if the broker URL is missing or a value is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let broker_url = non_empty(BROKER_URL_VAR)
            .or_else(|| non_empty(BROKER_URL_FALLBACK_VAR))
            .ok_or(ConfigError::MissingBrokerUrl)?;

        let bind_addr = parse_var(
            BIND_ADDR_VAR,
            non_empty(BIND_ADDR_VAR).as_deref().unwrap_or(DEFAULT_BIND_ADDR),
        )?;
        let execution_limit = secs_var(EXECUTION_LIMIT_VAR, non_empty(EXECUTION_LIMIT_VAR))?
            .unwrap_or(DEFAULT_EXECUTION_LIMIT);
        let safety_margin = secs_var(SAFETY_MARGIN_VAR, non_empty(SAFETY_MARGIN_VAR))?
            .unwrap_or(DEFAULT_SAFETY_MARGIN);
        let response_timeout = secs_var(RESPONSE_TIMEOUT_VAR, non_empty(RESPONSE_TIMEOUT_VAR))?
            .unwrap_or(DEFAULT_RESPONSE_TIMEOUT);

        let config = Self {
            broker_url,
            bind_addr,
            execution_limit,
            safety_margin,
            response_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    /// Returns error if the margin swallows the limit or the timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.safety_margin >= self.execution_limit {
            return Err(ConfigError::Invalid {
                name: SAFETY_MARGIN_VAR,
                reason: format!(
                    "margin of {}s leaves no session time within a {}s limit",
                    self.safety_margin.as_secs(),
                    self.execution_limit.as_secs()
                ),
            });
        }
        if self.response_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                name: RESPONSE_TIMEOUT_VAR,
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Longest a session may stay open.
    #[must_use]
    pub const fn max_session_duration(&self) -> Duration {
        self.execution_limit.saturating_sub(self.safety_margin)
    }
}

fn parse_var<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })
}

fn secs_var(name: &'static str, raw: Option<String>) -> Result<Option<Duration>, ConfigError> {
    raw.map(|v| parse_var::<u64>(name, &v).map(Duration::from_secs))
        .transpose()
}
