//! Host configuration.
//!
//! Layered the way the teacher's CLI config is: defaults, then environment
//! overrides via [`figment`]. Durations are expressed in milliseconds on the
//! wire/env layer (matching the upstream `*Ms` config keys) and normalized to
//! [`std::time::Duration`] once loaded.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{HostError, Result};

/// Log verbosity requested by the caller. Distinct from the crate's internal
/// `tracing` level — this only gates the host's own `log(...)` forwarding
/// and startup diagnostics.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Quiet,
    #[default]
    Info,
    Prod,
    Debug,
}

/// Raw, wire-shaped configuration (milliseconds, not `Duration`).
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHostConfig {
    api_key: Option<String>,
    endpoint: String,
    #[serde(default)]
    log_level: LogLevel,
    #[serde(default = "defaults::retry_interval_ms")]
    retry_interval_ms: u64,
    #[serde(default = "defaults::ping_interval_ms")]
    ping_interval_ms: u64,
    #[serde(default = "defaults::ping_timeout_ms")]
    ping_timeout_ms: u64,
    #[serde(default = "defaults::connect_timeout_ms")]
    connect_timeout_ms: u64,
    #[serde(default = "defaults::send_timeout_ms")]
    send_timeout_ms: u64,
    #[serde(default = "defaults::close_unresponsive_connection_timeout_ms")]
    close_unresponsive_connection_timeout_ms: u64,
    #[serde(default = "defaults::reinitialize_batch_timeout_ms")]
    reinitialize_batch_timeout_ms: u64,
    #[serde(default = "defaults::complete_http_request_delay_ms")]
    complete_http_request_delay_ms: u64,
    #[serde(default = "defaults::complete_shutdown_delay_ms")]
    complete_shutdown_delay_ms: u64,
    #[serde(default = "defaults::max_resend_attempts")]
    max_resend_attempts: u32,
    #[serde(default)]
    verbose_message_logs: bool,
}

mod defaults {
    pub const fn retry_interval_ms() -> u64 {
        3_000
    }
    pub const fn ping_interval_ms() -> u64 {
        30_000
    }
    pub const fn ping_timeout_ms() -> u64 {
        5_000
    }
    pub const fn connect_timeout_ms() -> u64 {
        10_000
    }
    pub const fn send_timeout_ms() -> u64 {
        10_000
    }
    pub const fn close_unresponsive_connection_timeout_ms() -> u64 {
        180_000
    }
    pub const fn reinitialize_batch_timeout_ms() -> u64 {
        200
    }
    pub const fn complete_http_request_delay_ms() -> u64 {
        200
    }
    pub const fn complete_shutdown_delay_ms() -> u64 {
        100
    }
    pub const fn max_resend_attempts() -> u32 {
        5
    }
}

/// Normalized, ready-to-use host configuration.
#[derive(Clone, Debug)]
pub struct HostConfig {
    pub api_key: Option<String>,
    pub endpoint: String,
    pub log_level: LogLevel,
    pub retry_interval: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub close_unresponsive_connection_timeout: Duration,
    pub reinitialize_batch_timeout: Duration,
    pub complete_http_request_delay: Duration,
    pub complete_shutdown_delay: Duration,
    pub max_resend_attempts: u32,
    pub verbose_message_logs: bool,
}

impl HostConfig {
    /// Load configuration from process environment variables prefixed
    /// `CHRONICALS_` (e.g. `CHRONICALS_ENDPOINT`), falling back to defaults.
    ///
    /// # Errors
    /// Returns [`HostError::Fatal`] if required keys are missing or a value
    /// fails to parse, or if a loaded value is out of range (see
    /// [`HostConfig::validate`]).
    pub fn from_env() -> Result<Self> {
        use figment::Figment;
        use figment::providers::Env;

        let raw: RawHostConfig = Figment::new()
            .merge(Env::prefixed("CHRONICALS_"))
            .extract()
            .map_err(|e| HostError::Fatal(format!("invalid host configuration: {e}")))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawHostConfig) -> Result<Self> {
        let config = Self {
            api_key: raw.api_key,
            endpoint: raw.endpoint,
            log_level: raw.log_level,
            retry_interval: Duration::from_millis(raw.retry_interval_ms),
            ping_interval: Duration::from_millis(raw.ping_interval_ms),
            ping_timeout: Duration::from_millis(raw.ping_timeout_ms),
            connect_timeout: Duration::from_millis(raw.connect_timeout_ms),
            send_timeout: Duration::from_millis(raw.send_timeout_ms),
            close_unresponsive_connection_timeout: Duration::from_millis(
                raw.close_unresponsive_connection_timeout_ms,
            ),
            reinitialize_batch_timeout: Duration::from_millis(raw.reinitialize_batch_timeout_ms),
            complete_http_request_delay: Duration::from_millis(raw.complete_http_request_delay_ms),
            complete_shutdown_delay: Duration::from_millis(raw.complete_shutdown_delay_ms),
            max_resend_attempts: raw.max_resend_attempts,
            verbose_message_logs: raw.verbose_message_logs,
        };
        config.validate()?;
        Ok(config)
    }

    /// Construct directly from already-resolved values (used by callers that
    /// build configuration programmatically instead of from the environment).
    ///
    /// # Errors
    /// Returns [`HostError::Fatal`] if any duration is zero or
    /// `max_resend_attempts` is zero.
    pub fn validate(&self) -> Result<()> {
        let zero = Duration::from_millis(0);
        let durations = [
            ("pingIntervalMs", self.ping_interval),
            ("pingTimeoutMs", self.ping_timeout),
            ("connectTimeoutMs", self.connect_timeout),
            ("sendTimeoutMs", self.send_timeout),
            ("retryIntervalMs", self.retry_interval),
        ];
        for (name, value) in durations {
            if value == zero {
                return Err(HostError::Fatal(format!("{name} must be non-zero")));
            }
        }
        if self.max_resend_attempts == 0 {
            return Err(HostError::Fatal("maxResendAttempts must be non-zero".into()));
        }
        if self.endpoint.is_empty() {
            return Err(HostError::Fatal("endpoint must be set".into()));
        }
        Ok(())
    }

    /// Derive the HTTP base URL used for the single-shot declare request:
    /// same host, `ws`/`wss` mapped to `http`/`https`, empty path.
    ///
    /// # Errors
    /// Returns [`HostError::Fatal`] if the endpoint is not a valid URL.
    pub fn http_base_url(&self) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.endpoint)
            .map_err(|e| HostError::Fatal(format!("invalid endpoint url: {e}")))?;
        let scheme = match url.scheme() {
            "ws" => "http",
            "wss" => "https",
            other => other,
        };
        url.set_scheme(scheme)
            .map_err(|()| HostError::Fatal("failed to rewrite endpoint scheme".into()))?;
        url.set_path("");
        url.set_query(None);
        Ok(url)
    }
}
