//! Construction-time configuration for the market data coordinator.
//!
//! All durations are expressed in milliseconds so the config round-trips
//! through JSON settings unchanged. Missing fields fall back to defaults.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::Operation;

/// Default number of retries after the first attempt.
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_RETRY_DELAY_MS: u64 = 500;
const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 10_000;
const DEFAULT_RETRY_JITTER_MS: u64 = 250;
const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 60_000;
const DEFAULT_HEALTH_PROBE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_DEGRADED_LATENCY_MS: u64 = 5_000;
const DEFAULT_FAILURE_COOLDOWN_MS: u64 = 5 * 60 * 1000;
const DEFAULT_CACHE_MAX_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_METRICS_SMOOTHING: f64 = 0.1;

/// Errors raised while validating configuration. These are the only fatal
/// errors of the crate.
#[derive(Error, Clone, Debug, PartialEq)]
pub enum ConfigError {
    #[error("No providers are enabled")]
    NoProvidersEnabled,

    #[error("Unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("Provider '{0}' is registered more than once")]
    DuplicateProvider(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// How the coordinator orders providers for each call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverStrategy {
    /// Override, then primary, then the configured fallback list.
    #[default]
    Priority,
    /// Rotate through enabled providers starting after the last one used.
    RoundRobin,
    /// Ascending rolling mean latency.
    Fastest,
    /// Ascending rolling error rate.
    MostReliable,
}

/// Per-provider settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSettings {
    pub enabled: bool,

    /// Credential handed to the adapter by whoever constructs it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Overrides the quota the adapter declares
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            requests_per_minute: None,
        }
    }
}

/// Cache time-to-live per operation, in milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheTtls {
    pub quote_ms: u64,
    pub historical_ms: u64,
    pub search_ms: u64,
    pub company_overview_ms: u64,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            quote_ms: 60_000,
            historical_ms: 60 * 60 * 1000,
            search_ms: 24 * 60 * 60 * 1000,
            company_overview_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl CacheTtls {
    /// TTL for an operation. Native batch results are cached per symbol, so
    /// batches share the quote TTL.
    pub fn for_operation(&self, operation: Operation) -> Duration {
        let ms = match operation {
            Operation::Quote | Operation::BatchQuotes => self.quote_ms,
            Operation::HistoricalData => self.historical_ms,
            Operation::Search => self.search_ms,
            Operation::CompanyOverview => self.company_overview_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Market data coordinator configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MarketDataConfig {
    /// First provider under the priority strategy. Defaults to the first
    /// registered enabled provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_provider: Option<String>,

    /// Ordered fallbacks after the primary.
    pub fallback_providers: Vec<String>,

    /// Per-provider settings keyed by provider id.
    pub providers: HashMap<String, ProviderSettings>,

    pub strategy: FailoverStrategy,

    /// Retries after the first attempt, per provider.
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub retry_jitter_ms: u64,

    /// Health probe period; 0 disables probing.
    pub health_check_interval_ms: u64,
    pub health_probe_timeout_ms: u64,
    /// Probe latency above which a responsive provider counts as degraded.
    pub degraded_latency_ms: u64,

    /// How long a failed provider is skipped.
    pub failure_cooldown_ms: u64,

    pub cache_ttl: CacheTtls,
    pub cache_max_bytes: usize,

    /// When false, each call only tries the first eligible provider.
    pub enable_auto_failover: bool,

    /// EWMA smoothing factor for performance metrics, in (0, 1].
    pub metrics_smoothing: f64,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            primary_provider: None,
            fallback_providers: Vec::new(),
            providers: HashMap::new(),
            strategy: FailoverStrategy::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            base_retry_delay_ms: DEFAULT_BASE_RETRY_DELAY_MS,
            max_retry_delay_ms: DEFAULT_MAX_RETRY_DELAY_MS,
            retry_jitter_ms: DEFAULT_RETRY_JITTER_MS,
            health_check_interval_ms: DEFAULT_HEALTH_CHECK_INTERVAL_MS,
            health_probe_timeout_ms: DEFAULT_HEALTH_PROBE_TIMEOUT_MS,
            degraded_latency_ms: DEFAULT_DEGRADED_LATENCY_MS,
            failure_cooldown_ms: DEFAULT_FAILURE_COOLDOWN_MS,
            cache_ttl: CacheTtls::default(),
            cache_max_bytes: DEFAULT_CACHE_MAX_BYTES,
            enable_auto_failover: true,
            metrics_smoothing: DEFAULT_METRICS_SMOOTHING,
        }
    }
}

impl MarketDataConfig {
    /// Parse a JSON settings document. Unspecified fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check numeric invariants. Provider ids are checked against the
    /// registered adapters when the coordinator is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.metrics_smoothing > 0.0 && self.metrics_smoothing <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "metricsSmoothing",
                reason: format!("must be in (0, 1], got {}", self.metrics_smoothing),
            });
        }
        if self.base_retry_delay_ms > self.max_retry_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "baseRetryDelayMs",
                reason: format!(
                    "{} exceeds maxRetryDelayMs {}",
                    self.base_retry_delay_ms, self.max_retry_delay_ms
                ),
            });
        }
        if self.cache_max_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cacheMaxBytes",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.health_check_interval_ms > 0 && self.health_probe_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "healthProbeTimeoutMs",
                reason: "must be greater than zero when health checks are enabled".to_string(),
            });
        }
        Ok(())
    }

    /// Whether a provider is enabled. Providers without settings are enabled.
    pub fn is_enabled(&self, provider: &str) -> bool {
        self.providers
            .get(provider)
            .map(|settings| settings.enabled)
            .unwrap_or(true)
    }

    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn retry_jitter(&self) -> Duration {
        Duration::from_millis(self.retry_jitter_ms)
    }

    /// `None` when health probing is disabled.
    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_ms > 0)
            .then(|| Duration::from_millis(self.health_check_interval_ms))
    }

    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health_probe_timeout_ms)
    }

    pub fn degraded_latency(&self) -> Duration {
        Duration::from_millis(self.degraded_latency_ms)
    }

    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_millis(self.failure_cooldown_ms)
    }
}
