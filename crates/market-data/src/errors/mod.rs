//! Error types and retry classification for the market data crate.
//!
//! This module provides:
//! - [`ProviderErrorKind`]: The fixed failure taxonomy every adapter classifies into
//! - [`ProviderError`]: A classified failure from a single provider invocation
//! - [`MarketDataError`]: The error surfaced to callers of the coordinator
//! - [`RetryClass`]: Classification for determining retry behavior

mod retry;

pub use retry::RetryClass;

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::models::ProviderId;
use crate::provider::Operation;
use crate::registry::SkipReason;

/// Classified failure kinds returned by provider adapters.
///
/// Adapters map raw transport and HTTP failures into exactly one of these
/// kinds. The coordinator's retry and cooldown decisions are driven purely by
/// the kind, never by the message text.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProviderErrorKind {
    /// The request did not complete within the transport timeout.
    Timeout,

    /// Connection, DNS or I/O failure before a response was received.
    NetworkError,

    /// The provider throttled the request (HTTP 429 or quota exhausted).
    RateLimited {
        /// How long the provider asked us to wait, when it said so.
        retry_after: Option<Duration>,
    },

    /// Credentials were rejected (HTTP 401/403).
    AuthInvalid,

    /// Any other 4xx-style rejection of the request.
    ClientError {
        /// HTTP-equivalent status code.
        code: u16,
    },

    /// The provider is down or failing internally (HTTP 5xx).
    ServiceUnavailable,

    /// The adapter does not implement the requested operation.
    NotSupported,

    /// Anything that could not be classified (e.g. an unparseable body).
    Unknown,
}

impl ProviderErrorKind {
    /// Returns the retry classification for this kind.
    ///
    /// # Examples
    ///
    /// ```
    /// use tickerflow_market_data::errors::{ProviderErrorKind, RetryClass};
    ///
    /// assert_eq!(ProviderErrorKind::Timeout.retry_class(), RetryClass::WithBackoff);
    /// assert_eq!(ProviderErrorKind::AuthInvalid.retry_class(), RetryClass::Never);
    /// assert_eq!(
    ///     ProviderErrorKind::ClientError { code: 429 }.retry_class(),
    ///     RetryClass::AfterRetryAfter
    /// );
    /// ```
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Timeout | Self::NetworkError | Self::ServiceUnavailable => {
                RetryClass::WithBackoff
            }
            Self::RateLimited { .. } | Self::ClientError { code: 429 } => {
                RetryClass::AfterRetryAfter
            }
            Self::AuthInvalid | Self::ClientError { .. } | Self::NotSupported | Self::Unknown => {
                RetryClass::Never
            }
        }
    }

    /// Whether giving up on a provider with this kind puts it into cooldown.
    ///
    /// Rate limiting, rejected credentials and server-side failures make the
    /// provider temporarily ineligible. Timeouts, network blips and ordinary
    /// client errors do not.
    pub fn marks_temporary_failure(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::AuthInvalid | Self::ServiceUnavailable => true,
            Self::ClientError { code } => *code >= 500 || *code == 429,
            Self::Timeout | Self::NetworkError | Self::NotSupported | Self::Unknown => false,
        }
    }

    /// The provider-requested wait for rate limited responses.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Short stable label, used in logs and metrics keys.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::NetworkError => "network_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::AuthInvalid => "auth_invalid",
            Self::ClientError { .. } => "client_error",
            Self::ServiceUnavailable => "service_unavailable",
            Self::NotSupported => "not_supported",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "Timeout"),
            Self::NetworkError => write!(f, "Network error"),
            Self::RateLimited {
                retry_after: Some(wait),
            } => write!(f, "Rate limited (retry after {:?})", wait),
            Self::RateLimited { retry_after: None } => write!(f, "Rate limited"),
            Self::AuthInvalid => write!(f, "Invalid credentials"),
            Self::ClientError { code } => write!(f, "Client error {}", code),
            Self::ServiceUnavailable => write!(f, "Service unavailable"),
            Self::NotSupported => write!(f, "Not supported"),
            Self::Unknown => write!(f, "Unknown error"),
        }
    }
}

/// A classified failure from one provider invocation.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
#[error("{provider}: {kind} - {message}")]
pub struct ProviderError {
    /// The provider that failed.
    pub provider: ProviderId,
    /// Classified failure kind.
    pub kind: ProviderErrorKind,
    /// Human readable detail from the adapter.
    pub message: String,
}

impl ProviderError {
    pub fn new(
        provider: impl Into<ProviderId>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            kind,
            message: message.into(),
        }
    }

    /// Error returned by the default trait methods for operations an adapter
    /// does not implement.
    pub fn not_supported(provider: impl Into<ProviderId>, operation: Operation) -> Self {
        Self::new(
            provider,
            ProviderErrorKind::NotSupported,
            format!("{} is not supported", operation),
        )
    }

    pub fn retry_class(&self) -> RetryClass {
        self.kind.retry_class()
    }
}

/// Errors surfaced by the market data coordinator.
///
/// Provider failures never escape individually; they drive failover and are
/// collected into [`MarketDataError::AllProvidersExhausted`] when nothing is
/// left to try. Every variant is `Clone` so that coalesced callers can share a
/// single outcome.
#[derive(Error, Clone, Debug)]
pub enum MarketDataError {
    /// The request parameters failed validation (empty symbol, bad range...).
    /// Nothing was sent upstream.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No enabled provider declares the requested operation.
    #[error("No providers available for {operation}")]
    NoProvidersAvailable {
        /// The operation nobody can serve
        operation: Operation,
    },

    /// The caller's deadline elapsed before an outcome was reached.
    /// Retries and failover stop as soon as this is detected.
    #[error("Deadline exceeded after {elapsed:?}")]
    DeadlineExceeded {
        /// Time spent on the request before giving up
        elapsed: Duration,
    },

    /// Every eligible provider was tried and failed, or was skipped.
    #[error("All providers exhausted: {}", summarize_exhaustion(attempts, skipped))]
    AllProvidersExhausted {
        /// Last classified error of every provider that was invoked, in order
        attempts: Vec<ProviderError>,
        /// Providers that were passed over without an invocation
        skipped: Vec<(ProviderId, SkipReason)>,
    },

    /// A batch request in which no symbol could be fetched.
    #[error("Batch failed for every symbol: {}", errors.join("; "))]
    BatchFailed {
        /// One `"SYMBOL: message"` entry per requested symbol
        errors: Vec<String>,
    },

    /// A typed helper received a response for a different operation.
    #[error("Expected a {expected} response, got {actual}")]
    UnexpectedResponse {
        expected: Operation,
        actual: Operation,
    },

    /// The coordinator was disposed and no longer serves requests.
    #[error("Market data service has been disposed")]
    Disposed,

    /// Invalid construction-time configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl MarketDataError {
    /// The last provider error recorded before exhaustion, if any.
    pub fn last_provider_error(&self) -> Option<&ProviderError> {
        match self {
            Self::AllProvidersExhausted { attempts, .. } => attempts.last(),
            _ => None,
        }
    }

    /// Whether this error came from running out of time rather than providers.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }
}

fn summarize_exhaustion(attempts: &[ProviderError], skipped: &[(ProviderId, SkipReason)]) -> String {
    if attempts.is_empty() && skipped.is_empty() {
        return "no eligible providers".to_string();
    }

    attempts
        .iter()
        .map(|e| format!("{}: {} ({})", e.provider, e.kind, e.message))
        .chain(
            skipped
                .iter()
                .map(|(provider, reason)| format!("{}: skipped ({})", provider, reason)),
        )
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    #[test]
    fn test_transient_kinds_retry_with_backoff() {
        assert_eq!(ProviderErrorKind::Timeout.retry_class(), RetryClass::WithBackoff);
        assert_eq!(
            ProviderErrorKind::NetworkError.retry_class(),
            RetryClass::WithBackoff
        );
        assert_eq!(
            ProviderErrorKind::ServiceUnavailable.retry_class(),
            RetryClass::WithBackoff
        );
    }

    #[test]
    fn test_auth_and_client_errors_never_retry() {
        assert_eq!(ProviderErrorKind::AuthInvalid.retry_class(), RetryClass::Never);
        assert_eq!(
            ProviderErrorKind::ClientError { code: 404 }.retry_class(),
            RetryClass::Never
        );
        assert_eq!(ProviderErrorKind::NotSupported.retry_class(), RetryClass::Never);
        assert_eq!(ProviderErrorKind::Unknown.retry_class(), RetryClass::Never);
    }

    #[test]
    fn test_rate_limited_waits_for_retry_after() {
        let kind = ProviderErrorKind::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(kind.retry_class(), RetryClass::AfterRetryAfter);
        assert_eq!(kind.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(
            ProviderErrorKind::ClientError { code: 429 }.retry_class(),
            RetryClass::AfterRetryAfter
        );
    }

    #[test]
    fn test_temporary_failure_marking() {
        assert!(ProviderErrorKind::RateLimited { retry_after: None }.marks_temporary_failure());
        assert!(ProviderErrorKind::AuthInvalid.marks_temporary_failure());
        assert!(ProviderErrorKind::ServiceUnavailable.marks_temporary_failure());
        assert!(ProviderErrorKind::ClientError { code: 503 }.marks_temporary_failure());

        assert!(!ProviderErrorKind::ClientError { code: 404 }.marks_temporary_failure());
        assert!(!ProviderErrorKind::Timeout.marks_temporary_failure());
        assert!(!ProviderErrorKind::NetworkError.marks_temporary_failure());
        assert!(!ProviderErrorKind::Unknown.marks_temporary_failure());
    }

    #[test]
    fn test_error_display() {
        let error = ProviderError::new(
            Cow::Borrowed("FINNHUB"),
            ProviderErrorKind::ClientError { code: 404 },
            "unknown symbol",
        );
        assert_eq!(
            format!("{}", error),
            "FINNHUB: Client error 404 - unknown symbol"
        );

        let error = MarketDataError::InvalidRequest("symbol must not be empty".to_string());
        assert_eq!(
            format!("{}", error),
            "Invalid request: symbol must not be empty"
        );
    }

    #[test]
    fn test_exhaustion_summary_lists_every_provider() {
        let error = MarketDataError::AllProvidersExhausted {
            attempts: vec![
                ProviderError::new(
                    Cow::Borrowed("A"),
                    ProviderErrorKind::ServiceUnavailable,
                    "HTTP 503",
                ),
                ProviderError::new(Cow::Borrowed("B"), ProviderErrorKind::Timeout, "30s"),
            ],
            skipped: vec![(Cow::Borrowed("C"), SkipReason::CoolingDown)],
        };

        let text = error.to_string();
        assert!(text.contains("A: Service unavailable"));
        assert!(text.contains("B: Timeout"));
        assert!(text.contains("C: skipped"));
        assert_eq!(error.last_provider_error().map(|e| e.provider.as_ref()), Some("B"));
    }

    #[test]
    fn test_empty_exhaustion_summary() {
        let error = MarketDataError::AllProvidersExhausted {
            attempts: Vec::new(),
            skipped: Vec::new(),
        };
        assert_eq!(
            error.to_string(),
            "All providers exhausted: no eligible providers"
        );
    }
}
