//! Skip reason tracking for provider selection diagnostics.

use std::fmt;
use std::time::Duration;

use crate::errors::{MarketDataError, ProviderError};
use crate::models::ProviderId;

/// Why a provider was passed over without being invoked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Provider is in its failure cooldown.
    CoolingDown,

    /// Rate limiter denied the request.
    RateLimited { retry_after: Duration },

    /// Provider doesn't declare the requested operation.
    NotSupported,

    /// Provider is disabled in configuration.
    Disabled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CoolingDown => write!(f, "cooling down"),
            Self::RateLimited { retry_after } => {
                write!(f, "rate limited, retry after {:?}", retry_after)
            }
            Self::NotSupported => write!(f, "operation not supported"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Record of a single provider attempt during a fetch.
#[derive(Clone, Debug)]
pub struct ProviderAttempt {
    pub provider_id: ProviderId,
    pub skipped: Option<SkipReason>,
    pub error: Option<ProviderError>,
    pub success: bool,
}

/// Detailed result of a fetch operation with skip diagnostics.
#[derive(Clone, Debug, Default)]
pub struct FetchDiagnostics {
    pub attempts: Vec<ProviderAttempt>,
}

impl FetchDiagnostics {
    pub fn new() -> Self {
        Self {
            attempts: Vec::new(),
        }
    }

    pub fn record_skip(&mut self, provider_id: ProviderId, reason: SkipReason) {
        self.attempts.push(ProviderAttempt {
            provider_id,
            skipped: Some(reason),
            error: None,
            success: false,
        });
    }

    pub fn record_error(&mut self, error: ProviderError) {
        self.attempts.push(ProviderAttempt {
            provider_id: error.provider.clone(),
            skipped: None,
            error: Some(error),
            success: false,
        });
    }

    pub fn record_success(&mut self, provider_id: ProviderId) {
        self.attempts.push(ProviderAttempt {
            provider_id,
            skipped: None,
            error: None,
            success: true,
        });
    }

    /// Summary for logging/debugging.
    pub fn summary(&self) -> String {
        self.attempts
            .iter()
            .map(|a| {
                if a.success {
                    format!("{}: SUCCESS", a.provider_id)
                } else if let Some(skip) = &a.skipped {
                    format!("{}: SKIPPED ({})", a.provider_id, skip)
                } else if let Some(err) = &a.error {
                    format!("{}: ERROR ({} - {})", a.provider_id, err.kind, err.message)
                } else {
                    format!("{}: UNKNOWN", a.provider_id)
                }
            })
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// Check if any provider succeeded.
    pub fn has_success(&self) -> bool {
        self.attempts.iter().any(|a| a.success)
    }

    /// Get all skip reasons.
    pub fn skip_reasons(&self) -> Vec<(&ProviderId, &SkipReason)> {
        self.attempts
            .iter()
            .filter_map(|a| a.skipped.as_ref().map(|s| (&a.provider_id, s)))
            .collect()
    }

    /// Get all errors.
    pub fn errors(&self) -> Vec<&ProviderError> {
        self.attempts.iter().filter_map(|a| a.error.as_ref()).collect()
    }

    /// Convert into the caller-facing exhaustion error.
    pub fn into_exhausted(self) -> MarketDataError {
        let mut attempts = Vec::new();
        let mut skipped = Vec::new();

        for attempt in self.attempts {
            if let Some(error) = attempt.error {
                attempts.push(error);
            } else if let Some(reason) = attempt.skipped {
                skipped.push((attempt.provider_id, reason));
            }
        }

        MarketDataError::AllProvidersExhausted { attempts, skipped }
    }
}
