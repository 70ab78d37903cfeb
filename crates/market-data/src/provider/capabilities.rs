//! Provider capabilities and rate limiting configuration.
//!
//! This module defines structures for describing what a market data provider
//! can do and how it should be rate-limited.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Data operations a provider may implement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Quote,
    HistoricalData,
    Search,
    BatchQuotes,
    CompanyOverview,
}

impl Operation {
    pub const ALL: [Operation; 5] = [
        Operation::Quote,
        Operation::HistoricalData,
        Operation::Search,
        Operation::BatchQuotes,
        Operation::CompanyOverview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quote => "quote",
            Self::HistoricalData => "historical_data",
            Self::Search => "search",
            Self::BatchQuotes => "batch_quotes",
            Self::CompanyOverview => "company_overview",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Describes the capabilities of a market data provider.
///
/// Read once when the provider is registered; the coordinator never probes an
/// adapter at call time to find out what it can do.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    /// Whether the provider supports real-time quotes.
    pub supports_quote: bool,

    /// Whether the provider supports historical series.
    pub supports_historical: bool,

    /// Whether the provider supports symbol search.
    pub supports_search: bool,

    /// Whether the provider can fetch many quotes in one upstream call.
    pub supports_batch_quotes: bool,

    /// Whether the provider serves company overviews.
    pub supports_company_overview: bool,
}

impl ProviderCapabilities {
    /// Capabilities for a provider implementing every operation.
    pub fn all() -> Self {
        Self {
            supports_quote: true,
            supports_historical: true,
            supports_search: true,
            supports_batch_quotes: true,
            supports_company_overview: true,
        }
    }

    /// Build from an explicit operation list.
    pub fn from_operations(operations: &[Operation]) -> Self {
        let mut caps = Self::default();
        for op in operations {
            match op {
                Operation::Quote => caps.supports_quote = true,
                Operation::HistoricalData => caps.supports_historical = true,
                Operation::Search => caps.supports_search = true,
                Operation::BatchQuotes => caps.supports_batch_quotes = true,
                Operation::CompanyOverview => caps.supports_company_overview = true,
            }
        }
        caps
    }

    pub fn supports(&self, operation: Operation) -> bool {
        match operation {
            Operation::Quote => self.supports_quote,
            Operation::HistoricalData => self.supports_historical,
            Operation::Search => self.supports_search,
            Operation::BatchQuotes => self.supports_batch_quotes,
            Operation::CompanyOverview => self.supports_company_overview,
        }
    }

    /// Supported operations in declaration order.
    pub fn operations(&self) -> Vec<Operation> {
        Operation::ALL
            .into_iter()
            .filter(|op| self.supports(*op))
            .collect()
    }
}

/// Rate limiting configuration for a provider.
///
/// Controls how aggressively we can call a provider to avoid
/// hitting their rate limits and getting blocked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimit {
    /// Maximum requests allowed per window.
    pub requests: u32,

    /// Length of the quota window.
    pub window: Duration,
}

impl RateLimit {
    pub fn per_minute(requests: u32) -> Self {
        Self {
            requests,
            window: Duration::from_secs(60),
        }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::per_minute(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_operations() {
        let caps = ProviderCapabilities::from_operations(&[Operation::Quote, Operation::Search]);
        assert!(caps.supports(Operation::Quote));
        assert!(caps.supports(Operation::Search));
        assert!(!caps.supports(Operation::BatchQuotes));
        assert_eq!(caps.operations(), vec![Operation::Quote, Operation::Search]);
    }

    #[test]
    fn test_all_capabilities() {
        let caps = ProviderCapabilities::all();
        assert!(Operation::ALL.iter().all(|op| caps.supports(*op)));
    }
}
