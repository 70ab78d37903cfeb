//! Market data provider trait definitions.
//!
//! This module defines the core `MarketDataProvider` trait that all
//! market data providers must implement.

use async_trait::async_trait;

use crate::errors::ProviderError;
use crate::models::{CompanyOverview, HistoricalPoint, Interval, Quote, Range, SearchResult};

use super::capabilities::{Operation, ProviderCapabilities, RateLimit};

/// Symbol used by the default health probe.
pub const DEFAULT_PROBE_SYMBOL: &str = "AAPL";

/// Trait for market data providers.
///
/// Implement this trait to add support for a new market data source.
/// Adapters only perform network I/O and classify failures into
/// [`ProviderErrorKind`](crate::errors::ProviderErrorKind); retrying, caching
/// and rate limiting belong to the coordinator.
///
/// Operations the provider does not declare in [`capabilities`](Self::capabilities)
/// are never called. Their default implementations return `NotSupported`.
///
/// # Example
///
/// ```ignore
/// use async_trait::async_trait;
/// use tickerflow_market_data::provider::{MarketDataProvider, Operation, ProviderCapabilities, RateLimit};
///
/// struct MyProvider {
///     api_key: String,
/// }
///
/// #[async_trait]
/// impl MarketDataProvider for MyProvider {
///     fn id(&self) -> &'static str {
///         "MY_PROVIDER"
///     }
///
///     fn capabilities(&self) -> ProviderCapabilities {
///         ProviderCapabilities::from_operations(&[Operation::Quote])
///     }
///
///     fn rate_limit(&self) -> RateLimit {
///         RateLimit::per_minute(30)
///     }
///
///     async fn get_quote(&self, symbol: &str) -> Result<Quote, ProviderError> {
///         // ... call the API
///     }
/// }
/// ```
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Unique identifier for this provider.
    ///
    /// Should be a constant string like "FINNHUB". Used for logging, cache
    /// namespacing, rate limiting and failover bookkeeping.
    fn id(&self) -> &'static str;

    /// Describes what this provider can do.
    fn capabilities(&self) -> ProviderCapabilities;

    /// Rate limiting configuration.
    ///
    /// Returns the quota that should be enforced when calling this provider.
    fn rate_limit(&self) -> RateLimit {
        RateLimit::default()
    }

    /// Quota left in the current window as reported by the upstream on its
    /// most recent response. `None` when the upstream does not report one.
    ///
    /// The coordinator reads this after every invocation and lets it lower,
    /// never raise, the locally tracked quota.
    fn reported_remaining(&self) -> Option<u32> {
        None
    }

    /// Fetch the latest quote for a symbol.
    async fn get_quote(&self, symbol: &str) -> Result<Quote, ProviderError> {
        let _ = symbol;
        Err(ProviderError::not_supported(self.id(), Operation::Quote))
    }

    /// Fetch a historical series, ordered by timestamp ascending.
    async fn get_historical(
        &self,
        symbol: &str,
        interval: Interval,
        range: Range,
    ) -> Result<Vec<HistoricalPoint>, ProviderError> {
        let _ = (symbol, interval, range);
        Err(ProviderError::not_supported(
            self.id(),
            Operation::HistoricalData,
        ))
    }

    /// Search for symbols matching the query.
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, ProviderError> {
        let _ = query;
        Err(ProviderError::not_supported(self.id(), Operation::Search))
    }

    /// Fetch quotes for many symbols in one upstream call.
    async fn get_batch_quotes(&self, symbols: &[String]) -> Result<Vec<Quote>, ProviderError> {
        let _ = symbols;
        Err(ProviderError::not_supported(self.id(), Operation::BatchQuotes))
    }

    /// Fetch company overview information.
    async fn get_company_overview(&self, symbol: &str) -> Result<CompanyOverview, ProviderError> {
        let _ = symbol;
        Err(ProviderError::not_supported(
            self.id(),
            Operation::CompanyOverview,
        ))
    }

    /// Lightweight liveness probe used by the health monitor.
    ///
    /// The default fetches a quote for [`DEFAULT_PROBE_SYMBOL`] when quotes are
    /// supported and otherwise runs a one-letter search.
    async fn probe(&self) -> Result<(), ProviderError> {
        if self.capabilities().supports_quote {
            self.get_quote(DEFAULT_PROBE_SYMBOL).await.map(|_| ())
        } else {
            self.search("a").await.map(|_| ())
        }
    }
}
