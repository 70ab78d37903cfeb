//! Tickerflow Market Data Crate
//!
//! This crate provides resilient, provider-agnostic market data access on
//! top of any number of upstream data vendors.
//!
//! # Overview
//!
//! The market data crate supports:
//! - Quotes, historical series, symbol search, batch quotes and company overviews
//! - Multiple providers behind one [`MarketDataProvider`] trait
//! - Priority, round robin, fastest and most reliable failover strategies
//! - Per-provider rate limiting, retry with backoff and failure cooldowns
//! - An integrity-checked, size-bounded response cache
//! - Periodic health probing and rolling performance metrics
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |     Caller       |  (DataRequest + RequestOptions)
//! +------------------+
//!          |
//!          v
//! +---------------------+     +------------------+
//! | FailoverCoordinator | <-> |   CacheStore     |  (per-provider namespaces)
//! +---------------------+     +------------------+
//!          |
//!          |  ordering, cooldowns, rate limits, retries
//!          v
//! +------------------+
//! |    Provider      |  (Finnhub, ...)
//! +------------------+
//!          |
//!          v
//! +------------------+
//! |  HttpTransport   |  (reqwest)
//! +------------------+
//! ```
//!
//! A [`HealthMonitor`] runs beside the coordinator and probes every enabled
//! provider on a fixed interval. It never serves requests.
//!
//! # Core Types
//!
//! - [`FailoverCoordinator`] - Single entry point for data requests
//! - [`DataRequest`] / [`DataResponse`] - Request descriptor and response envelope
//! - [`RequestOptions`] - Per-call provider override, deadline and stale policy
//! - [`MarketDataConfig`] - Construction-time configuration
//! - [`MarketDataError`] / [`ProviderError`] - Caller-facing and adapter-level errors
//!
//! # Type Aliases
//!
//! - [`ProviderId`] - Provider identifier (e.g., "FINNHUB")
//! - [`Currency`] - Currency code (ISO 4217)

pub mod cache;
pub mod clock;
pub mod config;
pub mod errors;
pub mod models;
pub mod provider;
pub mod registry;

// Re-export all public types from models
pub use models::{
    BatchQuotes, CompanyOverview, Currency, DataRequest, DataResponse, HistoricalPoint, Interval,
    ProviderId, Quote, Range, RequestOptions, SearchResult,
};

pub use cache::{CacheError, CacheLookup, CacheStats, CacheStore, EntryCodec, IdentityCodec};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheTtls, ConfigError, FailoverStrategy, MarketDataConfig, ProviderSettings};
pub use errors::{MarketDataError, ProviderError, ProviderErrorKind, RetryClass};

// Re-export provider types
pub use provider::finnhub::FinnhubProvider;
pub use provider::{MarketDataProvider, Operation, ProviderCapabilities, RateLimit};

// Re-export registry types
pub use registry::{
    FailoverCoordinator, FetchDiagnostics, HealthMonitor, HealthStatus, PerformanceMetrics,
    ProviderAttempt, ProviderHealth, ProviderStatus, RateLimiter, RetryPolicy, SkipReason,
};
