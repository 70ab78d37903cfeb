//! Market data provider abstractions and implementations.
//!
//! This module contains:
//! - The `MarketDataProvider` trait that all providers implement
//! - Provider capabilities and rate limiting configuration
//! - The HTTP transport seam adapters are built on
//! - The Finnhub reference adapter
//!
//! # Architecture
//!
//! The provider system is designed to be:
//! - **Provider-agnostic**: The coordinator doesn't know about specific providers
//! - **Extensible**: New providers can be added by implementing `MarketDataProvider`
//! - **Thin**: Adapters only do I/O and classify failures; retries, caching,
//!   rate limiting and failover live in the registry module

mod capabilities;
mod traits;

pub mod finnhub;
pub mod transport;

// Re-exports
pub use capabilities::{Operation, ProviderCapabilities, RateLimit};
pub use traits::{MarketDataProvider, DEFAULT_PROBE_SYMBOL};
pub use transport::{
    classify_status, classify_transport_error, HttpTransport, ReqwestTransport, TransportError,
    TransportRequest, TransportResponse,
};
