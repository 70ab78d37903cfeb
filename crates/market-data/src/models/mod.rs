//! Market data models
//!
//! This module contains the core data types for market data operations:
//! - `types` - Type aliases for common identifiers (ProviderId, Currency)
//! - `quote` - Normalized quote and historical bar records
//! - `search` - Search result data (SearchResult)
//! - `profile` - Company overview data (CompanyOverview)
//! - `request` - Request descriptors, per-call options and response envelopes

mod profile;
mod quote;
mod request;
mod search;
mod types;

pub use profile::CompanyOverview;
pub use quote::{HistoricalPoint, Quote};
pub use request::{BatchQuotes, DataRequest, DataResponse, Interval, Range, RequestOptions};
pub use search::SearchResult;
pub use types::{Currency, ProviderId};
