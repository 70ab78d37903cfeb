//! Finnhub market data provider implementation.
//!
//! This module provides market data from Finnhub API:
//! - Equities via /quote and /stock/candle endpoints
//! - Symbol search via /search endpoint
//! - Company profiles via /stock/profile2 endpoint
//!
//! Finnhub free tier is limited to 60 API calls per minute.
//! API documentation: https://finnhub.io/docs/api

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::errors::{ProviderError, ProviderErrorKind};
use crate::models::{CompanyOverview, HistoricalPoint, Interval, Quote, Range, SearchResult};
use crate::provider::transport::{
    classify_status, classify_transport_error, truncate, HttpTransport, ReqwestTransport,
    TransportRequest,
};
use crate::provider::{MarketDataProvider, Operation, ProviderCapabilities, RateLimit};

const BASE_URL: &str = "https://finnhub.io/api/v1";
const PROVIDER_ID: &str = "FINNHUB";

// ============================================================================
// API Response Structures
// ============================================================================

/// Response from /quote endpoint
#[derive(Debug, Deserialize)]
struct QuoteResponse {
    /// Current price
    c: Option<f64>,
    /// High price of the day
    h: Option<f64>,
    /// Low price of the day
    l: Option<f64>,
    /// Open price of the day
    o: Option<f64>,
    /// Previous close
    pc: Option<f64>,
    /// Timestamp (Unix)
    t: Option<i64>,
}

/// Response from /stock/candle endpoint
#[derive(Debug, Deserialize)]
struct CandleResponse {
    /// Status: "ok" or "no_data"
    s: String,
    #[serde(default)]
    c: Vec<f64>,
    #[serde(default)]
    h: Vec<f64>,
    #[serde(default)]
    l: Vec<f64>,
    #[serde(default)]
    o: Vec<f64>,
    #[serde(default)]
    v: Vec<f64>,
    /// Timestamps (Unix)
    #[serde(default)]
    t: Vec<i64>,
}

/// Response from /search endpoint
#[derive(Debug, Deserialize)]
struct SearchResponse {
    result: Vec<SearchItem>,
}

/// Individual search result item
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItem {
    /// Full description/name
    description: String,
    /// Display symbol
    display_symbol: String,
    /// Symbol for API calls
    symbol: String,
    /// Security type (e.g., "Common Stock", "ETF")
    #[serde(rename = "type")]
    security_type: String,
}

/// Response from /stock/profile2 endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    name: Option<String>,
    ticker: Option<String>,
    #[serde(default)]
    description: Option<String>,
    /// Finnhub industry classification
    finnhub_industry: Option<String>,
    country: Option<String>,
    weburl: Option<String>,
    logo: Option<String>,
    /// Market capitalization (in millions)
    market_capitalization: Option<f64>,
    employee_total: Option<i64>,
}

/// Error response from Finnhub
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: Option<String>,
}

// ============================================================================
// FinnhubProvider
// ============================================================================

/// Finnhub market data provider.
///
/// Supports quotes, daily and intraday candles, search and company profiles.
/// Free tier is limited to 60 API calls per minute.
pub struct FinnhubProvider {
    transport: Arc<dyn HttpTransport>,
    api_key: String,
    /// Last `X-Ratelimit-Remaining` value seen
    remaining: Mutex<Option<u32>>,
}

impl FinnhubProvider {
    /// Create a new Finnhub provider with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_transport(Arc::new(ReqwestTransport::new()), api_key)
    }

    /// Create a provider on top of a custom transport.
    pub fn with_transport(transport: Arc<dyn HttpTransport>, api_key: impl Into<String>) -> Self {
        Self {
            transport,
            api_key: api_key.into(),
            remaining: Mutex::new(None),
        }
    }

    /// Make a GET request to the Finnhub API.
    async fn fetch(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<String, ProviderError> {
        let url = format!("{}{}", BASE_URL, endpoint);

        // Add API key as header (more secure than query param)
        let mut request = TransportRequest::get(url).header("X-Finnhub-Token", &self.api_key);
        for (key, value) in params {
            request = request.query(key, *value);
        }

        debug!(
            "Finnhub request: {} with {} params",
            endpoint,
            params.len()
        );

        let response = self.transport.get(request).await.map_err(|e| {
            ProviderError::new(
                PROVIDER_ID,
                classify_transport_error(&e),
                format!("Request failed: {}", e),
            )
        })?;

        if let Some(remaining) = response.rate_limit_remaining {
            if let Ok(mut slot) = self.remaining.lock() {
                *slot = Some(remaining);
            }
        }

        if let Some(kind) = classify_status(response.status, response.retry_after) {
            // Try to parse error message
            let message = serde_json::from_str::<ErrorResponse>(&response.body)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or_else(|| {
                    format!(
                        "HTTP {} - {}",
                        response.status,
                        truncate(&response.body, 200)
                    )
                });

            return Err(ProviderError::new(PROVIDER_ID, kind, message));
        }

        Ok(response.body)
    }

    fn parse<T: for<'de> Deserialize<'de>>(text: &str, what: &str) -> Result<T, ProviderError> {
        serde_json::from_str(text).map_err(|e| {
            ProviderError::new(
                PROVIDER_ID,
                ProviderErrorKind::Unknown,
                format!("Failed to parse {} response: {}", what, e),
            )
        })
    }

    /// Fetch latest quote from /quote endpoint.
    async fn fetch_latest_quote(&self, symbol: &str) -> Result<Quote, ProviderError> {
        let text = self.fetch("/quote", &[("symbol", symbol)]).await?;
        let response: QuoteResponse = Self::parse(&text, "quote")?;

        let close = response.c.unwrap_or(0.0);

        // Finnhub returns 0 for unknown symbols instead of an error
        if close == 0.0 && response.o.unwrap_or(0.0) == 0.0 {
            return Err(symbol_not_found(symbol));
        }

        let timestamp = response
            .t
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .unwrap_or_else(Utc::now);

        let price = Decimal::try_from(close).map_err(|_| {
            ProviderError::new(
                PROVIDER_ID,
                ProviderErrorKind::Unknown,
                format!("Invalid close price: {}", close),
            )
        })?;

        let mut quote = Quote::new(symbol, price, timestamp, "USD", PROVIDER_ID);
        quote.open = response.o.and_then(|v| Decimal::try_from(v).ok());
        quote.high = response.h.and_then(|v| Decimal::try_from(v).ok());
        quote.low = response.l.and_then(|v| Decimal::try_from(v).ok());
        quote.previous_close = response.pc.and_then(|v| Decimal::try_from(v).ok());
        // /quote endpoint doesn't provide volume

        Ok(quote)
    }

    /// Fetch a candle series from /stock/candle endpoint.
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoricalPoint>, ProviderError> {
        let from_ts = start.timestamp().to_string();
        let to_ts = end.timestamp().to_string();

        let params = [
            ("symbol", symbol),
            ("resolution", resolution(interval)),
            ("from", from_ts.as_str()),
            ("to", to_ts.as_str()),
        ];

        let text = self.fetch("/stock/candle", &params).await?;
        let response: CandleResponse = Self::parse(&text, "candle")?;

        if response.s == "no_data" {
            return Err(no_data(symbol));
        }

        if response.s != "ok" {
            return Err(ProviderError::new(
                PROVIDER_ID,
                ProviderErrorKind::Unknown,
                format!("Unexpected candle status: {}", response.s),
            ));
        }

        // Validate array lengths match
        let len = response.t.len();
        if response.c.len() != len
            || response.o.len() != len
            || response.h.len() != len
            || response.l.len() != len
        {
            return Err(ProviderError::new(
                PROVIDER_ID,
                ProviderErrorKind::Unknown,
                "Mismatched array lengths in candle response",
            ));
        }

        let mut points = Vec::with_capacity(len);

        for i in 0..len {
            let timestamp = match Utc.timestamp_opt(response.t[i], 0).single() {
                Some(ts) => ts,
                None => {
                    warn!("Invalid timestamp at index {}: {}", i, response.t[i]);
                    continue;
                }
            };

            let prices = (
                Decimal::try_from(response.o[i]),
                Decimal::try_from(response.h[i]),
                Decimal::try_from(response.l[i]),
                Decimal::try_from(response.c[i]),
            );
            let (open, high, low, close) = match prices {
                (Ok(o), Ok(h), Ok(l), Ok(c)) => (o, h, l, c),
                _ => {
                    warn!("Invalid prices at index {} for {}", i, symbol);
                    continue;
                }
            };

            points.push(HistoricalPoint {
                timestamp,
                open,
                high,
                low,
                close,
                volume: response.v.get(i).and_then(|&v| Decimal::try_from(v).ok()),
            });
        }

        if points.is_empty() {
            return Err(no_data(symbol));
        }

        // Sort by timestamp ascending
        points.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        debug!(
            "Finnhub: fetched {} candles for {} ({} to {})",
            points.len(),
            symbol,
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        );

        Ok(points)
    }

    /// Fetch company profile from /stock/profile2 endpoint.
    async fn fetch_profile(&self, symbol: &str) -> Result<CompanyOverview, ProviderError> {
        let text = self.fetch("/stock/profile2", &[("symbol", symbol)]).await?;

        // Check for empty response (symbol not found)
        if text.trim() == "{}" {
            return Err(symbol_not_found(symbol));
        }

        let response: ProfileResponse = Self::parse(&text, "profile")?;

        if response.name.is_none() && response.ticker.is_none() {
            return Err(symbol_not_found(symbol));
        }

        let mut overview = CompanyOverview::new(symbol);
        overview.source = Some(PROVIDER_ID.to_string());
        overview.name = response.name;
        overview.description = response.description;
        overview.sector = response.finnhub_industry.clone();
        overview.industry = response.finnhub_industry;
        overview.country = response.country;
        overview.website = response.weburl;
        overview.logo_url = response.logo;
        // Finnhub returns market cap in millions
        overview.market_cap = response.market_capitalization.map(|mc| mc * 1_000_000.0);
        overview.employees = response
            .employee_total
            .and_then(|e| u64::try_from(e).ok());

        Ok(overview)
    }

    /// Search for symbols.
    async fn search_symbols(&self, query: &str) -> Result<Vec<SearchResult>, ProviderError> {
        let text = self.fetch("/search", &[("q", query)]).await?;
        let response: SearchResponse = Self::parse(&text, "search")?;

        let results: Vec<SearchResult> = response
            .result
            .into_iter()
            .map(|item| {
                SearchResult::new(
                    item.symbol,
                    item.description,
                    item.display_symbol, // Use display_symbol as exchange hint
                    map_security_type(&item.security_type),
                )
            })
            .collect();

        debug!("Finnhub: found {} search results for '{}'", results.len(), query);

        Ok(results)
    }
}

// ============================================================================
// MarketDataProvider Implementation
// ============================================================================

#[async_trait]
impl MarketDataProvider for FinnhubProvider {
    fn id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::from_operations(&[
            Operation::Quote,
            Operation::HistoricalData,
            Operation::Search,
            Operation::CompanyOverview,
        ])
    }

    fn rate_limit(&self) -> RateLimit {
        // Free tier limit
        RateLimit::per_minute(60)
    }

    fn reported_remaining(&self) -> Option<u32> {
        self.remaining.lock().ok().and_then(|slot| *slot)
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, ProviderError> {
        debug!("Fetching latest quote for {} from Finnhub", symbol);
        self.fetch_latest_quote(symbol).await
    }

    async fn get_historical(
        &self,
        symbol: &str,
        interval: Interval,
        range: Range,
    ) -> Result<Vec<HistoricalPoint>, ProviderError> {
        let end = Utc::now();
        let start = match range.days() {
            Some(days) => end - chrono::Duration::days(days as i64),
            None => DateTime::<Utc>::UNIX_EPOCH,
        };

        debug!(
            "Fetching {} candles for {} over {} from Finnhub",
            interval.as_str(),
            symbol,
            range.as_str()
        );

        self.fetch_candles(symbol, interval, start, end).await
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, ProviderError> {
        debug!("Searching Finnhub for '{}'", query);
        self.search_symbols(query).await
    }

    async fn get_company_overview(&self, symbol: &str) -> Result<CompanyOverview, ProviderError> {
        debug!("Fetching profile for {} from Finnhub", symbol);
        self.fetch_profile(symbol).await
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Finnhub candle resolution for an interval.
fn resolution(interval: Interval) -> &'static str {
    match interval {
        Interval::OneMinute => "1",
        Interval::FiveMinutes => "5",
        Interval::FifteenMinutes => "15",
        Interval::ThirtyMinutes => "30",
        Interval::OneHour => "60",
        Interval::OneDay => "D",
        Interval::OneWeek => "W",
        Interval::OneMonth => "M",
    }
}

fn symbol_not_found(symbol: &str) -> ProviderError {
    ProviderError::new(
        PROVIDER_ID,
        ProviderErrorKind::ClientError { code: 404 },
        format!("Symbol not found or no trading data: {}", symbol),
    )
}

fn no_data(symbol: &str) -> ProviderError {
    ProviderError::new(
        PROVIDER_ID,
        ProviderErrorKind::ClientError { code: 404 },
        format!("No data for requested range: {}", symbol),
    )
}

/// Map Finnhub security type to our asset type.
fn map_security_type(finnhub_type: &str) -> String {
    match finnhub_type.to_lowercase().as_str() {
        "common stock" | "stock" => "Stock".to_string(),
        "etf" | "etp" => "ETF".to_string(),
        "mutual fund" | "fund" => "Mutual Fund".to_string(),
        "adr" | "american depositary receipt" => "ADR".to_string(),
        "reit" => "REIT".to_string(),
        "warrant" => "Warrant".to_string(),
        "preferred stock" | "preferred" => "Preferred Stock".to_string(),
        "unit" => "Unit".to_string(),
        "closed-end fund" => "Closed-End Fund".to_string(),
        _ => finnhub_type.to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================
