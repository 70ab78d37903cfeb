//! Request descriptors and response envelopes for the coordinator.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::profile::CompanyOverview;
use super::quote::{HistoricalPoint, Quote};
use super::search::SearchResult;
use super::types::ProviderId;
use crate::errors::MarketDataError;
use crate::provider::Operation;

/// Bar interval for historical series.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "1wk")]
    OneWeek,
    #[serde(rename = "1mo")]
    OneMonth,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::OneDay => "1d",
            Self::OneWeek => "1wk",
            Self::OneMonth => "1mo",
        }
    }

    /// Bar length in minutes (months approximated as 30 days).
    pub fn minutes(&self) -> u64 {
        match self {
            Self::OneMinute => 1,
            Self::FiveMinutes => 5,
            Self::FifteenMinutes => 15,
            Self::ThirtyMinutes => 30,
            Self::OneHour => 60,
            Self::OneDay => 24 * 60,
            Self::OneWeek => 7 * 24 * 60,
            Self::OneMonth => 30 * 24 * 60,
        }
    }

    pub fn is_intraday(&self) -> bool {
        self.minutes() < 24 * 60
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = MarketDataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1m" => Ok(Self::OneMinute),
            "5m" => Ok(Self::FiveMinutes),
            "15m" => Ok(Self::FifteenMinutes),
            "30m" => Ok(Self::ThirtyMinutes),
            "1h" | "60m" => Ok(Self::OneHour),
            "1d" => Ok(Self::OneDay),
            "1wk" | "1w" => Ok(Self::OneWeek),
            "1mo" => Ok(Self::OneMonth),
            other => Err(MarketDataError::InvalidRequest(format!(
                "unknown interval '{}'",
                other
            ))),
        }
    }
}

/// Lookback window for historical series.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Range {
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "5d")]
    FiveDays,
    #[serde(rename = "1mo")]
    OneMonth,
    #[serde(rename = "3mo")]
    ThreeMonths,
    #[serde(rename = "6mo")]
    SixMonths,
    #[serde(rename = "1y")]
    OneYear,
    #[serde(rename = "2y")]
    TwoYears,
    #[serde(rename = "5y")]
    FiveYears,
    #[serde(rename = "max")]
    Max,
}

impl Range {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneDay => "1d",
            Self::FiveDays => "5d",
            Self::OneMonth => "1mo",
            Self::ThreeMonths => "3mo",
            Self::SixMonths => "6mo",
            Self::OneYear => "1y",
            Self::TwoYears => "2y",
            Self::FiveYears => "5y",
            Self::Max => "max",
        }
    }

    /// Approximate length in days. `Max` is open ended.
    pub fn days(&self) -> Option<u64> {
        match self {
            Self::OneDay => Some(1),
            Self::FiveDays => Some(5),
            Self::OneMonth => Some(30),
            Self::ThreeMonths => Some(90),
            Self::SixMonths => Some(180),
            Self::OneYear => Some(365),
            Self::TwoYears => Some(730),
            Self::FiveYears => Some(1825),
            Self::Max => None,
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Range {
    type Err = MarketDataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1d" => Ok(Self::OneDay),
            "5d" => Ok(Self::FiveDays),
            "1mo" => Ok(Self::OneMonth),
            "3mo" => Ok(Self::ThreeMonths),
            "6mo" => Ok(Self::SixMonths),
            "1y" => Ok(Self::OneYear),
            "2y" => Ok(Self::TwoYears),
            "5y" => Ok(Self::FiveYears),
            "max" => Ok(Self::Max),
            other => Err(MarketDataError::InvalidRequest(format!(
                "unknown range '{}'",
                other
            ))),
        }
    }
}

/// Longest range intraday bars may be requested for.
const MAX_INTRADAY_RANGE_DAYS: u64 = 30;

/// What the caller wants fetched.
///
/// Symbols are normalized (trimmed, upper-cased) by the constructors; search
/// queries are trimmed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DataRequest {
    Quote {
        symbol: String,
    },
    HistoricalData {
        symbol: String,
        interval: Interval,
        range: Range,
    },
    Search {
        query: String,
    },
    BatchQuotes {
        symbols: Vec<String>,
    },
    CompanyOverview {
        symbol: String,
    },
}

fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

impl DataRequest {
    pub fn quote(symbol: &str) -> Self {
        Self::Quote {
            symbol: normalize_symbol(symbol),
        }
    }

    pub fn historical(symbol: &str, interval: Interval, range: Range) -> Self {
        Self::HistoricalData {
            symbol: normalize_symbol(symbol),
            interval,
            range,
        }
    }

    pub fn search(query: &str) -> Self {
        Self::Search {
            query: query.trim().to_string(),
        }
    }

    pub fn batch_quotes<S: AsRef<str>>(symbols: &[S]) -> Self {
        Self::BatchQuotes {
            symbols: symbols.iter().map(|s| normalize_symbol(s.as_ref())).collect(),
        }
    }

    pub fn company_overview(symbol: &str) -> Self {
        Self::CompanyOverview {
            symbol: normalize_symbol(symbol),
        }
    }

    /// The capability a provider must declare to serve this request.
    pub fn operation(&self) -> Operation {
        match self {
            Self::Quote { .. } => Operation::Quote,
            Self::HistoricalData { .. } => Operation::HistoricalData,
            Self::Search { .. } => Operation::Search,
            Self::BatchQuotes { .. } => Operation::BatchQuotes,
            Self::CompanyOverview { .. } => Operation::CompanyOverview,
        }
    }

    /// Validate parameters before anything is sent upstream.
    pub fn validate(&self) -> Result<(), MarketDataError> {
        match self {
            Self::Quote { symbol } | Self::CompanyOverview { symbol } => validate_symbol(symbol),
            Self::HistoricalData {
                symbol,
                interval,
                range,
            } => {
                validate_symbol(symbol)?;
                validate_interval_range(*interval, *range)
            }
            Self::Search { query } => {
                if query.trim().is_empty() {
                    return Err(MarketDataError::InvalidRequest(
                        "search query must not be empty".to_string(),
                    ));
                }
                Ok(())
            }
            Self::BatchQuotes { symbols } => {
                if symbols.is_empty() {
                    return Err(MarketDataError::InvalidRequest(
                        "batch request must contain at least one symbol".to_string(),
                    ));
                }
                symbols.iter().try_for_each(|s| validate_symbol(s))
            }
        }
    }

    /// Provider-agnostic cache key, e.g. `quote:AAPL` or `historical:AAPL:1d:1y`.
    pub fn cache_key(&self) -> String {
        match self {
            Self::Quote { symbol } => format!("quote:{}", symbol),
            Self::HistoricalData {
                symbol,
                interval,
                range,
            } => format!("historical:{}:{}:{}", symbol, interval, range),
            Self::Search { query } => format!("search:{}", query.to_lowercase()),
            Self::BatchQuotes { symbols } => format!("batch:{}", symbols.join(",")),
            Self::CompanyOverview { symbol } => format!("overview:{}", symbol),
        }
    }
}

fn validate_symbol(symbol: &str) -> Result<(), MarketDataError> {
    if symbol.trim().is_empty() {
        return Err(MarketDataError::InvalidRequest(
            "symbol must not be empty".to_string(),
        ));
    }
    if symbol.chars().any(char::is_whitespace) {
        return Err(MarketDataError::InvalidRequest(format!(
            "symbol '{}' must not contain whitespace",
            symbol
        )));
    }
    Ok(())
}

fn validate_interval_range(interval: Interval, range: Range) -> Result<(), MarketDataError> {
    match range.days() {
        Some(days) if interval.is_intraday() && days > MAX_INTRADAY_RANGE_DAYS => {
            Err(MarketDataError::InvalidRequest(format!(
                "intraday interval {} is only available for ranges up to 1mo (got {})",
                interval, range
            )))
        }
        Some(days) if interval.minutes() > days * 24 * 60 => {
            Err(MarketDataError::InvalidRequest(format!(
                "interval {} is longer than range {}",
                interval, range
            )))
        }
        None if interval.is_intraday() => Err(MarketDataError::InvalidRequest(format!(
            "intraday interval {} is not available for range max",
            interval
        ))),
        _ => Ok(()),
    }
}

/// Per-call options.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    /// Provider to try first (ignored by the round robin strategy)
    pub preferred_provider: Option<ProviderId>,

    /// Total time budget for the call, retries and failover included
    pub deadline: Option<Duration>,

    /// Serve a stale (expired but intact) cache entry when every provider fails
    pub allow_stale: bool,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: impl Into<ProviderId>) -> Self {
        self.preferred_provider = Some(provider.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn allow_stale(mut self) -> Self {
        self.allow_stale = true;
        self
    }
}

/// Result of a batch quote request.
///
/// Partial success is normal: symbols that could not be fetched are listed in
/// `errors` as `"SYMBOL: message"`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchQuotes {
    pub data: Vec<Quote>,
    pub errors: Vec<String>,
}

/// Normalized response envelope, one variant per operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum DataResponse {
    Quote(Quote),
    HistoricalData(Vec<HistoricalPoint>),
    Search(Vec<SearchResult>),
    BatchQuotes(BatchQuotes),
    CompanyOverview(CompanyOverview),
}

impl DataResponse {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Quote(_) => Operation::Quote,
            Self::HistoricalData(_) => Operation::HistoricalData,
            Self::Search(_) => Operation::Search,
            Self::BatchQuotes(_) => Operation::BatchQuotes,
            Self::CompanyOverview(_) => Operation::CompanyOverview,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbols_are_normalized() {
        assert_eq!(
            DataRequest::quote(" aapl "),
            DataRequest::Quote {
                symbol: "AAPL".to_string()
            }
        );
        assert_eq!(DataRequest::quote("msft").cache_key(), "quote:MSFT");
    }

    #[test]
    fn test_empty_symbol_is_rejected() {
        let err = DataRequest::quote("   ").validate().unwrap_err();
        assert!(matches!(err, MarketDataError::InvalidRequest(_)));

        let err = DataRequest::batch_quotes(&["AAPL", ""]).validate().unwrap_err();
        assert!(matches!(err, MarketDataError::InvalidRequest(_)));

        let empty: [&str; 0] = [];
        assert!(DataRequest::batch_quotes(&empty).validate().is_err());
        assert!(DataRequest::search("  ").validate().is_err());
    }

    #[test]
    fn test_interval_range_validation() {
        assert!(DataRequest::historical("AAPL", Interval::OneDay, Range::OneYear)
            .validate()
            .is_ok());
        assert!(DataRequest::historical("AAPL", Interval::FiveMinutes, Range::FiveDays)
            .validate()
            .is_ok());
        assert!(DataRequest::historical("AAPL", Interval::OneMinute, Range::OneYear)
            .validate()
            .is_err());
        assert!(DataRequest::historical("AAPL", Interval::OneMonth, Range::FiveDays)
            .validate()
            .is_err());
        assert!(DataRequest::historical("AAPL", Interval::OneHour, Range::Max)
            .validate()
            .is_err());
        assert!(DataRequest::historical("AAPL", Interval::OneWeek, Range::Max)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_interval_and_range_parsing() {
        assert_eq!("1h".parse::<Interval>().unwrap(), Interval::OneHour);
        assert_eq!("1wk".parse::<Interval>().unwrap(), Interval::OneWeek);
        assert!("7m".parse::<Interval>().is_err());
        assert_eq!("6mo".parse::<Range>().unwrap(), Range::SixMonths);
        assert!("10y".parse::<Range>().is_err());
    }

    #[test]
    fn test_cache_keys() {
        assert_eq!(
            DataRequest::historical("aapl", Interval::OneDay, Range::OneYear).cache_key(),
            "historical:AAPL:1d:1y"
        );
        assert_eq!(DataRequest::search("Apple").cache_key(), "search:apple");
        assert_eq!(
            DataRequest::batch_quotes(&["aapl", "msft"]).cache_key(),
            "batch:AAPL,MSFT"
        );
    }

    #[test]
    fn test_response_serde_tagging() {
        let response = DataResponse::Search(vec![SearchResult::new(
            "AAPL", "Apple Inc", "NASDAQ", "Stock",
        )]);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["kind"], "search");
        assert_eq!(json["data"][0]["symbol"], "AAPL");

        let back: DataResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back, response);
    }
}
