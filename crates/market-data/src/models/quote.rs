use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Normalized real-time quote
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    /// Symbol as requested by the caller
    pub symbol: String,

    /// Last traded / current price (required)
    pub price: Decimal,

    /// Session open
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open: Option<Decimal>,

    /// Session high
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high: Option<Decimal>,

    /// Session low
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low: Option<Decimal>,

    /// Previous session close
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_close: Option<Decimal>,

    /// Trading volume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,

    /// Timestamp of the quote
    pub timestamp: DateTime<Utc>,

    /// Quote currency
    pub currency: String,

    /// Provider that produced the quote (FINNHUB, ...)
    pub source: String,
}

impl Quote {
    /// Create a new quote with minimal required fields
    pub fn new(
        symbol: impl Into<String>,
        price: Decimal,
        timestamp: DateTime<Utc>,
        currency: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            open: None,
            high: None,
            low: None,
            previous_close: None,
            volume: None,
            timestamp,
            currency: currency.into(),
            source: source.into(),
        }
    }

    /// Absolute change against the previous close.
    pub fn change(&self) -> Option<Decimal> {
        self.previous_close.map(|prev| self.price - prev)
    }

    /// Percentage change against the previous close.
    ///
    /// `None` when the previous close is unknown or zero.
    pub fn change_percent(&self) -> Option<Decimal> {
        let prev = self.previous_close?;
        if prev.is_zero() {
            return None;
        }
        Some((self.price - prev) / prev * Decimal::ONE_HUNDRED)
    }
}

/// One bar of a historical series
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPoint {
    /// Bar open time
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_quote_new() {
        let quote = Quote::new("AAPL", dec!(150.25), Utc::now(), "USD", "FINNHUB");
        assert_eq!(quote.price, dec!(150.25));
        assert_eq!(quote.currency, "USD");
        assert!(quote.open.is_none());
        assert!(quote.change().is_none());
    }

    #[test]
    fn test_quote_change() {
        let mut quote = Quote::new("AAPL", dec!(110), Utc::now(), "USD", "FINNHUB");
        quote.previous_close = Some(dec!(100));

        assert_eq!(quote.change(), Some(dec!(10)));
        assert_eq!(quote.change_percent(), Some(dec!(10)));
    }

    #[test]
    fn test_change_percent_zero_previous_close() {
        let mut quote = Quote::new("NEW", dec!(5), Utc::now(), "USD", "FINNHUB");
        quote.previous_close = Some(dec!(0));
        assert!(quote.change_percent().is_none());
    }
}
