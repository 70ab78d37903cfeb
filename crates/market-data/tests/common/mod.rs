//! Shared fakes for coordinator integration tests.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal_macros::dec;

use tickerflow_market_data::{
    MarketDataConfig, MarketDataProvider, Operation, ProviderCapabilities, ProviderError,
    ProviderErrorKind, Quote, RateLimit,
};

/// Scripted provider. Each call pops the next scripted outcome, falling back
/// to the standing failure (or success) once the script is empty.
pub struct FakeProvider {
    id: &'static str,
    operations: Vec<Operation>,
    latency: Duration,
    rate_limit: RateLimit,
    script: Mutex<VecDeque<Option<ProviderErrorKind>>>,
    failure: Mutex<Option<ProviderErrorKind>>,
    unknown_symbols: HashSet<String>,
    reported_remaining: Option<u32>,
    offline: AtomicBool,
    quote_calls: AtomicU32,
    batch_calls: AtomicU32,
}

impl FakeProvider {
    pub fn new(id: &'static str) -> Self {
        Self {
            id,
            operations: vec![Operation::Quote],
            latency: Duration::ZERO,
            rate_limit: RateLimit::per_minute(1_000),
            script: Mutex::new(VecDeque::new()),
            failure: Mutex::new(None),
            unknown_symbols: HashSet::new(),
            reported_remaining: None,
            offline: AtomicBool::new(false),
            quote_calls: AtomicU32::new(0),
            batch_calls: AtomicU32::new(0),
        }
    }

    pub fn with_operations(mut self, operations: &[Operation]) -> Self {
        self.operations = operations.to_vec();
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn failing(self, kind: ProviderErrorKind) -> Self {
        self.set_failure(Some(kind));
        self
    }

    /// Outcomes for the next calls, `None` meaning success.
    pub fn with_script(self, outcomes: Vec<Option<ProviderErrorKind>>) -> Self {
        *self.script.lock().unwrap() = outcomes.into();
        self
    }

    /// Symbols answered with a 404.
    pub fn with_unknown_symbols(mut self, symbols: &[&str]) -> Self {
        self.unknown_symbols = symbols.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Quota the fake claims is left after every call.
    pub fn with_reported_remaining(mut self, remaining: u32) -> Self {
        self.reported_remaining = Some(remaining);
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn set_failure(&self, kind: Option<ProviderErrorKind>) {
        *self.failure.lock().unwrap() = kind;
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn quote_calls(&self) -> u32 {
        self.quote_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> u32 {
        self.batch_calls.load(Ordering::SeqCst)
    }

    fn next_failure(&self) -> Option<ProviderErrorKind> {
        match self.script.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => self.failure.lock().unwrap().clone(),
        }
    }

    fn quote_for(&self, symbol: &str) -> Result<Quote, ProviderError> {
        if self.unknown_symbols.contains(symbol) {
            return Err(ProviderError::new(
                self.id,
                ProviderErrorKind::ClientError { code: 404 },
                "unknown symbol",
            ));
        }
        Ok(Quote::new(
            symbol,
            dec!(101.25),
            DateTime::<Utc>::UNIX_EPOCH,
            "USD",
            self.id,
        ))
    }
}

#[async_trait]
impl MarketDataProvider for FakeProvider {
    fn id(&self) -> &'static str {
        self.id
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::from_operations(&self.operations)
    }

    fn rate_limit(&self) -> RateLimit {
        self.rate_limit.clone()
    }

    fn reported_remaining(&self) -> Option<u32> {
        self.reported_remaining
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, ProviderError> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(kind) = self.next_failure() {
            return Err(ProviderError::new(self.id, kind, "scripted failure"));
        }
        self.quote_for(symbol)
    }

    async fn get_batch_quotes(&self, symbols: &[String]) -> Result<Vec<Quote>, ProviderError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = self.next_failure() {
            return Err(ProviderError::new(self.id, kind, "scripted failure"));
        }
        Ok(symbols
            .iter()
            .filter_map(|s| self.quote_for(s).ok())
            .collect())
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(ProviderError::new(
                self.id,
                ProviderErrorKind::ServiceUnavailable,
                "probe failed",
            ))
        } else {
            Ok(())
        }
    }
}

pub fn providers(list: &[&Arc<FakeProvider>]) -> Vec<Arc<dyn MarketDataProvider>> {
    list.iter()
        .map(|p| (*p).clone() as Arc<dyn MarketDataProvider>)
        .collect()
}

/// Deterministic config: no background probing, no jitter, no retries.
pub fn test_config() -> MarketDataConfig {
    MarketDataConfig {
        health_check_interval_ms: 0,
        retry_jitter_ms: 0,
        max_retries: 0,
        base_retry_delay_ms: 100,
        max_retry_delay_ms: 10_000,
        ..Default::default()
    }
}
