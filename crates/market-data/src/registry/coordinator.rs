//! Failover coordinator for orchestrating market data providers.
//!
//! The coordinator is the single entry point for data requests. It handles:
//! - Provider ordering per the configured [`FailoverStrategy`]
//! - Per-provider caching, rate limiting and retries with backoff
//! - Failure cooldowns and failover to the next provider
//! - Coalescing of identical in-flight requests
//! - Batch quotes, natively or fanned out per symbol, with partial results

use std::borrow::Cow;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio::time::{self, Instant};

use super::failover_state::FailoverState;
use super::health::{HealthMonitor, HealthSettings, HealthStatus, ProviderHealth};
use super::metrics::{PerformanceMetrics, PerformanceTracker};
use super::rate_limiter::{RateDecision, RateLimitSnapshot, RateLimiter};
use super::retry::{RetryDecision, RetryPolicy};
use super::skip_reason::{FetchDiagnostics, SkipReason};
use crate::cache::{CacheLookup, CacheStats, CacheStore, EntryCodec, IdentityCodec};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, FailoverStrategy, MarketDataConfig};
use crate::errors::{MarketDataError, ProviderError, ProviderErrorKind};
use crate::models::{
    BatchQuotes, CompanyOverview, DataRequest, DataResponse, HistoricalPoint, Interval, ProviderId,
    Quote, Range, RequestOptions, SearchResult,
};
use crate::provider::{MarketDataProvider, Operation, ProviderCapabilities, RateLimit};

type SharedOutcome = Arc<OnceCell<Result<DataResponse, MarketDataError>>>;

/// A provider as registered with the coordinator.
struct Registration {
    index: usize,
    id: &'static str,
    provider: Arc<dyn MarketDataProvider>,
    capabilities: ProviderCapabilities,
    enabled: bool,
}

impl Registration {
    fn serves(&self, operation: Operation) -> bool {
        self.enabled && self.capabilities.supports(operation)
    }
}

/// How one provider's turn ended.
enum ProviderOutcome {
    Success(DataResponse),
    /// The limiter denied the first attempt. Not a failure.
    RateLimited(Duration),
    Failed(ProviderError),
    /// The next backoff would end past the deadline. Not marked as a failure.
    OutOfTime(ProviderError),
}

/// Point-in-time view of a registered provider.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub id: String,
    pub enabled: bool,
    pub capabilities: ProviderCapabilities,
    pub health: ProviderHealth,
    /// End of the failure cooldown, while the provider is cooling down.
    pub cooldown_until: Option<DateTime<Utc>>,
    pub rate_limit: RateLimitSnapshot,
    pub metrics: Option<PerformanceMetrics>,
    pub is_primary: bool,
    pub is_current: bool,
}

/// Market data coordinator with failover across providers.
pub struct FailoverCoordinator {
    config: MarketDataConfig,
    providers: Vec<Registration>,
    clock: Arc<dyn Clock>,
    cache: Arc<CacheStore<DataResponse>>,
    rate_limiter: RateLimiter,
    retry: RetryPolicy,
    state: FailoverState,
    metrics: PerformanceTracker,
    health: HealthMonitor,
    in_flight: DashMap<String, SharedOutcome>,
    disposed: AtomicBool,
}

impl FailoverCoordinator {
    /// Create a coordinator on the system clock.
    pub fn new(
        config: MarketDataConfig,
        providers: Vec<Arc<dyn MarketDataProvider>>,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(config, providers, Arc::new(SystemClock::new()))
    }

    /// Create a coordinator reading wall time from `clock`.
    pub fn with_clock(
        config: MarketDataConfig,
        providers: Vec<Arc<dyn MarketDataProvider>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        Self::with_codec(config, providers, clock, Arc::new(IdentityCodec))
    }

    /// Create a coordinator whose cache stores entries through `codec`.
    ///
    /// Providers are registered in the given order. Capabilities and rate
    /// limits are read once here. When health checks are enabled and a tokio
    /// runtime is available, the probe loop starts immediately.
    pub fn with_codec(
        config: MarketDataConfig,
        providers: Vec<Arc<dyn MarketDataProvider>>,
        clock: Arc<dyn Clock>,
        codec: Arc<dyn EntryCodec>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut seen = HashSet::new();
        for provider in &providers {
            if !seen.insert(provider.id()) {
                return Err(ConfigError::DuplicateProvider(provider.id().to_string()));
            }
        }

        let configured = config
            .primary_provider
            .iter()
            .chain(config.fallback_providers.iter());
        for id in configured {
            if !seen.contains(id.as_str()) {
                return Err(ConfigError::UnknownProvider(id.clone()));
            }
        }
        for id in config.providers.keys() {
            if !seen.contains(id.as_str()) {
                warn!("Settings for unregistered provider '{}' are ignored", id);
            }
        }

        let rate_limiter = RateLimiter::new();
        let registrations: Vec<Registration> = providers
            .into_iter()
            .enumerate()
            .map(|(index, provider)| {
                let id = provider.id();
                let limit = config
                    .providers
                    .get(id)
                    .and_then(|s| s.requests_per_minute)
                    .map(RateLimit::per_minute)
                    .unwrap_or_else(|| provider.rate_limit());
                rate_limiter.configure(id, limit);

                Registration {
                    index,
                    id,
                    capabilities: provider.capabilities(),
                    enabled: config.is_enabled(id),
                    provider,
                }
            })
            .collect();

        let enabled: Vec<Arc<dyn MarketDataProvider>> = registrations
            .iter()
            .filter(|r| r.enabled)
            .map(|r| Arc::clone(&r.provider))
            .collect();
        if enabled.is_empty() {
            return Err(ConfigError::NoProvidersEnabled);
        }

        let primary: Option<ProviderId> = config
            .primary_provider
            .clone()
            .map(Cow::Owned)
            .or_else(|| enabled.first().map(|p| Cow::Borrowed(p.id())));

        let cache = Arc::new(
            CacheStore::new(config.cache_max_bytes, Arc::clone(&clock)).with_codec(codec),
        );
        let health = HealthMonitor::new(
            enabled,
            HealthSettings {
                probe_timeout: config.health_probe_timeout(),
                degraded_latency: config.degraded_latency(),
            },
            Arc::clone(&clock),
        );

        if let Some(interval) = config.health_check_interval() {
            if tokio::runtime::Handle::try_current().is_ok() {
                let cache = Arc::clone(&cache);
                health.start(interval, move || {
                    let purged = cache.purge_expired();
                    if purged > 0 {
                        debug!("Purged {} expired cache entries", purged);
                    }
                });
            } else {
                warn!("No tokio runtime available, health checks are disabled");
            }
        }

        info!(
            "Market data coordinator ready: {} providers, strategy {:?}, primary {:?}",
            registrations.len(),
            config.strategy,
            primary
        );

        Ok(Self {
            retry: RetryPolicy::from_config(&config),
            state: FailoverState::new(config.failure_cooldown(), primary),
            metrics: PerformanceTracker::new(config.metrics_smoothing),
            config,
            providers: registrations,
            clock,
            cache,
            rate_limiter,
            health,
            in_flight: DashMap::new(),
            disposed: AtomicBool::new(false),
        })
    }

    fn ensure_active(&self) -> Result<(), MarketDataError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(MarketDataError::Disposed);
        }
        Ok(())
    }

    /// Serve a request.
    ///
    /// Tries providers in strategy order:
    /// 1. Skip providers that are cooling down
    /// 2. Return a fresh cache entry for the provider, if any
    /// 3. Consult the rate limiter (a denial moves on without penalty)
    /// 4. Invoke the adapter, retrying transient failures with backoff
    /// 5. On success, cache the response and clear the provider's failure
    /// 6. On failure, maybe cool the provider down and try the next one
    ///
    /// Identical requests in flight at the same time share one execution.
    pub async fn execute(
        &self,
        request: DataRequest,
        options: RequestOptions,
    ) -> Result<DataResponse, MarketDataError> {
        self.ensure_active()?;
        request.validate()?;

        let started = Instant::now();
        let deadline = options.deadline.map(|budget| started + budget);

        if let DataRequest::BatchQuotes { symbols } = &request {
            return self.execute_batch(symbols, &options, started, deadline).await;
        }

        self.execute_coalesced(&request, &options, started, deadline)
            .await
    }

    async fn execute_coalesced(
        &self,
        request: &DataRequest,
        options: &RequestOptions,
        started: Instant,
        deadline: Option<Instant>,
    ) -> Result<DataResponse, MarketDataError> {
        let key = coalescing_key(request, options);
        let cell = self
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let shared = cell.get_or_init(|| self.run(request, options, started, deadline));
        let outcome = match deadline {
            // Followers wait on their own budget, not the leader's.
            Some(at) => match time::timeout_at(at, shared).await {
                Ok(outcome) => outcome.clone(),
                Err(_) => return Err(deadline_exceeded(started)),
            },
            None => shared.await.clone(),
        };

        self.in_flight
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &cell));
        outcome
    }

    async fn run(
        &self,
        request: &DataRequest,
        options: &RequestOptions,
        started: Instant,
        deadline: Option<Instant>,
    ) -> Result<DataResponse, MarketDataError> {
        let operation = request.operation();
        let order = self.provider_order(operation, options.preferred_provider.as_deref());
        if order.is_empty() {
            warn!("No providers available for {}", operation);
            return Err(MarketDataError::NoProvidersAvailable { operation });
        }

        let base_key = request.cache_key();
        let mut diagnostics = FetchDiagnostics::new();
        let mut reached_provider = false;
        let mut out_of_time = false;

        for &index in &order {
            if reached_provider && !self.config.enable_auto_failover {
                break;
            }
            check_deadline(started, deadline)?;

            let registration = &self.providers[index];
            let provider_id: ProviderId = Cow::Borrowed(registration.id);

            if self.state.is_cooling_down(registration.id, self.clock.now()) {
                debug!("Provider '{}' is cooling down, skipping", provider_id);
                diagnostics.record_skip(provider_id, SkipReason::CoolingDown);
                continue;
            }
            reached_provider = true;

            if let Some(hit) = self.cached(registration.id, request, options.allow_stale) {
                debug!("Cache hit for '{}' from '{}'", base_key, provider_id);
                return Ok(hit);
            }

            match self
                .invoke_with_retry(registration, request, started, deadline)
                .await?
            {
                ProviderOutcome::Success(response) => {
                    self.write_through(registration.id, request, &response);
                    self.record_provider_success(registration);
                    diagnostics.record_success(provider_id);
                    debug!("Fetch path: {}", diagnostics.summary());
                    return Ok(response);
                }
                ProviderOutcome::RateLimited(retry_after) => {
                    debug!(
                        "Provider '{}' rate limited for {:?}, trying next",
                        provider_id, retry_after
                    );
                    diagnostics.record_skip(provider_id, SkipReason::RateLimited { retry_after });
                }
                ProviderOutcome::Failed(error) => {
                    self.record_provider_failure(registration, &error);
                    diagnostics.record_error(error);
                }
                ProviderOutcome::OutOfTime(error) => {
                    debug!(
                        "Provider '{}' cannot retry before the deadline, trying next",
                        provider_id
                    );
                    out_of_time = true;
                    diagnostics.record_error(error);
                }
            }
        }

        if options.allow_stale {
            if let Some(stale) = self.stale_fallback(&order, &base_key) {
                return Ok(stale);
            }
        }

        if out_of_time {
            warn!("Deadline cut {} short: {}", base_key, diagnostics.summary());
            return Err(deadline_exceeded(started));
        }

        warn!("All providers failed for {}: {}", base_key, diagnostics.summary());
        Err(diagnostics.into_exhausted())
    }

    /// Attempt one provider until it succeeds, gives up or is throttled.
    async fn invoke_with_retry(
        &self,
        registration: &Registration,
        request: &DataRequest,
        started: Instant,
        deadline: Option<Instant>,
    ) -> Result<ProviderOutcome, MarketDataError> {
        let mut attempt = 0u32;
        let mut last_error: Option<ProviderError> = None;

        loop {
            check_deadline(started, deadline)?;

            if let RateDecision::Deny { retry_after } = self
                .rate_limiter
                .try_consume(registration.id, self.clock.now())
            {
                return Ok(match last_error {
                    Some(error) => ProviderOutcome::Failed(error),
                    None => ProviderOutcome::RateLimited(retry_after),
                });
            }

            attempt += 1;
            let call_started = Instant::now();
            let result = match remaining(deadline) {
                Some(budget) => {
                    match time::timeout(budget, invoke(registration, request)).await {
                        Ok(result) => result,
                        Err(_) => return Err(deadline_exceeded(started)),
                    }
                }
                None => invoke(registration, request).await,
            };

            if let Some(quota) = registration.provider.reported_remaining() {
                self.rate_limiter
                    .observe_remaining(registration.id, quota, self.clock.now());
            }

            let error = match result {
                Ok(response) => {
                    self.metrics.record_success(
                        registration.id,
                        call_started.elapsed(),
                        self.clock.now(),
                    );
                    return Ok(ProviderOutcome::Success(response));
                }
                Err(error) => error,
            };

            self.metrics.record_failure(registration.id, self.clock.now());
            debug!(
                "Provider '{}' attempt {} failed: {}",
                registration.id, attempt, error
            );

            match self.retry.decide(&error, attempt, remaining(deadline)) {
                RetryDecision::RetryAfter(delay) => {
                    if let Some(at) = deadline {
                        if Instant::now() + delay >= at {
                            return Ok(ProviderOutcome::OutOfTime(error));
                        }
                    }
                    time::sleep(delay).await;
                    last_error = Some(error);
                }
                RetryDecision::GiveUp => return Ok(ProviderOutcome::Failed(error)),
            }
        }
    }

    fn record_provider_success(&self, registration: &Registration) {
        self.state.clear(registration.id);
        self.state.set_current(Cow::Borrowed(registration.id));
        self.state.set_last_used(registration.index);
        self.state.reset_failures();
    }

    fn record_provider_failure(&self, registration: &Registration, error: &ProviderError) {
        let consecutive = self.state.record_failure();
        if error.kind.marks_temporary_failure() {
            self.state
                .mark_failed(registration.id, error.kind.clone(), self.clock.now());
        }
        warn!(
            "Provider '{}' failed ({} consecutive failures): {}",
            registration.id, consecutive, error
        );
    }

    /// Fresh cached response of one provider. A strict read drops an expired
    /// entry; a stale-tolerant read leaves it for [`stale_fallback`](Self::stale_fallback).
    ///
    /// Batches are served from the per-symbol quote entries, and only when
    /// every symbol is cached.
    fn cached(
        &self,
        provider: &str,
        request: &DataRequest,
        allow_stale: bool,
    ) -> Option<DataResponse> {
        if let DataRequest::BatchQuotes { symbols } = request {
            let keys: Vec<String> = symbols
                .iter()
                .map(|symbol| quote_cache_key(provider, symbol))
                .collect();
            let mut hits = self.cache.get_many(&keys);

            let data: Vec<Quote> = keys
                .iter()
                .filter_map(|key| match hits.remove(key) {
                    Some(DataResponse::Quote(quote)) => Some(quote),
                    _ => None,
                })
                .collect();
            if data.len() < keys.len() {
                return None;
            }
            return Some(DataResponse::BatchQuotes(BatchQuotes {
                data,
                errors: Vec::new(),
            }));
        }

        let key = provider_cache_key(provider, &request.cache_key());
        if allow_stale {
            match self.cache.lookup(&key) {
                CacheLookup::Fresh(hit) => Some(hit),
                CacheLookup::Stale(_) | CacheLookup::Miss => None,
            }
        } else {
            self.cache.get(&key)
        }
    }

    /// Cache a successful response with its operation's TTL. Batch quotes
    /// are stored per symbol.
    fn write_through(&self, provider: &str, request: &DataRequest, response: &DataResponse) {
        // A call that outlives dispose() leaves the cache empty.
        if self.is_disposed() {
            return;
        }

        let operation = request.operation();
        let ttl = self.config.cache_ttl.for_operation(operation);
        match response {
            DataResponse::BatchQuotes(batch) => {
                let entries = batch.data.iter().map(|quote| {
                    (
                        quote_cache_key(provider, &quote.symbol),
                        DataResponse::Quote(quote.clone()),
                    )
                });
                let written = self.cache.set_many(entries, ttl);
                debug!("Cached {} of {} batch quotes", written, batch.data.len());
            }
            _ => {
                let key = provider_cache_key(provider, &request.cache_key());
                if let Err(e) = self.cache.set(key, response, ttl) {
                    warn!("Failed to cache {} response: {}", operation, e);
                }
            }
        }
    }

    fn stale_fallback(&self, order: &[usize], base_key: &str) -> Option<DataResponse> {
        order.iter().find_map(|&index| {
            let id = self.providers[index].id;
            match self.cache.lookup(&provider_cache_key(id, base_key)) {
                CacheLookup::Fresh(value) | CacheLookup::Stale(value) => {
                    warn!("Serving cached '{}' from '{}' after all providers failed", base_key, id);
                    Some(value)
                }
                CacheLookup::Miss => None,
            }
        })
    }

    /// Indices of enabled providers declaring `operation`, in the order they
    /// should be tried.
    fn provider_order(&self, operation: Operation, preferred: Option<&str>) -> Vec<usize> {
        let eligible: Vec<usize> = self
            .providers
            .iter()
            .filter(|r| r.serves(operation))
            .map(|r| r.index)
            .collect();
        if eligible.is_empty() {
            return eligible;
        }

        let mut order = match self.config.strategy {
            FailoverStrategy::Priority => {
                let primary = self.state.primary();
                let mut ids: Vec<&str> = Vec::new();
                ids.extend(primary.as_deref());
                ids.extend(self.config.fallback_providers.iter().map(String::as_str));
                ids.extend(eligible.iter().map(|&i| self.providers[i].id));

                let mut order = Vec::with_capacity(eligible.len());
                for id in ids {
                    if let Some(&index) = eligible.iter().find(|&&i| self.providers[i].id == id) {
                        if !order.contains(&index) {
                            order.push(index);
                        }
                    }
                }
                order
            }
            FailoverStrategy::RoundRobin => {
                let count = self.providers.len();
                let start = self.state.last_used().map(|i| i + 1).unwrap_or(0);
                let mut order = eligible;
                order.sort_by_key(|&i| (i + count - start % count) % count);
                order
            }
            FailoverStrategy::Fastest => {
                self.ranked(eligible, |id| self.metrics.avg_response_time_ms(id))
            }
            FailoverStrategy::MostReliable => {
                self.ranked(eligible, |id| self.metrics.error_rate(id))
            }
        };

        // Offline providers are tried last but stay eligible.
        order.sort_by_key(|&i| self.health.status(self.providers[i].id) == HealthStatus::Offline);

        // An override leads regardless of health, except under round robin.
        if !matches!(self.config.strategy, FailoverStrategy::RoundRobin) {
            if let Some(pos) = preferred
                .and_then(|id| order.iter().position(|&i| self.providers[i].id == id))
            {
                let index = order.remove(pos);
                order.insert(0, index);
            }
        }
        order
    }

    /// Sort ascending by a measured value. Unmeasured providers go last, in
    /// registration order.
    fn ranked<F>(&self, mut order: Vec<usize>, measure: F) -> Vec<usize>
    where
        F: Fn(&str) -> Option<f64>,
    {
        order.sort_by(|&a, &b| {
            match (measure(self.providers[a].id), measure(self.providers[b].id)) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                (Some(_), None) => CmpOrdering::Less,
                (None, Some(_)) => CmpOrdering::Greater,
                (None, None) => CmpOrdering::Equal,
            }
        });
        order
    }

    async fn execute_batch(
        &self,
        symbols: &[String],
        options: &RequestOptions,
        started: Instant,
        deadline: Option<Instant>,
    ) -> Result<DataResponse, MarketDataError> {
        let mut unique: Vec<String> = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            if !unique.contains(symbol) {
                unique.push(symbol.clone());
            }
        }

        let preferred = options.preferred_provider.as_deref();
        let quote_order = self.provider_order(Operation::Quote, preferred);
        let native = match quote_order.first() {
            Some(&index) => self.providers[index].serves(Operation::BatchQuotes),
            None => !self
                .provider_order(Operation::BatchQuotes, preferred)
                .is_empty(),
        };

        if native {
            let request = DataRequest::BatchQuotes {
                symbols: unique.clone(),
            };
            match self
                .execute_coalesced(&request, options, started, deadline)
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) if e.is_deadline_exceeded() => return Err(e),
                Err(e) if quote_order.is_empty() => {
                    let message = failure_message(&e);
                    return Err(MarketDataError::BatchFailed {
                        errors: unique
                            .iter()
                            .map(|symbol| format!("{}: {}", symbol, message))
                            .collect(),
                    });
                }
                Err(e) => debug!("Native batch failed, fetching symbols one by one: {}", e),
            }
        }

        let fetches = unique.iter().map(|symbol| async move {
            let request = DataRequest::Quote {
                symbol: symbol.clone(),
            };
            let result = self
                .execute_coalesced(&request, options, started, deadline)
                .await;
            (symbol, result)
        });

        let mut batch = BatchQuotes::default();
        for (symbol, result) in join_all(fetches).await {
            match result {
                Ok(DataResponse::Quote(quote)) => batch.data.push(quote),
                Ok(other) => batch.errors.push(format!(
                    "{}: unexpected {} response",
                    symbol,
                    other.operation()
                )),
                Err(e) if e.is_deadline_exceeded() => return Err(e),
                Err(e) => batch.errors.push(format!("{}: {}", symbol, failure_message(&e))),
            }
        }

        if batch.data.is_empty() {
            return Err(MarketDataError::BatchFailed {
                errors: batch.errors,
            });
        }
        if !batch.errors.is_empty() {
            info!(
                "Batch fetched {} of {} symbols",
                batch.data.len(),
                unique.len()
            );
        }
        Ok(DataResponse::BatchQuotes(batch))
    }

    /// Fetch the latest quote for a symbol.
    pub async fn quote(
        &self,
        symbol: &str,
        options: RequestOptions,
    ) -> Result<Quote, MarketDataError> {
        match self.execute(DataRequest::quote(symbol), options).await? {
            DataResponse::Quote(quote) => Ok(quote),
            other => Err(unexpected(Operation::Quote, &other)),
        }
    }

    /// Fetch a historical series, oldest first.
    pub async fn historical(
        &self,
        symbol: &str,
        interval: Interval,
        range: Range,
        options: RequestOptions,
    ) -> Result<Vec<HistoricalPoint>, MarketDataError> {
        match self
            .execute(DataRequest::historical(symbol, interval, range), options)
            .await?
        {
            DataResponse::HistoricalData(points) => Ok(points),
            other => Err(unexpected(Operation::HistoricalData, &other)),
        }
    }

    pub async fn search(
        &self,
        query: &str,
        options: RequestOptions,
    ) -> Result<Vec<SearchResult>, MarketDataError> {
        match self.execute(DataRequest::search(query), options).await? {
            DataResponse::Search(results) => Ok(results),
            other => Err(unexpected(Operation::Search, &other)),
        }
    }

    /// Fetch quotes for many symbols. Partial success is returned as data
    /// plus per-symbol errors.
    pub async fn batch_quotes<S: AsRef<str>>(
        &self,
        symbols: &[S],
        options: RequestOptions,
    ) -> Result<BatchQuotes, MarketDataError> {
        match self
            .execute(DataRequest::batch_quotes(symbols), options)
            .await?
        {
            DataResponse::BatchQuotes(batch) => Ok(batch),
            other => Err(unexpected(Operation::BatchQuotes, &other)),
        }
    }

    pub async fn company_overview(
        &self,
        symbol: &str,
        options: RequestOptions,
    ) -> Result<CompanyOverview, MarketDataError> {
        match self
            .execute(DataRequest::company_overview(symbol), options)
            .await?
        {
            DataResponse::CompanyOverview(overview) => Ok(overview),
            other => Err(unexpected(Operation::CompanyOverview, &other)),
        }
    }

    /// Make `provider` the primary and current provider.
    ///
    /// Returns false when the provider is unknown or disabled.
    pub fn switch_provider(&self, provider: &str) -> bool {
        match self
            .providers
            .iter()
            .find(|r| r.id == provider && r.enabled)
        {
            Some(registration) => {
                self.state.set_primary(Cow::Borrowed(registration.id));
                self.state.set_current(Cow::Borrowed(registration.id));
                info!("Switched primary provider to '{}'", registration.id);
                true
            }
            None => {
                warn!("Cannot switch to unknown or disabled provider '{}'", provider);
                false
            }
        }
    }

    /// The provider that served the last successful request, or the primary
    /// before any request succeeded.
    pub fn current_provider(&self) -> Option<ProviderId> {
        self.state.current()
    }

    pub fn provider_status(&self) -> HashMap<String, ProviderStatus> {
        let now = self.clock.now();
        let primary = self.state.primary();
        let current = self.state.current();

        self.providers
            .iter()
            .map(|r| {
                let status = ProviderStatus {
                    id: r.id.to_string(),
                    enabled: r.enabled,
                    capabilities: r.capabilities.clone(),
                    health: self.health.health(r.id).unwrap_or_default(),
                    cooldown_until: self.state.cooldown_until(r.id, now),
                    rate_limit: self.rate_limiter.snapshot(r.id, now),
                    metrics: self.metrics.get(r.id),
                    is_primary: primary.as_deref() == Some(r.id),
                    is_current: current.as_deref() == Some(r.id),
                };
                (r.id.to_string(), status)
            })
            .collect()
    }

    pub fn performance_metrics(&self) -> HashMap<String, PerformanceMetrics> {
        self.metrics.snapshot()
    }

    /// Run a health probe round immediately.
    pub async fn check_health(&self) -> Result<(), MarketDataError> {
        self.ensure_active()?;
        self.health.check_now().await;
        Ok(())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop cached responses of one provider, or of all providers. Returns
    /// the number of entries removed.
    pub fn clear_cache(&self, provider: Option<&str>) -> usize {
        match provider {
            Some(id) => {
                let removed = self.cache.clear_namespace(&format!("{}:", id));
                info!("Cleared {} cached entries for '{}'", removed, id);
                removed
            }
            None => {
                let removed = self.cache.len();
                self.cache.clear();
                info!("Cleared {} cached entries", removed);
                removed
            }
        }
    }

    /// Stop the health monitor and drop all cached data. Every later call
    /// returns [`MarketDataError::Disposed`]. Calling it twice is a no-op.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.health.stop().await;
        self.cache.clear();
        self.in_flight.clear();
        info!("Market data coordinator disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

async fn invoke(
    registration: &Registration,
    request: &DataRequest,
) -> Result<DataResponse, ProviderError> {
    let provider = &registration.provider;
    match request {
        DataRequest::Quote { symbol } => provider.get_quote(symbol).await.map(DataResponse::Quote),
        DataRequest::HistoricalData {
            symbol,
            interval,
            range,
        } => provider
            .get_historical(symbol, *interval, *range)
            .await
            .map(DataResponse::HistoricalData),
        DataRequest::Search { query } => provider.search(query).await.map(DataResponse::Search),
        DataRequest::BatchQuotes { symbols } => {
            let data = provider.get_batch_quotes(symbols).await?;
            if data.is_empty() {
                return Err(ProviderError::new(
                    registration.id,
                    ProviderErrorKind::ClientError { code: 404 },
                    format!("none of {} symbols returned", symbols.len()),
                ));
            }
            let errors = symbols
                .iter()
                .filter(|s| !data.iter().any(|q| q.symbol.eq_ignore_ascii_case(s)))
                .map(|s| format!("{}: not returned by {}", s, registration.id))
                .collect();
            Ok(DataResponse::BatchQuotes(BatchQuotes { data, errors }))
        }
        DataRequest::CompanyOverview { symbol } => provider
            .get_company_overview(symbol)
            .await
            .map(DataResponse::CompanyOverview),
    }
}

fn provider_cache_key(provider: &str, base_key: &str) -> String {
    format!("{}:{}", provider, base_key)
}

fn quote_cache_key(provider: &str, symbol: &str) -> String {
    provider_cache_key(provider, &DataRequest::quote(symbol).cache_key())
}

/// The most specific message for a failed call.
fn failure_message(error: &MarketDataError) -> String {
    error
        .last_provider_error()
        .map(|pe| pe.to_string())
        .unwrap_or_else(|| error.to_string())
}

fn coalescing_key(request: &DataRequest, options: &RequestOptions) -> String {
    format!(
        "{}|{}|{}",
        request.cache_key(),
        options.preferred_provider.as_deref().unwrap_or("*"),
        options.allow_stale
    )
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|at| at.saturating_duration_since(Instant::now()))
}

fn check_deadline(started: Instant, deadline: Option<Instant>) -> Result<(), MarketDataError> {
    match deadline {
        Some(at) if Instant::now() >= at => Err(deadline_exceeded(started)),
        _ => Ok(()),
    }
}

fn deadline_exceeded(started: Instant) -> MarketDataError {
    MarketDataError::DeadlineExceeded {
        elapsed: started.elapsed(),
    }
}

fn unexpected(expected: Operation, response: &DataResponse) -> MarketDataError {
    MarketDataError::UnexpectedResponse {
        expected,
        actual: response.operation(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicU32;

    struct Stub {
        id: &'static str,
        operations: Vec<Operation>,
        fail_with: Option<ProviderErrorKind>,
        calls: AtomicU32,
    }

    impl Stub {
        fn ok(id: &'static str) -> Arc<Self> {
            Arc::new(Self {
                id,
                operations: vec![Operation::Quote],
                fail_with: None,
                calls: AtomicU32::new(0),
            })
        }

        fn failing(id: &'static str, kind: ProviderErrorKind) -> Arc<Self> {
            Arc::new(Self {
                id,
                operations: vec![Operation::Quote],
                fail_with: Some(kind),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MarketDataProvider for Stub {
        fn id(&self) -> &'static str {
            self.id
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities::from_operations(&self.operations)
        }

        async fn get_quote(&self, symbol: &str) -> Result<Quote, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(kind) => Err(ProviderError::new(self.id, kind.clone(), "stubbed")),
                None => Ok(Quote::new(
                    symbol,
                    dec!(100),
                    DateTime::<Utc>::UNIX_EPOCH,
                    "USD",
                    self.id,
                )),
            }
        }

        async fn probe(&self) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn config() -> MarketDataConfig {
        MarketDataConfig {
            health_check_interval_ms: 0,
            retry_jitter_ms: 0,
            max_retries: 0,
            ..Default::default()
        }
    }

    fn coordinator(
        config: MarketDataConfig,
        providers: Vec<Arc<dyn MarketDataProvider>>,
    ) -> FailoverCoordinator {
        FailoverCoordinator::with_clock(config, providers, Arc::new(ManualClock::at_epoch()))
            .unwrap()
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let providers: Vec<Arc<dyn MarketDataProvider>> = vec![Stub::ok("A"), Stub::ok("A")];
        let err = FailoverCoordinator::new(config(), providers).err().unwrap();
        assert_eq!(err, ConfigError::DuplicateProvider("A".to_string()));
    }

    #[test]
    fn test_unknown_fallback_rejected() {
        let providers: Vec<Arc<dyn MarketDataProvider>> = vec![Stub::ok("A")];
        let config = MarketDataConfig {
            fallback_providers: vec!["Z".to_string()],
            ..config()
        };
        let err = FailoverCoordinator::new(config, providers).err().unwrap();
        assert_eq!(err, ConfigError::UnknownProvider("Z".to_string()));
    }

    #[test]
    fn test_priority_order() {
        let providers: Vec<Arc<dyn MarketDataProvider>> =
            vec![Stub::ok("A"), Stub::ok("B"), Stub::ok("C"), Stub::ok("D")];
        let config = MarketDataConfig {
            primary_provider: Some("B".to_string()),
            fallback_providers: vec!["D".to_string()],
            ..config()
        };
        let coordinator = coordinator(config, providers);

        assert_eq!(coordinator.provider_order(Operation::Quote, None), vec![1, 3, 0, 2]);
        assert_eq!(
            coordinator.provider_order(Operation::Quote, Some("C")),
            vec![2, 1, 3, 0]
        );
        assert!(coordinator.provider_order(Operation::Search, None).is_empty());
    }

    #[test]
    fn test_round_robin_order_rotates() {
        let providers: Vec<Arc<dyn MarketDataProvider>> =
            vec![Stub::ok("A"), Stub::ok("B"), Stub::ok("C")];
        let config = MarketDataConfig {
            strategy: FailoverStrategy::RoundRobin,
            ..config()
        };
        let coordinator = coordinator(config, providers);

        assert_eq!(coordinator.provider_order(Operation::Quote, None), vec![0, 1, 2]);
        coordinator.state.set_last_used(0);
        assert_eq!(coordinator.provider_order(Operation::Quote, Some("A")), vec![1, 2, 0]);
        coordinator.state.set_last_used(2);
        assert_eq!(coordinator.provider_order(Operation::Quote, None), vec![0, 1, 2]);
    }

    #[test]
    fn test_fastest_puts_unmeasured_last() {
        let providers: Vec<Arc<dyn MarketDataProvider>> =
            vec![Stub::ok("A"), Stub::ok("B"), Stub::ok("C")];
        let config = MarketDataConfig {
            strategy: FailoverStrategy::Fastest,
            ..config()
        };
        let coordinator = coordinator(config, providers);
        let now = DateTime::<Utc>::UNIX_EPOCH;
        coordinator
            .metrics
            .record_success("C", Duration::from_millis(50), now);
        coordinator
            .metrics
            .record_success("B", Duration::from_millis(200), now);

        assert_eq!(coordinator.provider_order(Operation::Quote, None), vec![2, 1, 0]);
        assert_eq!(
            coordinator.provider_order(Operation::Quote, Some("A")),
            vec![0, 2, 1]
        );
    }

    #[tokio::test]
    async fn test_failover_marks_primary_failed() {
        let a = Stub::failing("A", ProviderErrorKind::ServiceUnavailable);
        let b = Stub::ok("B");
        let providers: Vec<Arc<dyn MarketDataProvider>> = vec![a.clone(), b.clone()];
        let coordinator = coordinator(config(), providers);

        let quote = coordinator
            .quote("AAPL", RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(quote.source, "B");
        assert_eq!(coordinator.current_provider().as_deref(), Some("B"));

        let status = coordinator.provider_status();
        assert!(status["A"].cooldown_until.is_some());
        assert!(status["B"].is_current);
        assert!(status["A"].is_primary);
    }

    #[tokio::test]
    async fn test_client_error_does_not_cool_down() {
        let a = Stub::failing("A", ProviderErrorKind::ClientError { code: 404 });
        let b = Stub::ok("B");
        let providers: Vec<Arc<dyn MarketDataProvider>> = vec![a.clone(), b.clone()];
        let coordinator = coordinator(config(), providers);

        coordinator
            .quote("AAPL", RequestOptions::default())
            .await
            .unwrap();
        assert!(coordinator.provider_status()["A"].cooldown_until.is_none());
    }

    #[tokio::test]
    async fn test_failover_disabled_tries_only_first() {
        let a = Stub::failing("A", ProviderErrorKind::ServiceUnavailable);
        let b = Stub::ok("B");
        let providers: Vec<Arc<dyn MarketDataProvider>> = vec![a.clone(), b.clone()];
        let config = MarketDataConfig {
            enable_auto_failover: false,
            ..config()
        };
        let coordinator = coordinator(config, providers);

        let err = coordinator
            .quote("AAPL", RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MarketDataError::AllProvidersExhausted { .. }));
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_provider() {
        let a = Stub::ok("A");
        let providers: Vec<Arc<dyn MarketDataProvider>> = vec![a.clone()];
        let coordinator = coordinator(config(), providers);

        let err = coordinator
            .quote("  ", RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MarketDataError::InvalidRequest(_)));
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn test_clear_cache_per_provider() {
        let a = Stub::ok("A");
        let providers: Vec<Arc<dyn MarketDataProvider>> = vec![a.clone()];
        let coordinator = coordinator(config(), providers);

        coordinator
            .quote("AAPL", RequestOptions::default())
            .await
            .unwrap();
        coordinator
            .quote("AAPL", RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(a.calls(), 1);

        assert_eq!(coordinator.clear_cache(Some("B")), 0);
        assert_eq!(coordinator.clear_cache(Some("A")), 1);
        coordinator
            .quote("AAPL", RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(a.calls(), 2);
    }

    #[test]
    fn test_switch_provider() {
        let providers: Vec<Arc<dyn MarketDataProvider>> = vec![Stub::ok("A"), Stub::ok("B")];
        let coordinator = coordinator(config(), providers);

        assert!(coordinator.switch_provider("B"));
        assert_eq!(coordinator.current_provider().as_deref(), Some("B"));
        assert_eq!(coordinator.provider_order(Operation::Quote, None), vec![1, 0]);
        assert!(!coordinator.switch_provider("Z"));
    }
}
