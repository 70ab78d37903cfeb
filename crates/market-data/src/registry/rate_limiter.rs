//! Fixed-window rate limiter for market data providers.
//!
//! Each provider gets a quota of `requests` per `window`. The limiter never
//! reads the clock itself: callers pass `now`, which keeps every decision a
//! pure function of the stored state and the supplied time.
//!
//! A denial is a scheduling signal, not a failure. The coordinator moves on
//! to the next provider without penalizing the limited one.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::debug;
use serde::Serialize;

use crate::clock::{elapsed_since, to_chrono};
use crate::provider::RateLimit;

/// Outcome of a quota check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateDecision {
    Allow,
    /// Quota exhausted until the window resets.
    Deny { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Read-only view of a provider's window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSnapshot {
    pub limit: u32,
    pub remaining: u32,
    pub window_reset_at: DateTime<Utc>,
}

/// Quota window for a single provider.
#[derive(Debug)]
struct Window {
    limit: u32,
    length: Duration,
    remaining: u32,
    reset_at: DateTime<Utc>,
}

impl Window {
    fn new(config: &RateLimit, now: DateTime<Utc>) -> Self {
        Self {
            limit: config.requests,
            length: config.window,
            remaining: config.requests,
            reset_at: now + to_chrono(config.window),
        }
    }

    /// Start a new window if the current one has ended. Skipped windows do not
    /// accumulate quota.
    fn roll(&mut self, now: DateTime<Utc>) {
        if now >= self.reset_at {
            self.remaining = self.limit;
            self.reset_at = now + to_chrono(self.length);
        }
    }

    fn try_consume(&mut self, now: DateTime<Utc>) -> RateDecision {
        self.roll(now);

        if self.remaining > 0 {
            self.remaining -= 1;
            RateDecision::Allow
        } else {
            RateDecision::Deny {
                retry_after: elapsed_since(now, self.reset_at),
            }
        }
    }

    fn snapshot(&self, now: DateTime<Utc>) -> RateLimitSnapshot {
        if now >= self.reset_at {
            RateLimitSnapshot {
                limit: self.limit,
                remaining: self.limit,
                window_reset_at: now + to_chrono(self.length),
            }
        } else {
            RateLimitSnapshot {
                limit: self.limit,
                remaining: self.remaining,
                window_reset_at: self.reset_at,
            }
        }
    }
}

/// Per-provider fixed-window rate limiter.
///
/// Windows are created on demand, from the configured [`RateLimit`] when the
/// provider has one and from [`RateLimit::default`] otherwise.
#[derive(Default)]
pub struct RateLimiter {
    windows: DashMap<String, Window>,
    configs: DashMap<String, RateLimit>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the quota for a provider, discarding its current window.
    pub fn configure(&self, provider: &str, limit: RateLimit) {
        debug!(
            "Rate limiter: '{}' allows {} requests per {:?}",
            provider, limit.requests, limit.window
        );
        self.configs.insert(provider.to_string(), limit);
        self.windows.remove(provider);
    }

    /// Consume one request from the provider's quota if any is left.
    pub fn try_consume(&self, provider: &str, now: DateTime<Utc>) -> RateDecision {
        let mut window = self
            .windows
            .entry(provider.to_string())
            .or_insert_with(|| Window::new(&self.config_for(provider), now));

        let decision = window.try_consume(now);
        if let RateDecision::Deny { retry_after } = decision {
            debug!(
                "Rate limiter: '{}' exhausted, resets in {:?}",
                provider, retry_after
            );
        }
        decision
    }

    /// Apply a provider-reported remaining quota. Can only lower `remaining`.
    pub fn observe_remaining(&self, provider: &str, remaining: u32, now: DateTime<Utc>) {
        let mut window = self
            .windows
            .entry(provider.to_string())
            .or_insert_with(|| Window::new(&self.config_for(provider), now));

        window.roll(now);
        if remaining < window.remaining {
            window.remaining = remaining;
        }
    }

    pub fn snapshot(&self, provider: &str, now: DateTime<Utc>) -> RateLimitSnapshot {
        match self.windows.get(provider) {
            Some(window) => window.snapshot(now),
            None => Window::new(&self.config_for(provider), now).snapshot(now),
        }
    }

    /// Restore the provider's full quota.
    pub fn reset(&self, provider: &str) {
        self.windows.remove(provider);
    }

    fn config_for(&self, provider: &str) -> RateLimit {
        self.configs
            .get(provider)
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}
