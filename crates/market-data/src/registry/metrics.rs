//! Per-provider performance tracking.
//!
//! Response time and error rate are kept as exponentially weighted moving
//! averages. The first sample initializes the average.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Observed performance of one provider.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    /// EWMA of successful response times. `None` until the first success.
    pub avg_response_time_ms: Option<f64>,
    /// EWMA of failures over all invocations (0.0 to 1.0).
    pub error_rate: Option<f64>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl PerformanceMetrics {
    fn observe_error(&mut self, alpha: f64, failed: bool) {
        let sample = if failed { 1.0 } else { 0.0 };
        self.error_rate = Some(ewma(self.error_rate, sample, alpha));
        self.total_requests += 1;
    }
}

fn ewma(previous: Option<f64>, sample: f64, alpha: f64) -> f64 {
    match previous {
        None => sample,
        Some(avg) => alpha * sample + (1.0 - alpha) * avg,
    }
}

/// Tracks [`PerformanceMetrics`] for every provider that has been invoked.
pub struct PerformanceTracker {
    alpha: f64,
    metrics: DashMap<String, PerformanceMetrics>,
}

impl PerformanceTracker {
    /// `alpha` is the EWMA smoothing factor in `(0, 1]`.
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            metrics: DashMap::new(),
        }
    }

    pub fn record_success(&self, provider: &str, latency: Duration, now: DateTime<Utc>) {
        let mut entry = self.metrics.entry(provider.to_string()).or_default();
        let latency_ms = latency.as_secs_f64() * 1_000.0;

        entry.avg_response_time_ms = Some(ewma(entry.avg_response_time_ms, latency_ms, self.alpha));
        entry.observe_error(self.alpha, false);
        entry.successful_requests += 1;
        entry.last_success = Some(now);
    }

    pub fn record_failure(&self, provider: &str, now: DateTime<Utc>) {
        let mut entry = self.metrics.entry(provider.to_string()).or_default();

        entry.observe_error(self.alpha, true);
        entry.failed_requests += 1;
        entry.last_failure = Some(now);
    }

    pub fn get(&self, provider: &str) -> Option<PerformanceMetrics> {
        self.metrics.get(provider).map(|m| m.clone())
    }

    pub fn avg_response_time_ms(&self, provider: &str) -> Option<f64> {
        self.metrics
            .get(provider)
            .and_then(|m| m.avg_response_time_ms)
    }

    pub fn error_rate(&self, provider: &str) -> Option<f64> {
        self.metrics.get(provider).and_then(|m| m.error_rate)
    }

    pub fn snapshot(&self) -> HashMap<String, PerformanceMetrics> {
        self.metrics
            .iter()
            .map(|m| (m.key().clone(), m.value().clone()))
            .collect()
    }
}
