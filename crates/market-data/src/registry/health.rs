//! Periodic provider health probing.
//!
//! The monitor runs on its own task and only ever writes health records. It
//! never takes part in serving requests, so a slow or hung probe cannot hold
//! up [`execute`](super::FailoverCoordinator::execute).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::errors::{ProviderError, ProviderErrorKind};
use crate::provider::MarketDataProvider;

/// Number of recent probes used for the uptime ratio.
const UPTIME_WINDOW: usize = 100;

/// Health classification from the latest probe.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Not probed yet.
    #[default]
    Unknown,
    Online,
    /// Answering, but slowly or under throttling.
    Degraded,
    Offline,
}

/// Probe history for one provider.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    /// Share of successful probes over the recent window (0.0 to 1.0).
    pub uptime: f64,
    #[serde(skip)]
    recent: VecDeque<bool>,
}

impl ProviderHealth {
    fn record(&mut self, outcome: &ProbeOutcome, now: DateTime<Utc>) {
        self.status = outcome.status;
        self.last_check = Some(now);
        self.last_latency_ms = Some(outcome.latency.as_millis() as u64);
        self.last_error = outcome.error.clone();

        let answered = outcome.status != HealthStatus::Offline;
        if answered {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }

        self.recent.push_back(answered);
        if self.recent.len() > UPTIME_WINDOW {
            self.recent.pop_front();
        }
        let up = self.recent.iter().filter(|ok| **ok).count();
        self.uptime = up as f64 / self.recent.len() as f64;
    }
}

/// Probe timing thresholds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthSettings {
    pub probe_timeout: Duration,
    pub degraded_latency: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(10),
            degraded_latency: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct ProbeOutcome {
    status: HealthStatus,
    latency: Duration,
    error: Option<String>,
}

fn classify(
    result: Result<Result<(), ProviderError>, time::error::Elapsed>,
    latency: Duration,
    settings: &HealthSettings,
) -> ProbeOutcome {
    let (status, error) = match result {
        Ok(Ok(())) if latency > settings.degraded_latency => (HealthStatus::Degraded, None),
        Ok(Ok(())) => (HealthStatus::Online, None),
        Ok(Err(e)) if matches!(e.kind, ProviderErrorKind::RateLimited { .. }) => {
            (HealthStatus::Degraded, Some(e.to_string()))
        }
        Ok(Err(e)) => (HealthStatus::Offline, Some(e.to_string())),
        Err(_) => (
            HealthStatus::Offline,
            Some(format!("probe timed out after {:?}", settings.probe_timeout)),
        ),
    };

    ProbeOutcome {
        status,
        latency,
        error,
    }
}

struct MonitorInner {
    providers: Vec<Arc<dyn MarketDataProvider>>,
    health: DashMap<String, ProviderHealth>,
    settings: HealthSettings,
    clock: Arc<dyn Clock>,
}

impl MonitorInner {
    async fn probe_all(&self) {
        let probes = self.providers.iter().map(|provider| async move {
            let started = Instant::now();
            let result = time::timeout(self.settings.probe_timeout, provider.probe()).await;
            let outcome = classify(result, started.elapsed(), &self.settings);
            (provider.id(), outcome)
        });

        for (id, outcome) in join_all(probes).await {
            if outcome.status == HealthStatus::Offline {
                warn!(
                    "Health probe for '{}' failed: {}",
                    id,
                    outcome.error.as_deref().unwrap_or("unknown")
                );
            } else {
                debug!(
                    "Health probe for '{}': {:?} in {:?}",
                    id, outcome.status, outcome.latency
                );
            }

            let now = self.clock.now();
            self.health
                .entry(id.to_string())
                .or_default()
                .record(&outcome, now);
        }
    }
}

/// Owns the periodic probe task and the health records it produces.
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        providers: Vec<Arc<dyn MarketDataProvider>>,
        settings: HealthSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                providers,
                health: DashMap::new(),
                settings,
                clock,
            }),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(|poisoned| {
            warn!("Health monitor mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Spawn the probe loop. The first round runs one `interval` after start;
    /// `on_tick` runs after every round.
    ///
    /// Must be called from within a tokio runtime. Does nothing if the loop
    /// is already running or the monitor was stopped.
    pub fn start<F>(&self, interval: Duration, on_tick: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut handle = self.lock_handle();
        if handle.is_some() || self.cancel.is_cancelled() {
            return;
        }

        info!(
            "Health monitor starting: {} providers every {:?}",
            self.inner.providers.len(),
            interval
        );

        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();

        *handle = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Health monitor cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = inner.probe_all() => on_tick(),
                        }
                    }
                }
            }
        }));
    }

    /// Run one probe round now, outside the periodic schedule.
    pub async fn check_now(&self) {
        self.inner.probe_all().await;
    }

    pub fn is_running(&self) -> bool {
        self.lock_handle()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Cancel the probe loop and wait for it to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.lock_handle().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Health monitor task ended abnormally: {}", e);
            }
            info!("Health monitor stopped");
        }
    }

    pub fn status(&self, provider: &str) -> HealthStatus {
        self.inner
            .health
            .get(provider)
            .map(|h| h.status)
            .unwrap_or_default()
    }

    pub fn health(&self, provider: &str) -> Option<ProviderHealth> {
        self.inner.health.get(provider).map(|h| h.clone())
    }

    pub fn snapshot(&self) -> HashMap<String, ProviderHealth> {
        self.inner
            .health
            .iter()
            .map(|h| (h.key().clone(), h.value().clone()))
            .collect()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
