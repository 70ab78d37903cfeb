//! Provider registry module.
//!
//! This module provides orchestration for market data providers, including:
//! - Provider ordering and failover with cooldowns
//! - Rate limiting per provider
//! - Retry with exponential backoff
//! - Performance tracking and periodic health probing

mod coordinator;
mod failover_state;
mod health;
mod metrics;
mod rate_limiter;
mod retry;
mod skip_reason;

pub use coordinator::{FailoverCoordinator, ProviderStatus};
pub use failover_state::{FailoverState, TemporaryFailure};
pub use health::{HealthMonitor, HealthSettings, HealthStatus, ProviderHealth};
pub use metrics::{PerformanceMetrics, PerformanceTracker};
pub use rate_limiter::{RateDecision, RateLimitSnapshot, RateLimiter};
pub use retry::{RetryDecision, RetryPolicy};
pub use skip_reason::{FetchDiagnostics, ProviderAttempt, SkipReason};
