/// Classification for retry policy.
///
/// Used by the coordinator to decide whether a failed invocation should be
/// repeated against the same provider before failing over.
///
/// # Behavior Summary
///
/// | Class | Retry same provider? | Delay source |
/// |-------|---------------------|--------------|
/// | `WithBackoff` | Yes, up to the attempt budget | Exponential backoff with jitter |
/// | `AfterRetryAfter` | Only if the wait fits the caller's deadline | Provider's `Retry-After` |
/// | `Never` | No, fail over immediately | - |
///
/// Whether a provider is also placed in cooldown once the coordinator gives up
/// on it is a separate question answered by
/// [`ProviderErrorKind::marks_temporary_failure`](super::ProviderErrorKind::marks_temporary_failure).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryClass {
    /// Transient failure (timeout, network, 5xx). Retry with exponential backoff.
    WithBackoff,

    /// The provider throttled us (HTTP 429).
    ///
    /// Retrying is only worthwhile when the provider's requested wait still
    /// leaves room inside the caller's deadline; otherwise the failure is
    /// treated as hard for this provider and failover proceeds at once.
    AfterRetryAfter,

    /// Never retry against this provider - bad credentials, bad request,
    /// unsupported operation or an unclassified failure.
    Never,
}
