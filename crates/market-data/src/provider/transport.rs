//! HTTP transport seam for provider adapters.
//!
//! Adapters talk to the network through [`HttpTransport`] so they can be
//! tested against canned responses. [`classify_status`] and
//! [`classify_transport_error`] give every adapter the same mapping from HTTP
//! outcomes to [`ProviderErrorKind`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

use crate::errors::ProviderErrorKind;

/// Default per-request timeout for the reqwest transport.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Outgoing GET request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl TransportRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }
}

/// Response as seen by an adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    /// Parsed `Retry-After` header, if present
    pub retry_after: Option<Duration>,
    /// Parsed `X-Ratelimit-Remaining` header, if present
    pub rate_limit_remaining: Option<u32>,
    pub body: String,
}

impl TransportResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            retry_after: None,
            rate_limit_remaining: None,
            body: body.into(),
        }
    }

    pub fn with_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            rate_limit_remaining: None,
            body: body.into(),
        }
    }

    pub fn with_remaining(mut self, remaining: u32) -> Self {
        self.rate_limit_remaining = Some(remaining);
        self
    }
}

/// Failures before an HTTP response was received.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Other(String),
}

/// HTTP-capable client handed to adapters.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// [`HttpTransport`] backed by a shared `reqwest::Client`.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self { client }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self.client.get(&request.url).query(&request.query);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        debug!(
            "HTTP GET {} with {} params",
            request.url,
            request.query.len()
        );

        let response = builder.send().await.map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));
        let rate_limit_remaining = response
            .headers()
            .get(RATE_LIMIT_REMAINING)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u32>().ok());

        let body = response.text().await.map_err(map_reqwest_error)?;

        Ok(TransportResponse {
            status,
            retry_after,
            rate_limit_remaining,
            body,
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() || e.is_request() || e.is_body() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

/// Map an HTTP status to a failure kind. `None` for success.
pub fn classify_status(status: u16, retry_after: Option<Duration>) -> Option<ProviderErrorKind> {
    match status {
        200..=299 => None,
        401 | 403 => Some(ProviderErrorKind::AuthInvalid),
        408 => Some(ProviderErrorKind::Timeout),
        429 => Some(ProviderErrorKind::RateLimited { retry_after }),
        400..=499 => Some(ProviderErrorKind::ClientError { code: status }),
        500..=599 => Some(ProviderErrorKind::ServiceUnavailable),
        _ => Some(ProviderErrorKind::Unknown),
    }
}

/// Map a transport failure to a failure kind.
pub fn classify_transport_error(error: &TransportError) -> ProviderErrorKind {
    match error {
        TransportError::Timeout => ProviderErrorKind::Timeout,
        TransportError::Connect(_) => ProviderErrorKind::NetworkError,
        TransportError::Other(_) => ProviderErrorKind::Unknown,
    }
}

/// Parse a `Retry-After` header: delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|at| (at.with_timezone(&Utc) - now).to_std().unwrap_or(Duration::ZERO))
}

/// Cut `text` to at most `max_chars` characters for log and error messages.
pub(crate) fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
