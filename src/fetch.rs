use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::{BreakerConfig, RetryConfig};
use crate::retry::{with_retry, CircuitBreaker, RetryPolicy};
use crate::store::CachedResponse;

/// Upstream fetch failure taxonomy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Transport-level failure (connect, DNS, broken pipe...)
    Transport(String),
    /// Non-2xx HTTP status
    Status(u16),
    /// Attempt timed out
    Timeout,
    /// Short-circuited without touching the network
    CircuitOpen,
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Network error: {}", e),
            Self::Status(code) => write!(f, "HTTP {}", code),
            Self::Timeout => write!(f, "Request timed out"),
            Self::CircuitOpen => write!(f, "Circuit breaker is OPEN"),
        }
    }
}

impl std::error::Error for FetchError {}

impl FetchError {
    /// Default retry classification: transient failures only.
    /// 5xx, 429 and 408 are transient; other 4xx are permanent; an open
    /// breaker is deliberate fail-fast and must not be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout => true,
            Self::Status(code) => *code >= 500 || *code == 429 || *code == 408,
            Self::CircuitOpen => false,
        }
    }
}

/// Seam between the strategy engine / preloader and the network
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<CachedResponse, FetchError>;
}

/// Plain reqwest-backed upstream client (single attempt, no retry)
pub struct UpstreamClient {
    client: reqwest::Client,
    attempt_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(retry: &RetryConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            attempt_timeout: Duration::from_millis(retry.attempt_timeout_ms),
        })
    }
}

// Hop-by-hop headers never make sense inside a cached entry
const SKIPPED_HEADERS: &[&str] = &["connection", "transfer-encoding", "content-length", "keep-alive"];

#[async_trait]
impl Fetch for UpstreamClient {
    async fn fetch(&self, url: &str) -> Result<CachedResponse, FetchError> {
        let response = self
            .client
            .get(url)
            .timeout(self.attempt_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Transport(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(FetchError::Status(status));
        }

        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter(|(name, _)| !SKIPPED_HEADERS.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?
            .to_vec();

        debug!("Fetched {} ({} bytes)", url, body.len());
        Ok(CachedResponse { status, headers, body })
    }
}

/// Retry + circuit-breaker wrapper around any `Fetch` impl.
/// One breaker per upstream origin, created on first use.
pub struct ResilientFetcher {
    inner: Arc<dyn Fetch>,
    policy: RetryPolicy,
    breaker_config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    fetches: AtomicU64,
    retries: AtomicU64,
    exhausted: AtomicU64,
}

impl ResilientFetcher {
    pub fn new(inner: Arc<dyn Fetch>, retry: &RetryConfig, breaker: &BreakerConfig) -> Self {
        Self {
            inner,
            policy: RetryPolicy::from_config(retry),
            breaker_config: breaker.clone(),
            breakers: DashMap::new(),
            fetches: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        }
    }

    fn breaker_for(&self, url: &str) -> Arc<CircuitBreaker> {
        let origin = origin_of(url);
        self.breakers
            .entry(origin)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(&self.breaker_config)))
            .clone()
    }

    pub fn get_stats(&self) -> serde_json::Value {
        let breakers: Vec<serde_json::Value> = self
            .breakers
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "origin": entry.key(),
                    "state": entry.value().state_name(),
                    "failures": entry.value().failures(),
                    "trips": entry.value().trips(),
                })
            })
            .collect();
        serde_json::json!({
            "fetches": self.fetches.load(Ordering::Relaxed),
            "retries": self.retries.load(Ordering::Relaxed),
            "exhausted": self.exhausted.load(Ordering::Relaxed),
            "breakers": breakers,
        })
    }

    fn map_retry(
        &self,
        result: Result<crate::retry::RetryOutcome<CachedResponse>, crate::retry::RetryError>,
        url: &str,
    ) -> Result<CachedResponse, FetchError> {
        match result {
            Ok(outcome) => {
                if outcome.attempts > 1 {
                    self.retries
                        .fetch_add(outcome.attempts as u64 - 1, Ordering::Relaxed);
                    debug!(
                        "Fetched {} after {} attempts ({:?})",
                        url, outcome.attempts, outcome.total_time
                    );
                }
                Ok(outcome.data)
            }
            Err(e) => {
                if e.attempts > 1 {
                    self.retries
                        .fetch_add(e.attempts as u64 - 1, Ordering::Relaxed);
                }
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Fetch failed for {} after {} attempts ({:?}): {}",
                    url, e.attempts, e.elapsed, e.last_error
                );
                Err(e.last_error)
            }
        }
    }
}

#[async_trait]
impl Fetch for ResilientFetcher {
    async fn fetch(&self, url: &str) -> Result<CachedResponse, FetchError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let attempt = || self.inner.fetch(url);

        if self.breaker_config.enabled {
            let breaker = self.breaker_for(url);
            breaker
                .call(|| async { self.map_retry(with_retry(&self.policy, attempt).await, url) })
                .await
        } else {
            self.map_retry(with_retry(&self.policy, attempt).await, url)
        }
    }
}

/// "scheme://host[:port]" part of a URL, used as the breaker key
fn origin_of(url: &str) -> String {
    if let Some(scheme_end) = url.find("://") {
        let rest = &url[scheme_end + 3..];
        let host_end = rest.find('/').unwrap_or(rest.len());
        return url[..scheme_end + 3 + host_end].to_string();
    }
    url.to_string()
}
