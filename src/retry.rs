use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{BreakerConfig, RetryConfig};
use crate::fetch::FetchError;

/// Exponential backoff retry - どんな相手も三回までは信じる
///
/// Pure control flow: no side effects beyond the wrapped operation.
/// Delay formula: min(initial * multiplier^(attempt-1), max), then
/// optional ±25% jitter.

#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    /// Per-attempt timeout; None leaves the operation unbounded
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            attempt_timeout: None,
        }
    }
}

pub type RetryPredicate = Arc<dyn Fn(&FetchError, u32) -> bool + Send + Sync>;
pub type RetryHook = Arc<dyn Fn(&FetchError, u32) + Send + Sync>;

/// Options plus the pluggable retry predicate and observation hooks
#[derive(Clone)]
pub struct RetryPolicy {
    pub options: RetryOptions,
    pub should_retry: RetryPredicate,
    pub on_retry: Option<RetryHook>,
    pub on_exhausted: Option<RetryHook>,
}

impl RetryPolicy {
    pub fn new(options: RetryOptions) -> Self {
        Self {
            options,
            should_retry: Arc::new(|e, _remaining| e.is_retryable()),
            on_retry: None,
            on_exhausted: None,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(RetryOptions {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            jitter: config.jitter,
            attempt_timeout: Some(Duration::from_millis(config.attempt_timeout_ms)),
        })
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.options.initial_delay.as_millis() as f64
            * self.options.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.options.max_delay.as_millis() as f64);
        let jittered = if self.options.jitter {
            capped * (1.0 + (rand::random::<f64>() - 0.5) * 0.5)
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub data: T,
    pub attempts: u32,
    pub total_time: Duration,
}

/// Raised once retries are exhausted (or the error is not retryable)
#[derive(Debug, Clone)]
pub struct RetryError {
    pub last_error: FetchError,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl std::fmt::Display for RetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Operation failed after {} attempt(s) in {:?}: {}",
            self.attempts, self.elapsed, self.last_error
        )
    }
}

impl std::error::Error for RetryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last_error)
    }
}

/// Run `op` up to `max_retries` attempts with exponential backoff.
/// The predicate sees the error and the number of attempts still
/// available; returning false surfaces the error immediately.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<RetryOutcome<T>, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let start = Instant::now();
    let max_attempts = policy.options.max_retries.max(1);

    let mut attempt = 0;
    loop {
        attempt += 1;

        let result = match policy.options.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(r) => r,
                Err(_) => Err(FetchError::Timeout),
            },
            None => op().await,
        };

        match result {
            Ok(data) => {
                return Ok(RetryOutcome {
                    data,
                    attempts: attempt,
                    total_time: start.elapsed(),
                });
            }
            Err(e) => {
                let remaining = max_attempts - attempt;
                if remaining == 0 || !(policy.should_retry)(&e, remaining) {
                    if let Some(hook) = &policy.on_exhausted {
                        hook(&e, attempt);
                    }
                    return Err(RetryError {
                        last_error: e,
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    });
                }

                let delay = policy.delay_for(attempt);
                debug!("Attempt {} failed ({}), retrying in {:?}", attempt, e, delay);
                if let Some(hook) = &policy.on_retry {
                    hook(&e, attempt);
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

/// Fail-fast guard per upstream dependency.
///
/// CLOSED allows calls; `threshold` consecutive failures open the
/// breaker; while OPEN every call fails synchronously with
/// "Circuit breaker is OPEN"; after `reset_timeout` exactly one
/// HALF_OPEN probe decides whether to close or re-open.
pub struct CircuitBreaker {
    threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
    trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            threshold: config.threshold.max(1),
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
            trips: AtomicU64::new(0),
        }
    }

    /// Check admission without performing any I/O
    pub fn try_acquire(&self) -> Result<(), FetchError> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let cooled = inner
                    .last_failure
                    .map(|t| t.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    debug!("Circuit breaker HALF_OPEN, allowing one probe");
                    Ok(())
                } else {
                    Err(FetchError::CircuitOpen)
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(FetchError::CircuitOpen)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.failures = 0;
        inner.probe_in_flight = false;
        if inner.state != BreakerState::Closed {
            debug!("Circuit breaker CLOSED");
        }
        inner.state = BreakerState::Closed;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        inner.last_failure = Some(Instant::now());
        let was_half_open = inner.state == BreakerState::HalfOpen;
        inner.probe_in_flight = false;
        if was_half_open || inner.failures >= self.threshold {
            if inner.state != BreakerState::Open {
                self.trips.fetch_add(1, Ordering::Relaxed);
                warn!("Circuit breaker OPEN ({} consecutive failures)", inner.failures);
            }
            inner.state = BreakerState::Open;
        }
    }

    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        self.try_acquire()?;
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn state_name(&self) -> &'static str {
        match self.state() {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }

    pub fn failures(&self) -> u32 {
        self.inner.lock().failures
    }

    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn quick_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryOptions {
            max_retries,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            jitter: false,
            attempt_timeout: None,
        })
    }

    fn breaker_config(threshold: u32, reset_ms: u64) -> BreakerConfig {
        BreakerConfig {
            enabled: true,
            threshold,
            reset_timeout_ms: reset_ms,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();

        let outcome = with_retry(&quick_policy(3), move || {
            let calls = calls_op.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(FetchError::Status(503))
                } else {
                    Ok("data")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(outcome.data, "data");
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();

        let err = with_retry(&quick_policy(3), move || {
            let calls = calls_op.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(FetchError::Status(404))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 1);
        assert_eq!(err.last_error, FetchError::Status(404));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let err = with_retry(&quick_policy(3), || async {
            Err::<(), _>(FetchError::Timeout)
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_error, FetchError::Timeout);
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let policy = RetryPolicy::new(RetryOptions {
            max_retries: 10,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(3000),
            backoff_multiplier: 2.0,
            jitter: false,
            attempt_timeout: None,
        });
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(3000));
        assert_eq!(policy.delay_for(8), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(&breaker_config(3, 60_000));
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let _ = breaker
                .call(|| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(FetchError::Status(500))
                })
                .await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Next call is short-circuited without invoking the operation
        let calls_probe = calls.clone();
        let err = breaker
            .call(|| async move {
                calls_probe.fetch_add(1, Ordering::SeqCst);
                Ok::<_, FetchError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_half_open_probe_closes_on_success() {
        let breaker = CircuitBreaker::new(&breaker_config(1, 1000));
        let _ = breaker
            .call(|| async { Err::<(), _>(FetchError::Timeout) })
            .await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_millis(1001)).await;

        let value = breaker.call(|| async { Ok::<_, FetchError>(42) }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_half_open_probe_reopens_on_failure() {
        let breaker = CircuitBreaker::new(&breaker_config(1, 1000));
        let _ = breaker
            .call(|| async { Err::<(), _>(FetchError::Timeout) })
            .await;

        tokio::time::advance(Duration::from_millis(1001)).await;

        let _ = breaker
            .call(|| async { Err::<(), _>(FetchError::Timeout) })
            .await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_allows_single_probe() {
        let breaker = CircuitBreaker::new(&breaker_config(1, 1000));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_millis(1001)).await;

        // First acquire transitions to HALF_OPEN, second is rejected
        // while the probe is still in flight
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert_eq!(breaker.try_acquire().unwrap_err(), FetchError::CircuitOpen);
    }
}
