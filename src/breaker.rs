//! Circuit breaker guarding calls to one remote address.
//!
//! - CLOSED: requests flow through; outcomes are counted in a rolling window
//!   of ten one-second buckets
//! - OPEN: requests are rejected until the sleep window has elapsed
//! - HALF_OPEN: exactly one trial request is let through; its outcome closes
//!   or re-opens the circuit
//!
//! Breakers are shared per address across every client in the process via
//! [`breaker_for`].

use std::future::Future;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::error::{Result, RpcError};

/// Buckets in the rolling health window.
pub const WINDOW_BUCKETS: usize = 10;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests flow through.
    Closed,
    /// Failing - requests are rejected immediately.
    Open,
    /// Testing recovery - one trial request allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    second: u64,
    successes: u64,
    failures: u64,
}

/// Per-second success/failure counts over the last [`WINDOW_BUCKETS`] seconds.
#[derive(Debug, Default)]
struct RollingWindow {
    buckets: [Bucket; WINDOW_BUCKETS],
}

impl RollingWindow {
    fn bucket(&mut self, second: u64) -> &mut Bucket {
        let bucket = &mut self.buckets[(second % WINDOW_BUCKETS as u64) as usize];
        if bucket.second != second {
            *bucket = Bucket {
                second,
                ..Bucket::default()
            };
        }
        bucket
    }

    fn record(&mut self, second: u64, success: bool) {
        let bucket = self.bucket(second);
        if success {
            bucket.successes += 1;
        } else {
            bucket.failures += 1;
        }
    }

    /// (requests, failures) within the window ending at `second`.
    fn totals(&self, second: u64) -> (u64, u64) {
        let oldest = second.saturating_sub(WINDOW_BUCKETS as u64 - 1);
        self.buckets
            .iter()
            .filter(|b| b.second >= oldest && b.second <= second)
            .fold((0, 0), |(total, failed), b| {
                (total + b.successes + b.failures, failed + b.failures)
            })
    }

    fn reset(&mut self) {
        self.buckets = [Bucket::default(); WINDOW_BUCKETS];
    }
}

struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    window: RollingWindow,
}

enum Outcome {
    Success,
    Failure,
    Ignored,
}

/// Statistics about a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    /// Address this breaker protects.
    pub addr: String,
    /// State at the time of the snapshot.
    pub state: CircuitState,
    /// Requests in the rolling window.
    pub requests: u64,
    /// Failures in the rolling window.
    pub failures: u64,
}

/// Circuit breaker for one remote address.
pub struct CircuitBreaker {
    addr: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    concurrency: Semaphore,
    epoch: Instant,
}

impl CircuitBreaker {
    /// Create a standalone breaker. Clients share breakers through [`breaker_for`].
    pub fn new(addr: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            addr: addr.into(),
            concurrency: Semaphore::new(config.max_concurrent_requests),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
                trial_in_flight: false,
                window: RollingWindow::default(),
            }),
            epoch: Instant::now(),
        }
    }

    /// Address this breaker protects.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Current state. An open breaker whose sleep window elapsed still reports
    /// `Open` until a request claims the trial.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Snapshot of the current window.
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        let (requests, failures) = inner.window.totals(self.second());
        CircuitBreakerStats {
            addr: self.addr.clone(),
            state: inner.state,
            requests,
            failures,
        }
    }

    /// Run `call` under the breaker.
    ///
    /// # Errors
    ///
    /// [`RpcError::CircuitOpen`] without running `call` when the circuit is
    /// open, [`RpcError::MaxConcurrency`] when too many calls are in flight,
    /// [`RpcError::BreakerTimeout`] when `call` exceeds the breaker timeout,
    /// otherwise whatever `call` returns.
    pub async fn run<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self.concurrency.try_acquire().map_err(|_| RpcError::MaxConcurrency {
            addr: self.addr.clone(),
        })?;

        let trial = self.allow()?;

        let result = match tokio::time::timeout(self.config.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::BreakerTimeout {
                addr: self.addr.clone(),
            }),
        };

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(RpcError::ContextCanceled) => Outcome::Ignored,
            Err(_) => Outcome::Failure,
        };
        self.record(trial, outcome);

        result
    }

    /// Admit a request. Returns whether it is the half-open trial.
    fn allow(&self) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let slept = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.config.sleep_window);
                if slept && !inner.trial_in_flight {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    debug!(addr = %self.addr, "Circuit breaker entering HALF_OPEN");
                    Ok(true)
                } else {
                    Err(self.open_error())
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(self.open_error())
                } else {
                    inner.trial_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn record(&self, trial: bool, outcome: Outcome) {
        let second = self.second();
        let mut inner = self.inner.lock();

        if trial {
            inner.trial_in_flight = false;
            match outcome {
                Outcome::Success => {
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                    inner.window.reset();
                    info!(addr = %self.addr, "Circuit breaker recovered to CLOSED");
                }
                Outcome::Failure => {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(addr = %self.addr, "Circuit breaker trial failed, re-opened");
                }
                Outcome::Ignored => {}
            }
            return;
        }

        match outcome {
            Outcome::Success => inner.window.record(second, true),
            Outcome::Failure => {
                inner.window.record(second, false);
                let (requests, failures) = inner.window.totals(second);
                if inner.state == CircuitState::Closed && self.should_trip(requests, failures) {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(addr = %self.addr, requests, failures, "Circuit breaker opened");
                }
            }
            Outcome::Ignored => {}
        }
    }

    fn should_trip(&self, requests: u64, failures: u64) -> bool {
        requests > 0
            && requests >= self.config.request_volume_threshold
            && failures * 100 >= u64::from(self.config.error_percent_threshold) * requests
    }

    fn second(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    fn open_error(&self) -> RpcError {
        RpcError::CircuitOpen {
            addr: self.addr.clone(),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

fn registry() -> &'static DashMap<String, Arc<CircuitBreaker>> {
    static BREAKERS: OnceLock<DashMap<String, Arc<CircuitBreaker>>> = OnceLock::new();
    BREAKERS.get_or_init(DashMap::new)
}

/// The process-wide breaker for `addr`, created with `config` on first use.
///
/// Later callers get the existing breaker; their config is ignored.
pub fn breaker_for(addr: &str, config: &BreakerConfig) -> Arc<CircuitBreaker> {
    if let Some(existing) = registry().get(addr) {
        return Arc::clone(existing.value());
    }
    registry()
        .entry(addr.to_string())
        .or_insert_with(|| Arc::new(CircuitBreaker::new(addr, config.clone())))
        .value()
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(volume: u64) -> BreakerConfig {
        BreakerConfig {
            timeout: Duration::from_secs(1),
            sleep_window: Duration::from_millis(500),
            max_concurrent_requests: 10,
            request_volume_threshold: volume,
            error_percent_threshold: 50,
        }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<()> {
        cb.run(async { Err::<(), _>(RpcError::ConnectionClosed) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<()> {
        cb.run(async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let cb = CircuitBreaker::new("a", config(3));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.stats().requests, 1);
    }

    #[tokio::test]
    async fn test_trips_on_error_rate_after_volume() {
        let cb = CircuitBreaker::new("a", config(4));

        succeed(&cb).await.unwrap();
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);

        // 4 requests, 3 failures: 75% >= 50%
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        let err = succeed(&cb).await.unwrap_err();
        assert!(matches!(err, RpcError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_low_error_rate_stays_closed() {
        let cb = CircuitBreaker::new("a", config(4));
        for _ in 0..3 {
            succeed(&cb).await.unwrap();
        }
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_success_closes() {
        let cb = CircuitBreaker::new("a", config(1));
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(600)).await;
        succeed(&cb).await.unwrap();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_failure_reopens() {
        let cb = CircuitBreaker::new("a", config(1));
        fail(&cb).await.unwrap_err();

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(matches!(fail(&cb).await, Err(RpcError::ConnectionClosed)));
        assert_eq!(cb.state(), CircuitState::Open);

        let err = succeed(&cb).await.unwrap_err();
        assert!(matches!(err, RpcError::CircuitOpen { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_trial_in_flight() {
        let cb = Arc::new(CircuitBreaker::new("a", config(1)));
        fail(&cb).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(600)).await;

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let cb = Arc::clone(&cb);
            tokio::spawn(async move {
                cb.run(async {
                    let _ = wait.await;
                    Ok(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let err = succeed(&cb).await.unwrap_err();
        assert!(matches!(err, RpcError::CircuitOpen { .. }));

        release.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancellation_not_counted() {
        let cb = CircuitBreaker::new("a", config(1));
        let err = cb
            .run(async { Err::<(), _>(RpcError::ContextCanceled) })
            .await
            .unwrap_err();

        assert!(matches!(err, RpcError::ContextCanceled));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout() {
        let cb = CircuitBreaker::new("a", config(100));
        let err = cb
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RpcError::BreakerTimeout { .. }));
        assert_eq!(cb.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_max_concurrency() {
        let cb = Arc::new(CircuitBreaker::new(
            "a",
            BreakerConfig {
                max_concurrent_requests: 1,
                ..config(100)
            },
        ));

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let busy = {
            let cb = Arc::clone(&cb);
            tokio::spawn(async move {
                cb.run(async {
                    let _ = wait.await;
                    Ok(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        let err = succeed(&cb).await.unwrap_err();
        assert!(matches!(err, RpcError::MaxConcurrency { .. }));

        release.send(()).unwrap();
        busy.await.unwrap().unwrap();
        assert!(succeed(&cb).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_forgets_old_buckets() {
        let cb = CircuitBreaker::new("a", config(3));
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();

        tokio::time::sleep(Duration::from_secs(11)).await;
        fail(&cb).await.unwrap_err();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().requests, 1);
    }

    #[test]
    fn test_registry_shares_per_address() {
        let a = breaker_for("registry-test:1", &BreakerConfig::default());
        let b = breaker_for("registry-test:1", &config(1));
        let c = breaker_for("registry-test:2", &BreakerConfig::default());

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
    }
}
