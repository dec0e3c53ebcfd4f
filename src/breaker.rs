//! Per-service circuit breakers around external calls.
//!
//! One breaker per logical external service (`<platform>_api`). Every
//! wrapped call runs under the breaker's request timeout; a timeout counts
//! as a failure. After `failure_threshold` consecutive failures the breaker
//! opens and rejects calls until `reset_timeout` elapses, then lets a single
//! probe through in half-open state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Time spent open before allowing a half-open probe.
    pub reset_timeout: Duration,
    /// Hard deadline applied to every wrapped call.
    pub request_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BreakerMetrics {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub rejected: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    next_attempt: Option<Instant>,
    probe_in_flight: bool,
    metrics: BreakerMetrics,
}

pub struct CircuitBreaker {
    service: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                next_attempt: None,
                probe_in_flight: false,
                metrics: BreakerMetrics::default(),
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock").state
    }

    pub fn metrics(&self) -> BreakerMetrics {
        self.inner.lock().expect("breaker lock").metrics
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    /// Run `fut` under the breaker. Rejected immediately with `CircuitOpen`
    /// while open; the call itself is bounded by the request timeout.
    pub async fn call<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.admit()?;

        let outcome = tokio::time::timeout(self.config.request_timeout, fut).await;
        match outcome {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure();
                Err(err)
            }
            Err(_) => {
                self.record_failure();
                Err(CoreError::Timeout {
                    service: self.service.clone(),
                })
            }
        }
    }

    /// Like [`CircuitBreaker::call`], but a failure is handed to `fallback`
    /// instead of propagating.
    pub async fn call_with_fallback<F, T, FB>(&self, fut: F, fallback: FB) -> T
    where
        F: Future<Output = Result<T>>,
        FB: FnOnce(CoreError) -> T,
    {
        match self.call(fut).await {
            Ok(value) => value,
            Err(err) => fallback(err),
        }
    }

    fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::Closed => {}
            BreakerState::Open => {
                let due = inner
                    .next_attempt
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(true);
                if due {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(service = %self.service, "Circuit half-open, probing");
                } else {
                    inner.metrics.rejected += 1;
                    debug!(service = %self.service, "Circuit open, rejecting call");
                    return Err(CoreError::CircuitOpen {
                        service: self.service.clone(),
                    });
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    inner.metrics.rejected += 1;
                    debug!(service = %self.service, "Probe in flight, rejecting call");
                    return Err(CoreError::CircuitOpen {
                        service: self.service.clone(),
                    });
                }
                inner.probe_in_flight = true;
            }
        }
        inner.metrics.total += 1;
        Ok(())
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.metrics.success += 1;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if inner.state != BreakerState::Closed {
            info!(service = %self.service, "Circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.next_attempt = None;
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.metrics.failed += 1;
        inner.probe_in_flight = false;

        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.next_attempt = Some(Instant::now() + self.config.reset_timeout);
                warn!(service = %self.service, "Probe failed, circuit re-opened");
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.next_attempt = Some(Instant::now() + self.config.reset_timeout);
                    warn!(
                        service = %self.service,
                        failures = inner.consecutive_failures,
                        "Failure threshold reached, circuit opened"
                    );
                }
            }
            BreakerState::Open => {}
        }
    }
}

/// Hands out one breaker per service name, creating on first use.
#[derive(Default)]
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        self.get_with(service, None)
    }

    /// Fetch a breaker, applying `config` only on first creation.
    pub fn get_with(&self, service: &str, config: Option<BreakerConfig>) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().expect("registry lock").get(service) {
            return Arc::clone(existing);
        }
        let mut map = self.breakers.write().expect("registry lock");
        Arc::clone(map.entry(service.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                service,
                config.unwrap_or_else(|| self.default_config.clone()),
            ))
        }))
    }

    pub fn snapshot(&self) -> HashMap<String, (BreakerState, BreakerMetrics)> {
        self.breakers
            .read()
            .expect("registry lock")
            .iter()
            .map(|(name, b)| (name.clone(), (b.state(), b.metrics())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(50),
            request_timeout: Duration::from_millis(100),
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .call(async { Err::<(), _>(CoreError::transient("boom")) })
            .await;
    }

    #[tokio::test]
    async fn opens_after_threshold() {
        let breaker = CircuitBreaker::new("telegram_api", fast_config());
        for _ in 0..2 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn open_rejects_without_calling() {
        let breaker = CircuitBreaker::new("telegram_api", fast_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }

        let mut called = false;
        let result = breaker
            .call(async {
                called = true;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(CoreError::CircuitOpen { .. })));
        assert!(!called);
        assert_eq!(breaker.metrics().rejected, 1);
    }

    #[tokio::test]
    async fn half_open_probe_closes_on_success() {
        let breaker = CircuitBreaker::new("telegram_api", fast_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        breaker.call(async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.metrics().success, 1);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new("telegram_api", fast_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        // Timer was reset: still rejecting immediately after the failed probe.
        let result = breaker.call(async { Ok(()) }).await;
        assert!(matches!(result, Err(CoreError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new("signal_api", fast_config());
        let result = breaker
            .call(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(CoreError::Timeout { .. })));
        assert_eq!(breaker.metrics().failed, 1);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new("telegram_api", fast_config());
        fail(&breaker).await;
        fail(&breaker).await;
        breaker.call(async { Ok(()) }).await.unwrap();
        fail(&breaker).await;
        fail(&breaker).await;
        // Two failures after a success: still under the threshold.
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn fallback_receives_error() {
        let breaker = CircuitBreaker::new("telegram_api", fast_config());
        let value = breaker
            .call_with_fallback(
                async { Err::<i32, _>(CoreError::transient("boom")) },
                |_err| -1,
            )
            .await;
        assert_eq!(value, -1);
    }

    #[tokio::test]
    async fn registry_reuses_instances() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        let a = registry.get("discord_api");
        let b = registry.get("discord_api");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.snapshot().len(), 1);
    }
}
