//! Bank Registry Circuit Breaker
//!
//! Shields batch enrichment from an unreliable registry.
//!
//! ```text
//! CLOSED --(failure_threshold failures)--> OPEN
//! OPEN --(timeout elapsed, next query)--> HALF_OPEN
//! HALF_OPEN --(probe success)--> CLOSED
//! HALF_OPEN --(probe failure)--> OPEN
//! ```
//!
//! While OPEN, and in HALF_OPEN once the probe budget is spent, calls are
//! served from the bank info cache without touching the registry.
//!
//! All counters are atomics. Only the caller that wins the
//! `compare_exchange` performs a state transition; losers observe the
//! post-transition state.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mockable::Clock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::IngestionError;
use super::failure::FailureCategory;
use super::ports::{BankInfoCache, BankRegistryClient};
use super::types::{BankId, BankInfo};

/// Default bound on a single registry call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `circuit-breaker` configuration section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout_duration_seconds: u64,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_duration_seconds: 60,
            half_open_max_calls: 3,
        }
    }
}

/// Point-in-time view of the breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_call_count: u32,
    /// Epoch millis of the last failure, 0 if none
    pub last_failure_time_ms: i64,
    pub failure_threshold: u32,
    pub timeout_duration_seconds: u64,
}

impl CircuitBreakerMetrics {
    pub fn is_healthy(&self) -> bool {
        self.state == CircuitState::Closed && self.failure_count < self.failure_threshold
    }

    pub fn health_status(&self) -> &'static str {
        match self.state {
            CircuitState::Closed if self.failure_count == 0 => "HEALTHY",
            CircuitState::Closed => "DEGRADED",
            CircuitState::HalfOpen => "RECOVERING",
            CircuitState::Open => "UNHEALTHY",
        }
    }

    /// Seconds since the last failure, `None` if there never was one
    pub fn time_since_last_failure_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        if self.last_failure_time_ms == 0 {
            return None;
        }
        Some((now.timestamp_millis() - self.last_failure_time_ms) / 1000)
    }
}

/// Whether a call may reach the registry
enum Permit {
    Call,
    Fallback,
}

/// Circuit breaker in front of the bank registry, with cache fallback
pub struct BankRegistryCircuitBreaker {
    registry: Arc<dyn BankRegistryClient>,
    cache: Arc<dyn BankInfoCache>,
    clock: Arc<dyn Clock>,
    config: CircuitBreakerConfig,
    call_timeout: Duration,

    state: AtomicU8,
    failure_count: AtomicU32,
    half_open_call_count: AtomicU32,
    last_failure_time_ms: AtomicI64,
    half_open_since_ms: AtomicI64,
}

impl BankRegistryCircuitBreaker {
    pub fn new(
        registry: Arc<dyn BankRegistryClient>,
        cache: Arc<dyn BankInfoCache>,
        clock: Arc<dyn Clock>,
        config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            registry,
            cache,
            clock,
            config,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            half_open_call_count: AtomicU32::new(0),
            last_failure_time_ms: AtomicI64::new(0),
            half_open_since_ms: AtomicI64::new(0),
        }
    }

    /// Bound each registry call; an elapsed bound counts as a failure
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    fn now_ms(&self) -> i64 {
        self.clock.utc().timestamp_millis()
    }

    fn timeout_ms(&self) -> i64 {
        self.config.timeout_duration_seconds as i64 * 1000
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Current state, applying timed transitions.
    ///
    /// OPEN moves to HALF_OPEN once the timeout has elapsed since the last
    /// failure. In HALF_OPEN with the probe budget spent, the budget is
    /// renewed once the timeout elapses again.
    pub fn state(&self) -> CircuitState {
        let now = self.now_ms();
        match CircuitState::from_u8(self.state.load(Ordering::Acquire)) {
            CircuitState::Open => {
                let since_failure = now - self.last_failure_time_ms.load(Ordering::Acquire);
                if since_failure >= self.timeout_ms()
                    && self.transition(CircuitState::Open, CircuitState::HalfOpen)
                {
                    self.half_open_call_count.store(0, Ordering::Release);
                    self.half_open_since_ms.store(now, Ordering::Release);
                    info!("Bank registry circuit breaker OPEN -> HALF_OPEN");
                }
            }
            CircuitState::HalfOpen => {
                let exhausted = self.half_open_call_count.load(Ordering::Acquire)
                    >= self.config.half_open_max_calls;
                let since = self.half_open_since_ms.load(Ordering::Acquire);
                if exhausted
                    && now - since >= self.timeout_ms()
                    && self
                        .half_open_since_ms
                        .compare_exchange(since, now, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    self.half_open_call_count.store(0, Ordering::Release);
                    debug!("Bank registry probe budget renewed");
                }
            }
            CircuitState::Closed => {}
        }
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn acquire(&self) -> Permit {
        match self.state() {
            CircuitState::Closed => Permit::Call,
            CircuitState::Open => Permit::Fallback,
            CircuitState::HalfOpen => {
                let max = self.config.half_open_max_calls;
                let reserved = self.half_open_call_count.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |n| (n < max).then_some(n + 1),
                );
                if reserved.is_ok() {
                    Permit::Call
                } else {
                    Permit::Fallback
                }
            }
        }
    }

    fn on_success(&self) {
        match CircuitState::from_u8(self.state.load(Ordering::Acquire)) {
            CircuitState::HalfOpen => {
                if self.transition(CircuitState::HalfOpen, CircuitState::Closed) {
                    self.failure_count.store(0, Ordering::Release);
                    self.half_open_call_count.store(0, Ordering::Release);
                    info!("Bank registry circuit breaker HALF_OPEN -> CLOSED");
                }
            }
            CircuitState::Closed => self.failure_count.store(0, Ordering::Release),
            // forced open while the call was in flight
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        self.last_failure_time_ms
            .store(self.now_ms(), Ordering::Release);
        let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;

        match CircuitState::from_u8(self.state.load(Ordering::Acquire)) {
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold
                    && self.transition(CircuitState::Closed, CircuitState::Open)
                {
                    warn!(
                        failures,
                        threshold = self.config.failure_threshold,
                        "Bank registry circuit breaker CLOSED -> OPEN"
                    );
                }
            }
            CircuitState::HalfOpen => {
                if self.transition(CircuitState::HalfOpen, CircuitState::Open) {
                    warn!("Bank registry probe failed, circuit breaker HALF_OPEN -> OPEN");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Fetch bank info, through the registry when the circuit allows it
    pub async fn get_bank_info(&self, bank_id: &BankId) -> Result<BankInfo, IngestionError> {
        if let Permit::Fallback = self.acquire() {
            debug!(bank_id = %bank_id, "Circuit breaker rejecting call, using cache");
            return self.fallback(bank_id).await;
        }

        let outcome = match tokio::time::timeout(self.call_timeout, self.registry.fetch(bank_id))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(IngestionError::dependency(
                "bank-registry",
                FailureCategory::Timeout,
                format!("call timed out after {}s", self.call_timeout.as_secs()),
            )),
        };

        match outcome {
            Ok(info) => {
                self.on_success();
                if let Err(e) = self.cache.put(&info).await {
                    warn!(bank_id = %bank_id, error = %e, "Failed to cache bank info");
                }
                Ok(info)
            }
            // The registry answered; that is not a dependency failure.
            Err(e @ IngestionError::BankNotFound(_)) => {
                self.on_success();
                Err(e)
            }
            Err(e) => {
                warn!(bank_id = %bank_id, error = %e, "Bank registry call failed");
                self.on_failure();
                self.fallback(bank_id).await
            }
        }
    }

    async fn fallback(&self, bank_id: &BankId) -> Result<BankInfo, IngestionError> {
        match self.cache.get(bank_id).await? {
            Some(info) => {
                if !info.is_fresh(self.clock.utc()) {
                    warn!(
                        bank_id = %bank_id,
                        last_updated = %info.last_updated,
                        "Serving stale cached bank info"
                    );
                }
                Ok(info)
            }
            None => Err(IngestionError::RegistryUnavailableNoCache(bank_id.clone())),
        }
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            state: self.state(),
            failure_count: self.failure_count.load(Ordering::Acquire),
            half_open_call_count: self.half_open_call_count.load(Ordering::Acquire),
            last_failure_time_ms: self.last_failure_time_ms.load(Ordering::Acquire),
            failure_threshold: self.config.failure_threshold,
            timeout_duration_seconds: self.config.timeout_duration_seconds,
        }
    }

    /// Operational override: force CLOSED and clear counters
    pub fn reset(&self) {
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.half_open_call_count.store(0, Ordering::Release);
        info!("Bank registry circuit breaker manually reset");
    }

    /// Operational override: force OPEN from now
    pub fn force_open(&self) {
        self.last_failure_time_ms
            .store(self.now_ms(), Ordering::Release);
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        warn!("Bank registry circuit breaker manually opened");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryBankInfoCache;
    use crate::ingestion::test_support::{MockRegistry, MutableClock, active_bank};
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        registry: Arc<MockRegistry>,
        cache: Arc<InMemoryBankInfoCache>,
        clock: Arc<MutableClock>,
        breaker: BankRegistryCircuitBreaker,
    }

    fn fixture(threshold: u32, half_open_max_calls: u32) -> Fixture {
        let registry = Arc::new(MockRegistry::new());
        let cache = Arc::new(InMemoryBankInfoCache::new());
        let clock = Arc::new(MutableClock::fixed());
        let breaker = BankRegistryCircuitBreaker::new(
            registry.clone(),
            cache.clone(),
            clock.clone(),
            CircuitBreakerConfig {
                failure_threshold: threshold,
                timeout_duration_seconds: 60,
                half_open_max_calls,
            },
        );
        Fixture {
            registry,
            cache,
            clock,
            breaker,
        }
    }

    async fn trip(f: &Fixture, n: u32) {
        f.registry.fail_with(FailureCategory::Connection);
        for _ in 0..n {
            let _ = f.breaker.get_bank_info(&BankId::new("B1")).await;
        }
    }

    #[tokio::test]
    async fn test_success_writes_through_to_cache() {
        let f = fixture(2, 1);
        f.registry.respond_with(active_bank("B1", f.clock.utc()));

        let info = f.breaker.get_bank_info(&BankId::new("B1")).await.unwrap();
        assert!(info.is_active());
        assert!(f.cache.get(&BankId::new("B1")).await.unwrap().is_some());
        assert_eq!(f.breaker.metrics().health_status(), "HEALTHY");
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_serves_cache_without_calling_registry() {
        let f = fixture(2, 1);
        f.cache
            .put(&active_bank("B1", f.clock.utc()))
            .await
            .unwrap();

        trip(&f, 2).await;
        assert_eq!(f.breaker.state(), CircuitState::Open);
        assert_eq!(f.registry.calls(), 2);

        let info = f.breaker.get_bank_info(&BankId::new("B1")).await.unwrap();
        assert_eq!(info.bank_id, BankId::new("B1"));
        assert!(info.is_active());
        assert_eq!(f.registry.calls(), 2);
    }

    #[tokio::test]
    async fn test_open_without_cache_fails_hard() {
        let f = fixture(2, 1);
        trip(&f, 2).await;

        let err = f
            .breaker
            .get_bank_info(&BankId::new("B1"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::RegistryUnavailableNoCache(_)));
        assert_eq!(f.registry.calls(), 2);
        assert_eq!(f.breaker.metrics().health_status(), "UNHEALTHY");
    }

    #[tokio::test]
    async fn test_failure_below_threshold_falls_back_and_degrades() {
        let f = fixture(3, 1);
        f.cache
            .put(&active_bank("B1", f.clock.utc()))
            .await
            .unwrap();
        trip(&f, 1).await;

        let metrics = f.breaker.metrics();
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.failure_count, 1);
        assert_eq!(metrics.health_status(), "DEGRADED");
        assert!(metrics.is_healthy());
    }

    #[tokio::test]
    async fn test_half_open_trial_success_closes() {
        let f = fixture(2, 1);
        trip(&f, 2).await;

        f.clock.advance(ChronoDuration::seconds(61));
        assert_eq!(f.breaker.state(), CircuitState::HalfOpen);
        assert_eq!(f.breaker.metrics().health_status(), "RECOVERING");

        f.registry.respond_with(active_bank("B1", f.clock.utc()));
        f.breaker.get_bank_info(&BankId::new("B1")).await.unwrap();

        let metrics = f.breaker.metrics();
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.failure_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_trial_failure_reopens() {
        let f = fixture(2, 3);
        trip(&f, 2).await;
        f.clock.advance(ChronoDuration::seconds(61));

        trip(&f, 1).await;
        assert_eq!(f.breaker.state(), CircuitState::Open);
        assert_eq!(f.registry.calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_trial_budget_falls_back_until_timeout() {
        let f = fixture(2, 1);
        trip(&f, 2).await;
        f.clock.advance(ChronoDuration::seconds(61));
        assert_eq!(f.breaker.state(), CircuitState::HalfOpen);

        // Reserve the only trial call by hand so the circuit stays HALF_OPEN
        assert!(matches!(f.breaker.acquire(), Permit::Call));
        let _ = f.breaker.get_bank_info(&BankId::new("B1")).await;
        assert_eq!(f.registry.calls(), 2);

        f.clock.advance(ChronoDuration::seconds(61));
        f.registry.respond_with(active_bank("B1", f.clock.utc()));
        f.breaker.get_bank_info(&BankId::new("B1")).await.unwrap();
        assert_eq!(f.registry.calls(), 3);
        assert_eq!(f.breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_bank_not_found_is_not_a_breaker_failure() {
        let f = fixture(1, 1);
        f.registry.not_found();

        let err = f
            .breaker
            .get_bank_info(&BankId::new("B9"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::BankNotFound(_)));
        assert_eq!(f.breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_slow_registry_counts_as_failure() {
        let f = fixture(1, 1);
        let breaker = BankRegistryCircuitBreaker::new(
            f.registry.clone(),
            f.cache.clone(),
            f.clock.clone(),
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            },
        )
        .with_call_timeout(Duration::from_millis(10));
        f.registry.respond_with(active_bank("B1", f.clock.utc()));
        f.registry.delay(Duration::from_millis(200));

        let err = breaker.get_bank_info(&BankId::new("B1")).await.unwrap_err();
        assert!(matches!(err, IngestionError::RegistryUnavailableNoCache(_)));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_manual_overrides() {
        let f = fixture(5, 1);
        f.breaker.force_open();
        assert_eq!(f.breaker.state(), CircuitState::Open);
        assert_eq!(
            f.breaker
                .metrics()
                .time_since_last_failure_seconds(f.clock.utc()),
            Some(0)
        );

        f.breaker.reset();
        let metrics = f.breaker.metrics();
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.failure_count, 0);
    }

    #[tokio::test]
    async fn test_concurrent_failures_open_once() {
        let f = fixture(5, 1);
        f.registry.fail_with(FailureCategory::Unavailable);
        let breaker = Arc::new(f.breaker);

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let breaker = breaker.clone();
                tokio::spawn(async move {
                    let _ = breaker.get_bank_info(&BankId::new("B1")).await;
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(f.registry.calls() >= 5);
    }
}
