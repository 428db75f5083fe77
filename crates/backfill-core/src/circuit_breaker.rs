//! Circuit breaker around the generation service.
//!
//! ```text
//! Closed ──[failure_threshold consecutive failures]──► Open
//!   ▲                                                    │ recovery_timeout
//!   └──[success_threshold probe successes]── HalfOpen ◄──┘
//!                                              │ probe failure
//!                                              └──────────► Open
//! ```
//!
//! Half-open admits one probe at a time. Callers arriving while the probe is
//! running are turned away with [`CircuitBreakerError::Open`], exactly as if
//! the circuit had not cooled down yet.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive tripping failures that open the circuit.
    pub failure_threshold: u32,

    /// Probe successes needed to close it again.
    pub success_threshold: u32,

    /// Cool-down before an open circuit admits a probe.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open { since: Instant },
    HalfOpen { probing: bool, successes: u32 },
}

impl Phase {
    fn state(&self) -> CircuitState {
        match self {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

#[derive(Debug)]
struct Shared {
    phase: Phase,
    consecutive_failures: u32,
    last_error: Option<String>,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            phase: Phase::Closed,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Snapshot for logs and run summaries.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    /// Rejected without calling the service.
    #[error("Circuit breaker '{name}' is open. Retry after {} ms.", .retry_after.as_millis())]
    Open { name: String, retry_after: Duration },

    /// The service was called and failed.
    #[error(transparent)]
    Inner(AppError),
}

impl CircuitBreakerError {
    /// The service error, if the call actually ran.
    pub fn into_inner(self) -> Option<AppError> {
        match self {
            CircuitBreakerError::Inner(e) => Some(e),
            CircuitBreakerError::Open { .. } => None,
        }
    }
}

/// Holds the half-open probe slot; frees it if the probe future is dropped.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        let mut shared = self.breaker.lock_shared();
        if let Phase::HalfOpen { probing, .. } = &mut shared.phase {
            *probing = false;
        }
    }
}

/// Shared breaker state; clones observe and update the same circuit.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    shared: Arc<Mutex<Shared>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned circuit breaker mutex");
            poisoned.into_inner()
        })
    }

    pub fn state(&self) -> CircuitState {
        let mut shared = self.lock_shared();
        self.cool_down(&mut shared);
        shared.phase.state()
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut shared = self.lock_shared();
        self.cool_down(&mut shared);
        CircuitBreakerStats {
            name: self.name.clone(),
            state: shared.phase.state(),
            failure_count: shared.consecutive_failures,
            last_error: shared.last_error.clone(),
            time_until_half_open: self.remaining(&shared.phase),
        }
    }

    /// Run `operation` unless the circuit rejects it.
    ///
    /// Only errors for which [`AppError::should_trip_circuit`] holds count
    /// as failures; other errors pass through without touching the state.
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let slot = self.admit()?;
        let result = operation().await;

        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.should_trip_circuit() => self.record_failure(e),
            Err(_) => {}
        }
        drop(slot);
        result.map_err(CircuitBreakerError::Inner)
    }

    /// Decide whether a call may proceed. Returns the probe slot when the
    /// caller is the half-open probe.
    fn admit(&self) -> Result<Option<ProbeSlot<'_>>, CircuitBreakerError> {
        let mut shared = self.lock_shared();
        self.cool_down(&mut shared);

        match &mut shared.phase {
            Phase::Closed => Ok(None),
            Phase::HalfOpen { probing, .. } if !*probing => {
                *probing = true;
                Ok(Some(ProbeSlot { breaker: self }))
            }
            phase => Err(CircuitBreakerError::Open {
                name: self.name.clone(),
                retry_after: self.remaining(phase).unwrap_or_default(),
            }),
        }
    }

    pub fn record_success(&self) {
        let mut shared = self.lock_shared();
        self.cool_down(&mut shared);
        match shared.phase {
            Phase::Closed => shared.consecutive_failures = 0,
            Phase::HalfOpen { probing, successes } => {
                let successes = successes + 1;
                if successes >= self.config.success_threshold {
                    tracing::info!(circuit = %self.name, successes, "Circuit closed after successful probe");
                    *shared = Shared::default();
                } else {
                    shared.phase = Phase::HalfOpen { probing, successes };
                }
            }
            Phase::Open { .. } => {}
        }
    }

    pub fn record_failure(&self, error: &AppError) {
        let mut shared = self.lock_shared();
        self.cool_down(&mut shared);
        shared.last_error = Some(error.to_string());

        match shared.phase {
            Phase::Closed => {
                shared.consecutive_failures += 1;
                if shared.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = shared.consecutive_failures,
                        %error,
                        "Circuit opened"
                    );
                    shared.phase = Phase::Open {
                        since: Instant::now(),
                    };
                }
            }
            Phase::HalfOpen { .. } => {
                shared.consecutive_failures += 1;
                tracing::warn!(circuit = %self.name, %error, "Probe failed, circuit reopened");
                shared.phase = Phase::Open {
                    since: Instant::now(),
                };
            }
            Phase::Open { .. } => {}
        }
    }

    pub fn reset(&self) {
        tracing::info!(circuit = %self.name, "Circuit breaker reset");
        *self.lock_shared() = Shared::default();
    }

    /// Cool-down left while open.
    fn remaining(&self, phase: &Phase) -> Option<Duration> {
        match phase {
            Phase::Open { since } => Some(self.config.recovery_timeout.saturating_sub(since.elapsed())),
            _ => None,
        }
    }

    fn cool_down(&self, shared: &mut Shared) {
        if let Phase::Open { since } = shared.phase
            && since.elapsed() >= self.config.recovery_timeout
        {
            tracing::info!(circuit = %self.name, "Circuit half-open, admitting one probe");
            shared.phase = Phase::HalfOpen {
                probing: false,
                successes: 0,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn refused() -> AppError {
        AppError::NetworkError("connection refused".into())
    }

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "generation",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
                ..Default::default()
            },
        )
    }

    /// A breaker already tripped by one failure.
    fn tripped(recovery: Duration) -> CircuitBreaker {
        let cb = breaker(1, recovery);
        cb.record_failure(&refused());
        cb
    }

    #[test]
    fn opens_only_at_threshold() {
        let cb = breaker(3, Duration::from_secs(60));
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(&refused());
        cb.record_failure(&refused());
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(&refused());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.stats().time_until_half_open.is_some());
    }

    #[test]
    fn success_clears_the_failure_streak() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.record_failure(&refused());
        cb.record_failure(&refused());
        cb.record_success();
        cb.record_failure(&refused());
        cb.record_failure(&refused());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_count, 2);
    }

    #[test]
    fn cools_down_to_half_open_then_closes() {
        let cb = tripped(Duration::from_millis(5));
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert!(stats.last_error.is_none());
    }

    #[test]
    fn failed_probe_reopens() {
        let cb = tripped(Duration::from_millis(50));
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure(&AppError::Timeout(1_000));
        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.last_error.as_deref(), Some("Request timed out after 1000 ms"));
    }

    #[test]
    fn needs_every_configured_probe_success() {
        let cb = CircuitBreaker::new(
            "generation",
            CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 2,
                recovery_timeout: Duration::from_millis(1),
            },
        );
        cb.record_failure(&refused());
        std::thread::sleep(Duration::from_millis(5));
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn failure_after_cool_down_restarts_the_timer() {
        let cb = CircuitBreaker::new(
            "generation",
            CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 1,
                recovery_timeout: Duration::from_millis(50),
            },
        );
        cb.record_failure(&refused());
        std::thread::sleep(Duration::from_millis(60));

        // Nobody polled the state, the failure must still count as a failed probe.
        cb.record_failure(&refused());
        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert!(stats.time_until_half_open.is_some_and(|d| d > Duration::from_millis(20)));
    }

    #[test]
    fn reset_closes_immediately() {
        let cb = tripped(Duration::from_secs(300));
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_calling() {
        let cb = breaker(2, Duration::from_secs(60));
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            let result = cb
                .call(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(refused())
                })
                .await;
            assert!(matches!(result, Err(CircuitBreakerError::Inner(_))));
        }

        let result = cb
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AppError>(())
            })
            .await;

        match result {
            Err(CircuitBreakerError::Open { name, retry_after }) => {
                assert_eq!(name, "generation");
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected open circuit, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn passes_results_through_when_closed() {
        let cb = breaker(2, Duration::from_secs(60));
        let text = cb.call(|| async { Ok::<_, AppError>("generated".to_string()) }).await;
        assert_eq!(text.unwrap(), "generated");

        let _ = cb.call(|| async { Err::<String, _>(refused()) }).await;
        assert_eq!(cb.stats().failure_count, 1);
    }

    #[tokio::test]
    async fn non_tripping_errors_leave_state_alone() {
        let cb = breaker(1, Duration::from_secs(60));
        for error in [
            AppError::Validation(crate::validator::ValidationError::MissingField("summary".into())),
            AppError::Shutdown,
        ] {
            let result = cb.call(move || async move { Err::<(), _>(error) }).await;
            assert!(result.unwrap_err().into_inner().is_some());
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_count, 0);
    }

    #[tokio::test]
    async fn half_open_admits_exactly_one_probe() {
        let cb = tripped(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let calls = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let cb = cb.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cb.call(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, AppError>(())
                })
                .await
            }));
        }

        let (mut admitted, mut rejected) = (0, 0);
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => admitted += 1,
                Err(CircuitBreakerError::Open { .. }) => rejected += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!((admitted, rejected), (1, 4));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn abandoned_probe_frees_the_slot() {
        let cb = tripped(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let probe = cb.call(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, AppError>(())
        });
        assert!(tokio::time::timeout(Duration::from_millis(10), probe).await.is_err());

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.call(|| async { Ok::<_, AppError>(()) }).await.is_ok());
    }
}
