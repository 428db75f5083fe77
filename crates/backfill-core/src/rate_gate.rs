//! Adaptive spacing of outbound calls to the generation service.
//!
//! Every caller goes through [`RateGate::acquire`], which sleeps until the
//! current effective delay has elapsed since the previous grant. Overload
//! signals (HTTP 429) bump a hit counter that widens the delay; after
//! `decay_window` without a new hit the counter drops back to zero.
//!
//! ```text
//! hits = 0           effective = base_delay
//! hits = n > 0       effective = min(max_delay, max(min_backoff, base_delay + n * increment))
//! ```
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use backfill_core::rate_gate::{RateGate, RateGateConfig};
//!
//! let gate = RateGate::new(
//!     RateGateConfig::new(Duration::from_millis(500))
//!         .with_backoff(Duration::from_secs(2), Duration::from_secs(1))
//!         .with_max_delay(Duration::from_secs(30)),
//! );
//! assert_eq!(gate.current_delay(), Duration::from_millis(500));
//! gate.record_overload();
//! assert_eq!(gate.current_delay(), Duration::from_secs(2));
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// Configuration for the rate gate.
#[derive(Debug, Clone)]
pub struct RateGateConfig {
    /// Minimum delay between consecutive grants with no overload history.
    pub base_delay: Duration,

    /// Lower bound of the delay once at least one overload hit is active.
    pub min_backoff: Duration,

    /// Added to the delay per active overload hit.
    pub increment: Duration,

    /// Upper bound for the effective delay.
    pub max_delay: Duration,

    /// Quiet period after which the hit counter resets.
    pub decay_window: Duration,
}

impl RateGateConfig {
    /// Create a config with the given base delay and default backoff settings.
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, min_backoff: Duration, increment: Duration) -> Self {
        self.min_backoff = min_backoff;
        self.increment = increment;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_decay_window(mut self, decay_window: Duration) -> Self {
        self.decay_window = decay_window;
        self
    }

    /// Delay for a given number of active overload hits.
    fn delay_for_hits(&self, hits: u32) -> Duration {
        let delay = if hits == 0 {
            self.base_delay
        } else {
            let grown = self.base_delay + self.increment.saturating_mul(hits);
            grown.max(self.min_backoff)
        };
        delay.min(self.max_delay.max(self.base_delay))
    }
}

impl Default for RateGateConfig {
    /// 1s base, 5s floor after a 429, +5s per hit, 60s cap, 2 minute decay.
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            min_backoff: Duration::from_secs(5),
            increment: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            decay_window: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Default)]
struct RateState {
    last_request: Option<Instant>,
    hits: u32,
    last_hit: Option<Instant>,
}

/// Shared, cloneable gate. Clones observe the same state.
#[derive(Clone)]
pub struct RateGate {
    config: RateGateConfig,
    state: Arc<Mutex<RateState>>,
}

impl RateGate {
    pub fn new(config: RateGateConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(RateState::default())),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RateState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned rate gate mutex");
            poisoned.into_inner()
        })
    }

    /// Reset the hit counter if the decay window has passed since the last hit.
    fn decay(&self, state: &mut RateState) {
        if state.hits > 0
            && let Some(last_hit) = state.last_hit
            && last_hit.elapsed() > self.config.decay_window
        {
            tracing::info!(hits = state.hits, "Rate limit pressure decayed");
            state.hits = 0;
            state.last_hit = None;
        }
    }

    /// The delay the next acquisition will wait for.
    pub fn current_delay(&self) -> Duration {
        let mut state = self.lock_state();
        self.decay(&mut state);
        self.config.delay_for_hits(state.hits)
    }

    pub fn hit_count(&self) -> u32 {
        let mut state = self.lock_state();
        self.decay(&mut state);
        state.hits
    }

    /// Register an overload signal from the service.
    pub fn record_overload(&self) {
        let mut state = self.lock_state();
        self.decay(&mut state);
        state.hits = state.hits.saturating_add(1);
        state.last_hit = Some(Instant::now());
        tracing::warn!(
            hits = state.hits,
            delay_ms = self.config.delay_for_hits(state.hits).as_millis() as u64,
            "Rate limit hit, widening request spacing"
        );
    }

    /// Wait for the next slot.
    ///
    /// Returns [`AppError::Shutdown`] without granting the slot if `cancel`
    /// fires while waiting.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AppError> {
        loop {
            if cancel.is_cancelled() {
                return Err(AppError::Shutdown);
            }

            let wait = {
                let mut state = self.lock_state();
                self.decay(&mut state);
                let required = self.config.delay_for_hits(state.hits);
                let elapsed = state.last_request.map(|t| t.elapsed());

                match elapsed {
                    Some(elapsed) if elapsed < required => required - elapsed,
                    _ => {
                        state.last_request = Some(Instant::now());
                        return Ok(());
                    }
                }
            };

            tracing::debug!(sleep_ms = %wait.as_millis(), "Rate gate waiting");
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = cancel.cancelled() => return Err(AppError::Shutdown),
            }
            // Another caller may have taken the slot while we slept; re-check.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RateGateConfig {
        RateGateConfig::new(Duration::from_millis(50))
            .with_backoff(Duration::from_millis(120), Duration::from_millis(40))
            .with_max_delay(Duration::from_millis(300))
            .with_decay_window(Duration::from_millis(80))
    }

    #[test]
    fn delay_grows_with_hits_and_is_capped() {
        let config = test_config();
        assert_eq!(config.delay_for_hits(0), Duration::from_millis(50));
        // base + 1*inc = 90 < min_backoff
        assert_eq!(config.delay_for_hits(1), Duration::from_millis(120));
        assert_eq!(config.delay_for_hits(3), Duration::from_millis(170));
        assert_eq!(config.delay_for_hits(100), Duration::from_millis(300));
    }

    #[test]
    fn delay_is_monotonic_in_hits() {
        let config = test_config();
        let mut previous = Duration::ZERO;
        for hits in 0..20 {
            let d = config.delay_for_hits(hits);
            assert!(d >= previous);
            previous = d;
        }
    }

    #[test]
    fn overload_strictly_increases_delay() {
        let gate = RateGate::new(test_config());
        let before = gate.current_delay();
        gate.record_overload();
        let after_one = gate.current_delay();
        gate.record_overload();
        let after_two = gate.current_delay();
        assert!(after_one > before);
        assert!(after_two > after_one);
    }

    #[test]
    fn delay_decays_back_to_base() {
        let gate = RateGate::new(test_config());
        gate.record_overload();
        assert!(gate.current_delay() > Duration::from_millis(50));

        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(gate.current_delay(), Duration::from_millis(50));
        assert_eq!(gate.hit_count(), 0);
    }

    #[tokio::test]
    async fn first_acquire_is_immediate() {
        let gate = RateGate::new(RateGateConfig::new(Duration::from_secs(10)));
        let start = Instant::now();
        gate.acquire(&CancellationToken::new()).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn consecutive_acquires_are_spaced() {
        let gate = RateGate::new(RateGateConfig::new(Duration::from_millis(100)));
        let cancel = CancellationToken::new();

        gate.acquire(&cancel).await.unwrap();
        let start = Instant::now();
        gate.acquire(&cancel).await.unwrap();
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_millis(100),
            "Second acquire should wait at least 100ms, waited {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn concurrent_acquires_are_spaced() {
        let gate = RateGate::new(RateGateConfig::new(Duration::from_millis(40)));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let gate = gate.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                gate.acquire(&cancel).await.unwrap();
                Instant::now()
            }));
        }
        let mut grants = Vec::new();
        for h in handles {
            grants.push(h.await.unwrap());
        }
        grants.sort();

        // Grants are timestamped after `acquire` returns; allow scheduling slack.
        for pair in grants.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(35));
        }
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn acquire_returns_promptly_on_cancel() {
        let gate = RateGate::new(RateGateConfig::new(Duration::from_secs(30)));
        let cancel = CancellationToken::new();
        gate.acquire(&cancel).await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = gate.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, AppError::Shutdown));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn default_config_is_sensible() {
        let config = RateGateConfig::default();
        assert!(config.min_backoff > config.base_delay);
        assert!(config.max_delay >= config.min_backoff);
    }
}
