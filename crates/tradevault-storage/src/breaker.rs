//! # Circuit Breaker
//!
//! Tracks consecutive query failures and fails fast once the store looks
//! broken. Three states:
//!
//! - `Closed`: every call goes through; failures are counted.
//! - `Open`: every call is rejected until the cooldown has elapsed.
//! - `HalfOpen`: exactly one probe call is let through; its outcome closes
//!   or re-opens the circuit.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tradevault_core::config::BreakerConfig;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of the breaker, for health reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
    /// Time left until an open circuit admits a probe.
    pub retry_after: Option<Duration>,
    /// Number of times the circuit has opened.
    pub trips: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    trips: u64,
}

/// Consecutive-failure circuit breaker guarding query execution
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                opened_at: None,
                probe_in_flight: false,
                trips: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether the next call may proceed.
    ///
    /// An open circuit whose cooldown has elapsed moves to `HalfOpen` and
    /// admits this one caller as the probe. Later callers are rejected until
    /// the probe reports back.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .is_none_or(|opened| opened.elapsed() >= self.config.cooldown);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(
                        cooldown_ms = self.config.cooldown.as_millis() as u64,
                        "Circuit breaker half-open, admitting probe"
                    );
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            info!("Circuit breaker closed");
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(now);
        inner.probe_in_flight = false;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.trips += 1;
                warn!(
                    consecutive_failures = inner.consecutive_failures,
                    "Circuit breaker probe failed, re-opening"
                );
            }
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.trips += 1;
                warn!(
                    consecutive_failures = inner.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    cooldown_ms = self.config.cooldown.as_millis() as u64,
                    "Circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    /// Admit one call, or `None` if the circuit rejects it. The permit must
    /// be settled with an outcome; dropping it unsettled (an early return or
    /// a panic in the guarded work) gives back a half-open probe slot.
    pub fn try_acquire(&self) -> Option<BreakerPermit<'_>> {
        self.can_execute().then(|| BreakerPermit {
            breaker: self,
            settled: false,
        })
    }

    /// Give back a half-open probe slot without an outcome, e.g. when the
    /// probe could not get a connection. The next caller becomes the probe.
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Time until an open circuit admits a probe; zero if it already would.
    pub fn retry_after(&self) -> Duration {
        let inner = self.inner.lock();
        Self::remaining_cooldown(&inner, self.config.cooldown).unwrap_or_default()
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure: inner.last_failure,
            retry_after: Self::remaining_cooldown(&inner, self.config.cooldown),
            trips: inner.trips,
        }
    }

    fn remaining_cooldown(inner: &BreakerState, cooldown: Duration) -> Option<Duration> {
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened)) => Some(cooldown.saturating_sub(opened.elapsed())),
            _ => None,
        }
    }
}

/// One admitted call through a [`CircuitBreaker`].
#[must_use = "an unsettled permit reports no outcome to the breaker"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl BreakerPermit<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_probe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown,
        })
    }

    #[test]
    fn test_opens_at_threshold() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
        assert!(cb.retry_after() > Duration::from_secs(59));
        assert_eq!(cb.snapshot().trips, 1);
    }

    #[test]
    fn test_success_resets_counter() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 2);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let cb = breaker(1, Duration::from_millis(20));
        cb.record_failure();
        assert!(!cb.can_execute());

        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.can_execute());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
    }

    #[test]
    fn test_failed_probe_reopens() {
        let cb = breaker(1, Duration::from_millis(20));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.can_execute());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
        assert_eq!(cb.snapshot().trips, 2);
    }

    #[test]
    fn test_released_probe_lets_next_caller_in() {
        let cb = breaker(1, Duration::from_millis(10));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.can_execute());
        cb.release_probe();
        assert!(cb.can_execute());
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_unsettled_permit_returns_probe_slot() {
        let cb = breaker(1, Duration::from_millis(10));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        let probe = cb.try_acquire().expect("cooled circuit admits a probe");
        assert!(cb.try_acquire().is_none());
        drop(probe);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let probe = cb.try_acquire().expect("slot was handed back");
        assert!(cb.try_acquire().is_none());
        probe.success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_settled_permit_reports_outcome() {
        let cb = breaker(2, Duration::from_secs(60));
        cb.try_acquire().unwrap().failure();
        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_none());
    }

    proptest! {
        #[test]
        fn prop_opens_only_after_threshold_consecutive_failures(
            threshold in 1u32..10,
            outcomes in proptest::collection::vec(any::<bool>(), 0..40),
        ) {
            let cb = breaker(threshold, Duration::from_secs(3600));
            let mut streak = 0u32;
            let mut should_be_open = false;

            for success in outcomes {
                if should_be_open {
                    break;
                }
                if success {
                    cb.record_success();
                    streak = 0;
                } else {
                    cb.record_failure();
                    streak += 1;
                    should_be_open = streak >= threshold;
                }
                let expected = if should_be_open { CircuitState::Open } else { CircuitState::Closed };
                prop_assert_eq!(cb.state(), expected);
            }
        }
    }
}
