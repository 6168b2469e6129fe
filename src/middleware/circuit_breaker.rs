use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Service considered down; calls fail fast
    Open,
    /// Cool-down elapsed; a single trial call is let through
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: usize,
    /// Cool-down before a trial call is allowed
    pub cooldown: Duration,
    /// Consecutive trial successes needed to close again
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            success_threshold: 3,
        }
    }
}

/// Circuit breaker guarding the text-understanding service
///
/// States:
/// - Closed: calls pass through
/// - Open: fail fast until the cool-down elapses
/// - Half-Open: one trial at a time; successes close, a failure reopens
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<RwLock<CircuitBreakerInner>>,
    config: CircuitBreakerConfig,
}

struct CircuitBreakerInner {
    state: CircuitState,
    consecutive_failures: usize,
    consecutive_successes: usize,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    total_failures: usize,
    total_successes: usize,
    trips: usize,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CircuitBreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                trial_in_flight: false,
                total_failures: 0,
                total_successes: 0,
                trips: 0,
            })),
            config,
        }
    }

    /// Admit one call, or `None` to fail fast
    ///
    /// The permit carries the outcome back. A half-open trial whose permit is
    /// dropped unsettled frees the trial slot again.
    pub fn allow_request(&self) -> Option<CallPermit> {
        let mut inner = self.inner.write();

        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map_or(true, |t| t.elapsed() >= self.config.cooldown);
                if !cooled {
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 0;
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return None;
                }
                inner.trial_in_flight = true;
                true
            }
        };

        Some(CallPermit {
            breaker: self.clone(),
            trial,
            settled: false,
        })
    }

    fn release_trial(&self) {
        let mut inner = self.inner.write();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        inner.total_successes += 1;
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;

        if inner.state != CircuitState::Closed {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                inner.state = CircuitState::Closed;
                inner.consecutive_successes = 0;
                inner.opened_at = None;
            } else {
                inner.state = CircuitState::HalfOpen;
            }
        }
    }

    /// Record a failed call; returns true if this failure opened the circuit
    pub fn record_failure(&self) -> bool {
        let mut inner = self.inner.write();
        inner.total_failures += 1;
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;
        inner.trial_in_flight = false;

        let trip = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if trip {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trips += 1;
        }
        trip
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.read();
        CircuitBreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            trips: inner.trips,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Admission for a single call through the breaker
#[must_use = "report the call outcome through the permit"]
pub struct CallPermit {
    breaker: CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallPermit {
    /// Whether this call is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    /// Returns true if this failure opened the circuit
    pub fn failure(mut self) -> bool {
        self.settled = true;
        self.breaker.record_failure()
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.release_trial();
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub total_failures: usize,
    pub total_successes: usize,
    pub trips: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: usize, cooldown_ms: u64, successes: usize) -> CircuitBreaker {
        CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: failures,
            cooldown: Duration::from_millis(cooldown_ms),
            success_threshold: successes,
        })
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = breaker(3, 1000, 2);

        assert_eq!(breaker.state(), CircuitState::Closed);
        let permit = breaker.allow_request().unwrap();
        assert!(!permit.is_trial());
        assert!(!permit.failure());

        assert!(!breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(breaker.allow_request().is_none());
        assert_eq!(breaker.stats().trips, 1);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let breaker = breaker(2, 1000, 1);
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_recovery_through_half_open() {
        let breaker = breaker(2, 50, 2);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(80));

        let trial = breaker.allow_request().unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Only one trial at a time
        assert!(breaker.allow_request().is_none());

        trial.success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.allow_request().unwrap().success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request().is_some());
    }

    #[test]
    fn test_failed_trial_reopens() {
        let breaker = breaker(2, 50, 2);
        breaker.record_failure();
        breaker.record_failure();

        std::thread::sleep(Duration::from_millis(80));
        let trial = breaker.allow_request().unwrap();

        assert!(trial.failure());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.allow_request().is_none());
        assert_eq!(breaker.stats().trips, 2);
    }

    #[test]
    fn test_abandoned_trial_frees_the_slot() {
        let breaker = breaker(1, 0, 1);
        assert!(breaker.record_failure());

        let trial = breaker.allow_request().unwrap();
        assert!(trial.is_trial());
        drop(trial);

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let next = breaker.allow_request().expect("trial slot released");
        next.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_dropped_closed_permit_records_nothing() {
        let breaker = breaker(1, 1000, 1);
        drop(breaker.allow_request().unwrap());

        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.total_failures + stats.total_successes, 0);
    }
}
