//! Circuit breaker guarding a single upstream.
//!
//! ```text
//! Closed   -> Open      consecutive_failures reaches the threshold
//! Open     -> HalfOpen  recovery window elapsed; one trial permit granted
//! HalfOpen -> Closed    trial succeeded
//! HalfOpen -> Open      trial failed or abandoned; recovery window restarts
//! ```
//!
//! While HalfOpen the single trial is in flight and every other caller is
//! refused as if the circuit were still open.
//!
//! Every read-decide-write sequence runs under one mutex, so two callers can
//! never both receive the trial permit and a failure is never counted twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::{Clock, has_elapsed};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerState {
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_window: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        recovery_window: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_window,
            clock,
            inner: Mutex::new(CircuitBreakerState {
                status: CircuitStatus::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn with_defaults(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self::new(name, DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_WINDOW, clock)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().clone()
    }

    /// Asks for permission to call the upstream.
    ///
    /// `None` means fail fast. A granted [`Permit`] must be resolved with
    /// [`Permit::record_success`] or [`Permit::record_failure`]; dropping it
    /// unresolved reopens a half-open circuit without counting a failure.
    pub fn allow_request(&self) -> Option<Permit<'_>> {
        let now = self.clock.now();
        let mut state = self.inner.lock();

        match state.status {
            CircuitStatus::Closed => Some(Permit::new(self, false)),
            CircuitStatus::Open => {
                let opened_at = state.opened_at.unwrap_or(now);
                if !has_elapsed(opened_at, now, self.recovery_window) {
                    return None;
                }
                state.status = CircuitStatus::HalfOpen;
                tracing::info!(breaker = %self.name, "circuit half-open; granting trial request");
                Some(Permit::new(self, true))
            }
            CircuitStatus::HalfOpen => None,
        }
    }

    fn on_success(&self, trial: bool) {
        let mut state = self.inner.lock();
        match (state.status, trial) {
            (CircuitStatus::HalfOpen, true) => {
                *state = CircuitBreakerState {
                    status: CircuitStatus::Closed,
                    consecutive_failures: 0,
                    opened_at: None,
                };
                tracing::info!(breaker = %self.name, "trial succeeded; circuit closed");
            }
            (CircuitStatus::Closed, _) => state.consecutive_failures = 0,
            // A call admitted before the circuit opened has no say in recovery.
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let now = self.clock.now();
        let mut state = self.inner.lock();
        match (state.status, trial) {
            (CircuitStatus::HalfOpen, true) => {
                state.status = CircuitStatus::Open;
                state.consecutive_failures += 1;
                state.opened_at = Some(now);
                tracing::warn!(breaker = %self.name, "trial failed; circuit reopened");
            }
            (CircuitStatus::Closed, _) => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.failure_threshold {
                    state.status = CircuitStatus::Open;
                    state.opened_at = Some(now);
                    tracing::warn!(
                        breaker = %self.name,
                        failures = state.consecutive_failures,
                        "failure threshold reached; circuit opened"
                    );
                } else {
                    tracing::debug!(
                        breaker = %self.name,
                        failures = state.consecutive_failures,
                        "upstream failure recorded"
                    );
                }
            }
            _ => {}
        }
    }

    fn on_abandon(&self, trial: bool) {
        if !trial {
            return;
        }
        let now = self.clock.now();
        let mut state = self.inner.lock();
        if state.status == CircuitStatus::HalfOpen {
            state.status = CircuitStatus::Open;
            state.opened_at = Some(now);
            tracing::info!(breaker = %self.name, "trial abandoned; circuit reopened");
        }
    }
}

/// Permission to make one upstream call.
#[derive(Debug)]
#[must_use = "a permit should be resolved with record_success or record_failure"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self { breaker, trial, resolved: false }
    }

    /// `true` for the single half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.trial);
    }

    pub fn record_failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.on_abandon(self.trial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker() -> (Arc<ManualClock>, CircuitBreaker) {
        let clock = Arc::new(ManualClock::default());
        let breaker = CircuitBreaker::with_defaults("test", clock.clone());
        (clock, breaker)
    }

    fn fail_times(breaker: &CircuitBreaker, n: u32) {
        for _ in 0..n {
            breaker.allow_request().expect("closed circuit admits").record_failure();
        }
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let (clock, breaker) = breaker();

        fail_times(&breaker, 4);
        assert_eq!(breaker.state().status, CircuitStatus::Closed);
        assert_eq!(breaker.state().consecutive_failures, 4);

        fail_times(&breaker, 1);
        let state = breaker.state();
        assert_eq!(state.status, CircuitStatus::Open);
        assert_eq!(state.opened_at, Some(clock.now()));
        assert!(breaker.allow_request().is_none());
    }

    #[test]
    fn success_resets_failure_count_while_closed() {
        let (_, breaker) = breaker();

        fail_times(&breaker, 4);
        breaker.allow_request().unwrap().record_success();
        assert_eq!(breaker.state().consecutive_failures, 0);

        fail_times(&breaker, 4);
        assert_eq!(breaker.state().status, CircuitStatus::Closed);
    }

    #[test]
    fn grants_exactly_one_trial_after_recovery_window() {
        let (clock, breaker) = breaker();
        fail_times(&breaker, 5);

        clock.advance(DEFAULT_RECOVERY_WINDOW - Duration::from_secs(1));
        assert!(breaker.allow_request().is_none());

        clock.advance(Duration::from_secs(1));
        let trial = breaker.allow_request().expect("trial permit");
        assert!(trial.is_trial());
        assert_eq!(breaker.state().status, CircuitStatus::HalfOpen);
        assert!(breaker.allow_request().is_none());

        trial.record_success();
        let state = breaker.state();
        assert_eq!(state.status, CircuitStatus::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.opened_at, None);
    }

    #[test]
    fn failed_trial_reopens_and_restarts_window() {
        let (clock, breaker) = breaker();
        fail_times(&breaker, 5);

        clock.advance(DEFAULT_RECOVERY_WINDOW);
        breaker.allow_request().expect("trial").record_failure();

        let state = breaker.state();
        assert_eq!(state.status, CircuitStatus::Open);
        assert_eq!(state.opened_at, Some(clock.now()));

        clock.advance(DEFAULT_RECOVERY_WINDOW - Duration::from_secs(1));
        assert!(breaker.allow_request().is_none());
        clock.advance(Duration::from_secs(1));
        assert!(breaker.allow_request().is_some());
    }

    #[test]
    fn dropped_trial_reopens_without_counting_a_failure() {
        let (clock, breaker) = breaker();
        fail_times(&breaker, 5);
        clock.advance(DEFAULT_RECOVERY_WINDOW);

        drop(breaker.allow_request().expect("trial"));
        let state = breaker.state();
        assert_eq!(state.status, CircuitStatus::Open);
        assert_eq!(state.opened_at, Some(clock.now()));
        assert_eq!(state.consecutive_failures, 5);
        assert!(breaker.allow_request().is_none());

        clock.advance(DEFAULT_RECOVERY_WINDOW);
        let next = breaker.allow_request().expect("trial in the next window");
        assert!(next.is_trial());
    }

    #[test]
    fn abandoned_trials_yield_one_trial_per_window() {
        let (clock, breaker) = breaker();
        fail_times(&breaker, 5);
        clock.advance(DEFAULT_RECOVERY_WINDOW);

        let mut granted = 0;
        for _ in 0..5 {
            if let Some(permit) = breaker.allow_request() {
                granted += 1;
                drop(permit);
            }
            clock.advance(Duration::from_millis(100));
        }

        assert_eq!(granted, 1);
        assert_eq!(breaker.state().status, CircuitStatus::Open);
    }

    #[test]
    fn late_results_from_pre_open_calls_do_not_move_the_breaker() {
        let (clock, breaker) = breaker();
        let straggler_ok = breaker.allow_request().unwrap();
        let straggler_err = breaker.allow_request().unwrap();
        fail_times(&breaker, 5);
        let opened_at = breaker.state().opened_at;

        clock.advance(Duration::from_secs(10));
        straggler_ok.record_success();
        straggler_err.record_failure();

        let state = breaker.state();
        assert_eq!(state.status, CircuitStatus::Open);
        assert_eq!(state.opened_at, opened_at);
    }

    #[test]
    fn concurrent_callers_share_a_single_trial() {
        let (clock, breaker) = breaker();
        let breaker = Arc::new(breaker);
        fail_times(&breaker, 5);
        clock.advance(DEFAULT_RECOVERY_WINDOW);

        let barrier = Arc::new(std::sync::Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let breaker = breaker.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    // Keep the permit alive so the slot stays taken.
                    breaker.allow_request().map(std::mem::forget).is_some()
                })
            })
            .collect();

        let granted = handles.into_iter().map(|h| h.join().unwrap()).filter(|g| *g).count();
        assert_eq!(granted, 1);
    }
}
