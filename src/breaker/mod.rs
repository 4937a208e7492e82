//! Per-key circuit breakers.
//!
//! A breaker watches the outcomes of one kind of call (for the orchestrator:
//! the health checks of one managed server) and stops attempting it after
//! repeated failures.
//!
//! ```text
//! Closed    -> Open       failures in the trailing window reach failure_threshold
//! Open      -> HalfOpen   first call attempt after timeout_seconds since the last failure
//! HalfOpen  -> Closed     success_threshold consecutive successes
//! HalfOpen  -> Open       any failure
//! ```
//!
//! The open-to-half-open move is evaluated lazily on the next call attempt;
//! there is no timer.
mod registry;

pub use registry::BreakerRegistry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures within the trailing window that open the breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// Cooldown after the last failure before a trial is allowed.
    pub timeout_seconds: u64,
    /// Number of recent outcomes kept in the trailing window.
    pub window_size: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            timeout_seconds: 60,
            window_size: 5,
        }
    }
}

impl BreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerStatus::Closed => write!(f, "closed"),
            BreakerStatus::Open => write!(f, "open"),
            BreakerStatus::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// A status change caused by a call attempt or a recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerTransition {
    pub from: BreakerStatus,
    pub to: BreakerStatus,
}

/// Answer to "may I make the call now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The cooldown has elapsed and this attempt moved the breaker to half-open.
    HalfOpened,
    /// The breaker is open; the call must not be made.
    Rejected,
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

/// Result of a call routed through a breaker.
///
/// `Skipped` means the breaker was open and the call never ran. It is
/// neither a success nor a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome<T, E> {
    Ok(T),
    Skipped,
    Failed(E),
}

impl<T, E> CallOutcome<T, E> {
    pub fn is_ok(&self) -> bool {
        matches!(self, CallOutcome::Ok(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, CallOutcome::Skipped)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CallOutcome::Failed(_))
    }
}

/// Point-in-time copy of a breaker's state.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub status: BreakerStatus,
    /// Failures currently inside the trailing window.
    pub failure_count: u32,
    /// Consecutive successes recorded while half-open.
    pub success_count: u32,
    /// Trailing window, oldest first; `true` is a success.
    pub window: Vec<bool>,
    pub last_failure_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    status: BreakerStatus,
    window: VecDeque<bool>,
    success_count: u32,
    last_failure: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            status: BreakerStatus::Closed,
            window: VecDeque::new(),
            success_count: 0,
            last_failure: None,
            last_failure_time: None,
        }
    }

    fn push(&mut self, outcome: bool, window_size: usize) {
        self.window.push_back(outcome);
        while self.window.len() > window_size.max(1) {
            self.window.pop_front();
        }
    }

    fn failures(&self) -> u32 {
        self.window.iter().filter(|ok| !**ok).count() as u32
    }

    fn move_to(&mut self, to: BreakerStatus) -> Option<BreakerTransition> {
        if self.status == to {
            return None;
        }
        let transition = BreakerTransition {
            from: self.status,
            to,
        };
        self.status = to;
        Some(transition)
    }
}

/// A single circuit breaker.
///
/// All state sits behind one mutex owned by this breaker, so breakers for
/// different keys never contend.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> BreakerStatus {
        self.lock().status
    }

    /// Decides whether a call may go ahead, performing the lazy
    /// open-to-half-open transition once the cooldown has elapsed.
    pub fn allow_request(&self) -> Admission {
        let mut state = self.lock();
        match state.status {
            BreakerStatus::Closed | BreakerStatus::HalfOpen => Admission::Allowed,
            BreakerStatus::Open => {
                let cooled = state
                    .last_failure
                    .map(|at| at.elapsed() >= self.config.timeout())
                    .unwrap_or(true);
                if cooled {
                    state.success_count = 0;
                    state.move_to(BreakerStatus::HalfOpen);
                    tracing::info!(breaker = %self.name, "Circuit breaker half-open");
                    Admission::HalfOpened
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) -> Option<BreakerTransition> {
        let mut state = self.lock();
        match state.status {
            // No call is attempted while open, so there is no outcome to keep.
            BreakerStatus::Open => None,
            BreakerStatus::Closed => {
                state.push(true, self.config.window_size);
                None
            }
            BreakerStatus::HalfOpen => {
                state.push(true, self.config.window_size);
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.window.clear();
                    state.success_count = 0;
                    tracing::info!(breaker = %self.name, "Circuit breaker closed");
                    state.move_to(BreakerStatus::Closed)
                } else {
                    None
                }
            }
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) -> Option<BreakerTransition> {
        let mut state = self.lock();
        if state.status == BreakerStatus::Open {
            return None;
        }

        state.push(false, self.config.window_size);
        state.last_failure = Some(Instant::now());
        state.last_failure_time = Some(Utc::now());

        let open = match state.status {
            BreakerStatus::HalfOpen => true,
            _ => state.failures() >= self.config.failure_threshold,
        };
        if open {
            state.success_count = 0;
            tracing::warn!(
                breaker = %self.name,
                failures = state.failures(),
                "Circuit breaker opened"
            );
            state.move_to(BreakerStatus::Open)
        } else {
            None
        }
    }

    /// Forces the breaker closed and clears all counters.
    pub fn reset(&self) -> Option<BreakerTransition> {
        let mut state = self.lock();
        let from = state.status;
        *state = BreakerState::new();
        tracing::info!(breaker = %self.name, "Circuit breaker reset");
        (from != BreakerStatus::Closed).then_some(BreakerTransition {
            from,
            to: BreakerStatus::Closed,
        })
    }

    /// Runs `f` through the breaker.
    ///
    /// An open breaker yields `CallOutcome::Skipped` without calling `f`;
    /// otherwise the outcome of `f` is recorded and handed back.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> CallOutcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if !self.allow_request().is_allowed() {
            tracing::debug!(breaker = %self.name, "Call skipped, circuit breaker open");
            return CallOutcome::Skipped;
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                CallOutcome::Ok(value)
            }
            Err(e) => {
                self.record_failure();
                CallOutcome::Failed(e)
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.lock();
        BreakerSnapshot {
            status: state.status,
            failure_count: state.failures(),
            success_count: state.success_count,
            window: state.window.iter().copied().collect(),
            last_failure_time: state.last_failure_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: 3,
                success_threshold: 2,
                timeout_seconds: 10,
                window_size: 5,
            },
        )
    }

    #[test]
    fn test_opens_at_threshold() {
        let cb = breaker();
        assert!(cb.record_failure().is_none());
        assert!(cb.record_failure().is_none());
        let transition = cb.record_failure().unwrap();
        assert_eq!(transition.from, BreakerStatus::Closed);
        assert_eq!(transition.to, BreakerStatus::Open);
        assert_eq!(cb.allow_request(), Admission::Rejected);
    }

    #[test]
    fn test_window_forgets_old_failures() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        for _ in 0..5 {
            cb.record_success();
        }
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.status(), BreakerStatus::Closed);
        assert_eq!(cb.snapshot().failure_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_then_closed() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.status(), BreakerStatus::Open);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cb.allow_request(), Admission::Rejected);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cb.allow_request(), Admission::HalfOpened);
        assert_eq!(cb.status(), BreakerStatus::HalfOpen);

        assert!(cb.record_success().is_none());
        let closed = cb.record_success().unwrap();
        assert_eq!(closed.to, BreakerStatus::Closed);
        assert!(cb.snapshot().window.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cb.allow_request().is_allowed());

        let reopened = cb.record_failure().unwrap();
        assert_eq!(reopened.from, BreakerStatus::HalfOpen);
        assert_eq!(reopened.to, BreakerStatus::Open);
        assert_eq!(cb.allow_request(), Admission::Rejected);
    }

    #[test]
    fn test_outcomes_ignored_while_open() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        let before = cb.snapshot().window.len();
        assert!(cb.record_success().is_none());
        assert!(cb.record_failure().is_none());
        assert_eq!(cb.snapshot().window.len(), before);
    }

    #[test]
    fn test_reset_forces_closed() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        let transition = cb.reset().unwrap();
        assert_eq!(transition.to, BreakerStatus::Closed);
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.status, BreakerStatus::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert!(snapshot.last_failure_time.is_none());
        assert!(cb.reset().is_none());
    }

    #[tokio::test]
    async fn test_call_skips_when_open() {
        let cb = breaker();
        for _ in 0..3 {
            let outcome: CallOutcome<(), &str> = cb.call(|| async { Err("down") }).await;
            assert!(outcome.is_failed());
        }

        let mut ran = false;
        let outcome: CallOutcome<(), &str> = cb
            .call(|| {
                ran = true;
                async { Ok(()) }
            })
            .await;
        assert!(outcome.is_skipped());
        assert!(!ran);
    }
}
