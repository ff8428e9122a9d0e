//! Per-connection circuit breaker.
//!
//! Plain state machine with no locking of its own; the safety controller
//! holds every breaker behind its map lock and turns returned transitions into
//! audit events once the lock is released.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive errors that trip the breaker.
    pub failure_threshold: u32,
    /// Time spent open before a trial call is allowed.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    Opened { consecutive_errors: u32 },
    HalfOpened,
    Closed,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_errors: u32,
    opened_at: Option<Instant>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_errors: 0,
            opened_at: None,
            config,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Move Open → HalfOpen once the cooldown has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<BreakerTransition> {
        match (self.state, self.opened_at) {
            (BreakerState::Open, Some(opened)) if now.duration_since(opened) >= self.config.cooldown => {
                self.state = BreakerState::HalfOpen;
                Some(BreakerTransition::HalfOpened)
            }
            _ => None,
        }
    }

    /// Whether a call may go out now. Half-open admits the trial call.
    pub fn allows(&mut self, now: Instant) -> (bool, Option<BreakerTransition>) {
        let transition = self.poll(now);
        (self.state != BreakerState::Open, transition)
    }

    pub fn record_success(&mut self) -> Option<BreakerTransition> {
        self.consecutive_errors = 0;
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Closed;
                self.opened_at = None;
                Some(BreakerTransition::Closed)
            }
            _ => None,
        }
    }

    pub fn record_failure(&mut self, now: Instant) -> Option<BreakerTransition> {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        match self.state {
            BreakerState::Closed if self.consecutive_errors >= self.config.failure_threshold => {
                self.trip(now)
            }
            // The trial call failed.
            BreakerState::HalfOpen => self.trip(now),
            BreakerState::Open => {
                self.opened_at = Some(now);
                None
            }
            BreakerState::Closed => None,
        }
    }

    fn trip(&mut self, now: Instant) -> Option<BreakerTransition> {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        Some(BreakerTransition::Opened {
            consecutive_errors: self.consecutive_errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        })
    }

    #[test]
    fn test_opens_after_threshold() {
        let now = Instant::now();
        let mut b = breaker();
        assert_eq!(b.record_failure(now), None);
        assert_eq!(b.record_failure(now), None);
        assert_eq!(
            b.record_failure(now),
            Some(BreakerTransition::Opened { consecutive_errors: 3 })
        );
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allows(now).0);
    }

    #[test]
    fn test_success_resets_count_while_closed() {
        let now = Instant::now();
        let mut b = breaker();
        b.record_failure(now);
        b.record_failure(now);
        assert_eq!(b.record_success(), None);
        assert_eq!(b.record_failure(now), None);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown_then_closes_on_trial_success() {
        let start = Instant::now();
        let mut b = breaker();
        for _ in 0..3 {
            b.record_failure(start);
        }
        assert!(!b.allows(start + Duration::from_secs(29)).0);

        let (allowed, transition) = b.allows(start + Duration::from_secs(30));
        assert!(allowed);
        assert_eq!(transition, Some(BreakerTransition::HalfOpened));
        assert_eq!(b.record_success(), Some(BreakerTransition::Closed));
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_failed_trial_reopens() {
        let start = Instant::now();
        let mut b = breaker();
        for _ in 0..3 {
            b.record_failure(start);
        }
        let later = start + Duration::from_secs(31);
        b.poll(later);
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(matches!(b.record_failure(later), Some(BreakerTransition::Opened { .. })));
        // Cooldown restarts from the failed trial.
        assert!(!b.allows(later + Duration::from_secs(10)).0);
    }
}
