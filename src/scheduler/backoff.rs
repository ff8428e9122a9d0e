//! Retry budget for a worker's failed cycles.

use std::time::Duration;

use rand::Rng;

use super::SchedulerConfig;

/// Spacing and budget for consecutive transient cycle failures.
///
/// The n-th failure in a row waits `min(backoff_max, backoff_base × 2^(n-1))`,
/// spread by `± backoff_jitter` of that delay so sibling workers hitting the
/// same exchange outage do not retry in lockstep. Failure `max_retries + 1`
/// exhausts the budget.
#[derive(Debug, Clone)]
pub struct CycleBackoff {
    base: Duration,
    max_delay: Duration,
    jitter: f64,
    max_retries: u32,
    failures: u32,
}

impl CycleBackoff {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            base: config.backoff_base,
            max_delay: config.backoff_max,
            jitter: config.backoff_jitter.clamp(0.0, 1.0),
            max_retries: config.max_retries,
            failures: 0,
        }
    }

    /// Count a failed cycle. `None` once the budget is spent.
    pub fn on_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.max_retries {
            return None;
        }
        let doublings = (self.failures - 1).min(31);
        let delay = self.base.saturating_mul(1u32 << doublings).min(self.max_delay);

        let spread = delay.as_secs_f64() * self.jitter;
        if spread <= 0.0 {
            return Some(delay);
        }
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Some(Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0)))
    }

    pub fn on_success(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_retries: u32, jitter: f64) -> SchedulerConfig {
        SchedulerConfig {
            max_retries,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(3),
            backoff_jitter: jitter,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn test_doubles_then_caps_then_exhausts() {
        let mut backoff = CycleBackoff::from_config(&config(5, 0.0));
        let delays: Vec<Option<Duration>> = (0..6).map(|_| backoff.on_failure()).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_millis(500)),
                Some(Duration::from_secs(1)),
                Some(Duration::from_secs(2)),
                Some(Duration::from_secs(3)),
                Some(Duration::from_secs(3)),
                None,
            ]
        );
    }

    #[test]
    fn test_success_restores_budget() {
        let mut backoff = CycleBackoff::from_config(&config(2, 0.0));
        backoff.on_failure();
        backoff.on_failure();
        backoff.on_success();
        assert_eq!(backoff.on_failure(), Some(Duration::from_millis(500)));
        assert_eq!(backoff.on_failure(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.on_failure(), None);
    }

    #[test]
    fn test_zero_retries_fails_first_error() {
        let mut backoff = CycleBackoff::from_config(&config(0, 0.0));
        assert_eq!(backoff.on_failure(), None);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let mut backoff = CycleBackoff::from_config(&SchedulerConfig {
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(60),
            backoff_jitter: 0.2,
            ..SchedulerConfig::default()
        });
        let secs = backoff.on_failure().map(|d| d.as_secs_f64());
        assert!(secs.is_some_and(|s| (8.0..=12.0).contains(&s)), "delay was {secs:?}");
    }
}
