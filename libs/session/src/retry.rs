use std::time::Duration;

use rand::Rng;

/// Exponential backoff with additive jitter.
///
/// `delay(attempt) = min(base * factor^(attempt - 1), max) + uniform[0, jitter_max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: u32,
    pub jitter_max: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            backoff_factor: 2,
            jitter_max: Duration::from_millis(1_000),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter_max = Duration::ZERO;
        self
    }

    /// Deterministic part of the delay for a 1-based attempt number.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let base = self.base_delay.as_millis() as u64;
        let factor = u64::from(self.backoff_factor.max(1)).saturating_pow(exponent.min(32));
        let capped = base
            .saturating_mul(factor)
            .min(self.max_delay.as_millis() as u64);
        Duration::from_millis(capped)
    }

    pub fn jitter(&self) -> Duration {
        let max = self.jitter_max.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..max))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay_for(attempt) + self.jitter()
    }
}

/// Outcome of recording one more consecutive connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

/// Consecutive-failure counter driven by [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryState {
    pub attempt: u32,
    policy: RetryPolicy,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { attempt: 0, policy }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The failure that brings the count to `max_attempts` exhausts the budget.
    pub fn record_failure(&mut self) -> RetryDecision {
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt < self.policy.max_attempts {
            RetryDecision::Retry {
                attempt: self.attempt,
                delay: self.policy.delay(self.attempt),
            }
        } else {
            RetryDecision::Exhausted {
                attempts: self.attempt,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_component_is_non_decreasing_and_capped() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (1..=8).map(|a| policy.base_delay_for(a)).collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[4], Duration::from_secs(16));
        assert_eq!(delays[5], Duration::from_secs(30));
        assert_eq!(delays[7], Duration::from_secs(30));
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn jitter_stays_below_maximum() {
        let policy = RetryPolicy::default();
        for attempt in 1..=policy.max_attempts {
            for _ in 0..50 {
                let delay = policy.delay(attempt);
                let base = policy.base_delay_for(attempt);
                assert!(delay >= base);
                assert!(delay - base < policy.jitter_max);
            }
        }
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        let policy = RetryPolicy::default().without_jitter();
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
        assert_eq!(policy.base_delay_for(0), Duration::from_secs(1));
    }

    #[test]
    fn budget_exhausts_on_max_attempt() {
        let mut state = RetryState::new(RetryPolicy::default().with_max_attempts(3).without_jitter());
        assert_eq!(
            state.record_failure(),
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            state.record_failure(),
            RetryDecision::Retry {
                attempt: 2,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(state.record_failure(), RetryDecision::Exhausted { attempts: 3 });

        state.reset();
        assert_eq!(state.attempt, 0);
    }
}
