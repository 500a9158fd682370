use std::time::Duration;

use crate::types::FailureReason;

/// How many failed attempts a job may accumulate and how long it waits
/// between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(300),
            max_delay: Duration::from_secs(6 * 3600),
        }
    }
}

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Back to `Reserved`, claimable again after `delay`.
    Retry { attempts: u32, delay: Duration },
    /// Straight to `PermanentlyFailed`.
    GiveUp { attempts: u32 },
}

impl RetryBudget {
    /// Decide the follow-up for a job that has used `attempts` so far and
    /// just failed with `reason`.
    pub fn after_failure(&self, attempts: u32, reason: FailureReason) -> Disposition {
        let attempts = if reason.consumes_attempt() {
            attempts.saturating_add(1)
        } else {
            attempts
        };

        if !reason.is_retryable() || attempts >= self.max_retries {
            return Disposition::GiveUp { attempts };
        }

        Disposition::Retry {
            attempts,
            delay: self.delay_for(attempts),
        }
    }

    /// `base * 2^(attempts-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1);
        let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
