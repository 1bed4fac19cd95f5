//! Shared retry schedule for oracle and store calls.

use std::time::Duration;

/// Exponential backoff with a hard overall budget.
///
/// The scoring and store stages use the same schedule: 200 ms initial
/// delay doubling per attempt, at most four attempts, five seconds total.
#[derive(Debug, Clone, Copy)]
pub struct BackoffSchedule {
    pub initial: Duration,
    pub factor: u32,
    pub max_attempts: u32,
    pub budget: Duration,
}

impl BackoffSchedule {
    pub fn new(initial_ms: u64, max_attempts: u32, budget_ms: u64) -> Self {
        Self {
            initial: Duration::from_millis(initial_ms),
            factor: 2,
            max_attempts,
            budget: Duration::from_millis(budget_ms),
        }
    }

    pub fn standard() -> Self {
        Self::new(200, 4, 5_000)
    }

    /// Delay to sleep after the given 1-based attempt, or `None` when the
    /// schedule allows no further attempt.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        Some(self.initial * self.factor.pow(attempt - 1))
    }
}
