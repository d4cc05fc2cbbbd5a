//! Leaky-bucket byte budget over a fixed window

use crate::rate::DataRate;
use std::time::Duration;

const WINDOW: Duration = Duration::from_millis(500);

/// Byte budget refilled at a target rate and drained by sent bytes
///
/// The budget is bounded to one window's worth of bytes in both directions.
/// With `can_build_up_underuse` unused budget accumulates across refills;
/// otherwise each refill starts over from the refill amount.
#[derive(Debug, Clone)]
pub struct IntervalBudget {
    target_rate: DataRate,
    max_bytes_in_budget: i64,
    bytes_remaining: i64,
    can_build_up_underuse: bool,
}

impl IntervalBudget {
    pub fn new(initial_rate: DataRate, can_build_up_underuse: bool) -> Self {
        let mut budget = IntervalBudget {
            target_rate: DataRate::ZERO,
            max_bytes_in_budget: 0,
            bytes_remaining: 0,
            can_build_up_underuse,
        };
        budget.set_target_rate(initial_rate);
        budget
    }

    pub fn set_target_rate(&mut self, rate: DataRate) {
        self.target_rate = rate;
        self.max_bytes_in_budget = rate.bytes_over(WINDOW).min(i64::MAX as u64) as i64;
        self.bytes_remaining = self
            .bytes_remaining
            .clamp(-self.max_bytes_in_budget, self.max_bytes_in_budget);
    }

    pub fn target_rate(&self) -> DataRate {
        self.target_rate
    }

    /// Refill for `elapsed` time at the target rate
    pub fn increase_budget(&mut self, elapsed: Duration) {
        let bytes = self.target_rate.bytes_over(elapsed).min(i64::MAX as u64) as i64;
        if self.bytes_remaining < 0 || self.can_build_up_underuse {
            self.bytes_remaining = self
                .bytes_remaining
                .saturating_add(bytes)
                .min(self.max_bytes_in_budget);
        } else {
            self.bytes_remaining = bytes.min(self.max_bytes_in_budget);
        }
    }

    /// Drain `bytes`
    pub fn use_budget(&mut self, bytes: usize) {
        self.bytes_remaining = self
            .bytes_remaining
            .saturating_sub(bytes as i64)
            .max(-self.max_bytes_in_budget);
    }

    /// Bytes that may still be sent (never negative)
    pub fn bytes_remaining(&self) -> usize {
        self.bytes_remaining.max(0) as usize
    }

    /// Bytes sent beyond the budget (never negative)
    pub fn deficit(&self) -> usize {
        (-self.bytes_remaining).max(0) as usize
    }

    /// Remaining budget relative to the window size, in `[-1, 1]`
    pub fn budget_ratio(&self) -> f64 {
        if self.max_bytes_in_budget == 0 {
            return 0.0;
        }
        self.bytes_remaining as f64 / self.max_bytes_in_budget as f64
    }
}
