//! Application-limited region detection
//!
//! The sender is application limited when it sends noticeably less than the
//! estimate allows. In that state acknowledged throughput says nothing about
//! the link, so probing is used to discover headroom instead.

use super::interval_budget::IntervalBudget;
use crate::rate::DataRate;
use std::time::Instant;

/// Fraction of the estimate the budget is refilled at
const BANDWIDTH_USAGE_RATIO: f64 = 0.65;
/// Enter ALR once the unused budget exceeds this fraction of the window
const START_BUDGET_LEVEL_RATIO: f64 = 0.80;
/// Leave ALR once the unused budget drops below this fraction
const STOP_BUDGET_LEVEL_RATIO: f64 = 0.50;

#[derive(Debug)]
pub struct AlrDetector {
    budget: IntervalBudget,
    last_send_time: Option<Instant>,
    alr_start_time: Option<Instant>,
}

impl AlrDetector {
    pub fn new(initial_estimate: DataRate) -> Self {
        AlrDetector {
            budget: IntervalBudget::new(initial_estimate * BANDWIDTH_USAGE_RATIO, true),
            last_send_time: None,
            alr_start_time: None,
        }
    }

    /// Account for a sent packet
    pub fn on_bytes_sent(&mut self, bytes: usize, send_time: Instant) {
        let Some(last) = self.last_send_time else {
            self.last_send_time = Some(send_time);
            return;
        };
        let elapsed = send_time.saturating_duration_since(last);
        self.last_send_time = Some(send_time.max(last));
        self.budget.use_budget(bytes);
        self.budget.increase_budget(elapsed);

        let ratio = self.budget.budget_ratio();
        if ratio > START_BUDGET_LEVEL_RATIO && self.alr_start_time.is_none() {
            tracing::debug!(ratio, "entering application-limited region");
            self.alr_start_time = Some(send_time);
        } else if ratio < STOP_BUDGET_LEVEL_RATIO && self.alr_start_time.is_some() {
            tracing::debug!(ratio, "leaving application-limited region");
            self.alr_start_time = None;
        }
    }

    pub fn set_estimated_bitrate(&mut self, estimate: DataRate) {
        self.budget.set_target_rate(estimate * BANDWIDTH_USAGE_RATIO);
    }

    /// When the current application-limited region began, if in one
    pub fn alr_start_time(&self) -> Option<Instant> {
        self.alr_start_time
    }

    pub fn in_alr(&self) -> bool {
        self.alr_start_time.is_some()
    }
}
