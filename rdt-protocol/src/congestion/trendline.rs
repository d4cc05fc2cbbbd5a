//! Trendline over-use detector
//!
//! Accumulates the one-way delay variation between send-time groups,
//! smooths it, and fits a least-squares slope over a sliding window. The
//! slope, scaled by the sample count and a gain, is compared against an
//! adaptive threshold to classify the link as normal, over- or underused.

use super::BandwidthUsage;
use std::collections::VecDeque;

const MAX_ADAPT_OFFSET_MS: f64 = 15.0;
const MIN_THRESHOLD_MS: f64 = 6.0;
const MAX_THRESHOLD_MS: f64 = 600.0;
const MAX_THRESHOLD_TIME_DELTA_MS: f64 = 100.0;
const DELTA_COUNTER_MAX: usize = 1000;
const MIN_NUM_DELTAS_FOR_SCALING: usize = 60;

#[derive(Debug, Clone)]
pub struct TrendlineConfig {
    /// Number of smoothed delay samples in the regression window
    pub window_size: usize,
    /// Exponential smoothing coefficient for the accumulated delay
    pub smoothing_coef: f64,
    /// Gain applied to the slope before thresholding
    pub threshold_gain: f64,
    /// Threshold adaptation rate when the trend exceeds it
    pub k_up: f64,
    /// Threshold adaptation rate when the trend is below it
    pub k_down: f64,
    pub initial_threshold_ms: f64,
    /// Sustained over-use time before signalling
    pub overusing_time_threshold_ms: f64,
}

impl Default for TrendlineConfig {
    fn default() -> Self {
        TrendlineConfig {
            window_size: 20,
            smoothing_coef: 0.9,
            threshold_gain: 4.0,
            k_up: 0.0087,
            k_down: 0.039,
            initial_threshold_ms: 12.5,
            overusing_time_threshold_ms: 10.0,
        }
    }
}

#[derive(Debug)]
pub struct TrendlineEstimator {
    config: TrendlineConfig,
    num_of_deltas: usize,
    first_arrival_time_ms: Option<f64>,
    accumulated_delay: f64,
    smoothed_delay: f64,
    /// (arrival time relative to the first, smoothed delay)
    delay_hist: VecDeque<(f64, f64)>,
    threshold: f64,
    prev_modified_trend: f64,
    last_update_ms: Option<f64>,
    prev_trend: f64,
    time_over_using: Option<f64>,
    overuse_counter: u32,
    hypothesis: BandwidthUsage,
}

impl TrendlineEstimator {
    pub fn new(config: TrendlineConfig) -> Self {
        TrendlineEstimator {
            threshold: config.initial_threshold_ms,
            delay_hist: VecDeque::with_capacity(config.window_size + 1),
            config,
            num_of_deltas: 0,
            first_arrival_time_ms: None,
            accumulated_delay: 0.0,
            smoothed_delay: 0.0,
            prev_modified_trend: f64::NAN,
            last_update_ms: None,
            prev_trend: 0.0,
            time_over_using: None,
            overuse_counter: 0,
            hypothesis: BandwidthUsage::Normal,
        }
    }

    /// Feed the deltas of one completed group
    ///
    /// `arrival_time_ms` is the local arrival time of the group on any
    /// monotonic millisecond scale.
    pub fn update(&mut self, recv_delta_ms: f64, send_delta_ms: f64, arrival_time_ms: f64) {
        let delta_ms = recv_delta_ms - send_delta_ms;
        self.num_of_deltas = (self.num_of_deltas + 1).min(DELTA_COUNTER_MAX);
        let first = *self.first_arrival_time_ms.get_or_insert(arrival_time_ms);

        self.accumulated_delay += delta_ms;
        self.smoothed_delay = self.config.smoothing_coef * self.smoothed_delay
            + (1.0 - self.config.smoothing_coef) * self.accumulated_delay;

        self.delay_hist.push_back((arrival_time_ms - first, self.smoothed_delay));
        if self.delay_hist.len() > self.config.window_size {
            self.delay_hist.pop_front();
        }

        let mut trend = self.prev_trend;
        if self.delay_hist.len() == self.config.window_size {
            // Slope stays at the previous value if the fit is degenerate
            if let Some(slope) = linear_fit_slope(&self.delay_hist) {
                trend = slope;
            }
        }

        self.detect(trend, send_delta_ms, arrival_time_ms);
    }

    pub fn state(&self) -> BandwidthUsage {
        self.hypothesis
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// The last gain-scaled trend, NaN before the first detection
    pub fn modified_trend(&self) -> f64 {
        self.prev_modified_trend
    }

    fn detect(&mut self, trend: f64, ts_delta_ms: f64, now_ms: f64) {
        if self.num_of_deltas < 2 {
            self.hypothesis = BandwidthUsage::Normal;
            return;
        }
        let modified_trend =
            self.num_of_deltas.min(MIN_NUM_DELTAS_FOR_SCALING) as f64 * trend * self.config.threshold_gain;
        self.prev_modified_trend = modified_trend;

        if modified_trend > self.threshold {
            let over = match self.time_over_using {
                // First sample over the threshold counts half a delta
                None => ts_delta_ms / 2.0,
                Some(t) => t + ts_delta_ms,
            };
            self.time_over_using = Some(over);
            self.overuse_counter += 1;
            if over > self.config.overusing_time_threshold_ms
                && self.overuse_counter > 1
                && trend >= self.prev_trend
            {
                self.time_over_using = Some(0.0);
                self.overuse_counter = 0;
                if self.hypothesis != BandwidthUsage::Overusing {
                    tracing::debug!(modified_trend, threshold = self.threshold, "delay over-use detected");
                }
                self.hypothesis = BandwidthUsage::Overusing;
            }
        } else if modified_trend < -self.threshold {
            self.time_over_using = None;
            self.overuse_counter = 0;
            self.hypothesis = BandwidthUsage::Underusing;
        } else {
            self.time_over_using = None;
            self.overuse_counter = 0;
            self.hypothesis = BandwidthUsage::Normal;
        }
        self.prev_trend = trend;
        self.update_threshold(modified_trend, now_ms);
    }

    fn update_threshold(&mut self, modified_trend: f64, now_ms: f64) {
        let last = *self.last_update_ms.get_or_insert(now_ms);
        let magnitude = modified_trend.abs();
        if magnitude > self.threshold + MAX_ADAPT_OFFSET_MS {
            // Spikes are not allowed to drag the threshold up
            self.last_update_ms = Some(now_ms);
            return;
        }
        let k = if magnitude < self.threshold {
            self.config.k_down
        } else {
            self.config.k_up
        };
        let time_delta_ms = (now_ms - last).clamp(0.0, MAX_THRESHOLD_TIME_DELTA_MS);
        self.threshold += k * (magnitude - self.threshold) * time_delta_ms;
        self.threshold = self.threshold.clamp(MIN_THRESHOLD_MS, MAX_THRESHOLD_MS);
        self.last_update_ms = Some(now_ms);
    }
}

/// Least-squares slope of y over x
fn linear_fit_slope(points: &VecDeque<(f64, f64)>) -> Option<f64> {
    let n = points.len() as f64;
    let (sum_x, sum_y) = points.iter().fold((0.0, 0.0), |(sx, sy), (x, y)| (sx + x, sy + y));
    let x_avg = sum_x / n;
    let y_avg = sum_y / n;
    let (numerator, denominator) = points.iter().fold((0.0, 0.0), |(num, den), (x, y)| {
        (num + (x - x_avg) * (y - y_avg), den + (x - x_avg) * (x - x_avg))
    });
    if denominator == 0.0 {
        None
    } else {
        Some(numerator / denominator)
    }
}
