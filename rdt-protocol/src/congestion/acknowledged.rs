//! Throughput acknowledged by the receiver
//!
//! A Bayesian estimate over fixed-length windows of received bytes. Each
//! window sample is weighted by how far it strays from the current estimate,
//! so single outliers move the estimate little.

use crate::feedback::PacketFeedback;
use crate::rate::DataRate;
use std::time::Instant;

/// Window used until the first estimate exists
const INITIAL_WINDOW_MS: i64 = 500;
const WINDOW_MS: i64 = 150;
const UNCERTAINTY_SCALE: f64 = 10.0;
const UNCERTAINTY_SCALE_IN_ALR: f64 = 10.0;
const SMALL_SAMPLE_UNCERTAINTY_SCALE: f64 = 10.0;
/// Windows with fewer bytes than this are "small" samples
const SMALL_SAMPLE_THRESHOLD_BYTES: u64 = 3000;
const ESTIMATE_VARIANCE_INCREMENT: f64 = 5.0;
const INITIAL_ESTIMATE_VARIANCE: f64 = 50.0;
/// Variance added when a large rate change is expected
const FAST_RATE_CHANGE_VARIANCE: f64 = 200.0;

#[derive(Debug)]
struct BitrateEstimator {
    epoch: Option<Instant>,
    sum: u64,
    current_window_us: i64,
    prev_time_us: Option<i64>,
    /// kbps
    estimate: Option<f64>,
    estimate_var: f64,
}

impl BitrateEstimator {
    fn new() -> Self {
        BitrateEstimator {
            epoch: None,
            sum: 0,
            current_window_us: 0,
            prev_time_us: None,
            estimate: None,
            estimate_var: INITIAL_ESTIMATE_VARIANCE,
        }
    }

    fn update(&mut self, at: Instant, bytes: usize, in_alr: bool) {
        let epoch = *self.epoch.get_or_insert(at);
        let now_us = at.saturating_duration_since(epoch).as_micros() as i64;
        let window_ms = if self.estimate.is_none() {
            INITIAL_WINDOW_MS
        } else {
            WINDOW_MS
        };
        let Some((sample, is_small)) = self.update_window(now_us, bytes as u64, window_ms) else {
            return;
        };
        let Some(estimate) = self.estimate else {
            self.estimate = Some(sample);
            return;
        };

        let scale = if in_alr {
            UNCERTAINTY_SCALE_IN_ALR
        } else if is_small && sample < estimate {
            SMALL_SAMPLE_UNCERTAINTY_SCALE
        } else {
            UNCERTAINTY_SCALE
        };
        // Samples far from the estimate are trusted less
        let sample_uncertainty = scale * (estimate - sample).abs() / estimate.max(f64::MIN_POSITIVE);
        let sample_var = sample_uncertainty * sample_uncertainty;
        let pred_var = self.estimate_var + ESTIMATE_VARIANCE_INCREMENT;
        let denom = sample_var + pred_var;
        let updated = (sample_var * estimate + pred_var * sample) / denom;
        self.estimate = Some(updated.max(0.0));
        self.estimate_var = sample_var * pred_var / denom;
    }

    /// Returns a kbps sample when a full window has elapsed
    fn update_window(&mut self, now_us: i64, bytes: u64, window_ms: i64) -> Option<(f64, bool)> {
        let window_us = window_ms * 1000;
        if let Some(prev) = self.prev_time_us {
            if now_us < prev {
                // Time went backwards
                self.prev_time_us = None;
                self.sum = 0;
                self.current_window_us = 0;
            }
        }
        if let Some(prev) = self.prev_time_us {
            self.current_window_us += now_us - prev;
            if now_us - prev > window_us {
                // Gap longer than a window, the partial sum is meaningless
                self.sum = 0;
                self.current_window_us %= window_us;
            }
        }
        self.prev_time_us = Some(now_us);

        let mut sample = None;
        if self.current_window_us >= window_us {
            let is_small = self.sum < SMALL_SAMPLE_THRESHOLD_BYTES;
            sample = Some((8.0 * self.sum as f64 / window_ms as f64, is_small));
            self.current_window_us -= window_us;
            self.sum = 0;
        }
        self.sum += bytes;
        sample
    }

    fn bitrate(&self) -> Option<DataRate> {
        self.estimate.map(|kbps| DataRate::from_bps((kbps * 1000.0) as u64))
    }

    fn expect_fast_rate_change(&mut self) {
        self.estimate_var += FAST_RATE_CHANGE_VARIANCE;
    }
}

#[derive(Debug)]
pub struct AcknowledgedBitrateEstimator {
    estimator: BitrateEstimator,
    in_alr: bool,
    alr_ended_time: Option<Instant>,
}

impl Default for AcknowledgedBitrateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl AcknowledgedBitrateEstimator {
    pub fn new() -> Self {
        AcknowledgedBitrateEstimator {
            estimator: BitrateEstimator::new(),
            in_alr: false,
            alr_ended_time: None,
        }
    }

    /// Feed received packets, in receive order
    pub fn incoming_packet_feedback_vector(&mut self, feedback: &[PacketFeedback]) {
        for fb in feedback {
            let Some(receive_time) = fb.receive_time else {
                continue;
            };
            if let Some(ended) = self.alr_ended_time {
                if fb.send_time > ended {
                    self.estimator.expect_fast_rate_change();
                    self.alr_ended_time = None;
                }
            }
            self.estimator.update(receive_time, fb.size, self.in_alr);
        }
    }

    pub fn bitrate(&self) -> Option<DataRate> {
        self.estimator.bitrate()
    }

    pub fn set_alr(&mut self, in_alr: bool) {
        self.in_alr = in_alr;
    }

    /// Packets sent after `ended` may show a sudden rate change
    pub fn set_alr_ended_time(&mut self, ended: Instant) {
        self.alr_ended_time = Some(ended);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::SeqNumber;
    use std::time::Duration;

    /// Packets of `size` received every `interval`
    fn stream(start: Instant, count: usize, size: usize, interval: Duration) -> Vec<PacketFeedback> {
        (0..count)
            .map(|i| {
                let t = start + interval * i as u32;
                PacketFeedback {
                    ssrc: 1,
                    sequence_number: i as i64,
                    rtp_seq: SeqNumber::new(i as u16),
                    send_time: t,
                    receive_time: Some(t + Duration::from_millis(40)),
                    size,
                    probe_cluster_id: None,
                }
            })
            .collect()
    }

    #[test]
    fn test_no_estimate_before_initial_window() {
        let mut estimator = AcknowledgedBitrateEstimator::new();
        let start = Instant::now();
        estimator.incoming_packet_feedback_vector(&stream(start, 40, 1000, Duration::from_millis(10)));
        assert_eq!(estimator.bitrate(), None);
    }

    #[test]
    fn test_converges_to_delivery_rate() {
        let mut estimator = AcknowledgedBitrateEstimator::new();
        let start = Instant::now();
        // 1000 bytes every 10 ms is 800 kbps
        estimator.incoming_packet_feedback_vector(&stream(start, 300, 1000, Duration::from_millis(10)));
        let rate = estimator.bitrate().unwrap();
        assert!(rate > DataRate::from_kbps(760) && rate < DataRate::from_kbps(840), "{rate}");
    }

    #[test]
    fn test_lost_packets_ignored() {
        let mut estimator = AcknowledgedBitrateEstimator::new();
        let start = Instant::now();
        let mut packets = stream(start, 300, 1000, Duration::from_millis(10));
        for fb in packets.iter_mut().skip(1).step_by(2) {
            fb.receive_time = None;
        }
        estimator.incoming_packet_feedback_vector(&packets);
        let rate = estimator.bitrate().unwrap();
        assert!(rate > DataRate::from_kbps(360) && rate < DataRate::from_kbps(440), "{rate}");
    }

    #[test]
    fn test_outlier_moves_estimate_little() {
        let mut estimator = AcknowledgedBitrateEstimator::new();
        let start = Instant::now();
        estimator.incoming_packet_feedback_vector(&stream(start, 300, 1000, Duration::from_millis(10)));
        let before = estimator.bitrate().unwrap();

        // One burst window at five times the rate
        let burst_start = start + Duration::from_millis(3000);
        estimator.incoming_packet_feedback_vector(&stream(burst_start, 15, 5000, Duration::from_millis(10)));
        estimator.incoming_packet_feedback_vector(&stream(
            burst_start + Duration::from_millis(150),
            15,
            1000,
            Duration::from_millis(10),
        ));
        let after = estimator.bitrate().unwrap();
        assert!(after < before * 1.2, "{before} -> {after}");
    }
}
