//! Delay-based bandwidth estimation
//!
//! Packets from transport feedback are grouped by send time, the group
//! deltas feed the trendline detector, and its verdict drives AIMD rate
//! control together with the acknowledged throughput.

use super::aimd::{AimdRateControl, RateControlInput};
use super::inter_arrival::InterArrival;
use super::trendline::{TrendlineConfig, TrendlineEstimator};
use super::{delta_ms, BandwidthUsage, NetworkStateEstimate};
use crate::feedback::PacketFeedback;
use crate::rate::DataRate;
use std::time::{Duration, Instant};

/// Silence after which the delay state is considered stale
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of processing one feedback batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayBasedResult {
    /// The estimate changed or was confirmed
    pub updated: bool,
    /// The estimate was taken from a probe result
    pub probe: bool,
    pub target_bitrate: DataRate,
    /// The detector went from underusing back to normal
    pub recovered_from_overuse: bool,
    pub state: BandwidthUsage,
}

#[derive(Debug)]
pub struct DelayBasedEstimator {
    trendline_config: TrendlineConfig,
    inter_arrival: InterArrival,
    detector: TrendlineEstimator,
    rate_control: AimdRateControl,
    last_seen_packet: Option<Instant>,
    epoch: Option<Instant>,
    prev_bitrate: DataRate,
    prev_state: BandwidthUsage,
}

impl DelayBasedEstimator {
    pub fn new(trendline_config: TrendlineConfig, min_rate: DataRate, max_rate: DataRate) -> Self {
        DelayBasedEstimator {
            detector: TrendlineEstimator::new(trendline_config.clone()),
            trendline_config,
            inter_arrival: InterArrival::new(),
            rate_control: AimdRateControl::new(min_rate, max_rate),
            last_seen_packet: None,
            epoch: None,
            prev_bitrate: DataRate::ZERO,
            prev_state: BandwidthUsage::Normal,
        }
    }

    pub fn set_start_bitrate(&mut self, start: DataRate) {
        tracing::debug!(%start, "delay-based start bitrate");
        self.rate_control.set_start_bitrate(start);
    }

    pub fn set_min_bitrate(&mut self, min: DataRate) {
        self.rate_control.set_min_bitrate(min);
    }

    pub fn set_max_bitrate(&mut self, max: DataRate) {
        self.rate_control.set_max_bitrate(max);
    }

    pub fn on_rtt_update(&mut self, rtt: Duration) {
        self.rate_control.set_rtt(rtt);
    }

    pub fn set_network_state_estimate(&mut self, estimate: Option<NetworkStateEstimate>) {
        self.rate_control.set_network_state_estimate(estimate);
    }

    /// Current estimate, if one has been established
    pub fn last_estimate(&self) -> Option<DataRate> {
        self.rate_control
            .valid_estimate()
            .then(|| self.rate_control.latest_estimate())
    }

    pub fn state(&self) -> BandwidthUsage {
        self.detector.state()
    }

    pub fn rate_control(&self) -> &AimdRateControl {
        &self.rate_control
    }

    /// Process one batch of per-packet feedback
    ///
    /// `acked_bitrate` is the measured delivery rate and `probe_bitrate` a
    /// fresh probe result, both optional.
    pub fn incoming_packet_feedback_vector(
        &mut self,
        feedback: &[PacketFeedback],
        acked_bitrate: Option<DataRate>,
        probe_bitrate: Option<DataRate>,
        now: Instant,
    ) -> DelayBasedResult {
        let mut received: Vec<&PacketFeedback> = feedback.iter().filter(|fb| fb.is_received()).collect();
        if received.is_empty() {
            tracing::trace!("feedback batch without received packets");
            return DelayBasedResult {
                updated: false,
                probe: false,
                target_bitrate: self.rate_control.latest_estimate(),
                recovered_from_overuse: false,
                state: self.detector.state(),
            };
        }
        received.sort_by_key(|fb| fb.receive_time);

        let mut recovered_from_overuse = false;
        let mut prev_detector_state = self.detector.state();
        for fb in received {
            self.incoming_packet_feedback(fb, now);
            let state = self.detector.state();
            if prev_detector_state == BandwidthUsage::Underusing && state == BandwidthUsage::Normal {
                recovered_from_overuse = true;
            }
            prev_detector_state = state;
        }

        self.maybe_update_estimate(acked_bitrate, probe_bitrate, recovered_from_overuse, now)
    }

    fn incoming_packet_feedback(&mut self, fb: &PacketFeedback, now: Instant) {
        let Some(receive_time) = fb.receive_time else {
            return;
        };
        let stale = self
            .last_seen_packet
            .map_or(true, |last| now.saturating_duration_since(last) > STREAM_TIMEOUT);
        if stale {
            if self.last_seen_packet.is_some() {
                tracing::debug!("stream timed out, resetting delay state");
            }
            self.inter_arrival.reset();
            self.detector = TrendlineEstimator::new(self.trendline_config.clone());
        }
        self.last_seen_packet = Some(now);

        let epoch = *self.epoch.get_or_insert(receive_time);
        if let Some(deltas) = self
            .inter_arrival
            .compute_deltas(fb.send_time, receive_time, now, fb.size)
        {
            self.detector.update(
                deltas.arrival_delta_ms,
                deltas.send_delta_ms,
                delta_ms(receive_time, epoch),
            );
        }
    }

    fn maybe_update_estimate(
        &mut self,
        acked_bitrate: Option<DataRate>,
        probe_bitrate: Option<DataRate>,
        recovered_from_overuse: bool,
        now: Instant,
    ) -> DelayBasedResult {
        let mut result = DelayBasedResult {
            updated: false,
            probe: false,
            target_bitrate: self.rate_control.latest_estimate(),
            recovered_from_overuse: false,
            state: self.detector.state(),
        };

        if self.detector.state() == BandwidthUsage::Overusing {
            match acked_bitrate {
                Some(acked) => {
                    if self.rate_control.time_to_reduce_further(now, acked) {
                        result.updated = self.update_estimate(Some(acked), &mut result.target_bitrate, now);
                    }
                }
                None => {
                    if self.rate_control.initial_time_to_reduce_further(now) {
                        // No throughput measurement yet: halve periodically
                        let halved = self.rate_control.latest_estimate() * 0.5;
                        self.rate_control.set_estimate(halved, now);
                        result.updated = true;
                        result.target_bitrate = self.rate_control.latest_estimate();
                    }
                }
            }
        } else if let Some(probe) = probe_bitrate {
            self.rate_control.set_estimate(probe, now);
            self.rate_control.on_probe_rate(probe);
            result.probe = true;
            result.updated = true;
            result.target_bitrate = self.rate_control.latest_estimate();
        } else {
            result.updated = self.update_estimate(acked_bitrate, &mut result.target_bitrate, now);
            result.recovered_from_overuse = recovered_from_overuse;
        }

        let state = self.detector.state();
        if result.updated && (self.prev_bitrate != result.target_bitrate || self.prev_state != state) {
            tracing::debug!(target = %result.target_bitrate, %state, "delay-based estimate");
            self.prev_bitrate = result.target_bitrate;
            self.prev_state = state;
        }
        result.state = state;
        result
    }

    fn update_estimate(&mut self, acked_bitrate: Option<DataRate>, target: &mut DataRate, now: Instant) -> bool {
        let input = RateControlInput {
            state: self.detector.state(),
            estimated_throughput: acked_bitrate,
        };
        *target = self.rate_control.update(input, now);
        self.rate_control.valid_estimate()
    }
}
