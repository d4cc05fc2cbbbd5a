//! Network controller
//!
//! Owns every estimator and turns sent-packet notifications, feedback
//! batches and periodic ticks into target rate, pacing rate and probe
//! decisions for the send path.

use super::acknowledged::AcknowledgedBitrateEstimator;
use super::alr::AlrDetector;
use super::delay_based::DelayBasedEstimator;
use super::probe_controller::{ProbeController, ProbeControllerConfig};
use super::probe_estimator::ProbeBitrateEstimator;
use super::trendline::TrendlineConfig;
use super::{NetworkStateEstimate, ProbeClusterConfig};
use crate::feedback::{PacketFeedback, SentPacket};
use crate::rate::DataRate;
use std::time::{Duration, Instant};

/// Configuration for the network controller
#[derive(Debug, Clone)]
pub struct NetworkControllerConfig {
    /// Never target below this rate
    pub min_rate: DataRate,
    /// Rate used until feedback arrives
    pub start_rate: DataRate,
    /// Never target above this rate
    pub max_rate: DataRate,
    /// Pacing rate as a multiple of the target rate
    pub pacing_factor: f64,
    /// Upper bound for padding sent to keep the estimate alive
    pub max_padding_rate: DataRate,
    pub trendline: TrendlineConfig,
    pub probing: ProbeControllerConfig,
}

impl Default for NetworkControllerConfig {
    fn default() -> Self {
        NetworkControllerConfig {
            min_rate: DataRate::from_kbps(30),
            start_rate: DataRate::from_kbps(300),
            max_rate: DataRate::from_kbps(20_000),
            pacing_factor: 2.5,
            max_padding_rate: DataRate::ZERO,
            trendline: TrendlineConfig::default(),
            probing: ProbeControllerConfig::default(),
        }
    }
}

/// Rates handed to the pacer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacerRates {
    pub pacing_rate: DataRate,
    pub padding_rate: DataRate,
}

/// Changes produced by one controller call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkControlUpdate {
    /// New target rate for the encoder, if it changed
    pub target_rate: Option<DataRate>,
    /// New pacer rates, if they changed
    pub pacer: Option<PacerRates>,
    /// Probe clusters to start
    pub probes: Vec<ProbeClusterConfig>,
}

impl NetworkControlUpdate {
    pub fn is_empty(&self) -> bool {
        self.target_rate.is_none() && self.pacer.is_none() && self.probes.is_empty()
    }
}

#[derive(Debug)]
pub struct NetworkController {
    config: NetworkControllerConfig,
    delay_based: DelayBasedEstimator,
    acknowledged: AcknowledgedBitrateEstimator,
    probe_estimator: ProbeBitrateEstimator,
    probe_controller: ProbeController,
    alr: AlrDetector,
    network_available: bool,
    previously_in_alr: bool,
    target_rate: DataRate,
    last_reported_target: Option<DataRate>,
    last_pacer: Option<PacerRates>,
}

impl NetworkController {
    pub fn new(config: NetworkControllerConfig) -> Self {
        let mut delay_based = DelayBasedEstimator::new(config.trendline.clone(), config.min_rate, config.max_rate);
        delay_based.set_start_bitrate(config.start_rate);
        NetworkController {
            delay_based,
            acknowledged: AcknowledgedBitrateEstimator::new(),
            probe_estimator: ProbeBitrateEstimator::new(),
            probe_controller: ProbeController::new(config.probing.clone()),
            alr: AlrDetector::new(config.start_rate),
            network_available: true,
            previously_in_alr: false,
            target_rate: config.start_rate,
            last_reported_target: None,
            last_pacer: None,
            config,
        }
    }

    /// Current target rate
    pub fn target_rate(&self) -> DataRate {
        self.target_rate
    }

    /// Latest acknowledged throughput, if measured
    pub fn acknowledged_rate(&self) -> Option<DataRate> {
        self.acknowledged.bitrate()
    }

    pub fn in_alr(&self) -> bool {
        self.alr.in_alr()
    }

    /// Apply rate bounds; `start` resets the estimate when given
    pub fn set_bitrates(
        &mut self,
        min: DataRate,
        start: Option<DataRate>,
        max: DataRate,
        now: Instant,
    ) -> NetworkControlUpdate {
        self.config.min_rate = min;
        self.config.max_rate = max;
        self.delay_based.set_min_bitrate(min);
        self.delay_based.set_max_bitrate(max);

        let mut update = NetworkControlUpdate::default();
        if let Some(start) = start {
            self.config.start_rate = start;
            self.delay_based.set_start_bitrate(start);
            self.apply_target(start, &mut update);
        } else {
            let clamped = self.target_rate.clamp_to(min, max);
            self.apply_target(clamped, &mut update);
        }
        let probes = self
            .probe_controller
            .set_bitrates(min, start.unwrap_or(DataRate::ZERO), max, now);
        self.add_probes(probes, &mut update);
        update
    }

    /// Record a packet handed to the network
    pub fn on_sent_packet(&mut self, packet: &SentPacket) {
        self.alr.on_bytes_sent(packet.size, packet.send_time);
    }

    /// Process one batch of feedback records
    pub fn on_feedback(&mut self, feedback: &[PacketFeedback], now: Instant) -> NetworkControlUpdate {
        let mut update = NetworkControlUpdate::default();
        if feedback.is_empty() {
            return update;
        }

        let in_alr = self.alr.in_alr();
        self.probe_controller.set_alr_start_time(self.alr.alr_start_time());
        if self.previously_in_alr && !in_alr {
            self.acknowledged.set_alr_ended_time(now);
            self.probe_controller.set_alr_ended_time(now);
        }
        self.previously_in_alr = in_alr;
        self.acknowledged.set_alr(in_alr);

        let mut sorted = feedback.to_vec();
        sorted.sort_by_key(|fb| (fb.receive_time.is_none(), fb.receive_time));
        self.acknowledged.incoming_packet_feedback_vector(&sorted);
        for fb in sorted.iter().filter(|fb| fb.probe_cluster_id.is_some()) {
            self.probe_estimator.handle_probe_and_estimate_bitrate(fb);
        }
        let probe_bitrate = self.probe_estimator.fetch_and_reset_last_estimated_bitrate();
        let acked_bitrate = self.acknowledged.bitrate();

        let result = self
            .delay_based
            .incoming_packet_feedback_vector(&sorted, acked_bitrate, probe_bitrate, now);

        if result.updated {
            if result.probe {
                tracing::debug!(rate = %result.target_bitrate, "estimate set from probe");
            }
            let probes = self
                .probe_controller
                .set_estimated_bitrate(result.target_bitrate, now);
            self.add_probes(probes, &mut update);
            self.apply_target(result.target_bitrate, &mut update);
        }
        if result.recovered_from_overuse {
            let probes = self.probe_controller.request_probe(now);
            self.add_probes(probes, &mut update);
        }
        update
    }

    /// Periodic tick
    pub fn on_process_interval(&mut self, now: Instant) -> NetworkControlUpdate {
        let mut update = NetworkControlUpdate::default();
        self.probe_controller.set_alr_start_time(self.alr.alr_start_time());
        let probes = self.probe_controller.process(now);
        self.add_probes(probes, &mut update);
        update
    }

    pub fn set_network_available(&mut self, available: bool, now: Instant) -> NetworkControlUpdate {
        let mut update = NetworkControlUpdate::default();
        if available == self.network_available {
            return update;
        }
        self.network_available = available;
        tracing::info!(available, "network availability changed");
        let probes = self.probe_controller.on_network_availability(available, now);
        self.add_probes(probes, &mut update);
        if available {
            // Re-announce the target that was suppressed while offline
            self.last_reported_target = None;
            self.apply_target(self.target_rate, &mut update);
        } else {
            update.target_rate = Some(DataRate::ZERO);
            self.last_reported_target = Some(DataRate::ZERO);
        }
        update
    }

    pub fn set_network_state_estimate(&mut self, estimate: Option<NetworkStateEstimate>) {
        self.delay_based.set_network_state_estimate(estimate);
        self.probe_controller
            .set_network_state_estimate(estimate.map(|e| e.link_capacity_upper));
    }

    /// The application's total allocated rate changed
    pub fn set_max_total_allocated_bitrate(&mut self, total: DataRate, now: Instant) -> NetworkControlUpdate {
        let mut update = NetworkControlUpdate::default();
        let probes = self.probe_controller.on_max_total_allocated_bitrate(total, now);
        self.add_probes(probes, &mut update);
        update
    }

    pub fn on_rtt_update(&mut self, rtt: Duration) {
        self.delay_based.on_rtt_update(rtt);
    }

    fn add_probes(&mut self, probes: Vec<ProbeClusterConfig>, update: &mut NetworkControlUpdate) {
        if !self.network_available {
            return;
        }
        for probe in &probes {
            self.probe_estimator.on_probe_cluster_created(probe);
        }
        update.probes.extend(probes);
    }

    fn apply_target(&mut self, target: DataRate, update: &mut NetworkControlUpdate) {
        let target = target.clamp_to(self.config.min_rate, self.config.max_rate);
        self.target_rate = target;
        self.alr.set_estimated_bitrate(target);
        if !self.network_available {
            return;
        }

        if self.last_reported_target != Some(target) {
            tracing::debug!(%target, "target rate changed");
            self.last_reported_target = Some(target);
            update.target_rate = Some(target);
        }
        let pacer = PacerRates {
            pacing_rate: target * self.config.pacing_factor,
            padding_rate: self.config.max_padding_rate.min(target),
        };
        if self.last_pacer != Some(pacer) {
            self.last_pacer = Some(pacer);
            update.pacer = Some(pacer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::SeqNumber;

    fn kbps(value: u64) -> DataRate {
        DataRate::from_kbps(value)
    }

    fn controller() -> NetworkController {
        NetworkController::new(NetworkControllerConfig {
            max_rate: kbps(5000),
            ..Default::default()
        })
    }

    /// Feedback for packets sent every 10 ms, queued `queue_growth_ms`
    /// more per packet from `growth_from` on
    fn feedback(
        start: Instant,
        first_seq: i64,
        count: usize,
        queue_growth_ms: f64,
        growth_from: i64,
    ) -> (Vec<PacketFeedback>, Instant) {
        let mut out = Vec::new();
        for i in 0..count {
            let seq = first_seq + i as i64;
            let send = start + Duration::from_millis(seq as u64 * 10);
            let queue = queue_growth_ms * (seq - growth_from).max(0) as f64;
            out.push(PacketFeedback {
                ssrc: 1,
                sequence_number: seq,
                rtp_seq: SeqNumber::new(seq as u16),
                send_time: send,
                receive_time: Some(send + Duration::from_secs_f64((40.0 + queue) / 1000.0)),
                size: 1000,
                probe_cluster_id: None,
            });
        }
        let now = start + Duration::from_millis((first_seq as u64 + count as u64) * 10 + 100);
        (out, now)
    }

    #[test]
    fn test_initial_update() {
        let mut controller = controller();
        let now = Instant::now();
        let update = controller.set_bitrates(kbps(100), Some(kbps(300)), kbps(5000), now);
        assert_eq!(update.target_rate, Some(kbps(300)));
        assert_eq!(
            update.pacer,
            Some(PacerRates {
                pacing_rate: kbps(750),
                padding_rate: DataRate::ZERO,
            })
        );
        let rates: Vec<DataRate> = update.probes.iter().map(|p| p.target_rate).collect();
        assert_eq!(rates, vec![kbps(900), kbps(1800)]);
    }

    #[test]
    fn test_probe_result_raises_target() {
        let mut controller = controller();
        let start = Instant::now();
        let update = controller.set_bitrates(kbps(100), Some(kbps(300)), kbps(5000), start);
        let cluster = update.probes[0];

        // Probe cluster delivered at 900 kbps
        let probes: Vec<PacketFeedback> = (0..10u64)
            .map(|i| {
                let send = start + Duration::from_micros(i * 8889);
                PacketFeedback {
                    ssrc: 1,
                    sequence_number: i as i64,
                    rtp_seq: SeqNumber::new(i as u16),
                    send_time: send,
                    receive_time: Some(send + Duration::from_millis(30)),
                    size: 1000,
                    probe_cluster_id: Some(cluster.id),
                }
            })
            .collect();
        let update = controller.on_feedback(&probes, start + Duration::from_millis(200));
        let target = update.target_rate.unwrap();
        assert!(target > kbps(850) && target <= kbps(900), "{target}");
        assert_eq!(controller.target_rate(), target);
    }

    #[test]
    fn test_growing_delay_lowers_target() {
        let mut controller = controller();
        let start = Instant::now();
        controller.set_bitrates(kbps(100), Some(kbps(1000)), kbps(5000), start);

        let mut seq = 0;
        for _ in 0..30 {
            let (batch, now) = feedback(start, seq, 10, 0.0, 0);
            controller.on_feedback(&batch, now);
            seq += 10;
        }
        let before = controller.target_rate();

        let growth_from = seq;
        let mut lowest = before;
        for _ in 0..30 {
            let (batch, now) = feedback(start, seq, 10, 6.0, growth_from);
            let update = controller.on_feedback(&batch, now);
            if let Some(target) = update.target_rate {
                lowest = lowest.min(target);
            }
            seq += 10;
        }
        assert!(lowest < before);
    }

    #[test]
    fn test_unavailable_network_zeroes_target() {
        let mut controller = controller();
        let now = Instant::now();
        controller.set_bitrates(kbps(100), Some(kbps(300)), kbps(5000), now);
        let update = controller.set_network_available(false, now);
        assert_eq!(update.target_rate, Some(DataRate::ZERO));
        assert!(controller.on_process_interval(now + Duration::from_secs(2)).probes.is_empty());

        let update = controller.set_network_available(true, now + Duration::from_secs(3));
        assert_eq!(update.target_rate, Some(kbps(300)));
    }

    #[test]
    fn test_empty_feedback_is_noop() {
        let mut controller = controller();
        let now = Instant::now();
        controller.set_bitrates(kbps(100), Some(kbps(300)), kbps(5000), now);
        assert!(controller.on_feedback(&[], now).is_empty());
    }
}
