//! Additive-increase / multiplicative-decrease rate control

use super::{BandwidthUsage, NetworkStateEstimate};
use crate::rate::DataRate;
use std::time::{Duration, Instant};

/// Multiplicative decrease factor applied to the acknowledged rate
pub const DEFAULT_BACKOFF_FACTOR: f64 = 0.85;
const DEFAULT_RTT: Duration = Duration::from_millis(200);
/// Use the acknowledged rate as the estimate after this long without one
const INITIALIZATION_TIME: Duration = Duration::from_secs(5);
const MIN_INCREASE_RATE_BPS_PER_SECOND: f64 = 4000.0;
const AVERAGE_PACKET_SIZE_BITS: f64 = 1200.0 * 8.0;
const FRAME_INTERVAL: f64 = 1.0 / 30.0;
const BACKOFF_ADDITIONAL_TERM: DataRate = DataRate::from_kbps(5);

/// Smoothed estimate of the link capacity seen at over-use events
#[derive(Debug, Clone)]
pub struct LinkCapacityEstimator {
    estimate_kbps: Option<f64>,
    deviation_kbps: f64,
}

impl Default for LinkCapacityEstimator {
    fn default() -> Self {
        LinkCapacityEstimator {
            estimate_kbps: None,
            deviation_kbps: 0.4,
        }
    }
}

impl LinkCapacityEstimator {
    pub fn upper_bound(&self) -> DataRate {
        match self.estimate_kbps {
            Some(est) => DataRate::from_bps(((est + 3.0 * self.deviation_estimate(est)) * 1000.0) as u64),
            None => DataRate::INFINITE,
        }
    }

    pub fn lower_bound(&self) -> DataRate {
        match self.estimate_kbps {
            Some(est) => DataRate::from_bps(((est - 3.0 * self.deviation_estimate(est)).max(0.0) * 1000.0) as u64),
            None => DataRate::ZERO,
        }
    }

    pub fn reset(&mut self) {
        self.estimate_kbps = None;
    }

    pub fn on_overuse_detected(&mut self, acknowledged_rate: DataRate) {
        self.update(acknowledged_rate, 0.05);
    }

    pub fn on_probe_rate(&mut self, probe_rate: DataRate) {
        self.update(probe_rate, 0.5);
    }

    pub fn has_estimate(&self) -> bool {
        self.estimate_kbps.is_some()
    }

    pub fn estimate(&self) -> Option<DataRate> {
        self.estimate_kbps
            .map(|kbps| DataRate::from_bps((kbps * 1000.0) as u64))
    }

    fn update(&mut self, sample: DataRate, alpha: f64) {
        let sample_kbps = sample.bps_f64() / 1000.0;
        let estimate = match self.estimate_kbps {
            None => sample_kbps,
            Some(est) => (1.0 - alpha) * est + alpha * sample_kbps,
        };
        // Deviation is normalized by the link capacity estimate
        let norm = estimate.max(1.0);
        let error = estimate - sample_kbps;
        self.deviation_kbps = ((1.0 - alpha) * self.deviation_kbps + alpha * error * error / norm).clamp(0.4, 2.5);
        self.estimate_kbps = Some(estimate);
    }

    fn deviation_estimate(&self, estimate_kbps: f64) -> f64 {
        (self.deviation_kbps * estimate_kbps).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControlState {
    Hold,
    Increase,
    Decrease,
}

/// Delay signal plus the measured throughput, if known
#[derive(Debug, Clone, Copy)]
pub struct RateControlInput {
    pub state: BandwidthUsage,
    pub estimated_throughput: Option<DataRate>,
}

#[derive(Debug)]
pub struct AimdRateControl {
    min_rate: DataRate,
    max_rate: DataRate,
    beta: f64,
    current_bitrate: DataRate,
    latest_estimated_throughput: DataRate,
    link_capacity: LinkCapacityEstimator,
    network_estimate: Option<NetworkStateEstimate>,
    state: RateControlState,
    time_last_bitrate_change: Option<Instant>,
    time_last_bitrate_decrease: Option<Instant>,
    time_first_throughput_estimate: Option<Instant>,
    bitrate_is_initialized: bool,
    last_decrease: Option<DataRate>,
    rtt: Duration,
}

impl AimdRateControl {
    pub fn new(min_rate: DataRate, max_rate: DataRate) -> Self {
        AimdRateControl {
            min_rate,
            max_rate,
            beta: DEFAULT_BACKOFF_FACTOR,
            current_bitrate: max_rate,
            latest_estimated_throughput: max_rate,
            link_capacity: LinkCapacityEstimator::default(),
            network_estimate: None,
            state: RateControlState::Hold,
            time_last_bitrate_change: None,
            time_last_bitrate_decrease: None,
            time_first_throughput_estimate: None,
            bitrate_is_initialized: false,
            last_decrease: None,
            rtt: DEFAULT_RTT,
        }
    }

    pub fn set_start_bitrate(&mut self, start: DataRate) {
        self.current_bitrate = start;
        self.latest_estimated_throughput = start;
        self.bitrate_is_initialized = true;
    }

    pub fn set_min_bitrate(&mut self, min: DataRate) {
        self.min_rate = min;
        self.current_bitrate = self.current_bitrate.max(min);
    }

    pub fn set_max_bitrate(&mut self, max: DataRate) {
        self.max_rate = max;
        self.current_bitrate = self.current_bitrate.min(max);
    }

    pub fn set_rtt(&mut self, rtt: Duration) {
        self.rtt = rtt;
    }

    pub fn set_network_state_estimate(&mut self, estimate: Option<NetworkStateEstimate>) {
        self.network_estimate = estimate;
    }

    pub fn valid_estimate(&self) -> bool {
        self.bitrate_is_initialized
    }

    pub fn latest_estimate(&self) -> DataRate {
        self.current_bitrate
    }

    pub fn state(&self) -> RateControlState {
        self.state
    }

    /// Size of the last decrease, if the estimate has ever been reduced
    pub fn last_decrease(&self) -> Option<DataRate> {
        self.last_decrease
    }

    pub fn link_capacity(&self) -> &LinkCapacityEstimator {
        &self.link_capacity
    }

    /// Whether a further reduction is warranted while over-using
    pub fn time_to_reduce_further(&self, now: Instant, estimated_throughput: DataRate) -> bool {
        let reduction_interval = self.rtt.clamp(Duration::from_millis(10), Duration::from_millis(200));
        if let Some(last) = self.time_last_bitrate_change {
            if now.saturating_duration_since(last) >= reduction_interval {
                return true;
            }
        }
        if self.valid_estimate() {
            // Throughput has collapsed well below the estimate
            let threshold = self.latest_estimate() * 0.5;
            return estimated_throughput < threshold;
        }
        false
    }

    /// Whether to halve the estimate while over-using with no throughput
    /// measurement yet
    pub fn initial_time_to_reduce_further(&self, now: Instant) -> bool {
        self.valid_estimate()
            && self.time_to_reduce_further(now, self.latest_estimate() * 0.5 - DataRate::from_bps(1))
    }

    /// Apply a detector state and return the new estimate
    pub fn update(&mut self, input: RateControlInput, now: Instant) -> DataRate {
        if !self.bitrate_is_initialized {
            if let Some(throughput) = input.estimated_throughput {
                let first = *self.time_first_throughput_estimate.get_or_insert(now);
                if now.saturating_duration_since(first) > INITIALIZATION_TIME {
                    self.current_bitrate = throughput;
                    self.bitrate_is_initialized = true;
                }
            }
        }
        self.change_bitrate(input, now);
        self.current_bitrate
    }

    /// Override the estimate, e.g. with a probe result
    pub fn set_estimate(&mut self, bitrate: DataRate, now: Instant) {
        self.bitrate_is_initialized = true;
        let prev = self.current_bitrate;
        self.current_bitrate = self.clamp_bitrate(bitrate);
        self.time_last_bitrate_change = Some(now);
        if self.current_bitrate < prev {
            self.time_last_bitrate_decrease = Some(now);
        }
    }

    /// Record a probe result in the link capacity estimate
    pub fn on_probe_rate(&mut self, rate: DataRate) {
        self.link_capacity.on_probe_rate(rate);
    }

    /// Expected time between decreases given the current estimate
    pub fn expected_bandwidth_period(&self) -> Duration {
        const MIN_PERIOD: Duration = Duration::from_secs(2);
        const DEFAULT_PERIOD: Duration = Duration::from_secs(3);
        const MAX_PERIOD: Duration = Duration::from_secs(50);

        let Some(last_decrease) = self.last_decrease else {
            return DEFAULT_PERIOD;
        };
        let increase_rate = self.near_max_increase_rate_bps_per_second();
        let secs = last_decrease.bps_f64() / increase_rate;
        Duration::from_secs_f64(secs).clamp(MIN_PERIOD, MAX_PERIOD)
    }

    fn change_bitrate(&mut self, input: RateControlInput, now: Instant) {
        let estimated_throughput = input
            .estimated_throughput
            .unwrap_or(self.latest_estimated_throughput);
        if let Some(throughput) = input.estimated_throughput {
            self.latest_estimated_throughput = throughput;
        }

        // Over-use always reduces, even before the first estimate
        if !self.bitrate_is_initialized && input.state != BandwidthUsage::Overusing {
            return;
        }

        self.change_state(input.state, now);

        let mut new_bitrate = self.current_bitrate;
        match self.state {
            RateControlState::Hold => {}
            RateControlState::Increase => {
                if estimated_throughput > self.link_capacity.upper_bound() {
                    self.link_capacity.reset();
                }
                let increase_limit = estimated_throughput * 1.5 + DataRate::from_kbps(10);
                if self.current_bitrate < increase_limit {
                    let increased = if self.link_capacity.has_estimate() {
                        // Close to the known capacity: grow slowly
                        self.current_bitrate + self.additive_rate_increase(now)
                    } else {
                        self.current_bitrate + self.multiplicative_rate_increase(now)
                    };
                    new_bitrate = increased.min(increase_limit);
                }
                self.time_last_bitrate_change = Some(now);
            }
            RateControlState::Decrease => {
                let mut decreased = estimated_throughput * self.beta;
                if decreased > BACKOFF_ADDITIONAL_TERM {
                    decreased = decreased - BACKOFF_ADDITIONAL_TERM;
                }
                if decreased > self.current_bitrate {
                    if let Some(capacity) = self.link_capacity.estimate() {
                        decreased = capacity * self.beta;
                    }
                }
                if decreased < self.current_bitrate {
                    new_bitrate = decreased;
                }
                if self.bitrate_is_initialized && input.estimated_throughput.is_some() {
                    self.last_decrease = Some(self.current_bitrate - new_bitrate);
                }
                if estimated_throughput < self.link_capacity.lower_bound() {
                    // The link changed, forget the old capacity
                    self.link_capacity.reset();
                }

                self.bitrate_is_initialized = true;
                self.link_capacity.on_overuse_detected(estimated_throughput);
                self.state = RateControlState::Hold;
                self.time_last_bitrate_change = Some(now);
                self.time_last_bitrate_decrease = Some(now);
                tracing::debug!(
                    from = %self.current_bitrate,
                    to = %new_bitrate,
                    throughput = %estimated_throughput,
                    "rate decrease"
                );
            }
        }
        self.current_bitrate = self.clamp_bitrate(new_bitrate);
    }

    fn change_state(&mut self, usage: BandwidthUsage, now: Instant) {
        match usage {
            BandwidthUsage::Normal => {
                if self.state == RateControlState::Hold {
                    self.time_last_bitrate_change = Some(now);
                    self.state = RateControlState::Increase;
                }
            }
            BandwidthUsage::Overusing => {
                if self.state != RateControlState::Decrease {
                    self.state = RateControlState::Decrease;
                }
            }
            BandwidthUsage::Underusing => self.state = RateControlState::Hold,
        }
    }

    fn clamp_bitrate(&self, bitrate: DataRate) -> DataRate {
        let mut bitrate = bitrate;
        if let Some(estimate) = self.network_estimate {
            if !estimate.link_capacity_upper.is_infinite() && bitrate > estimate.link_capacity_upper {
                // Never raise above the external bound, but do not cut below
                // the current rate because of it either
                bitrate = estimate.link_capacity_upper.max(self.current_bitrate.min(bitrate));
            }
        }
        bitrate.clamp_to(self.min_rate, self.max_rate)
    }

    fn multiplicative_rate_increase(&self, now: Instant) -> DataRate {
        let alpha = match self.time_last_bitrate_change {
            Some(last) => {
                let elapsed = now.saturating_duration_since(last).min(Duration::from_secs(1));
                1.08f64.powf(elapsed.as_secs_f64())
            }
            None => 1.08,
        };
        (self.current_bitrate * (alpha - 1.0)).max(DataRate::from_bps(1000))
    }

    fn additive_rate_increase(&self, now: Instant) -> DataRate {
        let elapsed = self
            .time_last_bitrate_change
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or_default();
        DataRate::from_bps((self.near_max_increase_rate_bps_per_second() * elapsed.as_secs_f64()) as u64)
    }

    /// About one average packet per response time
    fn near_max_increase_rate_bps_per_second(&self) -> f64 {
        let frame_size_bits = self.current_bitrate.bps_f64() * FRAME_INTERVAL;
        let packets_per_frame = (frame_size_bits / AVERAGE_PACKET_SIZE_BITS).ceil().max(1.0);
        let avg_packet_size_bits = frame_size_bits / packets_per_frame;
        let response_time = (self.rtt + Duration::from_millis(100)).as_secs_f64();
        (avg_packet_size_bits / response_time).max(MIN_INCREASE_RATE_BPS_PER_SECOND)
    }
}
