//! Decides when to send probe clusters and at what rate
//!
//! Probing starts exponentially from the start bitrate, continues while
//! results keep coming in close to the probed rate, and is revisited
//! periodically in the application-limited region, after allocation
//! changes, after large estimate drops and when an external network
//! estimate suggests headroom.

use super::ProbeClusterConfig;
use crate::rate::DataRate;
use std::time::{Duration, Instant};

/// A drop to below this fraction of the previous estimate is "large"
const BITRATE_DROP_THRESHOLD: f64 = 0.66;
/// Recovery probing only follows drops younger than this
const BITRATE_DROP_TIMEOUT: Duration = Duration::from_secs(5);
/// Recovery probes target this fraction of the pre-drop estimate
const PROBE_FRACTION_AFTER_DROP: f64 = 0.85;
/// Results within this fraction of the target count as reaching it
const PROBE_UNCERTAINTY: f64 = 0.05;
const MIN_TIME_BETWEEN_DROP_PROBES: Duration = Duration::from_secs(5);
/// Recent ALR exit still allows recovery probing
const ALR_ENDED_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct ProbeControllerConfig {
    pub first_exponential_probe_scale: f64,
    pub second_exponential_probe_scale: Option<f64>,
    pub further_exponential_probe_scale: f64,
    /// Probe further when the estimate exceeds this fraction of the last probe
    pub further_probe_threshold: f64,
    pub alr_probing_interval: Duration,
    pub alr_probe_scale: f64,
    pub first_allocation_probe_scale: f64,
    pub second_allocation_probe_scale: Option<f64>,
    /// Probes never exceed this multiple of the allocated rate
    pub allocation_probe_max_scale: f64,
    pub network_state_probe_interval: Duration,
    pub network_state_probe_scale: f64,
    pub min_probe_packets_sent: usize,
    pub min_probe_duration: Duration,
    pub min_probe_delta: Duration,
    /// Give up waiting for a probe result after this long
    pub max_waiting_time_for_probing_result: Duration,
    pub enable_periodic_alr_probing: bool,
}

impl Default for ProbeControllerConfig {
    fn default() -> Self {
        ProbeControllerConfig {
            first_exponential_probe_scale: 3.0,
            second_exponential_probe_scale: Some(6.0),
            further_exponential_probe_scale: 2.0,
            further_probe_threshold: 0.7,
            alr_probing_interval: Duration::from_secs(5),
            alr_probe_scale: 2.0,
            first_allocation_probe_scale: 1.0,
            second_allocation_probe_scale: Some(2.0),
            allocation_probe_max_scale: 2.0,
            network_state_probe_interval: Duration::from_secs(5),
            network_state_probe_scale: 1.0,
            min_probe_packets_sent: 5,
            min_probe_duration: Duration::from_millis(15),
            min_probe_delta: Duration::from_millis(2),
            max_waiting_time_for_probing_result: Duration::from_secs(1),
            enable_periodic_alr_probing: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// No probes sent yet
    Init,
    /// Exponential probing in progress
    WaitingForProbingResult,
    ProbingComplete,
}

#[derive(Debug)]
pub struct ProbeController {
    config: ProbeControllerConfig,
    state: ProbeState,
    network_available: bool,
    min_bitrate_to_probe_further: Option<DataRate>,
    time_last_probing_initiated: Option<Instant>,
    estimated_bitrate: DataRate,
    start_bitrate: DataRate,
    max_bitrate: DataRate,
    max_total_allocated_bitrate: DataRate,
    network_estimate: Option<DataRate>,
    alr_start_time: Option<Instant>,
    alr_end_time: Option<Instant>,
    time_of_last_large_drop: Option<Instant>,
    bitrate_before_last_large_drop: DataRate,
    last_bwe_drop_probing_time: Option<Instant>,
    next_probe_cluster_id: u32,
}

impl ProbeController {
    pub fn new(config: ProbeControllerConfig) -> Self {
        ProbeController {
            config,
            state: ProbeState::Init,
            network_available: true,
            min_bitrate_to_probe_further: None,
            time_last_probing_initiated: None,
            estimated_bitrate: DataRate::ZERO,
            start_bitrate: DataRate::ZERO,
            max_bitrate: DataRate::INFINITE,
            max_total_allocated_bitrate: DataRate::ZERO,
            network_estimate: None,
            alr_start_time: None,
            alr_end_time: None,
            time_of_last_large_drop: None,
            bitrate_before_last_large_drop: DataRate::ZERO,
            last_bwe_drop_probing_time: None,
            next_probe_cluster_id: 1,
        }
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    /// Configure the rate bounds; starts initial probing when possible
    pub fn set_bitrates(
        &mut self,
        min_bitrate: DataRate,
        start_bitrate: DataRate,
        max_bitrate: DataRate,
        now: Instant,
    ) -> Vec<ProbeClusterConfig> {
        if !start_bitrate.is_zero() {
            self.start_bitrate = start_bitrate;
            self.estimated_bitrate = start_bitrate;
        } else if self.start_bitrate.is_zero() {
            self.start_bitrate = min_bitrate;
        }

        let old_max = self.max_bitrate;
        self.max_bitrate = if max_bitrate.is_zero() {
            DataRate::INFINITE
        } else {
            max_bitrate
        };

        match self.state {
            ProbeState::Init => {
                if self.network_available {
                    return self.initiate_exponential_probing(now);
                }
            }
            ProbeState::WaitingForProbingResult => {}
            ProbeState::ProbingComplete => {
                // A raised cap in a call that was limited by the old one
                if !self.estimated_bitrate.is_zero()
                    && old_max < self.max_bitrate
                    && self.estimated_bitrate >= old_max * (1.0 - PROBE_UNCERTAINTY)
                {
                    tracing::debug!(from = %old_max, to = %self.max_bitrate, "max bitrate raised, probing");
                    return self.initiate_probing(now, &[self.max_bitrate], false);
                }
            }
        }
        Vec::new()
    }

    /// The total rate allocated by the application changed
    pub fn on_max_total_allocated_bitrate(&mut self, total: DataRate, now: Instant) -> Vec<ProbeClusterConfig> {
        let in_alr = self.alr_start_time.is_some();
        let changed = total != self.max_total_allocated_bitrate;
        self.max_total_allocated_bitrate = total;

        if in_alr
            && changed
            && self.state == ProbeState::ProbingComplete
            && self.estimated_bitrate < self.max_bitrate
            && self.estimated_bitrate < total
        {
            let mut probes = vec![total * self.config.first_allocation_probe_scale];
            if let Some(scale) = self.config.second_allocation_probe_scale {
                probes.push(total * scale);
            }
            return self.initiate_probing(now, &probes, false);
        }
        Vec::new()
    }

    pub fn on_network_availability(&mut self, available: bool, now: Instant) -> Vec<ProbeClusterConfig> {
        self.network_available = available;
        if !available && self.state == ProbeState::WaitingForProbingResult {
            self.state = ProbeState::ProbingComplete;
            self.min_bitrate_to_probe_further = None;
        }
        if available && self.state == ProbeState::Init && !self.start_bitrate.is_zero() {
            return self.initiate_exponential_probing(now);
        }
        Vec::new()
    }

    /// A new estimate arrived; may continue exponential probing
    pub fn set_estimated_bitrate(&mut self, bitrate: DataRate, now: Instant) -> Vec<ProbeClusterConfig> {
        let mut pending = Vec::new();
        if self.state == ProbeState::WaitingForProbingResult {
            if let Some(min) = self.min_bitrate_to_probe_further {
                if bitrate > min {
                    pending = self.initiate_probing(
                        now,
                        &[bitrate * self.config.further_exponential_probe_scale],
                        true,
                    );
                }
            }
        }

        if bitrate < self.estimated_bitrate * BITRATE_DROP_THRESHOLD {
            self.time_of_last_large_drop = Some(now);
            self.bitrate_before_last_large_drop = self.estimated_bitrate;
        }
        self.estimated_bitrate = bitrate;
        pending
    }

    pub fn set_alr_start_time(&mut self, alr_start_time: Option<Instant>) {
        self.alr_start_time = alr_start_time;
    }

    pub fn set_alr_ended_time(&mut self, ended: Instant) {
        self.alr_end_time = Some(ended);
    }

    pub fn set_network_state_estimate(&mut self, estimate: Option<DataRate>) {
        self.network_estimate = estimate;
    }

    /// Probe back towards the pre-drop rate after a large estimate drop
    pub fn request_probe(&mut self, now: Instant) -> Vec<ProbeClusterConfig> {
        let in_alr = self.alr_start_time.is_some();
        let alr_ended_recently = self
            .alr_end_time
            .is_some_and(|ended| now.saturating_duration_since(ended) < ALR_ENDED_TIMEOUT);
        if !(in_alr || alr_ended_recently) || self.state != ProbeState::ProbingComplete {
            return Vec::new();
        }
        let Some(drop_time) = self.time_of_last_large_drop else {
            return Vec::new();
        };

        let suggested = self.bitrate_before_last_large_drop * PROBE_FRACTION_AFTER_DROP;
        let min_expected_result = suggested * (1.0 - PROBE_UNCERTAINTY);
        let since_drop = now.saturating_duration_since(drop_time);
        let since_last_probe = self
            .last_bwe_drop_probing_time
            .map_or(Duration::MAX, |t| now.saturating_duration_since(t));
        if min_expected_result > self.estimated_bitrate
            && since_drop < BITRATE_DROP_TIMEOUT
            && since_last_probe > MIN_TIME_BETWEEN_DROP_PROBES
        {
            tracing::info!(rate = %suggested, "probing after large bitrate drop");
            self.last_bwe_drop_probing_time = Some(now);
            return self.initiate_probing(now, &[suggested], false);
        }
        Vec::new()
    }

    /// Periodic work: timeouts, ALR probing, network estimate probing
    pub fn process(&mut self, now: Instant) -> Vec<ProbeClusterConfig> {
        if self.state == ProbeState::WaitingForProbingResult {
            let waited = self
                .time_last_probing_initiated
                .map_or(Duration::ZERO, |t| now.saturating_duration_since(t));
            if waited > self.config.max_waiting_time_for_probing_result {
                tracing::debug!("probing result timed out");
                self.state = ProbeState::ProbingComplete;
                self.min_bitrate_to_probe_further = None;
            }
        }
        if self.estimated_bitrate.is_zero() || self.state != ProbeState::ProbingComplete {
            return Vec::new();
        }

        if self.config.enable_periodic_alr_probing {
            if let Some(alr_start) = self.alr_start_time {
                let base = self
                    .time_last_probing_initiated
                    .map_or(alr_start, |t| t.max(alr_start));
                if now >= base + self.config.alr_probing_interval {
                    let rate = self.estimated_bitrate * self.config.alr_probe_scale;
                    return self.initiate_probing(now, &[rate], true);
                }
            }
        }

        if let Some(estimate) = self.network_estimate {
            let due = self
                .time_last_probing_initiated
                .map_or(true, |t| now.saturating_duration_since(t) >= self.config.network_state_probe_interval);
            if due && estimate > self.estimated_bitrate {
                let rate = estimate * self.config.network_state_probe_scale;
                return self.initiate_probing(now, &[rate], false);
            }
        }
        Vec::new()
    }

    /// Forget all probing state, e.g. after a network route change
    pub fn reset(&mut self, now: Instant) {
        self.network_available = true;
        self.state = ProbeState::Init;
        self.min_bitrate_to_probe_further = None;
        self.time_last_probing_initiated = Some(now);
        self.estimated_bitrate = DataRate::ZERO;
        self.start_bitrate = DataRate::ZERO;
        self.max_bitrate = DataRate::INFINITE;
        self.max_total_allocated_bitrate = DataRate::ZERO;
        self.alr_start_time = None;
        self.alr_end_time = None;
        self.time_of_last_large_drop = None;
        self.bitrate_before_last_large_drop = DataRate::ZERO;
        self.last_bwe_drop_probing_time = None;
    }

    fn initiate_exponential_probing(&mut self, now: Instant) -> Vec<ProbeClusterConfig> {
        let mut probes = vec![self.start_bitrate * self.config.first_exponential_probe_scale];
        if let Some(scale) = self.config.second_exponential_probe_scale {
            probes.push(self.start_bitrate * scale);
        }
        self.initiate_probing(now, &probes, true)
    }

    fn initiate_probing(&mut self, now: Instant, bitrates: &[DataRate], mut probe_further: bool) -> Vec<ProbeClusterConfig> {
        let mut max_probe_bitrate = self.max_bitrate;
        if !self.max_total_allocated_bitrate.is_zero() {
            max_probe_bitrate =
                max_probe_bitrate.min(self.max_total_allocated_bitrate * self.config.allocation_probe_max_scale);
        }

        let mut pending = Vec::with_capacity(bitrates.len());
        let mut last_rate = DataRate::ZERO;
        for &requested in bitrates {
            let mut rate = requested;
            if rate > max_probe_bitrate {
                rate = max_probe_bitrate;
                probe_further = false;
            }
            let id = self.next_probe_cluster_id;
            self.next_probe_cluster_id = self.next_probe_cluster_id.wrapping_add(1);
            pending.push(ProbeClusterConfig {
                id,
                at_time: now,
                target_rate: rate,
                target_duration: self.config.min_probe_duration,
                min_probe_delta: self.config.min_probe_delta,
                target_probe_count: self.config.min_probe_packets_sent,
            });
            last_rate = rate;
        }
        self.time_last_probing_initiated = Some(now);
        tracing::debug!(count = pending.len(), max = %last_rate, probe_further, "initiating probes");

        if probe_further {
            self.state = ProbeState::WaitingForProbingResult;
            self.min_bitrate_to_probe_further = Some(last_rate * self.config.further_probe_threshold);
        } else {
            self.state = ProbeState::ProbingComplete;
            self.min_bitrate_to_probe_further = None;
        }
        pending
    }
}
