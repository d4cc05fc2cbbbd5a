//! Bandwidth estimation and probing
//!
//! Send-side congestion control driven by per-packet feedback:
//! - `delay_based`: one-way delay trend (inter-arrival grouping, trendline
//!   filter, AIMD rate control)
//! - `acknowledged`: throughput actually delivered to the peer
//! - `probe_estimator` / `probe_controller`: explicit probe bursts
//! - `alr`: application-limited region detection
//! - `controller`: glue producing target and pacing rates
//!
//! Everything is clock-injected; no method reads the wall clock.

pub mod acknowledged;
pub mod aimd;
pub mod alr;
pub mod controller;
pub mod delay_based;
pub mod inter_arrival;
pub mod interval_budget;
pub mod probe_controller;
pub mod probe_estimator;
pub mod trendline;

pub use acknowledged::AcknowledgedBitrateEstimator;
pub use aimd::{AimdRateControl, LinkCapacityEstimator, RateControlState};
pub use alr::AlrDetector;
pub use controller::{NetworkControlUpdate, NetworkController, NetworkControllerConfig, PacerRates};
pub use delay_based::{DelayBasedEstimator, DelayBasedResult};
pub use inter_arrival::InterArrival;
pub use interval_budget::IntervalBudget;
pub use probe_controller::{ProbeController, ProbeControllerConfig, ProbeState};
pub use probe_estimator::ProbeBitrateEstimator;
pub use trendline::{TrendlineConfig, TrendlineEstimator};

use crate::rate::DataRate;
use std::fmt;
use std::time::{Duration, Instant};

/// Network state derived from the delay trend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BandwidthUsage {
    #[default]
    Normal,
    Underusing,
    Overusing,
}

impl fmt::Display for BandwidthUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BandwidthUsage::Normal => write!(f, "normal"),
            BandwidthUsage::Underusing => write!(f, "underusing"),
            BandwidthUsage::Overusing => write!(f, "overusing"),
        }
    }
}

/// External hint about the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStateEstimate {
    /// Upper bound of the link capacity
    pub link_capacity_upper: DataRate,
}

/// A probe burst requested from the pacer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeClusterConfig {
    /// Monotonically increasing id
    pub id: u32,
    pub at_time: Instant,
    pub target_rate: DataRate,
    pub target_duration: Duration,
    /// Minimum spacing between probe packets
    pub min_probe_delta: Duration,
    /// Minimum number of packets to send
    pub target_probe_count: usize,
}

impl ProbeClusterConfig {
    /// Bytes the cluster should carry
    pub fn target_bytes(&self) -> u64 {
        self.target_rate.bytes_over(self.target_duration)
    }
}

/// `a - b` in milliseconds, may be negative
pub(crate) fn delta_ms(a: Instant, b: Instant) -> f64 {
    if a >= b {
        a.duration_since(b).as_secs_f64() * 1000.0
    } else {
        -(b.duration_since(a).as_secs_f64() * 1000.0)
    }
}
