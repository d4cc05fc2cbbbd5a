//! Estimate link capacity from probe cluster feedback

use super::ProbeClusterConfig;
use crate::feedback::PacketFeedback;
use crate::rate::DataRate;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Fraction of the cluster's packets and bytes needed for an estimate
const MIN_RECEIVED_PROBES_RATIO: f64 = 0.80;
const MIN_RECEIVED_BYTES_RATIO: f64 = 0.80;
/// Receive rate may exceed send rate by at most this factor
const MAX_VALID_RATIO: f64 = 2.0;
/// Below this receive/send ratio the link is saturated
const MIN_RATIO_FOR_UNSATURATED_LINK: f64 = 0.9;
/// Scale applied to the receive rate of a saturated link
const TARGET_UTILIZATION_FRACTION: f64 = 0.95;
const MAX_CLUSTER_HISTORY: Duration = Duration::from_secs(1);
const MAX_PROBE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct AggregatedCluster {
    num_probes: usize,
    first_send: Instant,
    last_send: Instant,
    first_receive: Instant,
    last_receive: Instant,
    size_last_send: usize,
    size_first_receive: usize,
    size_total: usize,
}

#[derive(Debug, Clone, Copy)]
struct ExpectedCluster {
    packets: usize,
    bytes: u64,
    created: Instant,
}

#[derive(Debug, Default)]
pub struct ProbeBitrateEstimator {
    clusters: HashMap<u32, AggregatedCluster>,
    expected: HashMap<u32, ExpectedCluster>,
    estimated_bitrate: Option<DataRate>,
}

impl ProbeBitrateEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cluster so its feedback can be evaluated
    pub fn on_probe_cluster_created(&mut self, config: &ProbeClusterConfig) {
        self.erase_old_clusters(config.at_time);
        self.expected.insert(
            config.id,
            ExpectedCluster {
                packets: config.target_probe_count,
                bytes: config.target_bytes(),
                created: config.at_time,
            },
        );
    }

    /// Feed one packet's feedback; returns an estimate once the cluster has
    /// enough packets
    pub fn handle_probe_and_estimate_bitrate(&mut self, fb: &PacketFeedback) -> Option<DataRate> {
        let cluster_id = fb.probe_cluster_id?;
        let receive_time = fb.receive_time?;
        let expected = *self.expected.get(&cluster_id)?;
        let (min_probes, min_bytes) = (expected.packets, expected.bytes);

        self.erase_old_clusters(receive_time);

        let cluster = self.clusters.entry(cluster_id).or_insert(AggregatedCluster {
            num_probes: 0,
            first_send: fb.send_time,
            last_send: fb.send_time,
            first_receive: receive_time,
            last_receive: receive_time,
            size_last_send: fb.size,
            size_first_receive: fb.size,
            size_total: 0,
        });
        if fb.send_time < cluster.first_send {
            cluster.first_send = fb.send_time;
        }
        if fb.send_time > cluster.last_send {
            cluster.last_send = fb.send_time;
            cluster.size_last_send = fb.size;
        }
        if receive_time < cluster.first_receive {
            cluster.first_receive = receive_time;
            cluster.size_first_receive = fb.size;
        }
        if receive_time > cluster.last_receive {
            cluster.last_receive = receive_time;
        }
        cluster.size_total += fb.size;
        cluster.num_probes += 1;

        let cluster = *cluster;
        if (cluster.num_probes as f64) < min_probes as f64 * MIN_RECEIVED_PROBES_RATIO
            || (cluster.size_total as f64) < min_bytes as f64 * MIN_RECEIVED_BYTES_RATIO
        {
            return None;
        }

        let send_interval = cluster.last_send.saturating_duration_since(cluster.first_send);
        let receive_interval = cluster
            .last_receive
            .saturating_duration_since(cluster.first_receive);
        if send_interval.is_zero()
            || send_interval > MAX_PROBE_INTERVAL
            || receive_interval.is_zero()
            || receive_interval > MAX_PROBE_INTERVAL
        {
            tracing::debug!(
                cluster_id,
                send_ms = send_interval.as_millis() as u64,
                receive_ms = receive_interval.as_millis() as u64,
                "probing unsuccessful, invalid send or receive interval"
            );
            return None;
        }

        // The last packet sent and the first received bound the intervals,
        // their bytes are not part of them
        let send_size = cluster.size_total - cluster.size_last_send;
        let send_rate = DataRate::from_bytes_per(send_size as u64, send_interval);
        let receive_size = cluster.size_total - cluster.size_first_receive;
        let receive_rate = DataRate::from_bytes_per(receive_size as u64, receive_interval);

        let ratio = receive_rate.bps_f64() / send_rate.bps_f64().max(1.0);
        if ratio > MAX_VALID_RATIO {
            tracing::debug!(
                cluster_id,
                %send_rate,
                %receive_rate,
                "probing unsuccessful, receive rate too high"
            );
            return None;
        }

        let mut estimate = send_rate.min(receive_rate);
        if receive_rate < send_rate * MIN_RATIO_FOR_UNSATURATED_LINK {
            estimate = receive_rate * TARGET_UTILIZATION_FRACTION;
        }
        tracing::debug!(cluster_id, %send_rate, %receive_rate, %estimate, "probing successful");
        self.estimated_bitrate = Some(estimate);
        Some(estimate)
    }

    /// Take the latest estimate, if any arrived since the last call
    pub fn fetch_and_reset_last_estimated_bitrate(&mut self) -> Option<DataRate> {
        self.estimated_bitrate.take()
    }

    fn erase_old_clusters(&mut self, now: Instant) {
        let expired: Vec<u32> = self
            .clusters
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.last_receive) > MAX_CLUSTER_HISTORY)
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            self.clusters.remove(&id);
            self.expected.remove(&id);
        }
        // Clusters that never got any feedback
        let clusters = &self.clusters;
        self.expected.retain(|id, expected| {
            clusters.contains_key(id)
                || now.saturating_duration_since(expected.created) <= MAX_CLUSTER_HISTORY
        });
    }
}
