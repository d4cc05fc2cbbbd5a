//! Probe cluster scheduling inside the pacer

use crate::congestion::ProbeClusterConfig;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Clusters not finished this long after creation are abandoned
pub const PROBE_CLUSTER_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbingState {
    /// No cluster pending
    Inactive,
    /// Sending probe packets
    Active,
}

#[derive(Debug, Clone)]
struct ProbeCluster {
    config: ProbeClusterConfig,
    sent_probes: usize,
    sent_bytes: u64,
    started_at: Option<Instant>,
}

#[derive(Debug)]
pub struct BitrateProber {
    state: ProbingState,
    clusters: VecDeque<ProbeCluster>,
    next_probe_time: Option<Instant>,
    completed: u64,
    abandoned: u64,
}

impl Default for BitrateProber {
    fn default() -> Self {
        Self::new()
    }
}

impl BitrateProber {
    pub fn new() -> Self {
        BitrateProber {
            state: ProbingState::Inactive,
            clusters: VecDeque::new(),
            next_probe_time: None,
            completed: 0,
            abandoned: 0,
        }
    }

    pub fn state(&self) -> ProbingState {
        self.state
    }

    pub fn is_probing(&self) -> bool {
        self.state == ProbingState::Active
    }

    /// Clusters fully sent
    pub fn completed_clusters(&self) -> u64 {
        self.completed
    }

    /// Clusters dropped after timing out
    pub fn abandoned_clusters(&self) -> u64 {
        self.abandoned
    }

    /// Queue a new cluster
    pub fn create_probe_cluster(&mut self, config: ProbeClusterConfig) {
        self.expire_clusters(config.at_time);
        tracing::debug!(
            id = config.id,
            rate = %config.target_rate,
            bytes = config.target_bytes(),
            "probe cluster created"
        );
        self.clusters.push_back(ProbeCluster {
            config,
            sent_probes: 0,
            sent_bytes: 0,
            started_at: None,
        });
        if self.state == ProbingState::Inactive {
            self.state = ProbingState::Active;
            self.next_probe_time = None;
        }
    }

    /// Cluster currently being sent
    pub fn current_cluster(&self) -> Option<&ProbeClusterConfig> {
        if !self.is_probing() {
            return None;
        }
        self.clusters.front().map(|c| &c.config)
    }

    /// When the next probe is due; `now` if the cluster has not started
    pub fn next_probe_time(&mut self, now: Instant) -> Option<Instant> {
        self.expire_clusters(now);
        if !self.is_probing() {
            return None;
        }
        Some(self.next_probe_time.unwrap_or(now))
    }

    /// Bytes to send in the next probe burst
    pub fn recommended_min_probe_size(&self) -> usize {
        self.current_cluster()
            .map(|c| c.target_rate.bytes_over(c.min_probe_delta * 2).max(1) as usize)
            .unwrap_or(0)
    }

    /// Record `bytes` sent for the current cluster
    pub fn probe_sent(&mut self, now: Instant, bytes: usize) {
        if !self.is_probing() || bytes == 0 {
            return;
        }
        let Some(cluster) = self.clusters.front_mut() else {
            return;
        };
        let started = *cluster.started_at.get_or_insert(now);
        cluster.sent_bytes += bytes as u64;
        cluster.sent_probes += 1;

        // Next burst is due when the cluster's bytes so far would have been
        // sent at its target rate, but never sooner than the min delta
        let paced = started + cluster.config.target_rate.duration_for(cluster.sent_bytes);
        self.next_probe_time = Some(paced.max(now + cluster.config.min_probe_delta));

        if cluster.sent_probes >= cluster.config.target_probe_count
            && cluster.sent_bytes >= cluster.config.target_bytes()
        {
            tracing::debug!(
                id = cluster.config.id,
                probes = cluster.sent_probes,
                bytes = cluster.sent_bytes,
                "probe cluster complete"
            );
            self.clusters.pop_front();
            self.completed += 1;
            self.next_probe_time = None;
            if self.clusters.is_empty() {
                self.state = ProbingState::Inactive;
            }
        }
    }

    fn expire_clusters(&mut self, now: Instant) {
        while let Some(front) = self.clusters.front() {
            if now.saturating_duration_since(front.config.at_time) <= PROBE_CLUSTER_TIMEOUT {
                break;
            }
            tracing::debug!(id = front.config.id, "probe cluster timed out");
            self.clusters.pop_front();
            self.abandoned += 1;
            self.next_probe_time = None;
        }
        if self.clusters.is_empty() {
            self.state = ProbingState::Inactive;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::DataRate;

    fn cluster(id: u32, at: Instant, kbps: u64) -> ProbeClusterConfig {
        ProbeClusterConfig {
            id,
            at_time: at,
            target_rate: DataRate::from_kbps(kbps),
            target_duration: Duration::from_millis(15),
            min_probe_delta: Duration::from_millis(2),
            target_probe_count: 5,
        }
    }

    #[test]
    fn test_cluster_lifecycle() {
        let mut prober = BitrateProber::new();
        let start = Instant::now();
        assert!(!prober.is_probing());
        prober.create_probe_cluster(cluster(1, start, 800));
        assert!(prober.is_probing());
        assert_eq!(prober.next_probe_time(start), Some(start));
        // 800 kbps over 4 ms
        assert_eq!(prober.recommended_min_probe_size(), 400);

        let mut now = start;
        for _ in 0..4 {
            prober.probe_sent(now, 400);
            now = prober.next_probe_time(now).unwrap();
        }
        // 1600 bytes over 4 probes: the byte target is met but not the count
        assert!(prober.is_probing());
        prober.probe_sent(now, 400);
        assert!(!prober.is_probing());
        assert_eq!(prober.completed_clusters(), 1);
    }

    #[test]
    fn test_probes_spaced_at_target_rate() {
        let mut prober = BitrateProber::new();
        let start = Instant::now();
        prober.create_probe_cluster(cluster(1, start, 800));
        prober.probe_sent(start, 1000);
        // 1000 bytes at 800 kbps take 10 ms
        assert_eq!(prober.next_probe_time(start), Some(start + Duration::from_millis(10)));
    }

    #[test]
    fn test_min_delta_respected() {
        let mut prober = BitrateProber::new();
        let start = Instant::now();
        prober.create_probe_cluster(cluster(1, start, 800));
        prober.probe_sent(start, 10);
        assert_eq!(prober.next_probe_time(start), Some(start + Duration::from_millis(2)));
    }

    #[test]
    fn test_clusters_run_in_order() {
        let mut prober = BitrateProber::new();
        let start = Instant::now();
        prober.create_probe_cluster(cluster(1, start, 800));
        prober.create_probe_cluster(cluster(2, start, 1600));
        assert_eq!(prober.current_cluster().map(|c| c.id), Some(1));
        for _ in 0..5 {
            prober.probe_sent(start, 400);
        }
        assert_eq!(prober.current_cluster().map(|c| c.id), Some(2));
    }

    #[test]
    fn test_stale_cluster_abandoned() {
        let mut prober = BitrateProber::new();
        let start = Instant::now();
        prober.create_probe_cluster(cluster(1, start, 800));
        assert_eq!(prober.next_probe_time(start + Duration::from_millis(1500)), None);
        assert!(!prober.is_probing());
        assert_eq!(prober.abandoned_clusters(), 1);
    }
}
