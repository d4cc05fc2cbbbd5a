//! Pacing controller
//!
//! Releases queued packets at the pacing rate, injects probe clusters, and
//! fills unused capacity with padding when asked to. The caller drives it by
//! calling `process_packets` at or after `next_send_time`.

use super::prober::BitrateProber;
use super::queue::{PacketQueue, Priority, QueueError, DEFAULT_QUEUE_CAPACITY};
use crate::congestion::{IntervalBudget, ProbeClusterConfig};
use crate::packet::RtpPacket;
use crate::rate::DataRate;
use std::time::{Duration, Instant};

/// Budget refills are capped to this much elapsed time
const MAX_ELAPSED: Duration = Duration::from_secs(2);
/// Smallest gap between two process calls the pacer asks for
const MIN_PACKET_INTERVAL: Duration = Duration::from_millis(1);

/// Receives packets released by the pacer
pub trait PacketSender {
    /// Put a packet on the wire; `probe_cluster_id` is set for probe traffic
    fn send_packet(&mut self, packet: RtpPacket, probe_cluster_id: Option<u32>);

    /// Produce padding packets totalling roughly `size` bytes
    fn generate_padding(&mut self, size: usize) -> Vec<RtpPacket>;
}

#[derive(Debug, Clone)]
pub struct PacerConfig {
    pub queue_capacity: usize,
    /// Packets may leave up to this much earlier than the budget allows
    pub hold_back_window: Duration,
    /// Cap of the hold-back window in average packets
    pub hold_back_packets: usize,
    /// Probes may be sent this much before they are due
    pub early_probe_window: Duration,
    /// Interval of padding sends while the queue is empty
    pub padding_interval: Duration,
}

impl Default for PacerConfig {
    fn default() -> Self {
        PacerConfig {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            hold_back_window: Duration::from_millis(5),
            hold_back_packets: 3,
            early_probe_window: Duration::from_millis(1),
            padding_interval: Duration::from_millis(5),
        }
    }
}

/// Pacer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacerStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub padding_bytes_sent: u64,
    pub probe_bytes_sent: u64,
    pub packets_dropped: u64,
}

#[derive(Debug)]
pub struct PacingController {
    config: PacerConfig,
    queue: PacketQueue,
    prober: BitrateProber,
    media_budget: IntervalBudget,
    padding_budget: IntervalBudget,
    pacing_rate: DataRate,
    padding_rate: DataRate,
    paused: bool,
    congested: bool,
    last_process_time: Option<Instant>,
    /// Padding only starts after the first media packet
    media_sent: bool,
    stats: PacerStats,
}

impl PacingController {
    pub fn new(config: PacerConfig) -> Self {
        PacingController {
            queue: PacketQueue::new(config.queue_capacity),
            config,
            prober: BitrateProber::new(),
            media_budget: IntervalBudget::new(DataRate::ZERO, false),
            padding_budget: IntervalBudget::new(DataRate::ZERO, false),
            pacing_rate: DataRate::ZERO,
            padding_rate: DataRate::ZERO,
            paused: false,
            congested: false,
            last_process_time: None,
            media_sent: false,
            stats: PacerStats::default(),
        }
    }

    pub fn set_pacing_rates(&mut self, pacing_rate: DataRate, padding_rate: DataRate) {
        tracing::debug!(%pacing_rate, %padding_rate, "pacing rates");
        self.pacing_rate = pacing_rate;
        self.padding_rate = padding_rate;
        self.media_budget.set_target_rate(pacing_rate);
        self.padding_budget.set_target_rate(padding_rate);
    }

    pub fn pacing_rate(&self) -> DataRate {
        self.pacing_rate
    }

    pub fn pause(&mut self) {
        if !self.paused {
            tracing::debug!("pacer paused");
        }
        self.paused = true;
    }

    pub fn resume(&mut self) {
        if self.paused {
            tracing::debug!("pacer resumed");
        }
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Congested pacers hold media and padding but still probe
    pub fn set_congested(&mut self, congested: bool) {
        self.congested = congested;
    }

    pub fn is_congested(&self) -> bool {
        self.congested
    }

    pub fn enqueue_packet(&mut self, packet: RtpPacket, priority: Priority, now: Instant) -> Result<(), QueueError> {
        if self.last_process_time.is_none() {
            self.last_process_time = Some(now);
        }
        let result = self.queue.push(packet, priority, now);
        self.stats.packets_dropped = self.queue.dropped();
        result
    }

    pub fn create_probe_cluster(&mut self, config: ProbeClusterConfig) {
        self.prober.create_probe_cluster(config);
    }

    pub fn is_probing(&self) -> bool {
        self.prober.is_probing()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_size_bytes(&self) -> usize {
        self.queue.size_bytes()
    }

    /// Time to drain the queue at the pacing rate
    pub fn expected_queue_time(&self) -> Duration {
        if self.pacing_rate.is_zero() {
            return Duration::ZERO;
        }
        self.pacing_rate.duration_for(self.queue.size_bytes() as u64)
    }

    /// How long the oldest queued packet has waited
    pub fn oldest_packet_wait_time(&self, now: Instant) -> Duration {
        self.queue
            .oldest_enqueue_time()
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default()
    }

    pub fn stats(&self) -> PacerStats {
        self.stats
    }

    /// When `process_packets` should next run; `None` when idle
    pub fn next_send_time(&mut self, now: Instant) -> Option<Instant> {
        if self.paused {
            return None;
        }
        if let Some(probe_time) = self.prober.next_probe_time(now) {
            return Some(
                probe_time
                    .checked_sub(self.config.early_probe_window)
                    .unwrap_or(probe_time),
            );
        }
        let last = self.last_process_time.unwrap_or(now);

        if self.congested || self.queue.is_empty() {
            if !self.congested && self.padding_possible() {
                return Some(last + self.config.padding_interval);
            }
            return None;
        }

        if self.pacing_rate.is_zero() {
            return None;
        }
        let deficit = self.media_budget.deficit();
        let hold_back = self.hold_back_bytes();
        if self.media_budget.bytes_remaining() > 0 || deficit < hold_back {
            return Some(now);
        }
        // Sending resumes once the deficit is strictly below the hold-back
        let wait = self.pacing_rate.duration_for((deficit - hold_back + 1) as u64);
        Some(last + wait.max(MIN_PACKET_INTERVAL))
    }

    /// Send everything that is due at `now`
    pub fn process_packets(&mut self, now: Instant, sender: &mut dyn PacketSender) {
        let last = self.last_process_time.unwrap_or(now);
        let elapsed = now.saturating_duration_since(last).min(MAX_ELAPSED);
        self.last_process_time = Some(now.max(last));
        self.media_budget.increase_budget(elapsed);
        self.padding_budget.increase_budget(elapsed);

        if self.paused {
            return;
        }

        if let Some(probe_time) = self.prober.next_probe_time(now) {
            if probe_time <= now + self.config.early_probe_window {
                self.send_probe(now, sender);
            }
        }

        if self.congested {
            return;
        }

        let hold_back = self.hold_back_bytes();
        while !self.queue.is_empty() {
            let can_send = self.media_budget.bytes_remaining() > 0 || self.media_budget.deficit() < hold_back;
            if !can_send {
                break;
            }
            let Some(queued) = self.queue.pop() else {
                break;
            };
            let size = queued.size();
            self.on_packet_sent(size, queued.priority != Priority::Padding);
            sender.send_packet(queued.packet, None);
        }

        if self.queue.is_empty() && self.padding_possible() {
            let budget = self.padding_budget.bytes_remaining();
            if budget > 0 {
                for packet in sender.generate_padding(budget) {
                    let size = packet.size();
                    self.on_packet_sent(size, false);
                    self.stats.padding_bytes_sent += size as u64;
                    sender.send_packet(packet, None);
                }
            }
        }
    }

    fn send_probe(&mut self, now: Instant, sender: &mut dyn PacketSender) {
        let Some(cluster_id) = self.prober.current_cluster().map(|c| c.id) else {
            return;
        };
        let target = self.prober.recommended_min_probe_size();
        let mut sent = 0usize;
        while sent < target {
            match self.queue.pop() {
                Some(queued) => {
                    let size = queued.size();
                    self.on_packet_sent(size, queued.priority != Priority::Padding);
                    sender.send_packet(queued.packet, Some(cluster_id));
                    sent += size;
                }
                None => {
                    let padding = sender.generate_padding(target - sent);
                    if padding.is_empty() {
                        break;
                    }
                    for packet in padding {
                        let size = packet.size();
                        self.on_packet_sent(size, false);
                        self.stats.padding_bytes_sent += size as u64;
                        sender.send_packet(packet, Some(cluster_id));
                        sent += size;
                    }
                }
            }
        }
        self.stats.probe_bytes_sent += sent as u64;
        self.prober.probe_sent(now, sent);
    }

    fn on_packet_sent(&mut self, size: usize, is_media: bool) {
        self.media_budget.use_budget(size);
        self.padding_budget.use_budget(size);
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += size as u64;
        if is_media {
            self.media_sent = true;
        }
    }

    fn padding_possible(&self) -> bool {
        self.media_sent && !self.padding_rate.is_zero()
    }

    /// Burst allowance: the hold-back window at the pacing rate, capped to a
    /// few average packets
    fn hold_back_bytes(&self) -> usize {
        let window = self.pacing_rate.bytes_over(self.config.hold_back_window) as usize;
        let avg = self.queue.average_packet_size().unwrap_or(0);
        window.min(avg * self.config.hold_back_packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::RtpHeader;
    use crate::sequence::SeqNumber;
    use bytes::Bytes;

    #[derive(Default)]
    struct Recorder {
        sent: Vec<(u16, usize, Option<u32>)>,
        padding_seq: u16,
    }

    impl PacketSender for Recorder {
        fn send_packet(&mut self, packet: RtpPacket, probe_cluster_id: Option<u32>) {
            self.sent
                .push((packet.seq_number().as_raw(), packet.size(), probe_cluster_id));
        }

        fn generate_padding(&mut self, size: usize) -> Vec<RtpPacket> {
            let mut out = Vec::new();
            let mut remaining = size;
            while remaining > 0 {
                let pad = remaining.min(255) as u8;
                self.padding_seq = self.padding_seq.wrapping_add(1);
                let header = RtpHeader::new(96, SeqNumber::new(50_000 + self.padding_seq), 0, 9);
                let packet = RtpPacket::padding(header, pad);
                remaining = remaining.saturating_sub(packet.size());
                out.push(packet);
            }
            out
        }
    }

    /// A 1000-byte packet on the wire
    fn media(seq: u16) -> RtpPacket {
        RtpPacket::new(
            RtpHeader::new(96, SeqNumber::new(seq), 0, 1),
            Bytes::from(vec![0u8; 988]),
        )
    }

    fn pacer(kbps: u64) -> PacingController {
        let mut pacer = PacingController::new(PacerConfig::default());
        pacer.set_pacing_rates(DataRate::from_kbps(kbps), DataRate::ZERO);
        pacer
    }

    /// Run the pacer in 1 ms steps until `end`
    fn run(pacer: &mut PacingController, recorder: &mut Recorder, start: Instant, end: Instant) {
        let mut now = start;
        while now <= end {
            if pacer.next_send_time(now).is_some_and(|t| t <= now) {
                pacer.process_packets(now, recorder);
            }
            now += Duration::from_millis(1);
        }
    }

    #[test]
    fn test_rate_is_respected() {
        let mut pacer = pacer(800);
        let mut recorder = Recorder::default();
        let start = Instant::now();
        for seq in 0..100 {
            pacer.enqueue_packet(media(seq), Priority::Video, start).unwrap();
        }
        // 800 kbps is 100 packets of 1000 bytes per second
        run(&mut pacer, &mut recorder, start, start + Duration::from_millis(500));
        let sent = recorder.sent.len();
        assert!((45..=56).contains(&sent), "sent {sent}");
    }

    #[test]
    fn test_priority_order_on_wire() {
        let mut pacer = pacer(100_000);
        let mut recorder = Recorder::default();
        let now = Instant::now();
        pacer.enqueue_packet(media(1), Priority::Video, now).unwrap();
        pacer.enqueue_packet(media(2), Priority::Retransmission, now).unwrap();
        pacer.enqueue_packet(media(3), Priority::Audio, now).unwrap();
        pacer.process_packets(now + Duration::from_millis(5), &mut recorder);
        let order: Vec<u16> = recorder.sent.iter().map(|s| s.0).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn test_paused_and_congested_hold_media() {
        let mut pacer = pacer(10_000);
        let mut recorder = Recorder::default();
        let now = Instant::now();
        pacer.enqueue_packet(media(1), Priority::Video, now).unwrap();

        pacer.pause();
        assert_eq!(pacer.next_send_time(now), None);
        pacer.process_packets(now + Duration::from_millis(10), &mut recorder);
        assert!(recorder.sent.is_empty());

        pacer.resume();
        pacer.set_congested(true);
        pacer.process_packets(now + Duration::from_millis(20), &mut recorder);
        assert!(recorder.sent.is_empty());

        pacer.set_congested(false);
        pacer.process_packets(now + Duration::from_millis(30), &mut recorder);
        assert_eq!(recorder.sent.len(), 1);
    }

    #[test]
    fn test_probe_cluster_sent_with_padding() {
        let mut pacer = pacer(300);
        let mut recorder = Recorder::default();
        let start = Instant::now();
        pacer.create_probe_cluster(ProbeClusterConfig {
            id: 7,
            at_time: start,
            target_rate: DataRate::from_kbps(900),
            target_duration: Duration::from_millis(15),
            min_probe_delta: Duration::from_millis(2),
            target_probe_count: 5,
        });
        assert_eq!(pacer.next_send_time(start), start.checked_sub(Duration::from_millis(1)).or(Some(start)));

        run(&mut pacer, &mut recorder, start, start + Duration::from_millis(100));
        assert!(!pacer.is_probing());
        let probe_bytes: usize = recorder
            .sent
            .iter()
            .filter(|s| s.2 == Some(7))
            .map(|s| s.1)
            .sum();
        // 900 kbps over 15 ms
        assert!(probe_bytes >= 1687, "{probe_bytes}");
        assert_eq!(pacer.stats().probe_bytes_sent as usize, probe_bytes);
    }

    #[test]
    fn test_probe_uses_queued_media_first() {
        let mut pacer = pacer(300);
        let mut recorder = Recorder::default();
        let start = Instant::now();
        pacer.enqueue_packet(media(1), Priority::Video, start).unwrap();
        pacer.create_probe_cluster(ProbeClusterConfig {
            id: 3,
            at_time: start,
            target_rate: DataRate::from_kbps(900),
            target_duration: Duration::from_millis(15),
            min_probe_delta: Duration::from_millis(2),
            target_probe_count: 5,
        });
        pacer.process_packets(start, &mut recorder);
        assert_eq!(recorder.sent[0], (1, 1000, Some(3)));
    }

    #[test]
    fn test_padding_after_media_when_idle() {
        let mut pacer = PacingController::new(PacerConfig::default());
        pacer.set_pacing_rates(DataRate::from_kbps(1000), DataRate::from_kbps(400));
        let mut recorder = Recorder::default();
        let start = Instant::now();

        // No padding before the first media packet
        assert_eq!(pacer.next_send_time(start), None);

        pacer.enqueue_packet(media(1), Priority::Video, start).unwrap();
        run(&mut pacer, &mut recorder, start, start + Duration::from_millis(200));
        let padding: usize = recorder.sent.iter().filter(|s| s.0 >= 50_000).map(|s| s.1).sum();
        assert!(padding > 0);
        assert_eq!(pacer.stats().padding_bytes_sent as usize, padding);
    }

    #[test]
    fn test_expected_queue_time() {
        let mut pacer = pacer(800);
        let now = Instant::now();
        for seq in 0..10 {
            pacer.enqueue_packet(media(seq), Priority::Video, now).unwrap();
        }
        assert_eq!(pacer.expected_queue_time(), Duration::from_millis(100));
        assert_eq!(pacer.oldest_packet_wait_time(now + Duration::from_millis(7)), Duration::from_millis(7));
    }

    #[test]
    fn test_full_queue_counts_drops() {
        let mut pacer = PacingController::new(PacerConfig {
            queue_capacity: 1,
            ..Default::default()
        });
        let now = Instant::now();
        pacer.enqueue_packet(media(1), Priority::Video, now).unwrap();
        assert!(pacer.enqueue_packet(media(2), Priority::Video, now).is_err());
        assert_eq!(pacer.stats().packets_dropped, 1);
    }
}
