//! Send-side packet history and feedback adaptation
//!
//! Every packet handed to the network is recorded under its transport-wide
//! sequence number. Incoming feedback reports are matched against the history
//! and turned into `PacketFeedback` records for the estimators. Each packet is
//! reported at most once as received; a packet first reported lost may later be
//! reported received when the peer re-reports a late arrival.

use crate::rtcp::ccfb::CongestionControlFeedback;
use crate::rtcp::transport_cc::{TransportFeedback, REFERENCE_TICK_US};
use crate::sequence::{SeqNumber, SeqUnwrapper};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// How long sent packets are remembered
pub const DEFAULT_HISTORY_WINDOW: Duration = Duration::from_secs(10);

/// Wrap period of the transport feedback reference time (24 bits of 64 ms)
const REFERENCE_WRAP_US: i64 = (1 << 24) * REFERENCE_TICK_US;

/// Wrap period of compact NTP timestamps (65536 s)
const COMPACT_NTP_WRAP_US: i64 = 65_536 * 1_000_000;

/// A packet as handed to the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentPacket {
    pub transport_seq: SeqNumber,
    pub ssrc: u32,
    pub rtp_seq: SeqNumber,
    pub send_time: Instant,
    /// Bytes on the wire
    pub size: usize,
    pub probe_cluster_id: Option<u32>,
    /// Whether the packet only carries padding
    pub is_padding: bool,
}

/// Per-packet feedback consumed by the estimators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketFeedback {
    pub ssrc: u32,
    /// Unwrapped transport-wide sequence number
    pub sequence_number: i64,
    pub rtp_seq: SeqNumber,
    pub send_time: Instant,
    /// Receive time mapped into the local clock; `None` if reported lost
    pub receive_time: Option<Instant>,
    pub size: usize,
    pub probe_cluster_id: Option<u32>,
}

impl PacketFeedback {
    pub fn is_received(&self) -> bool {
        self.receive_time.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckState {
    Unacked,
    Lost,
    Acked,
}

#[derive(Debug, Clone, Copy)]
struct SentRecord {
    packet: SentPacket,
    state: AckState,
}

/// Unwraps a periodic µs clock
#[derive(Debug, Default)]
struct ClockUnwrapper {
    last: Option<i64>,
}

impl ClockUnwrapper {
    fn unwrap(&mut self, value: i64, period: i64) -> i64 {
        let unwrapped = match self.last {
            None => value,
            Some(last) => {
                let mut delta = (value - last).rem_euclid(period);
                if delta > period / 2 {
                    delta -= period;
                }
                last + delta
            }
        };
        self.last = Some(unwrapped);
        unwrapped
    }
}

pub struct SendHistory {
    window: Duration,
    unwrapper: SeqUnwrapper,
    packets: BTreeMap<i64, SentRecord>,
    by_rtp: HashMap<(u32, u16), i64>,
    in_flight_bytes: usize,
    /// Maps the peer's receive clock onto ours: (remote µs, local instant)
    receive_anchor: Option<(i64, Instant)>,
    reference_clock: ClockUnwrapper,
    report_clock: ClockUnwrapper,
}

impl SendHistory {
    pub fn new(window: Duration) -> Self {
        SendHistory {
            window,
            unwrapper: SeqUnwrapper::new(),
            packets: BTreeMap::new(),
            by_rtp: HashMap::new(),
            in_flight_bytes: 0,
            receive_anchor: None,
            reference_clock: ClockUnwrapper::default(),
            report_clock: ClockUnwrapper::default(),
        }
    }

    /// Bytes sent but neither acknowledged nor reported lost
    pub fn in_flight_bytes(&self) -> usize {
        self.in_flight_bytes
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Record a sent packet; returns its unwrapped transport sequence number
    pub fn on_packet_sent(&mut self, packet: SentPacket) -> i64 {
        let key = self.unwrapper.unwrap(packet.transport_seq);
        if let Some(old) = self.packets.insert(
            key,
            SentRecord {
                packet,
                state: AckState::Unacked,
            },
        ) {
            if old.state == AckState::Unacked {
                self.in_flight_bytes -= old.packet.size;
            }
        }
        self.by_rtp.insert((packet.ssrc, packet.rtp_seq.as_raw()), key);
        self.in_flight_bytes += packet.size;
        self.prune(packet.send_time);
        key
    }

    fn prune(&mut self, now: Instant) {
        while let Some((&key, record)) = self.packets.first_key_value() {
            if now.saturating_duration_since(record.packet.send_time) <= self.window {
                break;
            }
            if record.state == AckState::Unacked {
                self.in_flight_bytes -= record.packet.size;
            }
            let rtp_key = (record.packet.ssrc, record.packet.rtp_seq.as_raw());
            if self.by_rtp.get(&rtp_key) == Some(&key) {
                self.by_rtp.remove(&rtp_key);
            }
            self.packets.remove(&key);
        }
    }

    fn map_receive_time(&mut self, remote_us: i64, now: Instant) -> Instant {
        let (anchor_us, anchor) = *self.receive_anchor.get_or_insert((remote_us, now));
        let offset = remote_us - anchor_us;
        if offset >= 0 {
            anchor + Duration::from_micros(offset as u64)
        } else {
            anchor
                .checked_sub(Duration::from_micros(offset.unsigned_abs()))
                .unwrap_or(anchor)
        }
    }

    fn apply(&mut self, key: i64, remote_us: Option<i64>, now: Instant) -> Option<PacketFeedback> {
        let record = self.packets.get(&key).copied()?;
        let receive_time = match (record.state, remote_us) {
            (AckState::Acked, _) => return None,
            (AckState::Lost, None) => return None,
            (_, Some(us)) => Some(self.map_receive_time(us, now)),
            (AckState::Unacked, None) => None,
        };

        if record.state == AckState::Unacked {
            self.in_flight_bytes -= record.packet.size;
        }
        if let Some(entry) = self.packets.get_mut(&key) {
            entry.state = if receive_time.is_some() {
                AckState::Acked
            } else {
                AckState::Lost
            };
        }

        Some(PacketFeedback {
            ssrc: record.packet.ssrc,
            sequence_number: key,
            rtp_seq: record.packet.rtp_seq,
            send_time: record.packet.send_time,
            receive_time,
            size: record.packet.size,
            probe_cluster_id: record.packet.probe_cluster_id,
        })
    }

    /// Adapt a transport-wide feedback report
    pub fn on_transport_feedback(&mut self, feedback: &TransportFeedback, now: Instant) -> Vec<PacketFeedback> {
        let reference = self
            .reference_clock
            .unwrap(feedback.reference_time_us(), REFERENCE_WRAP_US);
        let offset = reference - feedback.reference_time_us();

        let mut records = Vec::with_capacity(feedback.packets.len());
        let mut unknown = 0usize;
        for (seq, remote) in feedback.receive_times_us() {
            let key = self.unwrapper.peek(seq);
            if !self.packets.contains_key(&key) {
                unknown += 1;
                continue;
            }
            if let Some(record) = self.apply(key, remote.map(|us| us + offset), now) {
                records.push(record);
            }
        }
        if unknown > 0 {
            tracing::debug!("Transport feedback referenced {} unknown packets", unknown);
        }
        records
    }

    /// Adapt an RFC 8888 congestion control feedback report
    pub fn on_congestion_feedback(
        &mut self,
        feedback: &CongestionControlFeedback,
        now: Instant,
    ) -> Vec<PacketFeedback> {
        let report_us = CongestionControlFeedback::compact_ntp_to_us(feedback.report_timestamp);
        let unwrapped = self.report_clock.unwrap(report_us, COMPACT_NTP_WRAP_US);
        let offset = unwrapped - report_us;

        let mut records = Vec::new();
        for (ssrc, seq, remote) in feedback.arrival_times_us() {
            let Some(&key) = self.by_rtp.get(&(ssrc, seq.as_raw())) else {
                continue;
            };
            if let Some(record) = self.apply(key, remote.map(|us| us + offset), now) {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.sequence_number);
        records
    }
}

impl Default for SendHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtcp::ccfb::{CcfbReport, CcfbStreamBlock};

    fn sent(seq: u16, at: Instant) -> SentPacket {
        SentPacket {
            transport_seq: SeqNumber::new(seq),
            ssrc: 7,
            rtp_seq: SeqNumber::new(seq.wrapping_add(1000)),
            send_time: at,
            size: 1000,
            probe_cluster_id: None,
            is_padding: false,
        }
    }

    #[test]
    fn test_transport_feedback_mapping() {
        let mut history = SendHistory::default();
        let start = Instant::now();
        for seq in 0..4u16 {
            history.on_packet_sent(sent(seq, start + Duration::from_millis(u64::from(seq) * 10)));
        }
        assert_eq!(history.in_flight_bytes(), 4000);

        let mut feedback = TransportFeedback::new(1, 7, SeqNumber::new(0), 1_000_000, 0);
        assert!(feedback.add_received(SeqNumber::new(0), 1_000_000));
        assert!(feedback.add_received(SeqNumber::new(2), 1_020_000));

        let now = start + Duration::from_millis(50);
        let records = history.on_transport_feedback(&feedback, now);
        assert_eq!(records.len(), 3);
        assert!(records[0].is_received());
        assert!(!records[1].is_received());
        assert_eq!(
            records[2].receive_time.unwrap() - records[0].receive_time.unwrap(),
            Duration::from_millis(20)
        );
        assert_eq!(history.in_flight_bytes(), 1000);

        // Duplicate report is ignored
        assert!(history.on_transport_feedback(&feedback, now).is_empty());
    }

    #[test]
    fn test_late_arrival_reported_once() {
        let mut history = SendHistory::default();
        let start = Instant::now();
        for seq in 0..3u16 {
            history.on_packet_sent(sent(seq, start));
        }

        let mut first = TransportFeedback::new(1, 7, SeqNumber::new(0), 0, 0);
        assert!(first.add_received(SeqNumber::new(0), 0));
        assert!(first.add_received(SeqNumber::new(2), 1000));
        assert_eq!(history.on_transport_feedback(&first, start).len(), 3);

        let mut second = TransportFeedback::new(1, 7, SeqNumber::new(1), 0, 1);
        assert!(second.add_received(SeqNumber::new(1), 5000));
        assert!(second.add_received(SeqNumber::new(2), 1000));
        let records = history.on_transport_feedback(&second, start);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rtp_seq, SeqNumber::new(1001));
        assert!(records[0].is_received());
    }

    #[test]
    fn test_congestion_feedback_mapping() {
        let mut history = SendHistory::default();
        let start = Instant::now();
        history.on_packet_sent(sent(0, start));
        history.on_packet_sent(sent(1, start));

        let feedback = CongestionControlFeedback {
            sender_ssrc: 1,
            blocks: vec![CcfbStreamBlock {
                media_ssrc: 7,
                begin_seq: SeqNumber::new(1000),
                reports: vec![
                    CcfbReport::received(Duration::from_millis(100), 0),
                    CcfbReport::default(),
                    // Never sent
                    CcfbReport::received(Duration::ZERO, 0),
                ],
            }],
            report_timestamp: 10 << 16,
        };
        let records = history.on_congestion_feedback(&feedback, start);
        assert_eq!(records.len(), 2);
        assert!(records[0].is_received());
        assert!(!records[1].is_received());
        assert_eq!(history.in_flight_bytes(), 0);
    }

    #[test]
    fn test_history_window() {
        let mut history = SendHistory::new(Duration::from_secs(1));
        let start = Instant::now();
        history.on_packet_sent(sent(0, start));
        history.on_packet_sent(sent(1, start + Duration::from_secs(2)));
        assert_eq!(history.len(), 1);
        assert_eq!(history.in_flight_bytes(), 1000);
    }

    #[test]
    fn test_reference_time_wrap() {
        let mut clock = ClockUnwrapper::default();
        let near_wrap = REFERENCE_WRAP_US - REFERENCE_TICK_US;
        assert_eq!(clock.unwrap(near_wrap, REFERENCE_WRAP_US), near_wrap);
        assert_eq!(
            clock.unwrap(0, REFERENCE_WRAP_US),
            REFERENCE_WRAP_US
        );
    }
}
