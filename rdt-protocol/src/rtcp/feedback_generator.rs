//! Receive-side congestion feedback generation
//!
//! Arrivals are recorded per transport sequence number and reported back to
//! the sender in transport-wide or RFC 8888 feedback packets. Reports are sent
//! no more often than `min_interval` and no later than `max_interval` after the
//! previous one while packets keep arriving. Between those bounds the interval
//! is chosen so feedback uses about `bandwidth_fraction` of the incoming rate,
//! and a marker packet pulls the next report forward.

use super::ccfb::{CcfbReport, CcfbStreamBlock, CongestionControlFeedback};
use super::transport_cc::TransportFeedback;
use super::RtcpPacket;
use crate::rate::DataRate;
use crate::sequence::{SeqNumber, SeqUnwrapper};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Feedback wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackFormat {
    /// Transport-wide feedback keyed by the transport sequence extension
    TransportWide,
    /// RFC 8888 feedback keyed by the RTP sequence number of `media_ssrc`
    Congestion,
}

#[derive(Debug, Clone)]
pub struct FeedbackConfig {
    pub format: FeedbackFormat,
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub min_interval: Duration,
    pub max_interval: Duration,
    /// Share of the incoming rate feedback may use
    pub bandwidth_fraction: f64,
    /// Arrivals older than this are forgotten
    pub history: Duration,
    /// Upper bound on one report's size in bytes
    pub max_report_size: usize,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        FeedbackConfig {
            format: FeedbackFormat::TransportWide,
            sender_ssrc: 0,
            media_ssrc: 0,
            min_interval: Duration::from_millis(25),
            max_interval: Duration::from_millis(250),
            bandwidth_fraction: 0.05,
            history: Duration::from_millis(500),
            max_report_size: 1200,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Arrival {
    at: Instant,
    size: usize,
    ecn: u8,
}

pub struct FeedbackGenerator {
    config: FeedbackConfig,
    epoch: Instant,
    unwrapper: SeqUnwrapper,
    arrivals: BTreeMap<i64, Arrival>,
    next_unreported: Option<i64>,
    pending_since: Option<Instant>,
    marker_at: Option<Instant>,
    last_sent: Option<Instant>,
    feedback_count: u8,
    avg_report_bits: Option<f64>,
    reports_sent: u64,
}

impl FeedbackGenerator {
    /// `epoch` is the origin of the receive clock carried in reports
    pub fn new(config: FeedbackConfig, epoch: Instant) -> Self {
        FeedbackGenerator {
            config,
            epoch,
            unwrapper: SeqUnwrapper::new(),
            arrivals: BTreeMap::new(),
            next_unreported: None,
            pending_since: None,
            marker_at: None,
            last_sent: None,
            feedback_count: 0,
            avg_report_bits: None,
            reports_sent: 0,
        }
    }

    pub fn reports_sent(&self) -> u64 {
        self.reports_sent
    }

    /// Record an arrival
    ///
    /// A packet arriving after it was already reported as lost moves the report
    /// window back so it is reported once more.
    pub fn on_packet(&mut self, seq: SeqNumber, arrival: Instant, size: usize, marker: bool, ecn: u8) {
        let key = self.unwrapper.unwrap(seq);
        if self.arrivals.contains_key(&key) {
            return;
        }
        self.arrivals.insert(key, Arrival { at: arrival, size, ecn });

        self.next_unreported = match self.next_unreported {
            Some(next) if next <= key => Some(next),
            Some(_) => {
                tracing::trace!("Late arrival {} rewinds feedback window", seq);
                Some(key)
            }
            None => Some(key),
        };
        self.pending_since.get_or_insert(arrival);
        if marker && self.marker_at.is_none() {
            self.marker_at = Some(arrival);
        }
    }

    /// Incoming media rate over the history window
    pub fn incoming_rate(&self) -> DataRate {
        let bytes: usize = self.arrivals.values().map(|a| a.size).sum();
        DataRate::from_bytes_per(bytes as u64, self.config.history)
    }

    /// Target spacing between reports
    pub fn interval(&self) -> Duration {
        let budget = self.incoming_rate().bps_f64() * self.config.bandwidth_fraction;
        let bits = self.avg_report_bits.unwrap_or(800.0);
        if budget <= 0.0 {
            return self.config.max_interval;
        }
        Duration::from_secs_f64(bits / budget)
            .clamp(self.config.min_interval, self.config.max_interval)
    }

    /// When the next report is due, if anything is pending
    pub fn next_send_time(&self) -> Option<Instant> {
        let pending_since = self.pending_since?;
        let (earliest, regular) = match self.last_sent {
            Some(last) => (last + self.config.min_interval, last + self.interval()),
            None => (pending_since, pending_since),
        };
        let target = match self.marker_at {
            Some(marker) => regular.min(marker.max(earliest)),
            None => regular,
        };
        Some(target.max(earliest))
    }

    /// Produce a report if one is due
    pub fn poll(&mut self, now: Instant) -> Option<RtcpPacket> {
        let due = self.next_send_time()?;
        if now < due {
            return None;
        }
        self.prune(now);
        let packet = match self.config.format {
            FeedbackFormat::TransportWide => self.build_transport(),
            FeedbackFormat::Congestion => self.build_congestion(now),
        };

        self.last_sent = Some(now);
        self.marker_at = None;
        self.pending_since = self.next_unreported.map(|_| now);
        let packet = packet?;

        let bits = (packet.to_bytes().len() * 8) as f64;
        self.avg_report_bits = Some(match self.avg_report_bits {
            Some(avg) => 0.8 * avg + 0.2 * bits,
            None => bits,
        });
        self.feedback_count = self.feedback_count.wrapping_add(1);
        self.reports_sent += 1;
        Some(packet)
    }

    fn prune(&mut self, now: Instant) {
        let history = self.config.history;
        self.arrivals
            .retain(|_, arrival| now.saturating_duration_since(arrival.at) <= history);
        if let Some(next) = self.next_unreported {
            self.next_unreported = self.arrivals.range(next..).next().map(|(key, _)| *key);
        }
    }

    fn time_us(&self, at: Instant) -> i64 {
        at.saturating_duration_since(self.epoch).as_micros() as i64
    }

    fn build_transport(&mut self) -> Option<RtcpPacket> {
        let start = self.next_unreported?;
        let first = self.arrivals.get(&start)?;
        let mut feedback = TransportFeedback::new(
            self.config.sender_ssrc,
            self.config.media_ssrc,
            to_seq(start),
            self.time_us(first.at),
            self.feedback_count,
        );

        let mut next_unreported = None;
        for (key, arrival) in self.arrivals.range(start..) {
            if feedback.estimated_size() + 3 > self.config.max_report_size
                || !feedback.add_received(to_seq(*key), self.time_us(arrival.at))
            {
                next_unreported = Some(*key);
                break;
            }
        }
        self.next_unreported = next_unreported;

        if feedback.packets.is_empty() {
            // Unrepresentable head; skip it rather than stall
            self.next_unreported = self.arrivals.range(start + 1..).next().map(|(k, _)| *k);
            return None;
        }
        Some(RtcpPacket::TransportFeedback(feedback))
    }

    fn build_congestion(&mut self, now: Instant) -> Option<RtcpPacket> {
        let start = self.next_unreported?;
        let (last, _) = self.arrivals.iter().next_back()?;
        let max_reports = (self.config.max_report_size.saturating_sub(24)) / 2;
        let count = ((last - start + 1) as usize).min(max_reports).max(1);

        let reports = (0..count as i64)
            .map(|i| match self.arrivals.get(&(start + i)) {
                Some(arrival) => {
                    CcfbReport::received(now.saturating_duration_since(arrival.at), arrival.ecn)
                }
                None => CcfbReport::default(),
            })
            .collect();

        let end = start + count as i64;
        self.next_unreported = self.arrivals.range(end..).next().map(|(k, _)| *k);

        Some(RtcpPacket::CongestionFeedback(CongestionControlFeedback {
            sender_ssrc: self.config.sender_ssrc,
            blocks: vec![CcfbStreamBlock {
                media_ssrc: self.config.media_ssrc,
                begin_seq: to_seq(start),
                reports,
            }],
            report_timestamp: CongestionControlFeedback::duration_to_compact_ntp(
                now.saturating_duration_since(self.epoch),
            ),
        }))
    }
}

fn to_seq(key: i64) -> SeqNumber {
    SeqNumber::new(key.rem_euclid(1 << 16) as u16)
}
