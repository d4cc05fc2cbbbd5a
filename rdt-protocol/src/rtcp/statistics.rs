//! Per-stream receive statistics feeding receiver reports (RFC 3550 A.3, A.8)

use super::report::{ReportBlock, SenderReport};
use crate::sequence::{SeqNumber, SeqUnwrapper, TimestampUnwrapper};
use std::time::Instant;

#[derive(Debug)]
pub struct ReceiveStatistics {
    ssrc: u32,
    clock_rate: u32,
    epoch: Option<Instant>,
    seq_unwrapper: SeqUnwrapper,
    ts_unwrapper: TimestampUnwrapper,
    base_seq: i64,
    max_seq: i64,
    received: u64,
    bytes: u64,
    expected_prior: i64,
    received_prior: u64,
    jitter: f64,
    last_transit: Option<i64>,
    last_sr: Option<(u32, Instant)>,
}

impl ReceiveStatistics {
    pub fn new(ssrc: u32, clock_rate: u32) -> Self {
        ReceiveStatistics {
            ssrc,
            clock_rate,
            epoch: None,
            seq_unwrapper: SeqUnwrapper::new(),
            ts_unwrapper: TimestampUnwrapper::new(),
            base_seq: 0,
            max_seq: 0,
            received: 0,
            bytes: 0,
            expected_prior: 0,
            received_prior: 0,
            jitter: 0.0,
            last_transit: None,
            last_sr: None,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Record a received packet
    pub fn on_packet(&mut self, seq: SeqNumber, rtp_timestamp: u32, size: usize, arrival: Instant) {
        let unwrapped = self.seq_unwrapper.unwrap(seq);
        let epoch = *self.epoch.get_or_insert(arrival);
        self.received += 1;
        self.bytes += size as u64;

        if self.received == 1 {
            self.base_seq = unwrapped;
            self.max_seq = unwrapped;
        } else if unwrapped > self.max_seq {
            self.max_seq = unwrapped;
        } else {
            // Reordered or retransmitted packets would skew the jitter estimate
            return;
        }

        let elapsed = arrival.saturating_duration_since(epoch);
        let arrival_units = (elapsed.as_micros() * u128::from(self.clock_rate) / 1_000_000) as i64;
        let transit = arrival_units - self.ts_unwrapper.unwrap(rtp_timestamp);
        if let Some(last) = self.last_transit {
            let d = (transit - last).abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
    }

    /// Remember a sender report for the LSR/DLSR echo
    pub fn on_sender_report(&mut self, report: &SenderReport, now: Instant) {
        self.last_sr = Some((report.compact_ntp(), now));
    }

    pub fn packets_received(&self) -> u64 {
        self.received
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes
    }

    /// Packets expected minus packets received since the first packet
    pub fn cumulative_lost(&self) -> i64 {
        if self.received == 0 {
            return 0;
        }
        (self.max_seq - self.base_seq + 1) - self.received as i64
    }

    /// Interarrival jitter in timestamp units
    pub fn jitter(&self) -> u32 {
        self.jitter as u32
    }

    /// Build a report block and start a new reporting interval
    pub fn report_block(&mut self, now: Instant) -> Option<ReportBlock> {
        if self.received == 0 {
            return None;
        }
        let expected = self.max_seq - self.base_seq + 1;
        let expected_interval = expected - self.expected_prior;
        let received_interval = (self.received - self.received_prior) as i64;
        let lost_interval = expected_interval - received_interval;
        self.expected_prior = expected;
        self.received_prior = self.received;

        let fraction_lost = if expected_interval <= 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval).min(255) as u8
        };

        let (last_sr, delay_since_last_sr) = match self.last_sr {
            Some((compact, at)) => {
                let delay = now.saturating_duration_since(at);
                let units = (delay.as_micros() * 65536 / 1_000_000).min(u128::from(u32::MAX));
                (compact, units as u32)
            }
            None => (0, 0),
        };

        Some(ReportBlock {
            ssrc: self.ssrc,
            fraction_lost,
            cumulative_lost: self.cumulative_lost().clamp(i64::from(i32::MIN), i64::from(i32::MAX))
                as i32,
            extended_highest_seq: self.max_seq as u32,
            jitter: self.jitter(),
            last_sr,
            delay_since_last_sr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_loss_accounting() {
        let mut stats = ReceiveStatistics::new(5, 90_000);
        let now = Instant::now();
        for seq in [65530u16, 65531, 65533, 65534, 0, 1] {
            stats.on_packet(SeqNumber::new(seq), 0, 100, now);
        }
        assert_eq!(stats.cumulative_lost(), 2);

        let block = stats.report_block(now).unwrap();
        assert_eq!(block.ssrc, 5);
        assert_eq!(block.cumulative_lost, 2);
        assert_eq!(block.fraction_lost, (2 * 256 / 8) as u8);
        assert_eq!(block.extended_highest_seq, 65536 + 1);

        // No new loss in the next interval
        stats.on_packet(SeqNumber::new(2), 0, 100, now);
        assert_eq!(stats.report_block(now).unwrap().fraction_lost, 0);
    }

    #[test]
    fn test_constant_spacing_has_no_jitter() {
        let mut stats = ReceiveStatistics::new(1, 90_000);
        let start = Instant::now();
        for i in 0..50u32 {
            stats.on_packet(
                SeqNumber::new(i as u16),
                i * 3000,
                1000,
                start + Duration::from_micros(u64::from(i) * 33_333),
            );
        }
        assert!(stats.jitter() <= 1);
    }

    #[test]
    fn test_variable_delay_creates_jitter() {
        let mut stats = ReceiveStatistics::new(1, 90_000);
        let start = Instant::now();
        for i in 0..50u32 {
            let wobble = if i % 2 == 0 { 0 } else { 10_000 };
            stats.on_packet(
                SeqNumber::new(i as u16),
                i * 3000,
                1000,
                start + Duration::from_micros(u64::from(i) * 33_333 + wobble),
            );
        }
        // 10 ms at 90 kHz is 900 units
        assert!(stats.jitter() > 500);
    }

    #[test]
    fn test_lsr_echo() {
        let mut stats = ReceiveStatistics::new(1, 90_000);
        let now = Instant::now();
        stats.on_packet(SeqNumber::new(0), 0, 100, now);
        let report = SenderReport {
            sender_ssrc: 1,
            ntp_timestamp: 0x0000_1234_5678_0000,
            rtp_timestamp: 0,
            packet_count: 1,
            octet_count: 100,
            blocks: vec![],
        };
        stats.on_sender_report(&report, now);

        let block = stats.report_block(now + Duration::from_millis(500)).unwrap();
        assert_eq!(block.last_sr, 0x1234_5678);
        assert_eq!(block.delay_since_last_sr, 32768);
    }
}
