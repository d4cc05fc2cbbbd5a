//! Transport-wide congestion control feedback (transport-layer feedback, FMT 15)
//!
//! ```text
//! | sender ssrc | media ssrc | base seq | status count |
//! | reference time (24 bits, 64 ms) | feedback count |
//! | packet chunks (16 bits each) ...                  |
//! | receive deltas (8 or 16 bits each) ...            |
//! ```
//!
//! Packet chunks are either run-length chunks (one symbol repeated up to 8191
//! times) or status vectors (14 one-bit or 7 two-bit symbols). Symbols: 0 = not
//! received, 1 = received with a small delta (one unsigned byte), 2 = received
//! with a large or negative delta (two signed bytes). Deltas are in 250 µs ticks
//! relative to the previous received packet, the first one relative to the
//! reference time.

use super::{read_u16, read_u32, require, write_packet, RtcpError, FMT_TRANSPORT_WIDE,
    PT_TRANSPORT_FEEDBACK};
use crate::sequence::SeqNumber;
use bytes::{BufMut, BytesMut};

/// Receive delta resolution
pub const DELTA_TICK_US: i64 = 250;

/// Reference time resolution
pub const REFERENCE_TICK_US: i64 = 64_000;

/// Largest number of statuses in one feedback packet
pub const MAX_STATUS_COUNT: usize = 0xFFFF;

const MAX_RUN_LENGTH: usize = 0x1FFF;
const ONE_BIT_CAPACITY: usize = 14;
const TWO_BIT_CAPACITY: usize = 7;
const FIXED_BODY_SIZE: usize = 16;

const SYMBOL_NOT_RECEIVED: u8 = 0;
const SYMBOL_SMALL_DELTA: u8 = 1;
const SYMBOL_LARGE_DELTA: u8 = 2;

/// Reception status of one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketStatus {
    pub seq: SeqNumber,
    /// Receive delta in 250 µs ticks; `None` if not received
    pub delta_ticks: Option<i16>,
}

impl PacketStatus {
    fn symbol(&self) -> u8 {
        match self.delta_ticks {
            None => SYMBOL_NOT_RECEIVED,
            Some(delta) if (0..=255).contains(&delta) => SYMBOL_SMALL_DELTA,
            Some(_) => SYMBOL_LARGE_DELTA,
        }
    }
}

/// Transport-wide feedback packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFeedback {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub base_seq: SeqNumber,
    /// Reference time in 64 ms units (24 bits)
    pub reference_time: u32,
    /// Feedback packet counter, wraps at 256
    pub feedback_count: u8,
    /// One status per sequence number starting at `base_seq`
    pub packets: Vec<PacketStatus>,
    /// Time of the last received packet in µs, for incremental building
    last_time_us: i64,
}

impl TransportFeedback {
    /// Start a feedback packet whose reference time is at or before
    /// `reference_time_us`
    pub fn new(
        sender_ssrc: u32,
        media_ssrc: u32,
        base_seq: SeqNumber,
        reference_time_us: i64,
        feedback_count: u8,
    ) -> Self {
        let reference = reference_time_us.div_euclid(REFERENCE_TICK_US);
        TransportFeedback {
            sender_ssrc,
            media_ssrc,
            base_seq,
            reference_time: (reference as u32) & 0x00FF_FFFF,
            feedback_count,
            packets: Vec::new(),
            last_time_us: reference * REFERENCE_TICK_US,
        }
    }

    /// Reference time in µs (24-bit wrapped)
    pub fn reference_time_us(&self) -> i64 {
        i64::from(self.reference_time) * REFERENCE_TICK_US
    }

    /// Next sequence number this packet would describe
    pub fn next_seq(&self) -> SeqNumber {
        self.base_seq + self.packets.len() as u16
    }

    /// Add a received packet; packets skipped since the last one are reported
    /// as not received
    ///
    /// Returns `false` (and leaves the packet unchanged) if the sequence number
    /// goes backwards, the status count would overflow, or the delta cannot be
    /// represented.
    pub fn add_received(&mut self, seq: SeqNumber, arrival_us: i64) -> bool {
        let gap = self.next_seq().distance_to(seq);
        if gap < 0 {
            return false;
        }
        let gap = gap as usize;
        if self.packets.len() + gap + 1 > MAX_STATUS_COUNT {
            return false;
        }

        let delta_us = arrival_us - self.last_time_us;
        let ticks = (delta_us as f64 / DELTA_TICK_US as f64).round() as i64;
        let Ok(ticks) = i16::try_from(ticks) else {
            return false;
        };

        let next = self.next_seq();
        for i in 0..gap {
            self.packets.push(PacketStatus {
                seq: next + i as u16,
                delta_ticks: None,
            });
        }
        self.packets.push(PacketStatus {
            seq,
            delta_ticks: Some(ticks),
        });
        self.last_time_us += i64::from(ticks) * DELTA_TICK_US;
        true
    }

    /// Receive times in µs relative to the reference time origin
    pub fn receive_times_us(&self) -> Vec<(SeqNumber, Option<i64>)> {
        let mut time = self.reference_time_us();
        self.packets
            .iter()
            .map(|status| {
                let at = status.delta_ticks.map(|delta| {
                    time += i64::from(delta) * DELTA_TICK_US;
                    time
                });
                (status.seq, at)
            })
            .collect()
    }

    /// Number of packets reported as received
    pub fn received_count(&self) -> usize {
        self.packets.iter().filter(|p| p.delta_ticks.is_some()).count()
    }

    /// Upper bound of the serialized size
    pub fn estimated_size(&self) -> usize {
        let chunks = self.packets.len().div_ceil(TWO_BIT_CAPACITY);
        let deltas: usize = self
            .packets
            .iter()
            .map(|p| match p.symbol() {
                SYMBOL_SMALL_DELTA => 1,
                SYMBOL_LARGE_DELTA => 2,
                _ => 0,
            })
            .sum();
        4 + FIXED_BODY_SIZE + chunks * 2 + deltas + 3
    }

    fn encode_chunks(symbols: &[u8], body: &mut BytesMut) {
        let mut i = 0;
        while i < symbols.len() {
            let remaining = symbols.len() - i;
            let run = symbols[i..]
                .iter()
                .take(MAX_RUN_LENGTH)
                .take_while(|s| **s == symbols[i])
                .count();
            let one_bit_len = remaining.min(ONE_BIT_CAPACITY);
            let one_bit_fits = symbols[i..i + one_bit_len].iter().all(|s| *s <= 1);

            if run >= ONE_BIT_CAPACITY || (run >= TWO_BIT_CAPACITY && !one_bit_fits) || run == remaining {
                body.put_u16(u16::from(symbols[i]) << 13 | run as u16);
                i += run;
            } else if one_bit_fits {
                let mut chunk = 0x8000u16;
                for (j, symbol) in symbols[i..i + one_bit_len].iter().enumerate() {
                    chunk |= u16::from(*symbol) << (13 - j);
                }
                body.put_u16(chunk);
                i += one_bit_len;
            } else {
                let len = remaining.min(TWO_BIT_CAPACITY);
                let mut chunk = 0xC000u16;
                for (j, symbol) in symbols[i..i + len].iter().enumerate() {
                    chunk |= u16::from(*symbol) << (12 - 2 * j);
                }
                body.put_u16(chunk);
                i += len;
            }
        }
    }

    pub fn write(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::with_capacity(self.estimated_size());
        body.put_u32(self.sender_ssrc);
        body.put_u32(self.media_ssrc);
        body.put_u16(self.base_seq.as_raw());
        body.put_u16(self.packets.len() as u16);
        body.put_u32(self.reference_time << 8 | u32::from(self.feedback_count));

        let symbols: Vec<u8> = self.packets.iter().map(PacketStatus::symbol).collect();
        Self::encode_chunks(&symbols, &mut body);

        for status in &self.packets {
            match (status.symbol(), status.delta_ticks) {
                (SYMBOL_SMALL_DELTA, Some(delta)) => body.put_u8(delta as u8),
                (SYMBOL_LARGE_DELTA, Some(delta)) => body.put_i16(delta),
                _ => {}
            }
        }
        write_packet(FMT_TRANSPORT_WIDE, PT_TRANSPORT_FEEDBACK, &body, buf);
    }

    pub fn parse(body: &[u8]) -> Result<Self, RtcpError> {
        require(body, FIXED_BODY_SIZE)?;
        let base_seq = SeqNumber::new(read_u16(body, 8));
        let status_count = read_u16(body, 10) as usize;
        let time_word = read_u32(body, 12);

        let mut symbols = Vec::with_capacity(status_count);
        let mut offset = FIXED_BODY_SIZE;
        while symbols.len() < status_count {
            if offset + 2 > body.len() {
                return Err(RtcpError::Malformed("transport feedback chunk list"));
            }
            let chunk = read_u16(body, offset);
            offset += 2;
            let remaining = status_count - symbols.len();

            if chunk & 0x8000 == 0 {
                let symbol = ((chunk >> 13) & 0b11) as u8;
                let run = (chunk & 0x1FFF) as usize;
                symbols.extend(std::iter::repeat(symbol).take(run.min(remaining)));
            } else if chunk & 0x4000 == 0 {
                for j in 0..ONE_BIT_CAPACITY.min(remaining) {
                    symbols.push(((chunk >> (13 - j)) & 1) as u8);
                }
            } else {
                for j in 0..TWO_BIT_CAPACITY.min(remaining) {
                    symbols.push(((chunk >> (12 - 2 * j)) & 0b11) as u8);
                }
            }
        }

        let mut packets = Vec::with_capacity(status_count);
        let mut time_us = i64::from(time_word >> 8) * REFERENCE_TICK_US;
        for (i, symbol) in symbols.into_iter().enumerate() {
            let delta_ticks = match symbol {
                SYMBOL_NOT_RECEIVED => None,
                SYMBOL_SMALL_DELTA => {
                    let delta = *body
                        .get(offset)
                        .ok_or(RtcpError::Malformed("transport feedback delta"))?;
                    offset += 1;
                    Some(i16::from(delta))
                }
                SYMBOL_LARGE_DELTA => {
                    if offset + 2 > body.len() {
                        return Err(RtcpError::Malformed("transport feedback delta"));
                    }
                    let delta = read_u16(body, offset) as i16;
                    offset += 2;
                    Some(delta)
                }
                _ => return Err(RtcpError::Malformed("transport feedback symbol")),
            };
            if let Some(delta) = delta_ticks {
                time_us += i64::from(delta) * DELTA_TICK_US;
            }
            packets.push(PacketStatus {
                seq: base_seq + i as u16,
                delta_ticks,
            });
        }

        Ok(TransportFeedback {
            sender_ssrc: read_u32(body, 0),
            media_ssrc: read_u32(body, 4),
            base_seq,
            reference_time: time_word >> 8,
            feedback_count: (time_word & 0xFF) as u8,
            packets,
            last_time_us: time_us,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtcp::RtcpPacket;

    fn roundtrip(feedback: &TransportFeedback) -> TransportFeedback {
        let bytes = RtcpPacket::TransportFeedback(feedback.clone()).to_bytes();
        assert_eq!(bytes.len() % 4, 0);
        assert!(bytes.len() <= feedback.estimated_size() + 3);
        match RtcpPacket::parse_compound(&bytes).unwrap().pop() {
            Some(RtcpPacket::TransportFeedback(parsed)) => parsed,
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_small_and_large_deltas() {
        let base_us = 1_000_000;
        let mut feedback = TransportFeedback::new(1, 2, SeqNumber::new(100), base_us, 7);
        assert!(feedback.add_received(SeqNumber::new(100), base_us + 1_000));
        assert!(feedback.add_received(SeqNumber::new(101), base_us + 2_000));
        // Gap of two, then a large delta
        assert!(feedback.add_received(SeqNumber::new(104), base_us + 200_000));
        // Reordered arrival: negative delta
        assert!(feedback.add_received(SeqNumber::new(105), base_us + 150_000));

        assert_eq!(feedback.packets.len(), 6);
        assert_eq!(feedback.received_count(), 4);

        let parsed = roundtrip(&feedback);
        assert_eq!(parsed.packets, feedback.packets);
        assert_eq!(parsed.feedback_count, 7);

        let times = parsed.receive_times_us();
        let origin = feedback.reference_time_us();
        let expected_offset = base_us - origin;
        assert_eq!(times[0], (SeqNumber::new(100), Some(origin + expected_offset + 1_000)));
        assert_eq!(times[2].1, None);
        assert_eq!(times[5].1, Some(origin + expected_offset + 150_000));
    }

    #[test]
    fn test_long_loss_run() {
        let mut feedback = TransportFeedback::new(1, 2, SeqNumber::new(0), 0, 0);
        assert!(feedback.add_received(SeqNumber::new(0), 0));
        assert!(feedback.add_received(SeqNumber::new(500), 1_000));
        assert_eq!(feedback.packets.len(), 501);

        let parsed = roundtrip(&feedback);
        assert_eq!(parsed.packets, feedback.packets);
    }

    #[test]
    fn test_mixed_vectors() {
        let mut feedback = TransportFeedback::new(1, 2, SeqNumber::new(65530), 0, 0);
        let mut time = 0;
        for i in 0..40u16 {
            if i % 3 == 1 {
                continue;
            }
            time += if i % 5 == 0 { 100_000 } else { 500 };
            assert!(feedback.add_received(SeqNumber::new(65530) + i, time));
        }
        let parsed = roundtrip(&feedback);
        assert_eq!(parsed.packets, feedback.packets);
        assert_eq!(parsed.packets.last().map(|p| p.seq), Some(SeqNumber::new(33)));
    }

    #[test]
    fn test_backwards_rejected() {
        let mut feedback = TransportFeedback::new(1, 2, SeqNumber::new(10), 0, 0);
        assert!(feedback.add_received(SeqNumber::new(12), 0));
        assert!(!feedback.add_received(SeqNumber::new(11), 0));
        assert!(!feedback.add_received(SeqNumber::new(12), 0));
    }

    #[test]
    fn test_unrepresentable_delta_rejected() {
        let mut feedback = TransportFeedback::new(1, 2, SeqNumber::new(0), 0, 0);
        assert!(feedback.add_received(SeqNumber::new(0), 0));
        assert!(!feedback.add_received(SeqNumber::new(1), 10_000_000));
    }

    #[test]
    fn test_truncated_deltas_rejected() {
        let mut feedback = TransportFeedback::new(1, 2, SeqNumber::new(0), 0, 0);
        for i in 0..10u16 {
            assert!(feedback.add_received(SeqNumber::new(i), i64::from(i) * 1000));
        }
        let mut body = BytesMut::new();
        feedback.write(&mut body);
        let body = &body[4..body.len() - 8];
        assert!(TransportFeedback::parse(body).is_err());
    }
}
