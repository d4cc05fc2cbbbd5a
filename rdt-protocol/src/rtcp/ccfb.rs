//! Congestion control feedback (RFC 8888, transport-layer feedback FMT 11)
//!
//! One block per media stream, each listing consecutive sequence numbers from
//! `begin_seq`. Every 16-bit report is `R(1) | ECN(2) | ATO(13)` where ATO is
//! the arrival time offset before the report timestamp in 1/1024 s. The packet
//! ends with the report timestamp in compact NTP format (16.16 seconds).

use super::{read_u16, read_u32, require, write_packet, RtcpError, FMT_CONGESTION_FEEDBACK,
    PT_TRANSPORT_FEEDBACK};
use crate::sequence::SeqNumber;
use bytes::{BufMut, BytesMut};
use std::time::Duration;

/// Arrival offset value meaning "too old to represent"
pub const ATO_UNAVAILABLE: u16 = 0x1FFF;

/// Largest representable arrival offset
pub const ATO_MAX: u16 = 0x1FFE;

/// Per-packet report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CcfbReport {
    pub received: bool,
    /// ECN codepoint (2 bits)
    pub ecn: u8,
    /// Arrival time offset in 1/1024 s
    pub arrival_offset: u16,
}

impl CcfbReport {
    /// Report for a packet that arrived `offset` before the report timestamp
    pub fn received(offset: Duration, ecn: u8) -> Self {
        let units = offset.as_micros() * 1024 / 1_000_000;
        CcfbReport {
            received: true,
            ecn: ecn & 0b11,
            arrival_offset: units.min(u128::from(ATO_MAX)) as u16,
        }
    }

    /// Arrival offset, if it is representable
    pub fn offset(&self) -> Option<Duration> {
        if !self.received || self.arrival_offset == ATO_UNAVAILABLE {
            return None;
        }
        Some(Duration::from_micros(
            u64::from(self.arrival_offset) * 1_000_000 / 1024,
        ))
    }

    fn to_word(self) -> u16 {
        if !self.received {
            return 0;
        }
        0x8000 | u16::from(self.ecn & 0b11) << 13 | (self.arrival_offset & 0x1FFF)
    }

    fn from_word(word: u16) -> Self {
        CcfbReport {
            received: word & 0x8000 != 0,
            ecn: ((word >> 13) & 0b11) as u8,
            arrival_offset: word & 0x1FFF,
        }
    }
}

/// Reports for one media stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcfbStreamBlock {
    pub media_ssrc: u32,
    pub begin_seq: SeqNumber,
    pub reports: Vec<CcfbReport>,
}

/// RFC 8888 feedback packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CongestionControlFeedback {
    pub sender_ssrc: u32,
    pub blocks: Vec<CcfbStreamBlock>,
    /// Compact NTP time the report was generated
    pub report_timestamp: u32,
}

impl CongestionControlFeedback {
    /// Convert a compact NTP value to µs
    pub fn compact_ntp_to_us(value: u32) -> i64 {
        (i64::from(value) * 1_000_000) >> 16
    }

    /// Convert a duration to compact NTP (wraps every 65536 s)
    pub fn duration_to_compact_ntp(elapsed: Duration) -> u32 {
        let seconds = (elapsed.as_secs() & 0xFFFF) as u32;
        let fraction = (u64::from(elapsed.subsec_micros()) * 65536 / 1_000_000) as u32;
        seconds << 16 | fraction
    }

    pub fn write(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::with_capacity(
            8 + self.blocks.iter().map(|b| 8 + b.reports.len() * 2 + 2).sum::<usize>(),
        );
        body.put_u32(self.sender_ssrc);
        for block in &self.blocks {
            body.put_u32(block.media_ssrc);
            body.put_u16(block.begin_seq.as_raw());
            body.put_u16(block.reports.len() as u16);
            for report in &block.reports {
                body.put_u16(report.to_word());
            }
            if block.reports.len() % 2 == 1 {
                body.put_u16(0);
            }
        }
        body.put_u32(self.report_timestamp);
        write_packet(FMT_CONGESTION_FEEDBACK, PT_TRANSPORT_FEEDBACK, &body, buf);
    }

    pub fn parse(body: &[u8]) -> Result<Self, RtcpError> {
        require(body, 8)?;
        let end = body.len() - 4;
        let mut blocks = Vec::new();
        let mut offset = 4;

        while offset < end {
            if offset + 8 > end {
                return Err(RtcpError::Malformed("congestion feedback block"));
            }
            let media_ssrc = read_u32(body, offset);
            let begin_seq = SeqNumber::new(read_u16(body, offset + 4));
            let count = read_u16(body, offset + 6) as usize;
            offset += 8;

            let padded = count.div_ceil(2) * 4;
            if offset + padded > end {
                return Err(RtcpError::Malformed("congestion feedback reports"));
            }
            let reports = (0..count)
                .map(|i| CcfbReport::from_word(read_u16(body, offset + i * 2)))
                .collect();
            offset += padded;

            blocks.push(CcfbStreamBlock {
                media_ssrc,
                begin_seq,
                reports,
            });
        }

        Ok(CongestionControlFeedback {
            sender_ssrc: read_u32(body, 0),
            blocks,
            report_timestamp: read_u32(body, end),
        })
    }

    /// Arrival times in µs in the report timestamp's clock, per packet
    pub fn arrival_times_us(&self) -> Vec<(u32, SeqNumber, Option<i64>)> {
        let report_us = Self::compact_ntp_to_us(self.report_timestamp);
        self.blocks
            .iter()
            .flat_map(|block| {
                block.reports.iter().enumerate().map(move |(i, report)| {
                    let at = report
                        .offset()
                        .map(|offset| report_us - offset.as_micros() as i64);
                    (block.media_ssrc, block.begin_seq + i as u16, at)
                })
            })
            .collect()
    }
}
