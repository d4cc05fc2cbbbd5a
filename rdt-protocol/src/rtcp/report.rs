//! Sender and receiver reports

use super::{read_u32, require, write_packet, RtcpError, PT_RECEIVER_REPORT, PT_SENDER_REPORT};
use bytes::{BufMut, BytesMut};

/// Size of one report block
pub const REPORT_BLOCK_SIZE: usize = 24;

/// Largest cumulative loss representable in 24 signed bits
const MAX_CUMULATIVE_LOST: i32 = 0x7F_FFFF;
const MIN_CUMULATIVE_LOST: i32 = -0x80_0000;

/// Reception report for one source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportBlock {
    /// Source this block reports on
    pub ssrc: u32,
    /// Fraction lost since the previous report, in 1/256
    pub fraction_lost: u8,
    /// Packets lost since the start of reception (24-bit signed on the wire)
    pub cumulative_lost: i32,
    /// Extended highest sequence number received
    pub extended_highest_seq: u32,
    /// Interarrival jitter in timestamp units
    pub jitter: u32,
    /// Middle 32 bits of the last sender report NTP timestamp
    pub last_sr: u32,
    /// Delay since the last sender report, in 1/65536 s
    pub delay_since_last_sr: u32,
}

impl ReportBlock {
    pub fn write(&self, buf: &mut BytesMut) {
        let lost = self
            .cumulative_lost
            .clamp(MIN_CUMULATIVE_LOST, MAX_CUMULATIVE_LOST) as u32
            & 0x00FF_FFFF;
        buf.put_u32(self.ssrc);
        buf.put_u32(u32::from(self.fraction_lost) << 24 | lost);
        buf.put_u32(self.extended_highest_seq);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr);
        buf.put_u32(self.delay_since_last_sr);
    }

    pub fn parse(body: &[u8]) -> Result<Self, RtcpError> {
        require(body, REPORT_BLOCK_SIZE)?;
        let loss_word = read_u32(body, 4);
        // Sign-extend the 24-bit field
        let cumulative_lost = ((loss_word << 8) as i32) >> 8;
        Ok(ReportBlock {
            ssrc: read_u32(body, 0),
            fraction_lost: (loss_word >> 24) as u8,
            cumulative_lost,
            extended_highest_seq: read_u32(body, 8),
            jitter: read_u32(body, 12),
            last_sr: read_u32(body, 16),
            delay_since_last_sr: read_u32(body, 20),
        })
    }
}

fn parse_blocks(count: u8, body: &[u8]) -> Result<Vec<ReportBlock>, RtcpError> {
    require(body, count as usize * REPORT_BLOCK_SIZE)?;
    (0..count as usize)
        .map(|i| ReportBlock::parse(&body[i * REPORT_BLOCK_SIZE..]))
        .collect()
}

/// Receiver report (PT 201)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    pub sender_ssrc: u32,
    pub blocks: Vec<ReportBlock>,
}

impl ReceiverReport {
    pub fn write(&self, buf: &mut BytesMut) {
        let blocks = &self.blocks[..self.blocks.len().min(31)];
        let mut body = BytesMut::with_capacity(4 + blocks.len() * REPORT_BLOCK_SIZE);
        body.put_u32(self.sender_ssrc);
        for block in blocks {
            block.write(&mut body);
        }
        write_packet(blocks.len() as u8, PT_RECEIVER_REPORT, &body, buf);
    }

    pub fn parse(count: u8, body: &[u8]) -> Result<Self, RtcpError> {
        require(body, 4)?;
        Ok(ReceiverReport {
            sender_ssrc: read_u32(body, 0),
            blocks: parse_blocks(count, &body[4..])?,
        })
    }
}

/// Sender report (PT 200)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub sender_ssrc: u32,
    /// 64-bit NTP timestamp
    pub ntp_timestamp: u64,
    /// RTP timestamp corresponding to `ntp_timestamp`
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub blocks: Vec<ReportBlock>,
}

impl SenderReport {
    /// Middle 32 bits of the NTP timestamp, as echoed in `last_sr`
    pub fn compact_ntp(&self) -> u32 {
        (self.ntp_timestamp >> 16) as u32
    }

    pub fn write(&self, buf: &mut BytesMut) {
        let blocks = &self.blocks[..self.blocks.len().min(31)];
        let mut body = BytesMut::with_capacity(24 + blocks.len() * REPORT_BLOCK_SIZE);
        body.put_u32(self.sender_ssrc);
        body.put_u64(self.ntp_timestamp);
        body.put_u32(self.rtp_timestamp);
        body.put_u32(self.packet_count);
        body.put_u32(self.octet_count);
        for block in blocks {
            block.write(&mut body);
        }
        write_packet(blocks.len() as u8, PT_SENDER_REPORT, &body, buf);
    }

    pub fn parse(count: u8, body: &[u8]) -> Result<Self, RtcpError> {
        require(body, 24)?;
        let ntp_timestamp = u64::from(read_u32(body, 4)) << 32 | u64::from(read_u32(body, 8));
        Ok(SenderReport {
            sender_ssrc: read_u32(body, 0),
            ntp_timestamp,
            rtp_timestamp: read_u32(body, 12),
            packet_count: read_u32(body, 16),
            octet_count: read_u32(body, 20),
            blocks: parse_blocks(count, &body[24..])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtcp::RtcpPacket;

    #[test]
    fn test_cumulative_lost_clamped() {
        let block = ReportBlock {
            ssrc: 1,
            cumulative_lost: 50_000_000,
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        block.write(&mut buf);
        assert_eq!(ReportBlock::parse(&buf).unwrap().cumulative_lost, 0x7F_FFFF);

        let block = ReportBlock {
            cumulative_lost: -50_000_000,
            ..block
        };
        let mut buf = BytesMut::new();
        block.write(&mut buf);
        assert_eq!(ReportBlock::parse(&buf).unwrap().cumulative_lost, -0x80_0000);
    }

    #[test]
    fn test_negative_lost_sign_extended() {
        let block = ReportBlock {
            ssrc: 2,
            fraction_lost: 12,
            cumulative_lost: -3,
            extended_highest_seq: 0x1_0005,
            jitter: 40,
            last_sr: 0xAABB_CCDD,
            delay_since_last_sr: 65536,
        };
        let mut buf = BytesMut::new();
        block.write(&mut buf);
        assert_eq!(buf.len(), REPORT_BLOCK_SIZE);
        assert_eq!(ReportBlock::parse(&buf).unwrap(), block);
    }

    #[test]
    fn test_sender_report_with_blocks() {
        let report = SenderReport {
            sender_ssrc: 10,
            ntp_timestamp: 0x0102_0304_0506_0708,
            rtp_timestamp: 90_000,
            packet_count: 3,
            octet_count: 3000,
            blocks: vec![ReportBlock {
                ssrc: 20,
                ..Default::default()
            }],
        };
        assert_eq!(report.compact_ntp(), 0x0304_0506);

        let bytes = RtcpPacket::SenderReport(report.clone()).to_bytes();
        assert_eq!(bytes.len(), 4 + 24 + REPORT_BLOCK_SIZE);
        assert_eq!(
            RtcpPacket::parse_compound(&bytes).unwrap(),
            vec![RtcpPacket::SenderReport(report)]
        );
    }

    #[test]
    fn test_block_count_exceeds_body() {
        let mut body = BytesMut::new();
        body.put_u32(1);
        assert!(matches!(
            ReceiverReport::parse(2, &body),
            Err(RtcpError::Truncated { .. })
        ));
    }
}
