//! RTCP feedback channel
//!
//! Control packets share a 4-byte common header:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P| cnt/fmt |      PT       |             length            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `length` counts 32-bit words minus one. Several packets may be stacked in one
//! datagram (a compound packet).

pub mod ccfb;
pub mod feedback_generator;
pub mod keyframe;
pub mod nack;
pub mod report;
pub mod rtt;
pub mod statistics;
pub mod transport_cc;

pub use ccfb::{CcfbReport, CcfbStreamBlock, CongestionControlFeedback};
pub use feedback_generator::{FeedbackConfig, FeedbackFormat, FeedbackGenerator};
pub use keyframe::{Fir, Pli};
pub use nack::GenericNack;
pub use report::{ReceiverReport, ReportBlock, SenderReport};
pub use rtt::RttEstimator;
pub use statistics::ReceiveStatistics;
pub use transport_cc::{PacketStatus, TransportFeedback};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Common header size
pub const RTCP_HEADER_SIZE: usize = 4;

/// Sender report
pub const PT_SENDER_REPORT: u8 = 200;
/// Receiver report
pub const PT_RECEIVER_REPORT: u8 = 201;
/// Transport-layer feedback
pub const PT_TRANSPORT_FEEDBACK: u8 = 205;
/// Payload-specific feedback
pub const PT_PAYLOAD_FEEDBACK: u8 = 206;

/// Transport-layer feedback: generic NACK
pub const FMT_GENERIC_NACK: u8 = 1;
/// Transport-layer feedback: congestion control feedback
pub const FMT_CONGESTION_FEEDBACK: u8 = 11;
/// Transport-layer feedback: transport-wide feedback
pub const FMT_TRANSPORT_WIDE: u8 = 15;
/// Payload-specific feedback: picture loss indication
pub const FMT_PLI: u8 = 1;
/// Payload-specific feedback: full intra request
pub const FMT_FIR: u8 = 4;

const RTCP_VERSION: u8 = 2;

/// RTCP parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RtcpError {
    #[error("Truncated RTCP packet: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Unsupported RTCP version: {0}")]
    BadVersion(u8),

    #[error("Invalid RTCP padding length: {0}")]
    InvalidPadding(u8),

    #[error("Malformed {0}")]
    Malformed(&'static str),
}

/// Parsed common header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpHeader {
    /// Padding flag
    pub padding: bool,
    /// Report count or feedback message type
    pub count: u8,
    /// Packet type
    pub packet_type: u8,
    /// Length in 32-bit words minus one
    pub length: u16,
}

impl RtcpHeader {
    /// Header for a body of `body_len` bytes (must be a multiple of 4)
    pub fn new(count: u8, packet_type: u8, body_len: usize) -> Self {
        RtcpHeader {
            padding: false,
            count: count & 0x1F,
            packet_type,
            length: (body_len / 4) as u16,
        }
    }

    /// Total packet size including this header
    pub fn packet_size(&self) -> usize {
        (self.length as usize + 1) * 4
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, RtcpError> {
        if bytes.len() < RTCP_HEADER_SIZE {
            return Err(RtcpError::Truncated {
                expected: RTCP_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let version = bytes[0] >> 6;
        if version != RTCP_VERSION {
            return Err(RtcpError::BadVersion(version));
        }
        Ok(RtcpHeader {
            padding: bytes[0] & 0x20 != 0,
            count: bytes[0] & 0x1F,
            packet_type: bytes[1],
            length: u16::from_be_bytes([bytes[2], bytes[3]]),
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        let mut first = RTCP_VERSION << 6 | (self.count & 0x1F);
        if self.padding {
            first |= 0x20;
        }
        buf.put_u8(first);
        buf.put_u8(self.packet_type);
        buf.put_u16(self.length);
    }
}

/// Write a packet with the given header fields around `body`, zero-padding the
/// body to a word boundary
pub(crate) fn write_packet(count: u8, packet_type: u8, body: &[u8], buf: &mut BytesMut) {
    let padded = body.len().div_ceil(4) * 4;
    RtcpHeader::new(count, packet_type, padded).write(buf);
    buf.put_slice(body);
    buf.put_bytes(0, padded - body.len());
}

/// Ensure `body` holds at least `needed` bytes
pub(crate) fn require(body: &[u8], needed: usize) -> Result<(), RtcpError> {
    if body.len() < needed {
        return Err(RtcpError::Truncated {
            expected: needed,
            actual: body.len(),
        });
    }
    Ok(())
}

pub(crate) fn read_u32(body: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        body[offset],
        body[offset + 1],
        body[offset + 2],
        body[offset + 3],
    ])
}

pub(crate) fn read_u16(body: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([body[offset], body[offset + 1]])
}

/// A parsed RTCP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    Nack(GenericNack),
    TransportFeedback(TransportFeedback),
    CongestionFeedback(CongestionControlFeedback),
    Pli(Pli),
    Fir(Fir),
}

impl RtcpPacket {
    /// Append the wire form to `buf`
    pub fn write(&self, buf: &mut BytesMut) {
        match self {
            RtcpPacket::SenderReport(p) => p.write(buf),
            RtcpPacket::ReceiverReport(p) => p.write(buf),
            RtcpPacket::Nack(p) => p.write(buf),
            RtcpPacket::TransportFeedback(p) => p.write(buf),
            RtcpPacket::CongestionFeedback(p) => p.write(buf),
            RtcpPacket::Pli(p) => p.write(buf),
            RtcpPacket::Fir(p) => p.write(buf),
        }
    }

    /// Serialize a single packet
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        self.write(&mut buf);
        buf.freeze()
    }

    /// Serialize several packets into one compound datagram
    pub fn compound_to_bytes(packets: &[RtcpPacket]) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 * packets.len());
        for packet in packets {
            packet.write(&mut buf);
        }
        buf.freeze()
    }

    /// Parse a compound datagram
    ///
    /// Packet types this channel does not use are skipped. A packet shorter than
    /// its declared length or with a zero padding count fails the whole datagram.
    pub fn parse_compound(bytes: &[u8]) -> Result<Vec<RtcpPacket>, RtcpError> {
        let mut packets = Vec::new();
        let mut offset = 0;

        while offset < bytes.len() {
            let header = RtcpHeader::parse(&bytes[offset..])?;
            let size = header.packet_size();
            if offset + size > bytes.len() {
                return Err(RtcpError::Truncated {
                    expected: size,
                    actual: bytes.len() - offset,
                });
            }

            let mut body = &bytes[offset + RTCP_HEADER_SIZE..offset + size];
            if header.padding {
                let pad = body.last().copied().unwrap_or(0);
                if pad == 0 || pad as usize > body.len() {
                    return Err(RtcpError::InvalidPadding(pad));
                }
                body = &body[..body.len() - pad as usize];
            }

            if let Some(packet) = Self::parse_body(&header, body)? {
                packets.push(packet);
            }
            offset += size;
        }

        Ok(packets)
    }

    fn parse_body(header: &RtcpHeader, body: &[u8]) -> Result<Option<RtcpPacket>, RtcpError> {
        let packet = match (header.packet_type, header.count) {
            (PT_SENDER_REPORT, count) => {
                RtcpPacket::SenderReport(SenderReport::parse(count, body)?)
            }
            (PT_RECEIVER_REPORT, count) => {
                RtcpPacket::ReceiverReport(ReceiverReport::parse(count, body)?)
            }
            (PT_TRANSPORT_FEEDBACK, FMT_GENERIC_NACK) => {
                RtcpPacket::Nack(GenericNack::parse(body)?)
            }
            (PT_TRANSPORT_FEEDBACK, FMT_TRANSPORT_WIDE) => {
                RtcpPacket::TransportFeedback(TransportFeedback::parse(body)?)
            }
            (PT_TRANSPORT_FEEDBACK, FMT_CONGESTION_FEEDBACK) => {
                RtcpPacket::CongestionFeedback(CongestionControlFeedback::parse(body)?)
            }
            (PT_PAYLOAD_FEEDBACK, FMT_PLI) => RtcpPacket::Pli(Pli::parse(body)?),
            (PT_PAYLOAD_FEEDBACK, FMT_FIR) => RtcpPacket::Fir(Fir::parse(body)?),
            (packet_type, count) => {
                tracing::trace!("Skipping RTCP packet type {} fmt {}", packet_type, count);
                return Ok(None);
            }
        };
        Ok(Some(packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::SeqNumber;

    #[test]
    fn test_header_roundtrip() {
        let header = RtcpHeader::new(FMT_PLI, PT_PAYLOAD_FEEDBACK, 8);
        let mut buf = BytesMut::new();
        header.write(&mut buf);
        assert_eq!(&buf[..], &[0x81, 206, 0, 2]);
        assert_eq!(RtcpHeader::parse(&buf).unwrap(), header);
        assert_eq!(header.packet_size(), 12);
    }

    #[test]
    fn test_compound_parse() {
        let packets = vec![
            RtcpPacket::ReceiverReport(ReceiverReport {
                sender_ssrc: 1,
                blocks: vec![],
            }),
            RtcpPacket::Pli(Pli {
                sender_ssrc: 1,
                media_ssrc: 2,
            }),
            RtcpPacket::Nack(GenericNack {
                sender_ssrc: 1,
                media_ssrc: 2,
                lost: vec![SeqNumber::new(7)],
            }),
        ];
        let bytes = RtcpPacket::compound_to_bytes(&packets);
        assert_eq!(RtcpPacket::parse_compound(&bytes).unwrap(), packets);
    }

    #[test]
    fn test_short_packet_rejected() {
        let bytes = Pli {
            sender_ssrc: 1,
            media_ssrc: 2,
        };
        let bytes = RtcpPacket::Pli(bytes).to_bytes();
        let result = RtcpPacket::parse_compound(&bytes[..bytes.len() - 2]);
        assert!(matches!(result, Err(RtcpError::Truncated { .. })));
    }

    #[test]
    fn test_zero_padding_rejected() {
        let mut bytes = BytesMut::new();
        bytes.put_slice(&[0x80 | 0x20 | FMT_PLI, PT_PAYLOAD_FEEDBACK, 0, 2]);
        bytes.put_u32(1);
        bytes.put_u32(0);
        assert_eq!(
            RtcpPacket::parse_compound(&bytes),
            Err(RtcpError::InvalidPadding(0))
        );
    }

    #[test]
    fn test_valid_padding_stripped() {
        let mut bytes = BytesMut::new();
        bytes.put_slice(&[0x80 | 0x20, PT_RECEIVER_REPORT, 0, 2]);
        bytes.put_u32(9);
        bytes.put_slice(&[0, 0, 0, 4]);
        let packets = RtcpPacket::parse_compound(&bytes).unwrap();
        assert_eq!(
            packets,
            vec![RtcpPacket::ReceiverReport(ReceiverReport {
                sender_ssrc: 9,
                blocks: vec![],
            })]
        );
    }

    #[test]
    fn test_unknown_type_skipped() {
        let mut bytes = BytesMut::new();
        bytes.put_slice(&[0x81, 203, 0, 1]);
        bytes.put_u32(5);
        let pli = RtcpPacket::Pli(Pli {
            sender_ssrc: 3,
            media_ssrc: 4,
        });
        pli.write(&mut bytes);

        assert_eq!(RtcpPacket::parse_compound(&bytes).unwrap(), vec![pli]);
    }

    #[test]
    fn test_bad_version() {
        assert_eq!(
            RtcpPacket::parse_compound(&[0x40, 201, 0, 0]),
            Err(RtcpError::BadVersion(1))
        );
    }
}
