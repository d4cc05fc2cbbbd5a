//! RTP Packet Structures and Serialization
//!
//! This module implements the RTP wire format: a 12-byte fixed header, an optional
//! list of contributing sources, an optional extension block and the payload,
//! optionally followed by padding whose length is given by the final byte.

use crate::sequence::SeqNumber;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::ops::Range;
use thiserror::Error;

/// Size of the fixed RTP header in bytes
pub const HEADER_SIZE: usize = 12;

/// Default maximum payload size (MTU 1200 leaves headroom for tunnels and extensions)
pub const MAX_PAYLOAD_SIZE: usize = 1200;

/// The only RTP version we speak
pub const RTP_VERSION: u8 = 2;

/// Maximum number of contributing sources
pub const MAX_CSRC_COUNT: usize = 15;

/// Profile identifier for one-byte header extensions (RFC 8285)
pub const ONE_BYTE_EXTENSION_PROFILE: u16 = 0xBEDE;

/// Default extension id carrying the transport-wide sequence number
pub const DEFAULT_TRANSPORT_SEQ_EXTENSION_ID: u8 = 5;

/// Header extension block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderExtension {
    /// Profile-defined identifier
    pub profile: u16,
    /// Extension data, a multiple of four bytes
    pub data: Bytes,
}

impl HeaderExtension {
    /// Build a one-byte-header extension block from `(id, value)` elements
    ///
    /// Ids must be in `1..=14` and values `1..=16` bytes long; other elements are skipped.
    pub fn one_byte(elements: &[(u8, &[u8])]) -> Self {
        let mut buf = BytesMut::new();
        for (id, value) in elements {
            if !(1..=14).contains(id) || value.is_empty() || value.len() > 16 {
                tracing::warn!("Skipping invalid one-byte extension element id={}", id);
                continue;
            }
            buf.put_u8((id << 4) | (value.len() as u8 - 1));
            buf.put_slice(value);
        }
        while buf.len() % 4 != 0 {
            buf.put_u8(0);
        }
        HeaderExtension {
            profile: ONE_BYTE_EXTENSION_PROFILE,
            data: buf.freeze(),
        }
    }

    /// Find the value of a one-byte-header extension element
    pub fn find_one_byte(&self, id: u8) -> Option<&[u8]> {
        if self.profile != ONE_BYTE_EXTENSION_PROFILE {
            return None;
        }
        let data = &self.data[..];
        let mut i = 0;
        while i < data.len() {
            let element_id = data[i] >> 4;
            if element_id == 0 {
                // Padding byte
                i += 1;
                continue;
            }
            if element_id == 15 {
                return None;
            }
            let len = (data[i] & 0x0F) as usize + 1;
            let start = i + 1;
            if start + len > data.len() {
                return None;
            }
            if element_id == id {
                return Some(&data[start..start + len]);
            }
            i = start + len;
        }
        None
    }
}

/// RTP fixed header plus CSRC list and extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// Protocol version (always 2 on the wire)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Marker bit: this packet completes the current frame
    pub marker: bool,
    /// Payload type (7 bits)
    pub payload_type: u8,
    /// Sequence number
    pub sequence_number: SeqNumber,
    /// Media timestamp
    pub timestamp: u32,
    /// Stream identifier (SSRC)
    pub ssrc: u32,
    /// Contributing source identifiers
    pub csrcs: Vec<u32>,
    /// Optional extension block
    pub extension: Option<HeaderExtension>,
}

impl RtpHeader {
    /// Create a header with no CSRCs or extension
    pub fn new(payload_type: u8, sequence_number: SeqNumber, timestamp: u32, ssrc: u32) -> Self {
        RtpHeader {
            version: RTP_VERSION,
            padding: false,
            marker: false,
            payload_type: payload_type & 0x7F,
            sequence_number,
            timestamp,
            ssrc,
            csrcs: Vec::new(),
            extension: None,
        }
    }

    /// Whether the extension flag is set
    #[inline]
    pub fn has_extension(&self) -> bool {
        self.extension.is_some()
    }

    /// Serialized size of the header including CSRCs and extension
    pub fn size(&self) -> usize {
        let ext = self
            .extension
            .as_ref()
            .map(|e| 4 + e.data.len())
            .unwrap_or(0);
        HEADER_SIZE + 4 * self.csrcs.len() + ext
    }

    /// Read the transport-wide sequence number from the extension block
    pub fn transport_sequence_number(&self, extension_id: u8) -> Option<SeqNumber> {
        let value = self.extension.as_ref()?.find_one_byte(extension_id)?;
        if value.len() != 2 {
            return None;
        }
        Some(SeqNumber::new(u16::from_be_bytes([value[0], value[1]])))
    }

    /// Parse a header, returning it together with its encoded length
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), PacketError> {
        if bytes.len() < HEADER_SIZE {
            return Err(PacketError::InsufficientData {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let mut buf = bytes;
        let b0 = buf.get_u8();
        let b1 = buf.get_u8();

        let version = b0 >> 6;
        if version != RTP_VERSION {
            return Err(PacketError::BadVersion(version));
        }
        let padding = b0 & 0x20 != 0;
        let has_extension = b0 & 0x10 != 0;
        let csrc_count = (b0 & 0x0F) as usize;
        let marker = b1 & 0x80 != 0;
        let payload_type = b1 & 0x7F;
        let sequence_number = SeqNumber::new(buf.get_u16());
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        let mut offset = HEADER_SIZE;
        if buf.remaining() < 4 * csrc_count {
            return Err(PacketError::InsufficientData {
                expected: offset + 4 * csrc_count,
                actual: bytes.len(),
            });
        }
        let csrcs = (0..csrc_count).map(|_| buf.get_u32()).collect();
        offset += 4 * csrc_count;

        let extension = if has_extension {
            if buf.remaining() < 4 {
                return Err(PacketError::InsufficientData {
                    expected: offset + 4,
                    actual: bytes.len(),
                });
            }
            let profile = buf.get_u16();
            let length = buf.get_u16() as usize * 4;
            if buf.remaining() < length {
                return Err(PacketError::InsufficientData {
                    expected: offset + 4 + length,
                    actual: bytes.len(),
                });
            }
            let data = Bytes::copy_from_slice(&buf[..length]);
            offset += 4 + length;
            Some(HeaderExtension { profile, data })
        } else {
            None
        };

        Ok((
            RtpHeader {
                version,
                padding,
                marker,
                payload_type,
                sequence_number,
                timestamp,
                ssrc,
                csrcs,
                extension,
            },
            offset,
        ))
    }

    /// Serialize header to bytes (network byte order)
    pub fn to_bytes(&self, buf: &mut BytesMut) {
        let csrc_count = self.csrcs.len().min(MAX_CSRC_COUNT);
        let mut b0 = (RTP_VERSION << 6) | csrc_count as u8;
        if self.padding {
            b0 |= 0x20;
        }
        if self.extension.is_some() {
            b0 |= 0x10;
        }
        let mut b1 = self.payload_type & 0x7F;
        if self.marker {
            b1 |= 0x80;
        }
        buf.put_u8(b0);
        buf.put_u8(b1);
        buf.put_u16(self.sequence_number.as_raw());
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in self.csrcs.iter().take(csrc_count) {
            buf.put_u32(*csrc);
        }
        if let Some(ext) = &self.extension {
            buf.put_u16(ext.profile);
            buf.put_u16((ext.data.len() / 4) as u16);
            buf.put_slice(&ext.data[..ext.data.len() / 4 * 4]);
        }
    }
}

/// A complete RTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// Packet header
    pub header: RtpHeader,
    /// Payload data (padding removed)
    pub payload: Bytes,
    /// Number of padding bytes that trail the payload on the wire
    pub padding_len: u8,
}

impl RtpPacket {
    /// Create a new packet without padding
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        RtpPacket {
            header,
            payload,
            padding_len: 0,
        }
    }

    /// Create a padding-only packet of `size` padding bytes
    pub fn padding(mut header: RtpHeader, size: u8) -> Self {
        header.padding = size > 0;
        RtpPacket {
            header,
            payload: Bytes::new(),
            padding_len: size,
        }
    }

    /// Get the sequence number
    #[inline]
    pub fn seq_number(&self) -> SeqNumber {
        self.header.sequence_number
    }

    /// Get the media timestamp
    #[inline]
    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    /// Get the stream id
    #[inline]
    pub fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    /// Whether the marker bit is set
    #[inline]
    pub fn marker(&self) -> bool {
        self.header.marker
    }

    /// Total size of the packet on the wire
    pub fn size(&self) -> usize {
        self.header.size() + self.payload.len() + self.padding_len as usize
    }

    /// Serialize the packet to bytes
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());
        let mut header = self.header.clone();
        header.padding = self.padding_len > 0;
        header.to_bytes(&mut buf);
        buf.put_slice(&self.payload);
        if self.padding_len > 0 {
            buf.put_bytes(0, self.padding_len as usize - 1);
            buf.put_u8(self.padding_len);
        }
        buf
    }

    /// Parse a packet from bytes, copying the payload
    pub fn parse(bytes: &[u8]) -> Result<Self, PacketError> {
        let (header, payload, padding_len) = Self::split(bytes)?;
        Ok(RtpPacket {
            header,
            payload: Bytes::copy_from_slice(&bytes[payload]),
            padding_len,
        })
    }

    /// Parse a packet whose payload is a slice of `bytes`
    pub fn from_bytes(bytes: Bytes) -> Result<Self, PacketError> {
        let (header, payload, padding_len) = Self::split(&bytes)?;
        Ok(RtpPacket {
            header,
            payload: bytes.slice(payload),
            padding_len,
        })
    }

    fn split(bytes: &[u8]) -> Result<(RtpHeader, Range<usize>, u8), PacketError> {
        let (header, offset) = RtpHeader::from_bytes(bytes)?;
        let mut end = bytes.len();

        let padding_len = if header.padding {
            let pad = bytes[bytes.len() - 1];
            if pad == 0 || offset + pad as usize > bytes.len() {
                return Err(PacketError::InvalidPadding(pad));
            }
            end -= pad as usize;
            pad
        } else {
            0
        };
        Ok((header, offset..end, padding_len))
    }
}

/// Check whether a datagram looks like RTCP rather than RTP (RFC 5761 demultiplexing)
pub fn is_rtcp(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && (192..=223).contains(&bytes[1])
}

/// Packet parsing and validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Unsupported RTP version: {0}")]
    BadVersion(u8),

    #[error("Invalid padding length: {0}")]
    InvalidPadding(u8),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> RtpPacket {
        let mut header = RtpHeader::new(96, SeqNumber::new(1000), 90_000, 0xDEAD_BEEF);
        header.marker = true;
        RtpPacket::new(header, Bytes::from_static(b"Hello, RTP!"))
    }

    #[test]
    fn test_packet_serialization() {
        let packet = sample_packet();
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + 11);

        let decoded = RtpPacket::parse(&bytes).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.marker());
        assert_eq!(decoded.header.payload_type, 96);
    }

    #[test]
    fn test_csrc_and_extension() {
        let mut packet = sample_packet();
        packet.header.csrcs = vec![1, 2, 3];
        packet.header.extension = Some(HeaderExtension::one_byte(&[(
            DEFAULT_TRANSPORT_SEQ_EXTENSION_ID,
            &1234u16.to_be_bytes(),
        )]));

        let bytes = packet.to_bytes();
        let decoded = RtpPacket::parse(&bytes).unwrap();

        assert_eq!(decoded.header.csrcs, vec![1, 2, 3]);
        assert_eq!(
            decoded
                .header
                .transport_sequence_number(DEFAULT_TRANSPORT_SEQ_EXTENSION_ID),
            Some(SeqNumber::new(1234))
        );
        assert_eq!(decoded.payload, packet.payload);
    }

    #[test]
    fn test_padding_roundtrip() {
        let header = RtpHeader::new(96, SeqNumber::new(7), 0, 1);
        let packet = RtpPacket::padding(header, 200);
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + 200);

        let decoded = RtpPacket::parse(&bytes).unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.padding_len, 200);
    }

    #[test]
    fn test_from_bytes_shares_buffer() {
        let packet = sample_packet();
        let wire = packet.to_bytes().freeze();

        let decoded = RtpPacket::from_bytes(wire.clone()).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.payload.as_ptr(), wire[HEADER_SIZE..].as_ptr());

        let padded = RtpPacket::padding(RtpHeader::new(96, SeqNumber::new(8), 0, 1), 40);
        let decoded = RtpPacket::from_bytes(padded.to_bytes().freeze()).unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.padding_len, 40);
    }

    #[test]
    fn test_short_buffer() {
        let err = RtpPacket::parse(&[0x80, 96, 0, 1]).unwrap_err();
        assert!(matches!(err, PacketError::InsufficientData { .. }));
    }

    #[test]
    fn test_bad_version() {
        let mut bytes = sample_packet().to_bytes();
        bytes[0] = (1 << 6) | (bytes[0] & 0x3F);
        assert_eq!(RtpPacket::parse(&bytes).unwrap_err(), PacketError::BadVersion(1));
    }

    #[test]
    fn test_zero_padding_rejected() {
        let mut bytes = sample_packet().to_bytes();
        bytes[0] |= 0x20;
        let last = bytes.len() - 1;
        bytes[last] = 0;
        assert_eq!(
            RtpPacket::parse(&bytes).unwrap_err(),
            PacketError::InvalidPadding(0)
        );
    }

    #[test]
    fn test_csrc_overrun() {
        let mut bytes = sample_packet().to_bytes();
        bytes[0] |= 0x0F; // claims 15 CSRCs
        assert!(matches!(
            RtpPacket::parse(&bytes).unwrap_err(),
            PacketError::InsufficientData { .. }
        ));
    }

    #[test]
    fn test_is_rtcp() {
        assert!(is_rtcp(&[0x80, 201, 0, 1]));
        assert!(!is_rtcp(&sample_packet().to_bytes()));
    }
}
