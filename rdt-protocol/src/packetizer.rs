//! Packetization of encoded access units into RTP packets
//!
//! Three payload formats are supported:
//! - `Generic`: a one-byte descriptor (start / end / keyframe bits) in front of
//!   each fragment. Large units are split into evenly sized fragments.
//! - `Av1`: the AV1 RTP aggregation header; OBUs are split and aggregated into
//!   packets as elements.
//! - `Raw`: the unit is sent unchanged in a single packet (audio, control events).

use crate::obu::{leb128_size, parse_obus, write_leb128, ObuError};
use crate::packet::{PacketError, RtpHeader, RtpPacket};
use crate::sequence::SeqNumber;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Generic descriptor bit: first fragment of a unit
pub const GENERIC_START_BIT: u8 = 0x80;
/// Generic descriptor bit: last fragment of a unit
pub const GENERIC_END_BIT: u8 = 0x40;
/// Generic descriptor bit: unit is a keyframe
pub const GENERIC_KEYFRAME_BIT: u8 = 0x20;

/// AV1 aggregation header: first element continues an OBU from the previous packet
pub const AV1_Z_BIT: u8 = 0x80;
/// AV1 aggregation header: last element continues in the next packet
pub const AV1_Y_BIT: u8 = 0x40;
/// AV1 aggregation header: packet starts a new coded video sequence
pub const AV1_N_BIT: u8 = 0x08;
/// AV1 aggregation header: element count field shift
const AV1_W_SHIFT: u8 = 4;

/// Payload format carried by a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// One descriptor byte per packet with explicit start / end bits
    Generic,
    /// AV1 aggregation header
    Av1,
    /// Whole unit in a single packet
    Raw,
}

/// Decoded AV1 aggregation header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggregationHeader {
    /// First element continues an OBU fragment
    pub continues_previous: bool,
    /// Last element is continued in the next packet
    pub continues_next: bool,
    /// Number of elements (0 = every element is length-prefixed)
    pub element_count: u8,
    /// New coded video sequence starts in this packet
    pub new_sequence: bool,
}

impl AggregationHeader {
    /// Parse from the first payload byte
    pub fn from_byte(byte: u8) -> Self {
        AggregationHeader {
            continues_previous: byte & AV1_Z_BIT != 0,
            continues_next: byte & AV1_Y_BIT != 0,
            element_count: (byte >> AV1_W_SHIFT) & 0b11,
            new_sequence: byte & AV1_N_BIT != 0,
        }
    }

    /// Encode into a byte
    pub fn to_byte(self) -> u8 {
        let mut byte = (self.element_count & 0b11) << AV1_W_SHIFT;
        if self.continues_previous {
            byte |= AV1_Z_BIT;
        }
        if self.continues_next {
            byte |= AV1_Y_BIT;
        }
        if self.new_sequence {
            byte |= AV1_N_BIT;
        }
        byte
    }
}

/// Packetization errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketizeError {
    #[error("Cannot packetize an empty unit")]
    EmptyUnit,

    #[error("Payload budget {0} too small to carry any data")]
    BudgetTooSmall(usize),

    #[error("Malformed AV1 unit: {0}")]
    Obu(#[from] ObuError),

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),
}

/// Per-stream packetizer
///
/// Owns the stream's sequence number counter, so sequence numbers stay
/// contiguous across units and padding packets.
#[derive(Debug, Clone)]
pub struct Packetizer {
    ssrc: u32,
    payload_type: u8,
    format: PayloadFormat,
    max_payload_len: usize,
    next_seq: SeqNumber,
}

impl Packetizer {
    /// Create a new packetizer
    pub fn new(
        ssrc: u32,
        payload_type: u8,
        format: PayloadFormat,
        max_payload_len: usize,
        initial_seq: SeqNumber,
    ) -> Self {
        Packetizer {
            ssrc,
            payload_type,
            format,
            max_payload_len,
            next_seq: initial_seq,
        }
    }

    /// Stream id of the packets produced
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Payload format of the stream
    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    /// Sequence number the next packet will use
    pub fn next_sequence_number(&self) -> SeqNumber {
        self.next_seq
    }

    /// Split one encoded unit into packets sharing `timestamp`
    pub fn packetize(
        &mut self,
        unit: &Bytes,
        timestamp: u32,
        keyframe: bool,
    ) -> Result<Vec<RtpPacket>, PacketizeError> {
        if unit.is_empty() {
            return Err(PacketizeError::EmptyUnit);
        }

        let payloads = match self.format {
            PayloadFormat::Generic => self.generic_payloads(unit, keyframe)?,
            PayloadFormat::Av1 => self.av1_payloads(unit, keyframe)?,
            PayloadFormat::Raw => {
                if unit.len() > self.max_payload_len {
                    return Err(PacketError::PayloadTooLarge {
                        size: unit.len(),
                        max: self.max_payload_len,
                    }
                    .into());
                }
                vec![unit.clone()]
            }
        };

        let count = payloads.len();
        let packets = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                let mut header = self.next_header(timestamp);
                header.marker = i + 1 == count;
                RtpPacket::new(header, payload)
            })
            .collect::<Vec<_>>();

        tracing::trace!(
            "Packetized {} bytes into {} packets (ssrc={}, ts={})",
            unit.len(),
            count,
            self.ssrc,
            timestamp
        );
        Ok(packets)
    }

    /// Build a padding-only packet consuming a sequence number
    pub fn padding_packet(&mut self, size: u8, timestamp: u32) -> RtpPacket {
        let header = self.next_header(timestamp);
        RtpPacket::padding(header, size.max(1))
    }

    fn next_header(&mut self, timestamp: u32) -> RtpHeader {
        let seq = self.next_seq;
        self.next_seq.increment();
        RtpHeader::new(self.payload_type, seq, timestamp, self.ssrc)
    }

    fn generic_payloads(&self, unit: &Bytes, keyframe: bool) -> Result<Vec<Bytes>, PacketizeError> {
        let capacity = self.max_payload_len.saturating_sub(1);
        if capacity == 0 {
            return Err(PacketizeError::BudgetTooSmall(self.max_payload_len));
        }

        let count = unit.len().div_ceil(capacity);
        let base = unit.len() / count;
        let extra = unit.len() % count;

        let mut payloads = Vec::with_capacity(count);
        let mut offset = 0;
        for i in 0..count {
            // The first `extra` fragments carry one additional byte
            let len = base + usize::from(i < extra);
            let mut descriptor = 0u8;
            if i == 0 {
                descriptor |= GENERIC_START_BIT;
            }
            if i + 1 == count {
                descriptor |= GENERIC_END_BIT;
            }
            if keyframe {
                descriptor |= GENERIC_KEYFRAME_BIT;
            }
            let mut buf = BytesMut::with_capacity(len + 1);
            buf.put_u8(descriptor);
            buf.put_slice(&unit[offset..offset + len]);
            payloads.push(buf.freeze());
            offset += len;
        }
        Ok(payloads)
    }

    fn av1_payloads(&self, unit: &Bytes, keyframe: bool) -> Result<Vec<Bytes>, PacketizeError> {
        let capacity = self.max_payload_len.saturating_sub(1);
        if capacity < 2 {
            return Err(PacketizeError::BudgetTooSmall(self.max_payload_len));
        }

        let elements: Vec<Bytes> = parse_obus(unit)?
            .into_iter()
            .filter(|obu| !obu.is_dropped_on_wire())
            .map(|obu| {
                let mut buf = obu.header_bytes_without_size();
                buf.put_slice(&obu.payload);
                buf.freeze()
            })
            .collect();
        if elements.is_empty() {
            return Err(PacketizeError::EmptyUnit);
        }

        let mut packets: Vec<Av1PacketPlan> = Vec::new();
        let mut current = Av1PacketPlan::default();

        for element in &elements {
            let mut offset = 0;
            while offset < element.len() {
                let available = capacity - current.used;
                let take_max = available.saturating_sub(leb128_size(available as u64));
                if take_max == 0 {
                    packets.push(std::mem::take(&mut current));
                    continue;
                }
                let take = take_max.min(element.len() - offset);
                if current.pieces.is_empty() {
                    current.continues_previous = offset > 0;
                }
                current.pieces.push(element.slice(offset..offset + take));
                current.used += take + leb128_size(take as u64);
                offset += take;
                if offset < element.len() {
                    current.continues_next = true;
                    packets.push(std::mem::take(&mut current));
                }
            }
        }
        if !current.pieces.is_empty() {
            packets.push(current);
        }

        Ok(packets
            .into_iter()
            .enumerate()
            .map(|(i, plan)| plan.serialize(keyframe && i == 0))
            .collect())
    }
}

#[derive(Debug, Default)]
struct Av1PacketPlan {
    pieces: Vec<Bytes>,
    used: usize,
    continues_previous: bool,
    continues_next: bool,
}

impl Av1PacketPlan {
    fn serialize(self, new_sequence: bool) -> Bytes {
        let count = self.pieces.len();
        let element_count = if count <= 3 { count as u8 } else { 0 };
        let header = AggregationHeader {
            continues_previous: self.continues_previous,
            continues_next: self.continues_next,
            element_count,
            new_sequence,
        };

        let mut buf = BytesMut::with_capacity(self.used + 1);
        buf.put_u8(header.to_byte());
        for (i, piece) in self.pieces.iter().enumerate() {
            let last = i + 1 == count;
            // With an explicit count the last element carries no length field
            if !(last && element_count > 0) {
                write_leb128(piece.len() as u64, &mut buf);
            }
            buf.put_slice(piece);
        }
        buf.freeze()
    }
}

/// Split an AV1 RTP payload into its elements
///
/// Returns the aggregation header and the element byte slices.
pub fn split_av1_payload(payload: &Bytes) -> Result<(AggregationHeader, Vec<Bytes>), ObuError> {
    let Some(&first) = payload.first() else {
        return Err(ObuError::Truncated(0));
    };
    let header = AggregationHeader::from_byte(first);
    let mut elements = Vec::new();
    let mut offset = 1;

    while offset < payload.len() {
        let is_last_counted =
            header.element_count > 0 && elements.len() + 1 == header.element_count as usize;
        let len = if is_last_counted {
            payload.len() - offset
        } else {
            let (len, used) = crate::obu::read_leb128(&payload[offset..])?;
            offset += used;
            let remaining = payload.len() - offset;
            if len > remaining as u64 {
                return Err(ObuError::SizeOverrun {
                    declared: len as usize,
                    remaining,
                });
            }
            len as usize
        };
        elements.push(payload.slice(offset..offset + len));
        offset += len;
    }

    Ok((header, elements))
}
