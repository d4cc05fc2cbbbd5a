//! AV1 OBU (Open Bitstream Unit) splitting
//!
//! An AV1 temporal unit is a sequence of OBUs. Each OBU starts with a one-byte
//! header, optionally followed by an extension byte and a LEB128 size field. An
//! OBU without a size field extends to the end of the enclosing buffer.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// OBU header bit: an extension byte follows the header
pub const OBU_EXTENSION_FLAG: u8 = 0b0000_0100;

/// OBU header bit: a LEB128 size field follows the header(s)
pub const OBU_HAS_SIZE_FLAG: u8 = 0b0000_0010;

/// Forbidden bit, must be zero
const OBU_FORBIDDEN_BIT: u8 = 0b1000_0000;

/// Maximum number of bytes in a LEB128 value we accept
const MAX_LEB128_BYTES: usize = 8;

/// OBU types the transport treats specially
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObuType {
    SequenceHeader = 1,
    TemporalDelimiter = 2,
    FrameHeader = 3,
    TileGroup = 4,
    Metadata = 5,
    Frame = 6,
    RedundantFrameHeader = 7,
    TileList = 8,
    Padding = 15,
}

impl ObuType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ObuType::SequenceHeader),
            2 => Some(ObuType::TemporalDelimiter),
            3 => Some(ObuType::FrameHeader),
            4 => Some(ObuType::TileGroup),
            5 => Some(ObuType::Metadata),
            6 => Some(ObuType::Frame),
            7 => Some(ObuType::RedundantFrameHeader),
            8 => Some(ObuType::TileList),
            15 => Some(ObuType::Padding),
            _ => None,
        }
    }
}

/// One parsed OBU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Obu {
    /// OBU header byte (size flag as found in the source)
    pub header: u8,
    /// Optional extension byte
    pub extension: Option<u8>,
    /// Payload without header, extension or size field
    pub payload: Bytes,
    /// Number of bytes this OBU occupied in the source buffer
    pub encoded_len: usize,
}

impl Obu {
    /// Raw 4-bit OBU type
    #[inline]
    pub fn type_raw(&self) -> u8 {
        (self.header >> 3) & 0x0F
    }

    /// Decoded OBU type, if known
    pub fn obu_type(&self) -> Option<ObuType> {
        ObuType::from_u8(self.type_raw())
    }

    /// Whether the RTP packetizer should drop this OBU
    pub fn is_dropped_on_wire(&self) -> bool {
        matches!(
            self.obu_type(),
            Some(ObuType::TemporalDelimiter) | Some(ObuType::TileList) | Some(ObuType::Padding)
        )
    }

    /// Header (and extension) bytes with the size flag cleared
    pub fn header_bytes_without_size(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(2);
        buf.put_u8(self.header & !OBU_HAS_SIZE_FLAG);
        if let Some(ext) = self.extension {
            buf.put_u8(ext);
        }
        buf
    }

    /// Length of the OBU as sent in an RTP element (no size field)
    pub fn element_len(&self) -> usize {
        1 + usize::from(self.extension.is_some()) + self.payload.len()
    }

    /// Serialize the OBU, optionally with a size field
    pub fn to_bytes(&self, with_size: bool) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.element_len() + MAX_LEB128_BYTES);
        let mut header = self.header & !OBU_HAS_SIZE_FLAG;
        if with_size {
            header |= OBU_HAS_SIZE_FLAG;
        }
        buf.put_u8(header);
        if let Some(ext) = self.extension {
            buf.put_u8(ext);
        }
        if with_size {
            write_leb128(self.payload.len() as u64, &mut buf);
        }
        buf.put_slice(&self.payload);
        buf
    }
}

/// OBU parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObuError {
    #[error("OBU forbidden bit set at offset {0}")]
    ForbiddenBit(usize),

    #[error("Truncated OBU at offset {0}")]
    Truncated(usize),

    #[error("Invalid LEB128 value")]
    InvalidLeb128,

    #[error("OBU size {declared} exceeds remaining {remaining} bytes")]
    SizeOverrun { declared: usize, remaining: usize },
}

/// Read a LEB128 value, returning it and the number of bytes consumed
pub fn read_leb128(data: &[u8]) -> Result<(u64, usize), ObuError> {
    let mut value = 0u64;
    for (i, byte) in data.iter().take(MAX_LEB128_BYTES).enumerate() {
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(ObuError::InvalidLeb128)
}

/// Append a LEB128 encoding of `value`
pub fn write_leb128(mut value: u64, buf: &mut BytesMut) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Number of bytes needed to LEB128-encode `value`
pub fn leb128_size(mut value: u64) -> usize {
    let mut size = 1;
    while value >= 0x80 {
        value >>= 7;
        size += 1;
    }
    size
}

/// Split an encoded temporal unit into OBUs
pub fn parse_obus(data: &Bytes) -> Result<Vec<Obu>, ObuError> {
    let mut obus = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let start = offset;
        let header = data[offset];
        if header & OBU_FORBIDDEN_BIT != 0 {
            return Err(ObuError::ForbiddenBit(offset));
        }
        offset += 1;

        let extension = if header & OBU_EXTENSION_FLAG != 0 {
            let ext = *data.get(offset).ok_or(ObuError::Truncated(start))?;
            offset += 1;
            Some(ext)
        } else {
            None
        };

        let payload_len = if header & OBU_HAS_SIZE_FLAG != 0 {
            let (size, used) = read_leb128(&data[offset..])?;
            offset += used;
            let remaining = data.len() - offset;
            if size > remaining as u64 {
                return Err(ObuError::SizeOverrun {
                    declared: size as usize,
                    remaining,
                });
            }
            size as usize
        } else {
            data.len() - offset
        };

        let payload = data.slice(offset..offset + payload_len);
        offset += payload_len;

        obus.push(Obu {
            header,
            extension,
            payload,
            encoded_len: offset - start,
        });
    }

    Ok(obus)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obu_header(obu_type: ObuType, has_size: bool, has_ext: bool) -> u8 {
        let mut header = (obu_type as u8) << 3;
        if has_size {
            header |= OBU_HAS_SIZE_FLAG;
        }
        if has_ext {
            header |= OBU_EXTENSION_FLAG;
        }
        header
    }

    #[test]
    fn test_leb128() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, 1 << 30] {
            let mut buf = BytesMut::new();
            write_leb128(value, &mut buf);
            assert_eq!(buf.len(), leb128_size(value));
            assert_eq!(read_leb128(&buf).unwrap(), (value, buf.len()));
        }
        assert_eq!(read_leb128(&[0x80, 0x80]), Err(ObuError::InvalidLeb128));
    }

    #[test]
    fn test_parse_sized_obus() {
        let mut buf = BytesMut::new();
        buf.put_u8(obu_header(ObuType::TemporalDelimiter, true, false));
        buf.put_u8(0);
        buf.put_u8(obu_header(ObuType::Frame, true, true));
        buf.put_u8(0x28);
        buf.put_u8(3);
        buf.put_slice(&[1, 2, 3]);

        let obus = parse_obus(&buf.freeze()).unwrap();
        assert_eq!(obus.len(), 2);
        assert!(obus[0].is_dropped_on_wire());
        assert_eq!(obus[1].obu_type(), Some(ObuType::Frame));
        assert_eq!(obus[1].extension, Some(0x28));
        assert_eq!(&obus[1].payload[..], &[1, 2, 3]);
        assert_eq!(obus[1].encoded_len, 6);
    }

    #[test]
    fn test_unsized_obu_consumes_rest() {
        let mut buf = BytesMut::new();
        buf.put_u8(obu_header(ObuType::Frame, false, false));
        buf.put_slice(&[9, 8, 7, 6]);

        let obus = parse_obus(&buf.freeze()).unwrap();
        assert_eq!(obus.len(), 1);
        assert_eq!(&obus[0].payload[..], &[9, 8, 7, 6]);
    }

    #[test]
    fn test_size_overrun_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(obu_header(ObuType::Frame, true, false));
        buf.put_u8(10);
        buf.put_slice(&[1, 2]);

        assert_eq!(
            parse_obus(&buf.freeze()),
            Err(ObuError::SizeOverrun {
                declared: 10,
                remaining: 2
            })
        );
    }

    #[test]
    fn test_forbidden_bit_rejected() {
        let data = Bytes::from_static(&[0x80 | (6 << 3)]);
        assert_eq!(parse_obus(&data), Err(ObuError::ForbiddenBit(0)));
    }

    #[test]
    fn test_to_bytes_with_size() {
        let obu = Obu {
            header: obu_header(ObuType::Frame, false, false),
            extension: None,
            payload: Bytes::from_static(&[5, 5, 5]),
            encoded_len: 4,
        };
        let encoded = obu.to_bytes(true).freeze();
        let parsed = parse_obus(&encoded).unwrap();
        assert_eq!(parsed[0].payload, obu.payload);
        assert_eq!(parsed[0].encoded_len, 5);
    }
}
