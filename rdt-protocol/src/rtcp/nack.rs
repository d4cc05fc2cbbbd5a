//! Generic NACK (RFC 4585 transport-layer feedback, FMT 1)
//!
//! Each feedback control item is a 16-bit packet id (PID) plus a 16-bit bitmask
//! of following lost packets (BLP): bit `i` set means `PID + i + 1` is lost.

use super::{read_u16, read_u32, require, write_packet, RtcpError, FMT_GENERIC_NACK,
    PT_TRANSPORT_FEEDBACK};
use crate::sequence::SeqNumber;
use bytes::{BufMut, BytesMut};

/// Retransmission request for a list of packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericNack {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    /// Requested packets, in sequence order
    pub lost: Vec<SeqNumber>,
}

impl GenericNack {
    /// Pack the lost list into PID/BLP pairs
    pub fn items(&self) -> Vec<(u16, u16)> {
        let mut items = Vec::new();
        let mut i = 0;
        while i < self.lost.len() {
            let pid = self.lost[i];
            let mut blp = 0u16;
            i += 1;
            while i < self.lost.len() {
                let distance = pid.distance_to(self.lost[i]);
                if !(1..=16).contains(&distance) {
                    break;
                }
                blp |= 1 << (distance - 1);
                i += 1;
            }
            items.push((pid.as_raw(), blp));
        }
        items
    }

    pub fn write(&self, buf: &mut BytesMut) {
        let items = self.items();
        let mut body = BytesMut::with_capacity(8 + items.len() * 4);
        body.put_u32(self.sender_ssrc);
        body.put_u32(self.media_ssrc);
        for (pid, blp) in items {
            body.put_u16(pid);
            body.put_u16(blp);
        }
        write_packet(FMT_GENERIC_NACK, PT_TRANSPORT_FEEDBACK, &body, buf);
    }

    pub fn parse(body: &[u8]) -> Result<Self, RtcpError> {
        require(body, 8)?;
        let mut lost = Vec::new();
        let mut offset = 8;
        while offset + 4 <= body.len() {
            let pid = SeqNumber::new(read_u16(body, offset));
            let blp = read_u16(body, offset + 2);
            lost.push(pid);
            for bit in 0..16u16 {
                if blp & (1 << bit) != 0 {
                    lost.push(pid + (bit + 1));
                }
            }
            offset += 4;
        }
        Ok(GenericNack {
            sender_ssrc: read_u32(body, 0),
            media_ssrc: read_u32(body, 4),
            lost,
        })
    }
}
