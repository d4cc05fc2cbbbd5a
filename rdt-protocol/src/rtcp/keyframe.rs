//! Keyframe requests (payload-specific feedback)

use super::{read_u32, require, write_packet, RtcpError, FMT_FIR, FMT_PLI, PT_PAYLOAD_FEEDBACK};
use bytes::{BufMut, BytesMut};

/// Picture loss indication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pli {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
}

impl Pli {
    pub fn write(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::with_capacity(8);
        body.put_u32(self.sender_ssrc);
        body.put_u32(self.media_ssrc);
        write_packet(FMT_PLI, PT_PAYLOAD_FEEDBACK, &body, buf);
    }

    pub fn parse(body: &[u8]) -> Result<Self, RtcpError> {
        require(body, 8)?;
        Ok(Pli {
            sender_ssrc: read_u32(body, 0),
            media_ssrc: read_u32(body, 4),
        })
    }
}

/// Full intra request
///
/// Carries one FCI entry: the target stream and a command sequence number that
/// the requester increments for every new request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fir {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub command_seq: u8,
}

impl Fir {
    pub fn write(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::with_capacity(16);
        body.put_u32(self.sender_ssrc);
        // Media source field is unused for FIR
        body.put_u32(0);
        body.put_u32(self.media_ssrc);
        body.put_u8(self.command_seq);
        body.put_bytes(0, 3);
        write_packet(FMT_FIR, PT_PAYLOAD_FEEDBACK, &body, buf);
    }

    pub fn parse(body: &[u8]) -> Result<Self, RtcpError> {
        require(body, 16)?;
        Ok(Fir {
            sender_ssrc: read_u32(body, 0),
            media_ssrc: read_u32(body, 8),
            command_seq: body[12],
        })
    }
}
