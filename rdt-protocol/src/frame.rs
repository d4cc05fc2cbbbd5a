//! Reassembled frames and the reusable buffer they are built in

use crate::sequence::SeqNumber;
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Instant;

/// Growable byte buffer with explicit capacity and in-place reuse
///
/// Frames are assembled into the same allocation over and over. Once a frame is
/// taken out as `Bytes` and every clone of it is dropped, the next `reserve`
/// reclaims the allocation instead of allocating a new one.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    /// Create a buffer with the given initial capacity
    pub fn with_capacity(capacity: usize) -> Self {
        FrameBuffer {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Number of bytes currently written
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes that can be written without reallocating
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Ensure room for `additional` more bytes
    pub fn reserve(&mut self, additional: usize) {
        self.buf.reserve(additional);
    }

    /// Append bytes
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Append a single byte
    pub fn push(&mut self, byte: u8) {
        self.buf.put_u8(byte);
    }

    /// Discard the contents, keeping the allocation
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Move the written bytes out as an immutable, cheaply cloneable buffer
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

/// A complete frame produced by the reassembler
///
/// The data is shared: cloning a frame does not copy its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledFrame {
    /// Stream the frame belongs to
    pub ssrc: u32,
    /// Frame bytes
    pub data: Bytes,
    /// Media (capture) timestamp shared by all fragments
    pub timestamp: u32,
    /// When the last missing fragment arrived
    pub received_at: Instant,
    /// Sequence number of the first fragment
    pub first_seq: SeqNumber,
    /// Sequence number of the last fragment
    pub last_seq: SeqNumber,
    /// Whether the sender marked the frame as a keyframe
    pub keyframe: bool,
}

impl ReassembledFrame {
    /// Byte count of the frame
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Number of packets the frame was carried in
    pub fn packet_count(&self) -> usize {
        self.first_seq.distance_to(self.last_seq) as usize + 1
    }
}
