//! Priority packet queue for the pacer

use crate::packet::RtpPacket;
use std::collections::VecDeque;
use std::time::Instant;
use thiserror::Error;

/// Default maximum number of queued packets
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Queue errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Pacer queue is full ({capacity} packets)")]
    Full { capacity: usize },
}

/// Send priority, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Audio = 0,
    Retransmission = 1,
    Video = 2,
    Padding = 3,
}

impl Priority {
    const COUNT: usize = 4;

    fn index(self) -> usize {
        self as usize
    }
}

/// A packet waiting in the pacer
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    pub packet: RtpPacket,
    pub priority: Priority,
    pub enqueue_time: Instant,
}

impl QueuedPacket {
    /// Bytes on the wire
    pub fn size(&self) -> usize {
        self.packet.size()
    }
}

/// Bounded queue, FIFO within each priority class
#[derive(Debug)]
pub struct PacketQueue {
    classes: [VecDeque<QueuedPacket>; Priority::COUNT],
    capacity: usize,
    len: usize,
    size_bytes: usize,
    dropped: u64,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        PacketQueue {
            classes: Default::default(),
            capacity,
            len: 0,
            size_bytes: 0,
            dropped: 0,
        }
    }

    /// Add a packet; full queues drop the new packet and count it
    pub fn push(&mut self, packet: RtpPacket, priority: Priority, now: Instant) -> Result<(), QueueError> {
        if self.len >= self.capacity {
            self.dropped += 1;
            tracing::debug!(
                seq = packet.seq_number().as_raw(),
                ?priority,
                dropped = self.dropped,
                "pacer queue full, dropping packet"
            );
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }
        self.size_bytes += packet.size();
        self.len += 1;
        self.classes[priority.index()].push_back(QueuedPacket {
            packet,
            priority,
            enqueue_time: now,
        });
        Ok(())
    }

    /// Remove the next packet in priority order
    pub fn pop(&mut self) -> Option<QueuedPacket> {
        let queued = self.classes.iter_mut().find_map(|class| class.pop_front())?;
        self.len -= 1;
        self.size_bytes -= queued.size();
        Some(queued)
    }

    /// Priority of the packet `pop` would return
    pub fn peek_priority(&self) -> Option<Priority> {
        self.classes
            .iter()
            .find_map(|class| class.front().map(|p| p.priority))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Packets rejected because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Enqueue time of the oldest waiting packet
    pub fn oldest_enqueue_time(&self) -> Option<Instant> {
        self.classes
            .iter()
            .filter_map(|class| class.front().map(|p| p.enqueue_time))
            .min()
    }

    pub fn average_packet_size(&self) -> Option<usize> {
        (self.len > 0).then(|| self.size_bytes / self.len)
    }

    /// Drop everything, returning the number of packets removed
    pub fn clear(&mut self) -> usize {
        let removed = self.len;
        for class in &mut self.classes {
            class.clear();
        }
        self.len = 0;
        self.size_bytes = 0;
        removed
    }
}
