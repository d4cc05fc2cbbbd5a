//! Receive-side frame reassembly
//!
//! Fragments are stored in a ring indexed by sequence number. A frame is emitted
//! once its end fragment and every fragment back to its start fragment are
//! present; the whole range is evicted in the same step. Gaps are tracked per
//! media timestamp with a short wait deadline, after which the frame waits for a
//! retransmission. Frames are never emitted partially and never twice.

use crate::frame::{FrameBuffer, ReassembledFrame};
use crate::obu::{write_leb128, ObuError, OBU_EXTENSION_FLAG, OBU_HAS_SIZE_FLAG};
use crate::packet::RtpPacket;
use crate::packetizer::{
    split_av1_payload, AggregationHeader, PayloadFormat, GENERIC_END_BIT, GENERIC_KEYFRAME_BIT,
    GENERIC_START_BIT,
};
use crate::sequence::SeqNumber;
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Default number of fragment slots
pub const DEFAULT_REASSEMBLY_CAPACITY: usize = 2048;

/// How long a gap may stay open before the frame waits on retransmission
pub const DEFAULT_MISSING_WAIT: Duration = Duration::from_millis(20);

/// Fragments older than this are purged together with their frame
pub const DEFAULT_MAX_FRAGMENT_AGE: Duration = Duration::from_secs(1);

/// Number of emitted frame ranges remembered for duplicate suppression
const EMITTED_HISTORY: usize = 256;

/// Number of given-up frame timestamps remembered to reject late fragments
const DISCARDED_HISTORY: usize = 256;

/// Reassembler configuration
#[derive(Debug, Clone)]
pub struct ReassemblerConfig {
    /// Payload format of the stream
    pub format: PayloadFormat,
    /// Number of fragment slots (rounded up to a power of two)
    pub capacity: usize,
    /// Wait deadline for a missing fragment
    pub missing_wait: Duration,
    /// Maximum age of a pending fragment
    pub max_fragment_age: Duration,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        ReassemblerConfig {
            format: PayloadFormat::Generic,
            capacity: DEFAULT_REASSEMBLY_CAPACITY,
            missing_wait: DEFAULT_MISSING_WAIT,
            max_fragment_age: DEFAULT_MAX_FRAGMENT_AGE,
        }
    }
}

/// Reassembly counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    /// Frames emitted
    pub frames_emitted: u64,
    /// Frames discarded incomplete (loss, staleness, overflow)
    pub frames_lost: u64,
    /// Frames that completed but could not be rebuilt
    pub frames_malformed: u64,
    /// Duplicate fragments ignored
    pub duplicates: u64,
    /// Fragments of frames already given up on
    pub late_fragments: u64,
    /// Fragments with an unusable payload
    pub malformed_fragments: u64,
    /// Times the ring overflowed and was cleared
    pub overflows: u64,
}

/// Result of inserting one packet
#[derive(Debug, Default)]
pub struct InsertOutcome {
    /// Frames completed by this packet, in sequence order
    pub frames: Vec<ReassembledFrame>,
    /// The buffer overflowed; the sender should be asked for a keyframe
    pub keyframe_needed: bool,
}

#[derive(Debug, Clone)]
struct Fragment {
    seq: SeqNumber,
    timestamp: u32,
    /// Payload without the generic descriptor (AV1 keeps its aggregation header)
    payload: Bytes,
    start: bool,
    end: bool,
    keyframe: bool,
    padding: bool,
    received_at: Instant,
}

#[derive(Debug)]
struct MissingFrame {
    seqs: Vec<SeqNumber>,
    deadline: Instant,
    expired: bool,
}

/// Frame reassembler for one stream
pub struct FrameReassembler {
    ssrc: u32,
    config: ReassemblerConfig,
    slots: Vec<Option<Fragment>>,
    mask: usize,
    missing: HashMap<u32, MissingFrame>,
    emitted: VecDeque<(SeqNumber, SeqNumber)>,
    discarded: VecDeque<u32>,
    scratch: FrameBuffer,
    stats: ReassemblyStats,
}

impl FrameReassembler {
    /// Create a reassembler for stream `ssrc`
    pub fn new(ssrc: u32, mut config: ReassemblerConfig) -> Self {
        config.capacity = config.capacity.max(16).next_power_of_two();
        FrameReassembler {
            ssrc,
            slots: vec![None; config.capacity],
            mask: config.capacity - 1,
            missing: HashMap::new(),
            emitted: VecDeque::with_capacity(EMITTED_HISTORY),
            discarded: VecDeque::with_capacity(DISCARDED_HISTORY),
            scratch: FrameBuffer::with_capacity(64 * 1024),
            stats: ReassemblyStats::default(),
            config,
        }
    }

    #[inline]
    fn index(&self, seq: SeqNumber) -> usize {
        seq.as_raw() as usize & self.mask
    }

    fn fragment(&self, seq: SeqNumber) -> Option<&Fragment> {
        self.slots[self.index(seq)]
            .as_ref()
            .filter(|fragment| fragment.seq == seq)
    }

    /// Counters
    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    /// Number of fragments currently recorded as missing
    pub fn missing_count(&self) -> usize {
        self.missing.values().map(|m| m.seqs.len()).sum()
    }

    /// Number of pending fragments
    pub fn pending_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Insert a parsed packet and return any frames it completes
    pub fn insert(&mut self, packet: &RtpPacket, now: Instant) -> InsertOutcome {
        let mut outcome = InsertOutcome::default();
        let seq = packet.seq_number();

        if self.was_emitted(seq) {
            self.stats.duplicates += 1;
            tracing::trace!("Dropping fragment {} of an emitted frame", seq);
            return outcome;
        }
        if !packet.payload.is_empty() && self.discarded.contains(&packet.timestamp()) {
            self.stats.late_fragments += 1;
            tracing::debug!(
                "Dropping fragment {} of discarded frame ts={}",
                seq,
                packet.timestamp()
            );
            return outcome;
        }

        let Some(fragment) = self.classify(packet, now) else {
            self.stats.malformed_fragments += 1;
            tracing::debug!("Dropping malformed fragment {} (ssrc={})", seq, self.ssrc);
            return outcome;
        };

        let idx = self.index(seq);
        let occupant = self.slots[idx].as_ref().map(|f| (f.seq == seq, f.padding));
        match occupant {
            Some((true, _)) => {
                self.stats.duplicates += 1;
                return outcome;
            }
            Some((false, false)) => {
                tracing::warn!(
                    "Reassembly ring overflow at seq {} (ssrc={}), clearing pending fragments",
                    seq,
                    self.ssrc
                );
                self.stats.overflows += 1;
                let lost = self.clear();
                self.stats.frames_lost += lost.len() as u64;
                outcome.keyframe_needed = true;
                if lost.contains(&fragment.timestamp) {
                    return outcome;
                }
            }
            _ => {}
        }

        self.fill_missing(seq);
        self.slots[idx] = Some(fragment);
        outcome.frames = self.complete_from(seq, now);
        outcome
    }

    fn classify(&self, packet: &RtpPacket, now: Instant) -> Option<Fragment> {
        let payload = &packet.payload;
        let mut fragment = Fragment {
            seq: packet.seq_number(),
            timestamp: packet.timestamp(),
            payload: payload.clone(),
            start: false,
            end: false,
            keyframe: false,
            padding: false,
            received_at: now,
        };

        if payload.is_empty() {
            fragment.padding = true;
            return Some(fragment);
        }

        match self.config.format {
            PayloadFormat::Generic => {
                let descriptor = payload[0];
                fragment.payload = payload.slice(1..);
                fragment.start = descriptor & GENERIC_START_BIT != 0;
                fragment.end = descriptor & GENERIC_END_BIT != 0;
                fragment.keyframe = descriptor & GENERIC_KEYFRAME_BIT != 0;
            }
            PayloadFormat::Raw => {
                fragment.start = true;
                fragment.end = true;
            }
            PayloadFormat::Av1 => {
                let header = AggregationHeader::from_byte(payload[0]);
                if header.new_sequence && header.continues_previous {
                    // A coded video sequence cannot start with a fragment
                    return None;
                }
                fragment.start = !header.continues_previous;
                fragment.end = packet.marker() && !header.continues_next;
                fragment.keyframe = header.new_sequence;
            }
        }
        Some(fragment)
    }

    fn was_emitted(&self, seq: SeqNumber) -> bool {
        self.emitted
            .iter()
            .any(|(start, end)| start.le(seq) && seq.le(*end))
    }

    fn closed_by_emitted_frame(&self, seq: SeqNumber) -> bool {
        self.emitted.iter().any(|(_, end)| *end == seq)
    }

    fn fill_missing(&mut self, seq: SeqNumber) {
        self.missing.retain(|_, frame| {
            frame.seqs.retain(|s| *s != seq);
            !frame.seqs.is_empty()
        });
    }

    /// Walk forward from `seq` over present fragments, completing every frame whose
    /// end fragment is reached
    fn complete_from(&mut self, seq: SeqNumber, now: Instant) -> Vec<ReassembledFrame> {
        let mut frames = Vec::new();
        let mut cur = seq;
        for _ in 0..self.config.capacity {
            let Some(fragment) = self.fragment(cur) else {
                break;
            };
            if fragment.end {
                if let Some(frame) = self.assemble_ending_at(cur, now) {
                    frames.push(frame);
                }
            }
            cur = cur.next();
        }
        frames
    }

    fn is_frame_start(&self, fragment: &Fragment) -> bool {
        match self.config.format {
            PayloadFormat::Generic => fragment.start,
            PayloadFormat::Raw => true,
            PayloadFormat::Av1 => {
                if !fragment.start {
                    return false;
                }
                if fragment.keyframe {
                    return true;
                }
                let prev = fragment.seq.prev();
                match self.fragment(prev) {
                    Some(p) => p.padding || p.end || p.timestamp != fragment.timestamp,
                    None => self.closed_by_emitted_frame(prev),
                }
            }
        }
    }

    fn assemble_ending_at(&mut self, end: SeqNumber, now: Instant) -> Option<ReassembledFrame> {
        let timestamp = self.fragment(end)?.timestamp;
        let mut cur = end;

        for _ in 0..self.config.capacity {
            match self.fragment(cur) {
                None => {
                    self.record_missing(timestamp, cur, now);
                    return None;
                }
                Some(fragment) if fragment.padding || fragment.timestamp != timestamp => {
                    tracing::debug!(
                        "Frame ts={} ending at {} has no start fragment",
                        timestamp,
                        end
                    );
                    return None;
                }
                Some(fragment) => {
                    if self.is_frame_start(fragment) {
                        return self.emit(cur, end, now);
                    }
                }
            }
            cur = cur.prev();
        }
        None
    }

    fn record_missing(&mut self, timestamp: u32, seq: SeqNumber, now: Instant) {
        let deadline = now + self.config.missing_wait;
        let entry = self.missing.entry(timestamp).or_insert_with(|| MissingFrame {
            seqs: Vec::new(),
            deadline,
            expired: false,
        });
        if !entry.seqs.contains(&seq) {
            tracing::trace!("Frame ts={} waiting for fragment {}", timestamp, seq);
            entry.seqs.push(seq);
        }
    }

    /// Concatenate `start..=end`, evict the range and remember it as emitted
    fn emit(&mut self, start: SeqNumber, end: SeqNumber, now: Instant) -> Option<ReassembledFrame> {
        let count = start.distance_to(end) as usize + 1;
        let mut payloads = Vec::with_capacity(count);
        let mut keyframe = false;
        let mut timestamp = 0;
        let mut received_at = now;

        for i in 0..count {
            let fragment = self.fragment(start + i as u16)?;
            if i == 0 {
                keyframe = fragment.keyframe;
                timestamp = fragment.timestamp;
                received_at = fragment.received_at;
            }
            received_at = received_at.max(fragment.received_at);
            payloads.push(fragment.payload.clone());
        }

        for i in 0..count {
            let idx = self.index(start + i as u16);
            self.slots[idx] = None;
        }
        self.missing.remove(&timestamp);
        if self.emitted.len() == EMITTED_HISTORY {
            self.emitted.pop_front();
        }
        self.emitted.push_back((start, end));

        self.scratch.clear();
        let total: usize = payloads.iter().map(|p| p.len()).sum();
        self.scratch.reserve(total + 16 * count);
        let rebuilt = match self.config.format {
            PayloadFormat::Generic | PayloadFormat::Raw => {
                for payload in &payloads {
                    self.scratch.extend_from_slice(payload);
                }
                Ok(())
            }
            PayloadFormat::Av1 => rebuild_av1(&payloads, &mut self.scratch),
        };

        if let Err(e) = rebuilt {
            self.stats.frames_malformed += 1;
            self.scratch.clear();
            tracing::debug!("Discarding malformed AV1 frame ts={}: {}", timestamp, e);
            return None;
        }

        self.stats.frames_emitted += 1;
        Some(ReassembledFrame {
            ssrc: self.ssrc,
            data: self.scratch.take(),
            timestamp,
            received_at,
            first_seq: start,
            last_seq: end,
            keyframe,
        })
    }

    /// Report fragments whose wait deadline elapsed since the last poll
    ///
    /// The returned sequence numbers should be requested for retransmission
    /// without further delay.
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<SeqNumber> {
        let mut expired = Vec::new();
        for (timestamp, frame) in self.missing.iter_mut() {
            if !frame.expired && frame.deadline <= now {
                frame.expired = true;
                tracing::debug!(
                    "Frame ts={} still missing {:?}, waiting for retransmission",
                    timestamp,
                    frame.seqs
                );
                expired.extend_from_slice(&frame.seqs);
            }
        }
        expired
    }

    /// Give up on the frame(s) a lost sequence number belongs to
    ///
    /// Returns the media timestamps of the discarded frames.
    pub fn discard(&mut self, seq: SeqNumber) -> Vec<u32> {
        let mut timestamps: Vec<u32> = self
            .missing
            .iter()
            .filter(|(_, frame)| frame.seqs.contains(&seq))
            .map(|(ts, _)| *ts)
            .collect();

        if let Some(prev) = self.fragment(seq.prev()) {
            if !prev.padding && !prev.end {
                timestamps.push(prev.timestamp);
            }
        }
        if let Some(next) = self.fragment(seq.next()) {
            let definitely_starts = match self.config.format {
                PayloadFormat::Av1 => next.start && next.keyframe,
                _ => next.start,
            };
            if !next.padding && !definitely_starts {
                timestamps.push(next.timestamp);
            }
        }
        timestamps.sort_unstable();
        timestamps.dedup();

        for timestamp in &timestamps {
            self.drop_frame(*timestamp);
        }
        if !timestamps.is_empty() {
            tracing::debug!(
                "Discarded {} incomplete frame(s) after losing {} (ssrc={})",
                timestamps.len(),
                seq,
                self.ssrc
            );
        }
        self.stats.frames_lost += timestamps.len() as u64;
        timestamps
    }

    fn drop_frame(&mut self, timestamp: u32) {
        self.remember_discarded(timestamp);
        for slot in self.slots.iter_mut() {
            if slot
                .as_ref()
                .is_some_and(|f| !f.padding && f.timestamp == timestamp)
            {
                *slot = None;
            }
        }
        self.missing.remove(&timestamp);
    }

    /// Drop fragments older than the configured maximum age
    ///
    /// Returns the media timestamps of the frames that were dropped.
    pub fn purge_stale(&mut self, now: Instant) -> Vec<u32> {
        let max_age = self.config.max_fragment_age;
        let mut timestamps = Vec::new();
        for slot in self.slots.iter_mut() {
            let stale = slot
                .as_ref()
                .is_some_and(|f| now.saturating_duration_since(f.received_at) > max_age);
            if stale {
                if let Some(fragment) = slot.take() {
                    if !fragment.padding {
                        timestamps.push(fragment.timestamp);
                    }
                }
            }
        }
        timestamps.sort_unstable();
        timestamps.dedup();
        for timestamp in &timestamps {
            self.drop_frame(*timestamp);
        }
        self.missing
            .retain(|_, frame| now.saturating_duration_since(frame.deadline) <= max_age);
        self.stats.frames_lost += timestamps.len() as u64;
        timestamps
    }

    fn remember_discarded(&mut self, timestamp: u32) {
        if self.discarded.contains(&timestamp) {
            return;
        }
        if self.discarded.len() == DISCARDED_HISTORY {
            self.discarded.pop_front();
        }
        self.discarded.push_back(timestamp);
    }

    /// Drop everything pending; returns the timestamps of the incomplete frames dropped
    pub fn clear(&mut self) -> Vec<u32> {
        let mut timestamps: Vec<u32> = self
            .slots
            .iter()
            .flatten()
            .filter(|f| !f.padding)
            .map(|f| f.timestamp)
            .collect();
        timestamps.sort_unstable();
        timestamps.dedup();
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.missing.clear();
        for timestamp in &timestamps {
            self.remember_discarded(*timestamp);
        }
        timestamps
    }
}

/// Rebuild size-prefixed OBUs from AV1 RTP payloads
fn rebuild_av1(payloads: &[Bytes], out: &mut FrameBuffer) -> Result<(), ObuError> {
    let mut pending: Option<BytesMut> = None;
    let mut offset = 0;

    for payload in payloads {
        let (header, elements) = split_av1_payload(payload)?;
        let count = elements.len();
        for (i, element) in elements.into_iter().enumerate() {
            if i == 0 && header.continues_previous {
                match pending.as_mut() {
                    Some(acc) => acc.extend_from_slice(&element),
                    None => return Err(ObuError::Truncated(offset)),
                }
            } else {
                if pending.is_some() {
                    return Err(ObuError::Truncated(offset));
                }
                pending = Some(BytesMut::from(&element[..]));
            }

            let continued = i + 1 == count && header.continues_next;
            if !continued {
                if let Some(obu) = pending.take() {
                    write_sized_obu(&obu, out)?;
                }
            }
            offset += element.len();
        }
    }

    match pending {
        Some(_) => Err(ObuError::Truncated(offset)),
        None => Ok(()),
    }
}

fn write_sized_obu(obu: &[u8], out: &mut FrameBuffer) -> Result<(), ObuError> {
    let header = *obu.first().ok_or(ObuError::Truncated(0))?;
    let header_len = if header & OBU_EXTENSION_FLAG != 0 { 2 } else { 1 };
    if obu.len() < header_len {
        return Err(ObuError::Truncated(0));
    }
    out.push(header | OBU_HAS_SIZE_FLAG);
    if header_len == 2 {
        out.push(obu[1]);
    }
    let payload = &obu[header_len..];
    let mut size = BytesMut::with_capacity(8);
    write_leb128(payload.len() as u64, &mut size);
    out.extend_from_slice(&size);
    out.extend_from_slice(payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obu::{parse_obus, ObuType};
    use crate::packetizer::Packetizer;
    use bytes::BufMut;

    fn unit(len: usize) -> Bytes {
        (0..len).map(|i| (i * 7 % 256) as u8).collect::<Vec<_>>().into()
    }

    fn generic_packets(len: usize, max_payload: usize, first_seq: u16, ts: u32) -> Vec<RtpPacket> {
        let mut packetizer = Packetizer::new(
            7,
            96,
            PayloadFormat::Generic,
            max_payload,
            SeqNumber::new(first_seq),
        );
        packetizer.packetize(&unit(len), ts, false).unwrap()
    }

    fn reassembler(format: PayloadFormat) -> FrameReassembler {
        FrameReassembler::new(
            7,
            ReassemblerConfig {
                format,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_in_order_reassembly() {
        let mut reassembler = reassembler(PayloadFormat::Generic);
        let packets = generic_packets(1000, 101, 100, 9000);
        let now = Instant::now();

        let mut frames = Vec::new();
        for packet in &packets {
            frames.extend(reassembler.insert(packet, now).frames);
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, unit(1000));
        assert_eq!(frames[0].timestamp, 9000);
        assert_eq!(frames[0].first_seq, SeqNumber::new(100));
        assert_eq!(frames[0].packet_count(), packets.len());
        assert_eq!(reassembler.pending_count(), 0);
    }

    #[test]
    fn test_missing_middle_fragment_waits() {
        let mut reassembler = reassembler(PayloadFormat::Generic);
        let packets = generic_packets(500, 101, 0, 3000);
        let now = Instant::now();

        for (i, packet) in packets.iter().enumerate() {
            if i == 2 {
                continue;
            }
            assert!(reassembler.insert(packet, now).frames.is_empty());
        }
        assert_eq!(reassembler.missing_count(), 1);

        // Deadline not reached yet
        assert!(reassembler
            .poll_timeouts(now + Duration::from_millis(10))
            .is_empty());
        let expired = reassembler.poll_timeouts(now + Duration::from_millis(20));
        assert_eq!(expired, vec![SeqNumber::new(2)]);
        // Reported once only
        assert!(reassembler
            .poll_timeouts(now + Duration::from_millis(40))
            .is_empty());

        let retransmitted = reassembler.insert(&packets[2], now + Duration::from_millis(60));
        assert_eq!(retransmitted.frames.len(), 1);
        assert_eq!(retransmitted.frames[0].data, unit(500));
        assert_eq!(reassembler.missing_count(), 0);
    }

    #[test]
    fn test_end_fragment_first() {
        let mut reassembler = reassembler(PayloadFormat::Generic);
        let packets = generic_packets(300, 101, 65534, 1);
        let now = Instant::now();

        assert!(reassembler.insert(&packets[2], now).frames.is_empty());
        assert!(reassembler.insert(&packets[0], now).frames.is_empty());
        let frames = reassembler.insert(&packets[1], now).frames;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, unit(300));
    }

    #[test]
    fn test_duplicate_not_emitted_twice() {
        let mut reassembler = reassembler(PayloadFormat::Generic);
        let packets = generic_packets(50, 1200, 10, 1);
        let now = Instant::now();

        assert_eq!(reassembler.insert(&packets[0], now).frames.len(), 1);
        assert!(reassembler.insert(&packets[0], now).frames.is_empty());
        assert_eq!(reassembler.stats().duplicates, 1);
        assert_eq!(reassembler.stats().frames_emitted, 1);
    }

    #[test]
    fn test_two_frames_complete_out_of_order() {
        let mut reassembler = reassembler(PayloadFormat::Generic);
        let first = generic_packets(250, 101, 0, 1000);
        let second = generic_packets(250, 101, 3, 2000);
        let now = Instant::now();

        // Second frame completes while the first still misses a fragment
        reassembler.insert(&first[0], now);
        reassembler.insert(&first[2], now);
        let mut frames = Vec::new();
        for packet in &second {
            frames.extend(reassembler.insert(packet, now).frames);
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].timestamp, 2000);

        let frames = reassembler.insert(&first[1], now).frames;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].timestamp, 1000);
    }

    #[test]
    fn test_discard_after_loss() {
        let mut reassembler = reassembler(PayloadFormat::Generic);
        let packets = generic_packets(400, 101, 0, 5);
        let now = Instant::now();

        for packet in packets.iter().filter(|p| p.seq_number().as_raw() != 1) {
            reassembler.insert(packet, now);
        }
        assert_eq!(reassembler.discard(SeqNumber::new(1)), vec![5]);
        assert_eq!(reassembler.pending_count(), 0);
        assert_eq!(reassembler.missing_count(), 0);
        assert_eq!(reassembler.stats().frames_lost, 1);

        // A late retransmission cannot complete the discarded frame
        assert!(reassembler.insert(&packets[1], now).frames.is_empty());
        assert_eq!(reassembler.stats().late_fragments, 1);
        assert_eq!(reassembler.pending_count(), 0);

        // Nor is the frame reported lost a second time
        assert!(reassembler
            .purge_stale(now + Duration::from_millis(1500))
            .is_empty());
        assert_eq!(reassembler.stats().frames_lost, 1);
    }

    #[test]
    fn test_older_frame_survives_newer_completion_until_stale() {
        let mut reassembler = reassembler(PayloadFormat::Generic);
        let first = generic_packets(250, 101, 0, 1000);
        let second = generic_packets(250, 101, 3, 2000);
        let now = Instant::now();

        reassembler.insert(&first[0], now);
        reassembler.insert(&first[2], now);
        for packet in &second {
            reassembler.insert(packet, now);
        }
        // Still recoverable while younger than the maximum age
        assert!(reassembler
            .purge_stale(now + Duration::from_millis(900))
            .is_empty());
        assert_eq!(reassembler.pending_count(), 2);

        assert_eq!(
            reassembler.purge_stale(now + Duration::from_millis(1100)),
            vec![1000]
        );
        assert_eq!(reassembler.pending_count(), 0);
        assert_eq!(reassembler.stats().frames_lost, 1);
        assert!(reassembler.insert(&first[1], now).frames.is_empty());
    }

    #[test]
    fn test_purge_stale() {
        let mut reassembler = reassembler(PayloadFormat::Generic);
        let packets = generic_packets(400, 101, 0, 5);
        let now = Instant::now();
        reassembler.insert(&packets[0], now);

        assert!(reassembler.purge_stale(now + Duration::from_millis(500)).is_empty());
        assert_eq!(
            reassembler.purge_stale(now + Duration::from_millis(1500)),
            vec![5]
        );
        assert_eq!(reassembler.pending_count(), 0);
    }

    #[test]
    fn test_raw_packets_are_frames() {
        let mut reassembler = reassembler(PayloadFormat::Raw);
        let mut packetizer = Packetizer::new(7, 111, PayloadFormat::Raw, 1200, SeqNumber::new(0));
        let now = Instant::now();

        for ts in 0..3u32 {
            let packets = packetizer.packetize(&unit(20), ts * 960, false).unwrap();
            let frames = reassembler.insert(&packets[0], now).frames;
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].timestamp, ts * 960);
        }
    }

    #[test]
    fn test_padding_is_ignored() {
        let mut reassembler = reassembler(PayloadFormat::Generic);
        let mut packetizer = Packetizer::new(7, 96, PayloadFormat::Generic, 1200, SeqNumber::new(0));
        let now = Instant::now();

        let padding = packetizer.padding_packet(100, 0);
        assert!(reassembler.insert(&padding, now).frames.is_empty());
        let packets = packetizer.packetize(&unit(10), 90, false).unwrap();
        assert_eq!(reassembler.insert(&packets[0], now).frames.len(), 1);
    }

    #[test]
    fn test_overflow_requests_keyframe() {
        let mut reassembler = FrameReassembler::new(
            7,
            ReassemblerConfig {
                capacity: 16,
                ..Default::default()
            },
        );
        let now = Instant::now();
        let stuck = generic_packets(300, 101, 0, 1);
        reassembler.insert(&stuck[0], now);

        let colliding = generic_packets(300, 101, 16, 2);
        let outcome = reassembler.insert(&colliding[0], now);
        assert!(outcome.keyframe_needed);
        assert_eq!(reassembler.stats().overflows, 1);
    }

    fn av1_unit() -> (Bytes, Vec<u8>) {
        let mut unit = BytesMut::new();
        let mut expected = BytesMut::new();

        unit.put_u8(((ObuType::TemporalDelimiter as u8) << 3) | OBU_HAS_SIZE_FLAG);
        unit.put_u8(0);

        let sequence_header = [((ObuType::SequenceHeader as u8) << 3) | OBU_HAS_SIZE_FLAG, 3, 1, 2, 3];
        unit.put_slice(&sequence_header);
        expected.put_slice(&sequence_header);

        let frame: Vec<u8> = (0..700).map(|i| (i % 200) as u8).collect();
        let mut frame_obu = BytesMut::new();
        frame_obu.put_u8(((ObuType::Frame as u8) << 3) | OBU_HAS_SIZE_FLAG | OBU_EXTENSION_FLAG);
        frame_obu.put_u8(0x10);
        write_leb128(frame.len() as u64, &mut frame_obu);
        frame_obu.put_slice(&frame);
        unit.put_slice(&frame_obu);
        expected.put_slice(&frame_obu);

        (unit.freeze(), expected.to_vec())
    }

    #[test]
    fn test_av1_reassembly() {
        let (unit, expected) = av1_unit();
        let mut packetizer = Packetizer::new(7, 45, PayloadFormat::Av1, 200, SeqNumber::new(500));
        let packets = packetizer.packetize(&unit, 777, true).unwrap();
        assert!(packets.len() > 3);

        let mut reassembler = reassembler(PayloadFormat::Av1);
        let now = Instant::now();
        let mut frames = Vec::new();
        for packet in packets.iter().rev() {
            frames.extend(reassembler.insert(packet, now).frames);
        }

        assert_eq!(frames.len(), 1);
        assert!(frames[0].keyframe);
        assert_eq!(&frames[0].data[..], &expected[..]);
        assert_eq!(parse_obus(&frames[0].data).unwrap().len(), 2);
    }

    #[test]
    fn test_av1_delta_frame_needs_boundary() {
        let (unit, _) = av1_unit();
        let mut packetizer = Packetizer::new(7, 45, PayloadFormat::Av1, 1200, SeqNumber::new(0));
        let key = packetizer.packetize(&unit, 1, true).unwrap();
        let delta = packetizer.packetize(&unit, 2, false).unwrap();
        assert_eq!((key.len(), delta.len()), (1, 1));

        let mut reassembler = reassembler(PayloadFormat::Av1);
        let now = Instant::now();
        // Without the preceding keyframe the delta frame's start is unknown
        assert!(reassembler.insert(&delta[0], now).frames.is_empty());
        let frames = reassembler.insert(&key[0], now).frames;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].timestamp, 1);
        assert_eq!(frames[1].timestamp, 2);
    }
}
