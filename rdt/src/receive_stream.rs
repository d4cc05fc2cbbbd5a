//! Receive half of a session
//!
//! Incoming media packets feed the receive statistics, the congestion
//! feedback generator, the NACK scheduler and the frame reassembler.
//! Completed frames go to the event sink and the frame channel; everything
//! the peer needs to hear about (NACKs, feedback, reports, keyframe requests)
//! is sent from `process`.

use crate::config::SessionConfig;
use crate::events::SessionEvents;
use crossbeam::channel::{Sender, TrySendError};
use rdt_io::{DatagramTransport, Timer};
use rdt_protocol::frame::ReassembledFrame;
use rdt_protocol::nack::NackScheduler;
use rdt_protocol::packet::RtpPacket;
use rdt_protocol::reassembly::FrameReassembler;
use rdt_protocol::rtcp::{
    FeedbackFormat, FeedbackGenerator, GenericNack, Pli, ReceiveStatistics, ReceiverReport,
    RtcpPacket,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimum spacing between two keyframe requests
const KEYFRAME_REQUEST_INTERVAL: Duration = Duration::from_millis(200);

/// Receive-side counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveStreamStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub frames_received: u64,
    pub frames_lost: u64,
    /// Frames the consumer did not pick up in time
    pub frames_dropped: u64,
    pub nacks_sent: u64,
    pub keyframe_requests_sent: u64,
    pub feedback_sent: u64,
    pub unknown_ssrc: u64,
    pub missing_packets: usize,
    pub cumulative_lost: i64,
    /// Interarrival jitter in media clock units
    pub jitter: u32,
}

/// Receive half of a session
pub struct ReceiveStream {
    ssrc: u32,
    local_ssrc: u32,
    extension_id: u8,
    feedback_format: FeedbackFormat,
    reassembler: FrameReassembler,
    nack: NackScheduler,
    feedback: FeedbackGenerator,
    statistics: ReceiveStatistics,
    transport: Arc<dyn DatagramTransport>,
    events: Arc<dyn SessionEvents>,
    frames: Sender<ReassembledFrame>,
    report_timer: Timer,
    last_keyframe_request: Option<Instant>,
    stats: ReceiveStreamStats,
}

impl ReceiveStream {
    pub fn new(
        config: &SessionConfig,
        transport: Arc<dyn DatagramTransport>,
        events: Arc<dyn SessionEvents>,
        frames: Sender<ReassembledFrame>,
        now: Instant,
    ) -> Self {
        let mut nack = NackScheduler::new(config.nack.clone());
        nack.set_rtt(config.assumed_rtt);
        ReceiveStream {
            ssrc: config.remote_ssrc,
            local_ssrc: config.local_ssrc,
            extension_id: config.transport_seq_extension_id,
            feedback_format: config.feedback_format,
            reassembler: FrameReassembler::new(config.remote_ssrc, config.reassembler_config()),
            nack,
            feedback: FeedbackGenerator::new(config.feedback_config(), now),
            statistics: ReceiveStatistics::new(config.remote_ssrc, config.clock_rate),
            transport,
            events,
            frames,
            report_timer: Timer::new(config.report_interval, now),
            last_keyframe_request: None,
            stats: ReceiveStreamStats::default(),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Handle one media packet
    pub fn on_rtp(&mut self, packet: &RtpPacket, now: Instant) {
        if packet.ssrc() != self.ssrc {
            self.stats.unknown_ssrc += 1;
            tracing::debug!("Dropping packet for unknown ssrc {:#x}", packet.ssrc());
            return;
        }
        let size = packet.size();
        self.stats.packets_received += 1;
        self.stats.bytes_received += size as u64;
        self.statistics
            .on_packet(packet.seq_number(), packet.timestamp(), size, now);

        let feedback_seq = match self.feedback_format {
            FeedbackFormat::TransportWide => {
                packet.header.transport_sequence_number(self.extension_id)
            }
            FeedbackFormat::Congestion => Some(packet.seq_number()),
        };
        if let Some(seq) = feedback_seq {
            self.feedback.on_packet(seq, now, size, packet.marker(), 0);
        }

        if self.nack.on_packet(packet.seq_number(), now) {
            tracing::trace!("Recovered packet {}", packet.seq_number());
        }

        let outcome = self.reassembler.insert(packet, now);
        for frame in outcome.frames {
            self.deliver(frame);
        }
        if outcome.keyframe_needed {
            self.request_keyframe(now);
        }
    }

    /// Handle one RTCP packet from the peer
    pub fn on_rtcp(&mut self, packet: &RtcpPacket, now: Instant) {
        if let RtcpPacket::SenderReport(report) = packet {
            if report.sender_ssrc == self.ssrc {
                self.statistics.on_sender_report(report, now);
            }
        }
    }

    fn deliver(&mut self, frame: ReassembledFrame) {
        self.stats.frames_received += 1;
        tracing::trace!(
            "Frame ts={} complete: {} bytes in {} packets",
            frame.timestamp,
            frame.size(),
            frame.packet_count()
        );
        self.events.on_frame(&frame);
        match self.frames.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                self.stats.frames_dropped += 1;
                tracing::debug!("Frame queue full, dropping frame ts={}", frame.timestamp);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn frames_lost(&mut self, timestamps: Vec<u32>, now: Instant) {
        if timestamps.is_empty() {
            return;
        }
        self.stats.frames_lost += timestamps.len() as u64;
        for timestamp in timestamps {
            self.events.on_frame_lost(timestamp);
        }
        // Later frames reference the lost one; only a keyframe resyncs
        self.request_keyframe(now);
    }

    /// Ask the sender for a keyframe, at most once per interval
    pub fn request_keyframe(&mut self, now: Instant) {
        if let Some(last) = self.last_keyframe_request {
            if now.saturating_duration_since(last) < KEYFRAME_REQUEST_INTERVAL {
                return;
            }
        }
        self.last_keyframe_request = Some(now);
        self.stats.keyframe_requests_sent += 1;
        tracing::debug!("Requesting keyframe from ssrc={:#x}", self.ssrc);
        self.send(&RtcpPacket::Pli(Pli {
            sender_ssrc: self.local_ssrc,
            media_ssrc: self.ssrc,
        }));
    }

    /// Run NACK aging, feedback emission and the report timer
    pub fn process(&mut self, now: Instant) {
        let waiting = self.reassembler.poll_timeouts(now);
        if !waiting.is_empty() {
            self.nack.expedite(&waiting);
        }

        if self.nack.is_due(now) {
            let batch = self.nack.process(now);
            if !batch.requests.is_empty() {
                self.stats.nacks_sent += 1;
                self.send(&RtcpPacket::Nack(GenericNack {
                    sender_ssrc: self.local_ssrc,
                    media_ssrc: self.ssrc,
                    lost: batch.requests,
                }));
            }
            let mut lost = Vec::new();
            for seq in batch.lost {
                lost.extend(self.reassembler.discard(seq));
            }
            self.frames_lost(lost, now);
            if batch.keyframe_needed {
                self.request_keyframe(now);
            }
        }

        let stale = self.reassembler.purge_stale(now);
        self.frames_lost(stale, now);

        if let Some(report) = self.feedback.poll(now) {
            self.stats.feedback_sent += 1;
            self.send(&report);
        }

        if self.report_timer.try_fire(now) {
            if let Some(block) = self.statistics.report_block(now) {
                self.send(&RtcpPacket::ReceiverReport(ReceiverReport {
                    sender_ssrc: self.local_ssrc,
                    blocks: vec![block],
                }));
            }
        }
    }

    /// Earliest time `process` has work to do
    pub fn next_deadline(&self) -> Instant {
        let mut deadline = self.report_timer.deadline();
        for at in [self.nack.next_process_time(), self.feedback.next_send_time()]
            .into_iter()
            .flatten()
        {
            deadline = deadline.min(at);
        }
        deadline
    }

    fn send(&self, packet: &RtcpPacket) {
        if let Err(e) = self.transport.send_bytes(&packet.to_bytes()) {
            tracing::warn!("Failed to send RTCP: {}", e);
        }
    }

    pub fn stats(&self) -> ReceiveStreamStats {
        ReceiveStreamStats {
            missing_packets: self.nack.missing_count(),
            cumulative_lost: self.statistics.cumulative_lost(),
            jitter: self.statistics.jitter(),
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{RecordingEvents, SessionEvent};
    use bytes::Bytes;
    use crossbeam::channel::{bounded, Receiver};
    use rdt_io::LoopbackTransport;
    use rdt_protocol::packet::HeaderExtension;
    use rdt_protocol::packetizer::{PayloadFormat, Packetizer};
    use rdt_protocol::sequence::SeqNumber;

    struct Fixture {
        stream: ReceiveStream,
        peer: LoopbackTransport,
        events: Arc<RecordingEvents>,
        frames: Receiver<ReassembledFrame>,
        packetizer: Packetizer,
        config: SessionConfig,
        now: Instant,
        transport_seq: u16,
    }

    impl Fixture {
        fn new() -> Self {
            let config = SessionConfig::default();
            let (local, peer) = LoopbackTransport::pair();
            let events = Arc::new(RecordingEvents::new());
            let (tx, rx) = bounded(16);
            let now = Instant::now();
            let stream = ReceiveStream::new(&config, Arc::new(local), events.clone(), tx, now);
            let packetizer = Packetizer::new(
                config.remote_ssrc,
                96,
                PayloadFormat::Generic,
                1000,
                SeqNumber::new(100),
            );
            Fixture {
                stream,
                peer,
                events,
                frames: rx,
                packetizer,
                config,
                now,
                transport_seq: 0,
            }
        }

        fn frame(&mut self, size: usize, timestamp: u32) -> Vec<RtpPacket> {
            let unit = Bytes::from(vec![timestamp as u8; size]);
            let mut packets = self.packetizer.packetize(&unit, timestamp, true).unwrap();
            for packet in &mut packets {
                let seq = self.transport_seq.to_be_bytes();
                self.transport_seq = self.transport_seq.wrapping_add(1);
                packet.header.extension = Some(HeaderExtension::one_byte(&[(
                    self.config.transport_seq_extension_id,
                    &seq[..],
                )]));
            }
            packets
        }

        fn rtcp(&self) -> Vec<RtcpPacket> {
            let mut out = Vec::new();
            let mut buf = [0u8; 2048];
            while let Ok(Some(n)) = self.peer.recv_bytes(&mut buf, Duration::ZERO) {
                out.extend(RtcpPacket::parse_compound(&buf[..n]).unwrap());
            }
            out
        }
    }

    #[test]
    fn test_in_order_frame_delivered() {
        let mut f = Fixture::new();
        let now = f.now;
        for packet in f.frame(2500, 3000) {
            f.stream.on_rtp(&packet, now);
        }
        let frame = f.frames.try_recv().unwrap();
        assert_eq!(frame.data, Bytes::from(vec![3000u32 as u8; 2500]));
        assert_eq!(
            f.events.take(),
            vec![SessionEvent::Frame {
                timestamp: 3000,
                size: 2500,
                keyframe: true
            }]
        );
        assert_eq!(f.stream.stats().frames_received, 1);
    }

    #[test]
    fn test_gap_is_nacked_and_recovered() {
        let mut f = Fixture::new();
        let now = f.now;
        let packets = f.frame(2500, 3000);
        assert_eq!(packets.len(), 3);
        f.stream.on_rtp(&packets[0], now);
        f.stream.on_rtp(&packets[2], now);
        assert!(f.frames.try_recv().is_err());

        f.stream.process(now);
        let nacks: Vec<_> = f
            .rtcp()
            .into_iter()
            .filter_map(|p| match p {
                RtcpPacket::Nack(n) => Some(n),
                _ => None,
            })
            .collect();
        assert_eq!(nacks.len(), 1);
        assert_eq!(nacks[0].lost, vec![packets[1].seq_number()]);
        assert_eq!(nacks[0].media_ssrc, f.config.remote_ssrc);

        // The retransmission completes the frame
        f.stream.on_rtp(&packets[1], now + Duration::from_millis(30));
        assert_eq!(f.frames.try_recv().unwrap().size(), 2500);
        assert_eq!(f.stream.stats().missing_packets, 0);
    }

    #[test]
    fn test_feedback_emitted() {
        let mut f = Fixture::new();
        let now = f.now;
        for packet in f.frame(500, 3000) {
            f.stream.on_rtp(&packet, now);
        }
        f.stream.process(now);
        let feedback = f
            .rtcp()
            .into_iter()
            .filter(|p| matches!(p, RtcpPacket::TransportFeedback(_)))
            .count();
        assert_eq!(feedback, 1);
        assert_eq!(f.stream.stats().feedback_sent, 1);
    }

    #[test]
    fn test_unknown_ssrc_ignored() {
        let mut f = Fixture::new();
        let header = rdt_protocol::packet::RtpHeader::new(96, SeqNumber::new(1), 0, 0xBAD);
        f.stream
            .on_rtp(&RtpPacket::new(header, Bytes::from_static(b"\x80x")), f.now);
        assert_eq!(f.stream.stats().unknown_ssrc, 1);
        assert_eq!(f.stream.stats().packets_received, 0);
    }

    #[test]
    fn test_keyframe_requests_throttled() {
        let mut f = Fixture::new();
        let now = f.now;
        f.stream.request_keyframe(now);
        f.stream.request_keyframe(now + Duration::from_millis(50));
        f.stream.request_keyframe(now + Duration::from_millis(250));
        let plis = f
            .rtcp()
            .into_iter()
            .filter(|p| matches!(p, RtcpPacket::Pli(_)))
            .count();
        assert_eq!(plis, 2);
    }

    #[test]
    fn test_receiver_report_after_interval() {
        let mut f = Fixture::new();
        let now = f.now;
        for packet in f.frame(500, 3000) {
            f.stream.on_rtp(&packet, now);
        }
        f.stream.process(now + f.config.report_interval);
        assert!(f.rtcp().iter().any(|p| matches!(
            p,
            RtcpPacket::ReceiverReport(rr) if rr.blocks[0].ssrc == f.config.remote_ssrc
        )));
    }
}
