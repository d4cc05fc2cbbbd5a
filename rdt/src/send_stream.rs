//! Send half of a session
//!
//! Encoded units are packetized and queued in the pacer. Packets leave
//! through `Wire`, which stamps the transport-wide sequence number, keeps
//! copies for retransmission and records them for feedback matching.
//! Feedback from the peer drives the network controller, whose output sets
//! the pacing rates, schedules probes and is reported as the target rate.

use crate::codec::EncodedUnit;
use crate::config::SessionConfig;
use crate::events::SessionEvents;
use rdt_io::{DatagramTransport, NtpClock, Timer};
use rdt_protocol::congestion::{NetworkControlUpdate, NetworkController, NetworkStateEstimate};
use rdt_protocol::feedback::{SendHistory, SentPacket};
use rdt_protocol::pacer::{PacingController, PacketSender, Priority};
use rdt_protocol::packet::{HeaderExtension, RtpPacket, HEADER_SIZE};
use rdt_protocol::packetizer::{PacketizeError, Packetizer};
use rdt_protocol::rate::DataRate;
use rdt_protocol::rtcp::{ReportBlock, RtcpPacket, RttEstimator, SenderReport};
use rdt_protocol::sequence::SeqNumber;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Largest padding a single packet can carry
const MAX_PADDING_PER_PACKET: usize = 255;
/// Cap on padding packets produced per request
const MAX_PADDING_PACKETS: usize = 16;

/// Send-side counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendStreamStats {
    pub frames_sent: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub padding_packets: u64,
    pub retransmissions: u64,
    pub nacks_received: u64,
    pub keyframe_requests: u64,
    pub send_errors: u64,
    pub packets_dropped: u64,
    pub target_rate: DataRate,
    pub pacing_rate: DataRate,
    pub rtt: Option<Duration>,
    pub queue_len: usize,
    pub in_flight_bytes: usize,
}

#[derive(Debug)]
struct StoredPacket {
    packet: RtpPacket,
    last_resent: Option<Instant>,
}

/// Recently sent media packets, by RTP sequence number
#[derive(Debug)]
struct RetransmissionStore {
    capacity: usize,
    packets: HashMap<u16, StoredPacket>,
    order: VecDeque<u16>,
}

impl RetransmissionStore {
    fn new(capacity: usize) -> Self {
        RetransmissionStore {
            capacity: capacity.max(1),
            packets: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    fn insert(&mut self, packet: &RtpPacket) {
        let key = packet.seq_number().as_raw();
        if self.packets.contains_key(&key) {
            return;
        }
        while self.order.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.packets.remove(&old);
            }
        }
        self.order.push_back(key);
        self.packets.insert(
            key,
            StoredPacket {
                packet: packet.clone(),
                last_resent: None,
            },
        );
    }

    /// Packet to resend, unless it was resent less than `min_interval` ago
    fn resend(&mut self, seq: SeqNumber, now: Instant, min_interval: Duration) -> Option<RtpPacket> {
        let stored = self.packets.get_mut(&seq.as_raw())?;
        if let Some(at) = stored.last_resent {
            if now.saturating_duration_since(at) < min_interval {
                return None;
            }
        }
        stored.last_resent = Some(now);
        Some(stored.packet.clone())
    }

    fn len(&self) -> usize {
        self.packets.len()
    }
}

/// Puts pacer output on the wire
struct Wire {
    transport: Arc<dyn DatagramTransport>,
    packetizer: Packetizer,
    extension_id: u8,
    transport_seq: SeqNumber,
    history: SendHistory,
    rtx: RetransmissionStore,
    /// Packets sent during the current pacer pass
    sent: Vec<SentPacket>,
    now: Instant,
    last_timestamp: u32,
    packets_sent: u64,
    bytes_sent: u64,
    padding_packets: u64,
    send_errors: u64,
}

impl PacketSender for Wire {
    fn send_packet(&mut self, mut packet: RtpPacket, probe_cluster_id: Option<u32>) {
        let transport_seq = self.transport_seq;
        self.transport_seq.increment();

        let is_padding = packet.payload.is_empty() && packet.padding_len > 0;
        if !is_padding {
            self.rtx.insert(&packet);
        }

        let seq_bytes = transport_seq.as_raw().to_be_bytes();
        packet.header.extension = Some(HeaderExtension::one_byte(&[(
            self.extension_id,
            &seq_bytes[..],
        )]));
        let bytes = packet.to_bytes();
        if let Err(e) = self.transport.send_bytes(&bytes) {
            tracing::warn!("Failed to send packet {}: {}", packet.seq_number(), e);
            self.send_errors += 1;
        }

        self.packets_sent += 1;
        self.bytes_sent += bytes.len() as u64;
        if is_padding {
            self.padding_packets += 1;
        }

        let sent = SentPacket {
            transport_seq,
            ssrc: packet.ssrc(),
            rtp_seq: packet.seq_number(),
            send_time: self.now,
            size: bytes.len(),
            probe_cluster_id,
            is_padding,
        };
        self.history.on_packet_sent(sent);
        self.sent.push(sent);
    }

    fn generate_padding(&mut self, size: usize) -> Vec<RtpPacket> {
        let mut packets = Vec::new();
        let mut remaining = size;
        while remaining > 0 && packets.len() < MAX_PADDING_PACKETS {
            let pad = remaining.min(MAX_PADDING_PER_PACKET);
            packets.push(self.packetizer.padding_packet(pad as u8, self.last_timestamp));
            remaining = remaining.saturating_sub(pad + HEADER_SIZE);
        }
        packets
    }
}

/// Send half of a session
pub struct SendStream {
    ssrc: u32,
    clock_rate: u32,
    pacer: PacingController,
    controller: NetworkController,
    wire: Wire,
    rtt: RttEstimator,
    ntp: NtpClock,
    report_timer: Timer,
    events: Arc<dyn SessionEvents>,
    target_rate: DataRate,
    last_frame_at: Option<Instant>,
    last_fir_seq: Option<u8>,
    frames_sent: u64,
    retransmissions: u64,
    nacks_received: u64,
    keyframe_requests: u64,
}

impl SendStream {
    pub fn new(
        config: &SessionConfig,
        transport: Arc<dyn DatagramTransport>,
        events: Arc<dyn SessionEvents>,
        now: Instant,
    ) -> Self {
        let packetizer = Packetizer::new(
            config.local_ssrc,
            config.payload_type,
            config.payload_format,
            config.max_payload_len,
            SeqNumber::new(config.local_ssrc as u16),
        );
        let wire = Wire {
            transport,
            packetizer,
            extension_id: config.transport_seq_extension_id,
            transport_seq: SeqNumber::new(0),
            history: SendHistory::default(),
            rtx: RetransmissionStore::new(config.retransmission_history),
            sent: Vec::new(),
            now,
            last_timestamp: 0,
            packets_sent: 0,
            bytes_sent: 0,
            padding_packets: 0,
            send_errors: 0,
        };

        let congestion = &config.congestion;
        let mut stream = SendStream {
            ssrc: config.local_ssrc,
            clock_rate: config.clock_rate,
            pacer: PacingController::new(config.pacer.clone()),
            controller: NetworkController::new(congestion.clone()),
            wire,
            rtt: RttEstimator::new(),
            ntp: NtpClock::new(),
            report_timer: Timer::new(config.report_interval, now),
            events,
            target_rate: congestion.start_rate,
            last_frame_at: None,
            last_fir_seq: None,
            frames_sent: 0,
            retransmissions: 0,
            nacks_received: 0,
            keyframe_requests: 0,
        };
        let update = stream.controller.set_bitrates(
            congestion.min_rate,
            Some(congestion.start_rate),
            congestion.max_rate,
            now,
        );
        stream.apply(update);
        stream
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn target_rate(&self) -> DataRate {
        self.target_rate
    }

    /// Packetize one encoded unit and queue it for pacing
    pub fn send_frame(&mut self, unit: &EncodedUnit, now: Instant) -> Result<(), PacketizeError> {
        let packets = self
            .wire
            .packetizer
            .packetize(&unit.data, unit.timestamp, unit.keyframe)?;
        let count = packets.len();
        for packet in packets {
            if let Err(e) = self.pacer.enqueue_packet(packet, Priority::Video, now) {
                tracing::warn!("Dropping video packet: {}", e);
            }
        }
        self.wire.last_timestamp = unit.timestamp;
        self.last_frame_at = Some(now);
        self.frames_sent += 1;
        tracing::trace!(
            "Queued frame ts={} ({} bytes, {} packets, keyframe={})",
            unit.timestamp,
            unit.data.len(),
            count,
            unit.keyframe
        );
        Ok(())
    }

    /// Handle one RTCP packet from the peer
    pub fn on_rtcp(&mut self, packet: &RtcpPacket, now: Instant) {
        match packet {
            RtcpPacket::TransportFeedback(feedback) => {
                let records = self.wire.history.on_transport_feedback(feedback, now);
                let update = self.controller.on_feedback(&records, now);
                self.apply(update);
            }
            RtcpPacket::CongestionFeedback(feedback) => {
                let records = self.wire.history.on_congestion_feedback(feedback, now);
                let update = self.controller.on_feedback(&records, now);
                self.apply(update);
            }
            RtcpPacket::ReceiverReport(report) => self.on_report_blocks(&report.blocks, now),
            RtcpPacket::SenderReport(report) => self.on_report_blocks(&report.blocks, now),
            RtcpPacket::Nack(nack) if nack.media_ssrc == self.ssrc => {
                self.nacks_received += 1;
                self.retransmit(&nack.lost, now);
            }
            RtcpPacket::Pli(pli) if pli.media_ssrc == self.ssrc => {
                self.on_keyframe_request();
            }
            RtcpPacket::Fir(fir) if fir.media_ssrc == self.ssrc => {
                // A repeated command number is a retransmitted request
                if self.last_fir_seq != Some(fir.command_seq) {
                    self.last_fir_seq = Some(fir.command_seq);
                    self.on_keyframe_request();
                }
            }
            _ => {}
        }
    }

    fn on_keyframe_request(&mut self) {
        self.keyframe_requests += 1;
        tracing::debug!("Keyframe requested for ssrc={:#x}", self.ssrc);
        self.events.on_keyframe_request();
    }

    fn on_report_blocks(&mut self, blocks: &[ReportBlock], now: Instant) {
        for block in blocks.iter().filter(|b| b.ssrc == self.ssrc) {
            let now_compact = self.ntp.compact_at(now);
            if let Some(sample) =
                RttEstimator::sample_from_report(now_compact, block.last_sr, block.delay_since_last_sr)
            {
                self.rtt.update(sample);
                self.controller.on_rtt_update(self.rtt.srtt());
                tracing::trace!("RTT sample {:?}, smoothed {:?}", sample, self.rtt.srtt());
            }
        }
    }

    fn retransmit(&mut self, seqs: &[SeqNumber], now: Instant) {
        // One retransmission per packet per round trip (100 ms until sampled)
        let min_interval = self.rtt.srtt();
        for seq in seqs {
            match self.wire.rtx.resend(*seq, now, min_interval) {
                Some(packet) => {
                    if let Err(e) = self.pacer.enqueue_packet(packet, Priority::Retransmission, now) {
                        tracing::warn!("Dropping retransmission of {}: {}", seq, e);
                    } else {
                        self.retransmissions += 1;
                    }
                }
                None => tracing::trace!("Packet {} not available for retransmission", seq),
            }
        }
    }

    /// Network availability changed; sending pauses while unavailable
    pub fn set_network_available(&mut self, available: bool, now: Instant) {
        if available {
            self.pacer.resume();
        } else {
            self.pacer.pause();
        }
        let update = self.controller.set_network_available(available, now);
        self.apply(update);
    }

    /// The application's total allocated rate changed
    pub fn set_max_allocated_bitrate(&mut self, rate: DataRate, now: Instant) {
        let update = self.controller.set_max_total_allocated_bitrate(rate, now);
        self.apply(update);
    }

    /// Upper bound on the link capacity from outside the feedback loop;
    /// `None` removes it
    pub fn set_link_capacity(&mut self, capacity: Option<DataRate>) {
        tracing::debug!("Link capacity hint {:?}", capacity);
        self.controller
            .set_network_state_estimate(capacity.map(|link_capacity_upper| NetworkStateEstimate {
                link_capacity_upper,
            }));
    }

    fn apply(&mut self, update: NetworkControlUpdate) {
        if let Some(rate) = update.target_rate {
            self.target_rate = rate;
            tracing::debug!("Target rate {}", rate);
            self.events.on_target_rate(rate);
        }
        if let Some(rates) = update.pacer {
            self.pacer.set_pacing_rates(rates.pacing_rate, rates.padding_rate);
        }
        for probe in update.probes {
            self.pacer.create_probe_cluster(probe);
        }
    }

    /// Run the controller tick, the pacer and the report timer
    pub fn process(&mut self, now: Instant) {
        let update = self.controller.on_process_interval(now);
        self.apply(update);

        self.wire.now = now;
        self.pacer.process_packets(now, &mut self.wire);
        for sent in self.wire.sent.drain(..) {
            self.controller.on_sent_packet(&sent);
        }

        if self.report_timer.try_fire(now) && self.wire.packets_sent > 0 {
            self.send_sender_report(now);
        }
    }

    fn send_sender_report(&mut self, now: Instant) {
        let rtp_timestamp = match self.last_frame_at {
            Some(at) => {
                let elapsed = now.saturating_duration_since(at);
                let ticks = elapsed.as_micros() * u128::from(self.clock_rate) / 1_000_000;
                self.wire.last_timestamp.wrapping_add(ticks as u32)
            }
            None => self.wire.last_timestamp,
        };
        let report = RtcpPacket::SenderReport(SenderReport {
            sender_ssrc: self.ssrc,
            ntp_timestamp: self.ntp.ntp_at(now).as_raw(),
            rtp_timestamp,
            packet_count: self.wire.packets_sent as u32,
            octet_count: self.wire.bytes_sent as u32,
            blocks: Vec::new(),
        });
        if let Err(e) = self.wire.transport.send_bytes(&report.to_bytes()) {
            tracing::warn!("Failed to send sender report: {}", e);
            self.wire.send_errors += 1;
        }
    }

    /// Earliest time `process` has work to do
    pub fn next_deadline(&mut self, now: Instant) -> Instant {
        let report = self.report_timer.deadline();
        match self.pacer.next_send_time(now) {
            Some(pacer) => pacer.min(report),
            None => report,
        }
    }

    pub fn stats(&self) -> SendStreamStats {
        let pacer = self.pacer.stats();
        SendStreamStats {
            frames_sent: self.frames_sent,
            packets_sent: self.wire.packets_sent,
            bytes_sent: self.wire.bytes_sent,
            padding_packets: self.wire.padding_packets,
            retransmissions: self.retransmissions,
            nacks_received: self.nacks_received,
            keyframe_requests: self.keyframe_requests,
            send_errors: self.wire.send_errors,
            packets_dropped: pacer.packets_dropped,
            target_rate: self.target_rate,
            pacing_rate: self.pacer.pacing_rate(),
            rtt: self.rtt.has_samples().then(|| self.rtt.srtt()),
            queue_len: self.pacer.queue_len(),
            in_flight_bytes: self.wire.history.in_flight_bytes(),
        }
    }

    /// Packets held for retransmission
    pub fn retransmission_buffer_len(&self) -> usize {
        self.wire.rtx.len()
    }
}
