//! Integration tests across the protocol components

use bytes::Bytes;
use rdt::{CodecFactory, CodecSettings, EncodedUnit, PayloadFormat, RawFrame};
use rdt_io::NtpClock;
use rdt_protocol::congestion::{NetworkController, NetworkControllerConfig, NetworkStateEstimate};
use rdt_protocol::feedback::PacketFeedback;
use rdt_protocol::packetizer::Packetizer;
use rdt_protocol::rate::DataRate;
use rdt_protocol::reassembly::{FrameReassembler, ReassemblerConfig};
use rdt_protocol::rtcp::{
    GenericNack, Pli, ReceiveStatistics, ReceiverReport, RtcpPacket, RttEstimator, SenderReport,
};
use rdt_protocol::sequence::SeqNumber;
use std::time::{Duration, Instant};

#[test]
fn test_rtcp_compound_roundtrip() {
    let packets = vec![
        RtcpPacket::SenderReport(SenderReport {
            sender_ssrc: 1,
            ntp_timestamp: 0x0123_4567_89AB_CDEF,
            rtp_timestamp: 90_000,
            packet_count: 10,
            octet_count: 12_000,
            blocks: vec![],
        }),
        RtcpPacket::Nack(GenericNack {
            sender_ssrc: 2,
            media_ssrc: 1,
            lost: vec![SeqNumber::new(65_534), SeqNumber::new(65_535), SeqNumber::new(3)],
        }),
        RtcpPacket::Pli(Pli {
            sender_ssrc: 2,
            media_ssrc: 1,
        }),
    ];

    let bytes = RtcpPacket::compound_to_bytes(&packets);
    let parsed = RtcpPacket::parse_compound(&bytes).unwrap();
    assert_eq!(parsed, packets);
}

#[test]
fn test_truncated_compound_rejected() {
    let bytes = RtcpPacket::Pli(Pli {
        sender_ssrc: 2,
        media_ssrc: 1,
    })
    .to_bytes();
    assert!(RtcpPacket::parse_compound(&bytes[..bytes.len() - 2]).is_err());
}

#[test]
fn test_report_exchange_measures_rtt() {
    let clock = NtpClock::new();
    let t0 = Instant::now();
    let one_way = Duration::from_millis(20);
    let hold = Duration::from_millis(50);

    let report = SenderReport {
        sender_ssrc: 7,
        ntp_timestamp: clock.ntp_at(t0).as_raw(),
        rtp_timestamp: 0,
        packet_count: 1,
        octet_count: 100,
        blocks: vec![],
    };

    let mut statistics = ReceiveStatistics::new(7, 90_000);
    statistics.on_packet(SeqNumber::new(1), 0, 100, t0);
    statistics.on_sender_report(&report, t0 + one_way);
    let block = statistics.report_block(t0 + one_way + hold).unwrap();
    let rr = ReceiverReport {
        sender_ssrc: 8,
        blocks: vec![block],
    };
    let parsed = RtcpPacket::parse_compound(&RtcpPacket::ReceiverReport(rr).to_bytes()).unwrap();
    let RtcpPacket::ReceiverReport(rr) = &parsed[0] else {
        panic!("expected receiver report, got {:?}", parsed[0]);
    };

    let arrival = t0 + one_way + hold + one_way;
    let sample = RttEstimator::sample_from_report(
        clock.compact_at(arrival),
        rr.blocks[0].last_sr,
        rr.blocks[0].delay_since_last_sr,
    )
    .unwrap();
    let expected = one_way * 2;
    let error = if sample > expected {
        sample - expected
    } else {
        expected - sample
    };
    assert!(error < Duration::from_millis(1), "rtt sample {:?}", sample);

    let mut rtt = RttEstimator::new();
    rtt.update(sample);
    assert!(rtt.has_samples());
    assert_eq!(rtt.latest(), Some(sample));
}

#[test]
fn test_av1_units_survive_transport() {
    let settings = CodecSettings {
        width: 32,
        height: 16,
        payload_format: PayloadFormat::Av1,
        ..Default::default()
    };
    let factory = CodecFactory::select(&["passthrough"]).unwrap();
    let mut encoder = factory.create_encoder(&settings).unwrap();
    let mut decoder = factory.create_decoder(&settings).unwrap();

    let mut packetizer = Packetizer::new(3, 45, PayloadFormat::Av1, 100, SeqNumber::new(65_500));
    let mut reassembler = FrameReassembler::new(
        3,
        ReassemblerConfig {
            format: PayloadFormat::Av1,
            ..Default::default()
        },
    );
    let now = Instant::now();

    for index in 0..4u32 {
        let raw = RawFrame {
            data: Bytes::from(vec![index as u8 + 1; settings.frame_size()]),
            width: settings.width,
            height: settings.height,
            timestamp: index * 3000,
        };
        let units = encoder.encode(&raw).unwrap();
        assert_eq!(units.len(), 1);

        let packets = packetizer
            .packetize(&units[0].data, units[0].timestamp, units[0].keyframe)
            .unwrap();
        let mut frames = Vec::new();
        for packet in &packets {
            frames.extend(reassembler.insert(packet, now).frames);
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].keyframe, index == 0);

        let decoded = decoder
            .decode(&EncodedUnit {
                data: frames[0].data.clone(),
                timestamp: frames[0].timestamp,
                keyframe: frames[0].keyframe,
                width: settings.width,
                height: settings.height,
            })
            .unwrap()
            .unwrap();
        assert_eq!(decoded.data, raw.data);
    }
}

/// Feedback for a link whose queue grows by `extra_ms` per 20 ms batch
struct SimulatedLink {
    base: Instant,
    seq: i64,
    send_ms: f64,
    queue_ms: f64,
}

impl SimulatedLink {
    fn new() -> Self {
        SimulatedLink {
            base: Instant::now(),
            seq: 0,
            send_ms: 0.0,
            queue_ms: 0.0,
        }
    }

    fn batch(&mut self, extra_ms: f64) -> (Vec<PacketFeedback>, Instant) {
        let mut out = Vec::new();
        for _ in 0..2 {
            let send = self.base + Duration::from_secs_f64(self.send_ms / 1000.0);
            let recv = send + Duration::from_secs_f64((40.0 + self.queue_ms) / 1000.0);
            out.push(PacketFeedback {
                ssrc: 1,
                sequence_number: self.seq,
                rtp_seq: SeqNumber::new(self.seq as u16),
                send_time: send,
                receive_time: Some(recv),
                size: 1000,
                probe_cluster_id: None,
            });
            self.seq += 1;
            self.send_ms += 10.0;
            self.queue_ms += extra_ms / 2.0;
        }
        let now = self.base + Duration::from_secs_f64((self.send_ms + 100.0) / 1000.0);
        (out, now)
    }
}

#[test]
fn test_controller_backs_off_on_growing_delay() {
    let mut controller = NetworkController::new(NetworkControllerConfig {
        start_rate: DataRate::from_kbps(1000),
        max_rate: DataRate::from_kbps(5000),
        ..Default::default()
    });
    let mut link = SimulatedLink::new();

    for _ in 0..20 {
        let (batch, now) = link.batch(0.0);
        controller.on_feedback(&batch, now);
    }
    let stable = controller.target_rate();
    assert!(stable >= DataRate::from_kbps(1000));

    let mut reported = Vec::new();
    for _ in 0..60 {
        let (batch, now) = link.batch(8.0);
        if let Some(rate) = controller.on_feedback(&batch, now).target_rate {
            reported.push(rate);
        }
    }

    assert!(!reported.is_empty());
    assert!(controller.target_rate() < stable);
    assert!(controller.target_rate() >= DataRate::from_kbps(30));
}

#[test]
fn test_controller_starts_with_exponential_probes() {
    let mut controller = NetworkController::new(NetworkControllerConfig::default());
    let update = controller.set_bitrates(
        DataRate::from_kbps(100),
        Some(DataRate::from_kbps(300)),
        DataRate::from_kbps(5000),
        Instant::now(),
    );

    assert_eq!(update.target_rate, Some(DataRate::from_kbps(300)));
    let probes: Vec<DataRate> = update.probes.iter().map(|p| p.target_rate).collect();
    assert_eq!(probes, vec![DataRate::from_kbps(900), DataRate::from_kbps(1800)]);
    assert!(update.pacer.is_some());
}

#[test]
fn test_link_capacity_hint_bounds_target() {
    let mut controller = NetworkController::new(NetworkControllerConfig {
        start_rate: DataRate::from_kbps(300),
        max_rate: DataRate::from_kbps(5000),
        ..Default::default()
    });
    controller.set_network_state_estimate(Some(NetworkStateEstimate {
        link_capacity_upper: DataRate::from_kbps(350),
    }));
    let mut link = SimulatedLink::new();

    for _ in 0..200 {
        let (batch, now) = link.batch(0.0);
        controller.on_feedback(&batch, now);
        controller.on_process_interval(now);
    }
    assert!(controller.target_rate() <= DataRate::from_kbps(350));
}
