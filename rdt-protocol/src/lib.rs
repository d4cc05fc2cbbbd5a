//! Real-time transport protocol core
//!
//! This crate implements the sans-IO half of the remote-desktop transport:
//! RTP packets and payload formats, frame reassembly, NACK scheduling, the
//! RTCP feedback channel, congestion control and send pacing. Nothing here
//! touches sockets or clocks; callers pass in the current `Instant`.

pub mod congestion;
pub mod feedback;
pub mod frame;
pub mod nack;
pub mod obu;
pub mod pacer;
pub mod packet;
pub mod packetizer;
pub mod rate;
pub mod reassembly;
pub mod rtcp;
pub mod sequence;

pub use congestion::{
    BandwidthUsage, NetworkControlUpdate, NetworkController, NetworkControllerConfig,
    NetworkStateEstimate, PacerRates, ProbeClusterConfig,
};
pub use feedback::{PacketFeedback, SendHistory, SentPacket};
pub use frame::{FrameBuffer, ReassembledFrame};
pub use nack::{NackBatch, NackConfig, NackScheduler, NackStats};
pub use obu::{Obu, ObuError, ObuType};
pub use pacer::{PacerConfig, PacerStats, PacingController, PacketSender, Priority};
pub use packet::{HeaderExtension, PacketError, RtpHeader, RtpPacket};
pub use packetizer::{PacketizeError, Packetizer, PayloadFormat};
pub use rate::DataRate;
pub use reassembly::{FrameReassembler, InsertOutcome, ReassemblerConfig, ReassemblyStats};
pub use rtcp::{FeedbackConfig, FeedbackFormat, FeedbackGenerator, RtcpError, RtcpPacket, RttEstimator};
pub use sequence::{SeqNumber, SeqUnwrapper, TimestampUnwrapper};
