//! Session configuration

use crate::session::SessionError;
use rdt_protocol::congestion::NetworkControllerConfig;
use rdt_protocol::nack::NackConfig;
use rdt_protocol::pacer::PacerConfig;
use rdt_protocol::packet::{DEFAULT_TRANSPORT_SEQ_EXTENSION_ID, MAX_PAYLOAD_SIZE};
use rdt_protocol::packetizer::PayloadFormat;
use rdt_protocol::reassembly::ReassemblerConfig;
use rdt_protocol::rtcp::{FeedbackConfig, FeedbackFormat};
use std::time::Duration;

/// Smallest payload budget that still leaves room for data after the
/// payload descriptor
const MIN_PAYLOAD_LEN: usize = 16;

/// Everything a session needs to know up front
///
/// Stream ids come from the session layer; each peer sends on `local_ssrc`
/// and receives `remote_ssrc`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub local_ssrc: u32,
    pub remote_ssrc: u32,
    /// Run the send half
    pub send: bool,
    /// Run the receive half
    pub receive: bool,
    pub payload_type: u8,
    pub payload_format: PayloadFormat,
    /// Media clock rate in Hz
    pub clock_rate: u32,
    /// Per-packet payload budget
    pub max_payload_len: usize,
    /// One-byte header extension id of the transport-wide sequence number
    pub transport_seq_extension_id: u8,
    pub feedback_format: FeedbackFormat,
    /// RTT the receive side assumes when pacing NACKs
    pub assumed_rtt: Duration,
    /// Upper bound on the processing thread's sleep
    pub process_interval: Duration,
    /// Sender/receiver report cadence
    pub report_interval: Duration,
    /// Sent packets kept for retransmission
    pub retransmission_history: usize,
    /// Reassembled frames buffered for the consumer
    pub frame_queue_capacity: usize,
    pub nack: NackConfig,
    pub reassembly: ReassemblerConfig,
    pub pacer: PacerConfig,
    pub congestion: NetworkControllerConfig,
    pub feedback: FeedbackConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            local_ssrc: 0x5244_5401,
            remote_ssrc: 0x5244_5402,
            send: true,
            receive: true,
            payload_type: 96,
            payload_format: PayloadFormat::Generic,
            clock_rate: 90_000,
            max_payload_len: MAX_PAYLOAD_SIZE,
            transport_seq_extension_id: DEFAULT_TRANSPORT_SEQ_EXTENSION_ID,
            feedback_format: FeedbackFormat::TransportWide,
            assumed_rtt: Duration::from_millis(100),
            process_interval: Duration::from_millis(5),
            report_interval: Duration::from_secs(1),
            retransmission_history: 2048,
            frame_queue_capacity: 64,
            nack: NackConfig::default(),
            reassembly: ReassemblerConfig::default(),
            pacer: PacerConfig::default(),
            congestion: NetworkControllerConfig::default(),
            feedback: FeedbackConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Swap the stream ids, giving the configuration of the other peer
    pub fn mirrored(&self) -> Self {
        SessionConfig {
            local_ssrc: self.remote_ssrc,
            remote_ssrc: self.local_ssrc,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if !self.send && !self.receive {
            return Err(SessionError::InvalidConfig(
                "neither send nor receive is enabled".into(),
            ));
        }
        if self.send && self.receive && self.local_ssrc == self.remote_ssrc {
            return Err(SessionError::InvalidConfig(format!(
                "local and remote stream ids are both {:#x}",
                self.local_ssrc
            )));
        }
        if !(1..=14).contains(&self.transport_seq_extension_id) {
            return Err(SessionError::InvalidConfig(format!(
                "extension id {} outside 1..=14",
                self.transport_seq_extension_id
            )));
        }
        if self.max_payload_len < MIN_PAYLOAD_LEN {
            return Err(SessionError::InvalidConfig(format!(
                "payload budget {} below {}",
                self.max_payload_len, MIN_PAYLOAD_LEN
            )));
        }
        if self.payload_type > 127 {
            return Err(SessionError::InvalidConfig(format!(
                "payload type {} does not fit 7 bits",
                self.payload_type
            )));
        }
        let c = &self.congestion;
        if c.min_rate > c.max_rate || c.start_rate < c.min_rate || c.start_rate > c.max_rate {
            return Err(SessionError::InvalidConfig(format!(
                "rates must satisfy min {} <= start {} <= max {}",
                c.min_rate, c.start_rate, c.max_rate
            )));
        }
        if self.clock_rate == 0 || self.process_interval.is_zero() {
            return Err(SessionError::InvalidConfig(
                "clock rate and process interval must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Reassembler settings with the session's payload format applied
    pub(crate) fn reassembler_config(&self) -> ReassemblerConfig {
        ReassemblerConfig {
            format: self.payload_format,
            ..self.reassembly.clone()
        }
    }

    /// Feedback generator settings for reporting on `remote_ssrc`
    pub(crate) fn feedback_config(&self) -> FeedbackConfig {
        FeedbackConfig {
            format: self.feedback_format,
            sender_ssrc: self.local_ssrc,
            media_ssrc: self.remote_ssrc,
            ..self.feedback.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdt_protocol::rate::DataRate;

    #[test]
    fn test_default_is_valid() {
        SessionConfig::default().validate().unwrap();
    }

    #[test]
    fn test_mirrored_swaps_ssrcs() {
        let config = SessionConfig::default();
        let other = config.mirrored();
        assert_eq!(other.local_ssrc, config.remote_ssrc);
        assert_eq!(other.remote_ssrc, config.local_ssrc);
    }

    #[test]
    fn test_invalid_configs() {
        let mut config = SessionConfig::default();
        config.remote_ssrc = config.local_ssrc;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.transport_seq_extension_id = 15;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.congestion.start_rate = DataRate::from_kbps(1);
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.send = false;
        config.receive = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_configs() {
        let config = SessionConfig {
            payload_format: PayloadFormat::Av1,
            feedback_format: FeedbackFormat::Congestion,
            ..Default::default()
        };
        assert_eq!(config.reassembler_config().format, PayloadFormat::Av1);
        let feedback = config.feedback_config();
        assert_eq!(feedback.format, FeedbackFormat::Congestion);
        assert_eq!(feedback.media_ssrc, config.remote_ssrc);
        assert_eq!(feedback.sender_ssrc, config.local_ssrc);
    }
}
