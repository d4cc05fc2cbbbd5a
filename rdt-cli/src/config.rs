//! Configuration file support for the RDT command-line tools

use rdt::protocol::rtcp::FeedbackFormat;
use rdt::{DataRate, PayloadFormat, SessionConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Payload format as written in config files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    #[default]
    Generic,
    Av1,
    Raw,
}

impl From<PayloadKind> for PayloadFormat {
    fn from(kind: PayloadKind) -> Self {
        match kind {
            PayloadKind::Generic => PayloadFormat::Generic,
            PayloadKind::Av1 => PayloadFormat::Av1,
            PayloadKind::Raw => PayloadFormat::Raw,
        }
    }
}

/// Congestion feedback flavour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedbackKind {
    /// Transport-wide sequence numbers
    #[default]
    TransportWide,
    /// Per-stream congestion control feedback
    Congestion,
}

impl From<FeedbackKind> for FeedbackFormat {
    fn from(kind: FeedbackKind) -> Self {
        match kind {
            FeedbackKind::TransportWide => FeedbackFormat::TransportWide,
            FeedbackKind::Congestion => FeedbackFormat::Congestion,
        }
    }
}

/// Sender configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Local bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Receiver address
    pub peer: SocketAddr,
    #[serde(default = "default_sender_ssrc")]
    pub ssrc: u32,
    #[serde(default = "default_receiver_ssrc")]
    pub peer_ssrc: u32,
    /// Synthetic source width in pixels
    #[serde(default = "default_width")]
    pub width: u32,
    /// Synthetic source height in pixels
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    #[serde(default)]
    pub payload_format: PayloadKind,
    #[serde(default)]
    pub feedback: FeedbackKind,
    /// Maximum RTP payload size
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    #[serde(default = "default_min_rate")]
    pub min_rate_kbps: u64,
    #[serde(default = "default_start_rate")]
    pub start_rate_kbps: u64,
    #[serde(default = "default_max_rate")]
    pub max_rate_kbps: u64,
    /// Stop after this many seconds; run forever if absent
    pub duration_secs: Option<u64>,
    /// Statistics interval in seconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

/// Receiver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Listen address; the sender is learned from its first datagram
    pub listen: SocketAddr,
    #[serde(default = "default_receiver_ssrc")]
    pub ssrc: u32,
    #[serde(default = "default_sender_ssrc")]
    pub peer_ssrc: u32,
    #[serde(default)]
    pub payload_format: PayloadKind,
    #[serde(default)]
    pub feedback: FeedbackKind,
    /// Write received frames here ("-" for stdout); discard if absent
    pub output: Option<String>,
    /// Frames buffered between the session and the writer
    #[serde(default = "default_frame_queue")]
    pub frame_queue: usize,
    /// Statistics interval in seconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

fn default_sender_ssrc() -> u32 {
    0x5244_5401
}

fn default_receiver_ssrc() -> u32 {
    0x5244_5402
}

fn default_width() -> u32 {
    320
}

fn default_height() -> u32 {
    180
}

fn default_frame_rate() -> u32 {
    30
}

fn default_mtu() -> usize {
    1200
}

fn default_min_rate() -> u64 {
    30
}

fn default_start_rate() -> u64 {
    300
}

fn default_max_rate() -> u64 {
    20_000
}

fn default_frame_queue() -> usize {
    64
}

fn default_stats_interval() -> u64 {
    1
}

/// Combined configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Sender configuration
    pub sender: Option<SenderConfig>,
    /// Receiver configuration
    pub receiver: Option<ReceiverConfig>,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Create example sender configuration
    pub fn example_sender() -> Self {
        Config {
            sender: Some(SenderConfig {
                bind: default_bind(),
                peer: SocketAddr::from(([127, 0, 0, 1], 5004)),
                ssrc: default_sender_ssrc(),
                peer_ssrc: default_receiver_ssrc(),
                width: 640,
                height: 360,
                frame_rate: 30,
                payload_format: PayloadKind::Generic,
                feedback: FeedbackKind::TransportWide,
                mtu: default_mtu(),
                min_rate_kbps: default_min_rate(),
                start_rate_kbps: 1_000,
                max_rate_kbps: 8_000,
                duration_secs: Some(60),
                stats_interval_secs: 1,
            }),
            receiver: None,
        }
    }

    /// Create example receiver configuration
    pub fn example_receiver() -> Self {
        Config {
            sender: None,
            receiver: Some(ReceiverConfig {
                listen: SocketAddr::from(([0, 0, 0, 0], 5004)),
                ssrc: default_receiver_ssrc(),
                peer_ssrc: default_sender_ssrc(),
                payload_format: PayloadKind::Generic,
                feedback: FeedbackKind::TransportWide,
                output: None,
                frame_queue: default_frame_queue(),
                stats_interval_secs: 1,
            }),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<rdt::SessionError> for ConfigError {
    fn from(e: rdt::SessionError) -> Self {
        ConfigError::Invalid(e.to_string())
    }
}

impl SenderConfig {
    /// Get statistics interval as Duration
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_secs.map(Duration::from_secs)
    }

    /// Send-only session settings
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let mut config = SessionConfig {
            local_ssrc: self.ssrc,
            remote_ssrc: self.peer_ssrc,
            send: true,
            receive: false,
            payload_format: self.payload_format.into(),
            feedback_format: self.feedback.into(),
            max_payload_len: self.mtu,
            ..Default::default()
        };
        config.congestion.min_rate = DataRate::from_kbps(self.min_rate_kbps);
        config.congestion.start_rate = DataRate::from_kbps(self.start_rate_kbps);
        config.congestion.max_rate = DataRate::from_kbps(self.max_rate_kbps);
        if self.frame_rate == 0 {
            return Err(ConfigError::Invalid("frame rate must be non-zero".into()));
        }
        config.validate()?;
        Ok(config)
    }
}

impl ReceiverConfig {
    /// Get statistics interval as Duration
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }

    /// Receive-only session settings
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let config = SessionConfig {
            local_ssrc: self.ssrc,
            remote_ssrc: self.peer_ssrc,
            send: false,
            receive: true,
            payload_format: self.payload_format.into(),
            feedback_format: self.feedback.into(),
            frame_queue_capacity: self.frame_queue,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_configs() {
        let sender_config = Config::example_sender();
        assert!(sender_config.sender.is_some());

        let receiver_config = Config::example_receiver();
        assert!(receiver_config.receiver.is_some());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = Config::example_sender();
        let toml = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();

        let sender = parsed.sender.unwrap();
        assert_eq!(sender.start_rate_kbps, 1_000);
        assert_eq!(sender.payload_format, PayloadKind::Generic);
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let parsed: Config = toml::from_str(
            r#"
            [receiver]
            listen = "0.0.0.0:5004"
            feedback = "congestion"
            payload_format = "av1"
            "#,
        )
        .unwrap();
        let receiver = parsed.receiver.unwrap();
        assert_eq!(receiver.ssrc, default_receiver_ssrc());
        assert_eq!(receiver.frame_queue, 64);

        let session = receiver.session_config().unwrap();
        assert!(!session.send);
        assert_eq!(session.feedback_format, FeedbackFormat::Congestion);
        assert_eq!(session.payload_format, PayloadFormat::Av1);
    }

    #[test]
    fn test_sender_rates_mapped_and_checked() {
        let mut sender = Config::example_sender().sender.unwrap();
        let session = sender.session_config().unwrap();
        assert_eq!(session.congestion.start_rate, DataRate::from_kbps(1_000));
        assert!(session.send && !session.receive);

        sender.start_rate_kbps = 10;
        assert!(matches!(
            sender.session_config(),
            Err(ConfigError::Invalid(_))
        ));
    }
}
