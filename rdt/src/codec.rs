//! Encoder/decoder backends
//!
//! The transport treats codecs as opaque byte producers and consumers. A
//! backend is picked once, by name, when the `CodecFactory` is built; every
//! encoder and decoder it hands out afterwards comes from that backend.

use bytes::{BufMut, Bytes, BytesMut};
use rdt_protocol::obu::{parse_obus, Obu, ObuError, ObuType, OBU_HAS_SIZE_FLAG};
use rdt_protocol::packetizer::PayloadFormat;
use rdt_protocol::rate::DataRate;
use thiserror::Error;

/// Name of the built-in pass-through backend
pub const PASSTHROUGH_BACKEND: &str = "passthrough";

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unknown codec backend: {0}")]
    UnknownBackend(String),

    #[error("Codec not initialized")]
    NotInitialized,

    #[error("Frame is {actual} bytes, expected {expected} for {width}x{height}")]
    FrameSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Malformed encoded unit: {0}")]
    Malformed(#[from] ObuError),
}

/// Parameters fixed when a codec is initialized
#[derive(Debug, Clone)]
pub struct CodecSettings {
    pub width: u32,
    pub height: u32,
    /// Bytes per pixel of raw frames
    pub bytes_per_pixel: u32,
    pub frame_rate: u32,
    pub target_rate: DataRate,
    /// Force a keyframe every this many frames; 0 disables
    pub keyframe_interval: u32,
    /// Bitstream framing of encoded units
    pub payload_format: PayloadFormat,
}

impl Default for CodecSettings {
    fn default() -> Self {
        CodecSettings {
            width: 320,
            height: 180,
            bytes_per_pixel: 1,
            frame_rate: 30,
            target_rate: DataRate::from_kbps(300),
            keyframe_interval: 300,
            payload_format: PayloadFormat::Generic,
        }
    }
}

impl CodecSettings {
    /// Size of one raw frame
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_pixel as usize
    }
}

/// Uncompressed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    /// Media timestamp (90 kHz)
    pub timestamp: u32,
}

/// One unit of encoder output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedUnit {
    pub data: Bytes,
    pub timestamp: u32,
    pub keyframe: bool,
    pub width: u32,
    pub height: u32,
}

pub trait VideoEncoder: Send {
    fn name(&self) -> &str;

    fn init(&mut self, settings: &CodecSettings) -> Result<(), CodecError>;

    fn encode(&mut self, frame: &RawFrame) -> Result<Vec<EncodedUnit>, CodecError>;

    /// Make the next encoded unit a keyframe
    fn request_keyframe(&mut self);

    /// Follow the transport's target rate
    fn set_target_rate(&mut self, rate: DataRate);
}

pub trait VideoDecoder: Send {
    fn name(&self) -> &str;

    fn init(&mut self, settings: &CodecSettings) -> Result<(), CodecError>;

    /// Decode one unit; `Ok(None)` while the decoder waits for a keyframe
    fn decode(&mut self, unit: &EncodedUnit) -> Result<Option<RawFrame>, CodecError>;
}

/// Available backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecBackend {
    Passthrough,
}

impl CodecBackend {
    pub fn name(self) -> &'static str {
        match self {
            CodecBackend::Passthrough => PASSTHROUGH_BACKEND,
        }
    }
}

/// Hands out encoders and decoders from one backend
#[derive(Debug, Clone)]
pub struct CodecFactory {
    backend: CodecBackend,
}

impl CodecFactory {
    /// Pick the first available backend from `preferred`
    pub fn select(preferred: &[&str]) -> Result<Self, CodecError> {
        for name in preferred {
            if let Some(backend) = Self::lookup(name) {
                tracing::info!("Selected codec backend {}", backend.name());
                return Ok(CodecFactory { backend });
            }
            tracing::debug!("Codec backend {} unavailable", name);
        }
        Err(CodecError::UnknownBackend(preferred.join(",")))
    }

    pub fn new(backend: CodecBackend) -> Self {
        CodecFactory { backend }
    }

    fn lookup(name: &str) -> Option<CodecBackend> {
        match name {
            PASSTHROUGH_BACKEND => Some(CodecBackend::Passthrough),
            _ => None,
        }
    }

    pub fn backend(&self) -> CodecBackend {
        self.backend
    }

    pub fn create_encoder(&self, settings: &CodecSettings) -> Result<Box<dyn VideoEncoder>, CodecError> {
        let mut encoder: Box<dyn VideoEncoder> = match self.backend {
            CodecBackend::Passthrough => Box::new(PassthroughEncoder::new()),
        };
        encoder.init(settings)?;
        Ok(encoder)
    }

    pub fn create_decoder(&self, settings: &CodecSettings) -> Result<Box<dyn VideoDecoder>, CodecError> {
        let mut decoder: Box<dyn VideoDecoder> = match self.backend {
            CodecBackend::Passthrough => Box::new(PassthroughDecoder::new()),
        };
        decoder.init(settings)?;
        Ok(decoder)
    }
}

fn obu_header(obu_type: ObuType) -> u8 {
    (obu_type as u8) << 3 | OBU_HAS_SIZE_FLAG
}

/// Wrap raw bytes in an AV1-style temporal unit
///
/// Keyframes carry a sequence header ahead of the frame OBU so the receive
/// side can tell a new coded video sequence starts.
fn wrap_obus(data: &Bytes, keyframe: bool, settings: &CodecSettings) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + 32);
    let td = Obu {
        header: obu_header(ObuType::TemporalDelimiter),
        extension: None,
        payload: Bytes::new(),
        encoded_len: 0,
    };
    buf.put(td.to_bytes(true));
    if keyframe {
        let mut dims = BytesMut::with_capacity(8);
        dims.put_u32(settings.width);
        dims.put_u32(settings.height);
        let seq_header = Obu {
            header: obu_header(ObuType::SequenceHeader),
            extension: None,
            payload: dims.freeze(),
            encoded_len: 0,
        };
        buf.put(seq_header.to_bytes(true));
    }
    let frame = Obu {
        header: obu_header(ObuType::Frame),
        extension: None,
        payload: data.clone(),
        encoded_len: 0,
    };
    buf.put(frame.to_bytes(true));
    buf.freeze()
}

/// Encoder that forwards raw bytes unchanged
///
/// With the AV1 payload format the bytes are wrapped in OBUs so they travel
/// the AV1 packetization path.
pub struct PassthroughEncoder {
    settings: Option<CodecSettings>,
    frames: u64,
    keyframe_requested: bool,
}

impl PassthroughEncoder {
    pub fn new() -> Self {
        PassthroughEncoder {
            settings: None,
            frames: 0,
            keyframe_requested: true,
        }
    }
}

impl Default for PassthroughEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoder for PassthroughEncoder {
    fn name(&self) -> &str {
        PASSTHROUGH_BACKEND
    }

    fn init(&mut self, settings: &CodecSettings) -> Result<(), CodecError> {
        self.settings = Some(settings.clone());
        self.frames = 0;
        self.keyframe_requested = true;
        Ok(())
    }

    fn encode(&mut self, frame: &RawFrame) -> Result<Vec<EncodedUnit>, CodecError> {
        let settings = self.settings.as_ref().ok_or(CodecError::NotInitialized)?;
        let expected = settings.frame_size();
        if frame.data.len() != expected {
            return Err(CodecError::FrameSize {
                width: frame.width,
                height: frame.height,
                expected,
                actual: frame.data.len(),
            });
        }

        let periodic = settings.keyframe_interval > 0
            && self.frames % u64::from(settings.keyframe_interval) == 0;
        let keyframe = self.keyframe_requested || periodic;
        self.keyframe_requested = false;
        self.frames += 1;

        let data = match settings.payload_format {
            PayloadFormat::Av1 => wrap_obus(&frame.data, keyframe, settings),
            PayloadFormat::Generic | PayloadFormat::Raw => frame.data.clone(),
        };
        Ok(vec![EncodedUnit {
            data,
            timestamp: frame.timestamp,
            keyframe,
            width: frame.width,
            height: frame.height,
        }])
    }

    fn request_keyframe(&mut self) {
        self.keyframe_requested = true;
    }

    fn set_target_rate(&mut self, rate: DataRate) {
        if let Some(settings) = self.settings.as_mut() {
            settings.target_rate = rate;
        }
    }
}

/// Decoder matching `PassthroughEncoder`
pub struct PassthroughDecoder {
    settings: Option<CodecSettings>,
    seen_keyframe: bool,
}

impl PassthroughDecoder {
    pub fn new() -> Self {
        PassthroughDecoder {
            settings: None,
            seen_keyframe: false,
        }
    }
}

impl Default for PassthroughDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoDecoder for PassthroughDecoder {
    fn name(&self) -> &str {
        PASSTHROUGH_BACKEND
    }

    fn init(&mut self, settings: &CodecSettings) -> Result<(), CodecError> {
        self.settings = Some(settings.clone());
        self.seen_keyframe = false;
        Ok(())
    }

    fn decode(&mut self, unit: &EncodedUnit) -> Result<Option<RawFrame>, CodecError> {
        let settings = self.settings.as_ref().ok_or(CodecError::NotInitialized)?;
        if unit.keyframe {
            self.seen_keyframe = true;
        }
        if !self.seen_keyframe {
            return Ok(None);
        }

        let data = match settings.payload_format {
            PayloadFormat::Av1 => {
                let obus = parse_obus(&unit.data)?;
                let mut frame = BytesMut::new();
                for obu in obus
                    .iter()
                    .filter(|o| o.obu_type() == Some(ObuType::Frame))
                {
                    frame.put_slice(&obu.payload);
                }
                frame.freeze()
            }
            PayloadFormat::Generic | PayloadFormat::Raw => unit.data.clone(),
        };
        Ok(Some(RawFrame {
            data,
            width: unit.width,
            height: unit.height,
            timestamp: unit.timestamp,
        }))
    }
}
