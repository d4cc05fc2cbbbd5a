//! RDT - real-time desktop transport
//!
//! Session-level API: configure a `SessionConfig`, hand `Session::start` a
//! datagram transport and an event sink, then push encoded frames in and
//! pull reassembled frames out.

pub mod codec;
pub mod config;
pub mod events;
pub mod receive_stream;
pub mod send_stream;
pub mod session;

pub use rdt_io as io;
pub use rdt_protocol as protocol;

// Re-export commonly used types
pub use codec::{
    CodecBackend, CodecError, CodecFactory, CodecSettings, EncodedUnit, RawFrame, VideoDecoder,
    VideoEncoder,
};
pub use config::SessionConfig;
pub use events::{NoopEvents, RecordingEvents, SessionEvent, SessionEvents};
pub use protocol::{DataRate, PayloadFormat, ReassembledFrame};
pub use receive_stream::{ReceiveStream, ReceiveStreamStats};
pub use send_stream::{SendStream, SendStreamStats};
pub use session::{Command, Session, SessionCore, SessionError, SessionStats};
