//! Session event sink

use parking_lot::Mutex;
use rdt_protocol::frame::ReassembledFrame;
use rdt_protocol::rate::DataRate;

/// Receives notifications from a running session
///
/// Called from the session's processing thread; implementations should hand
/// work off rather than block.
pub trait SessionEvents: Send + Sync {
    /// A complete frame was reassembled
    fn on_frame(&self, _frame: &ReassembledFrame) {}

    /// The peer asked for a keyframe
    fn on_keyframe_request(&self) {}

    /// The congestion controller changed the target send rate
    fn on_target_rate(&self, _rate: DataRate) {}

    /// A frame was given up on; `timestamp` is its media timestamp
    fn on_frame_lost(&self, _timestamp: u32) {}
}

/// Ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl SessionEvents for NoopEvents {}

/// Event as recorded by `RecordingEvents`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Frame { timestamp: u32, size: usize, keyframe: bool },
    KeyframeRequest,
    TargetRate(DataRate),
    FrameLost(u32),
}

/// Keeps every event in memory, for tests and tooling
#[derive(Debug, Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the events recorded so far
    pub fn take(&self) -> Vec<SessionEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    fn push(&self, event: SessionEvent) {
        self.events.lock().push(event);
    }
}

impl SessionEvents for RecordingEvents {
    fn on_frame(&self, frame: &ReassembledFrame) {
        self.push(SessionEvent::Frame {
            timestamp: frame.timestamp,
            size: frame.size(),
            keyframe: frame.keyframe,
        });
    }

    fn on_keyframe_request(&self) {
        self.push(SessionEvent::KeyframeRequest);
    }

    fn on_target_rate(&self, rate: DataRate) {
        self.push(SessionEvent::TargetRate(rate));
    }

    fn on_frame_lost(&self, timestamp: u32) {
        self.push(SessionEvent::FrameLost(timestamp));
    }
}
