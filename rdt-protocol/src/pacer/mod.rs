//! Send pacing
//!
//! Packets leave in priority order at the pacing rate set by the network
//! controller, probe clusters are injected on top, and padding keeps the
//! estimate alive when there is no media.

pub mod controller;
pub mod prober;
pub mod queue;
pub mod scheduler;

pub use controller::{PacerConfig, PacerStats, PacingController, PacketSender};
pub use prober::{BitrateProber, ProbingState};
pub use queue::{PacketQueue, Priority, QueueError, QueuedPacket};
pub use scheduler::ProcessScheduler;
