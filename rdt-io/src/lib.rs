//! RDT I/O and Platform Abstraction
//!
//! This crate provides the datagram transports, timing utilities and the
//! worker/queue primitives the session runtime is built on.

pub mod loopback;
pub mod socket;
pub mod time;
pub mod worker;

pub use loopback::{DropFilter, LoopbackTransport};
pub use socket::{DatagramTransport, SocketError, UdpTransport};
pub use time::{NtpClock, NtpTime, Timer};
pub use worker::{StopFlag, WorkQueue, Worker};
