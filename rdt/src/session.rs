//! Session runtime
//!
//! `SessionCore` owns both stream halves and is driven with explicit
//! timestamps, so tests can run two peers on simulated time. `Session` wraps
//! a core in two threads: one blocks on the transport and forwards datagrams,
//! the other sleeps until work arrives or the core's next deadline and then
//! runs it. All protocol state lives on the processing thread.

use crate::codec::EncodedUnit;
use crate::config::SessionConfig;
use crate::events::SessionEvents;
use crate::receive_stream::{ReceiveStream, ReceiveStreamStats};
use crate::send_stream::{SendStream, SendStreamStats};
use bytes::Bytes;
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use rdt_io::worker::DEFAULT_POLL_INTERVAL;
use rdt_io::{DatagramTransport, StopFlag, WorkQueue, Worker};
use rdt_protocol::frame::ReassembledFrame;
use rdt_protocol::pacer::ProcessScheduler;
use rdt_protocol::packet::{is_rtcp, PacketError, RtpPacket};
use rdt_protocol::packetizer::PacketizeError;
use rdt_protocol::rate::DataRate;
use rdt_protocol::rtcp::RtcpPacket;
use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use thiserror::Error;

/// Largest datagram the receive thread accepts
const RECV_BUFFER_SIZE: usize = 2048;

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Packetization failed: {0}")]
    Packetize(#[from] PacketizeError),

    #[error("Session has no send half")]
    SendDisabled,

    #[error("Session stopped")]
    Stopped,
}

/// Work item for the processing thread
#[derive(Debug)]
pub enum Command {
    /// A datagram arrived at `at`
    Datagram { data: Bytes, at: Instant },
    SendFrame(EncodedUnit),
    RequestKeyframe,
    SetNetworkAvailable(bool),
    SetMaxAllocatedBitrate(DataRate),
    /// External upper bound on the link capacity
    SetLinkCapacity(Option<DataRate>),
}

/// Snapshot of both halves plus datagram-level counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionStats {
    pub send: Option<SendStreamStats>,
    pub receive: Option<ReceiveStreamStats>,
    pub malformed_rtp: u64,
    pub malformed_rtcp: u64,
    /// Frames the send half refused to packetize
    pub frames_rejected: u64,
}

/// Both stream halves, driven by the caller's clock
pub struct SessionCore {
    send: Option<SendStream>,
    receive: Option<ReceiveStream>,
    malformed_rtp: u64,
    malformed_rtcp: u64,
    frames_rejected: u64,
}

impl SessionCore {
    pub fn new(
        config: &SessionConfig,
        transport: Arc<dyn DatagramTransport>,
        events: Arc<dyn SessionEvents>,
        frames: Sender<ReassembledFrame>,
        now: Instant,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let send = config
            .send
            .then(|| SendStream::new(config, transport.clone(), events.clone(), now));
        let receive = config
            .receive
            .then(|| ReceiveStream::new(config, transport, events, frames, now));
        tracing::info!(
            "Session created: local ssrc={:#x} remote ssrc={:#x}",
            config.local_ssrc,
            config.remote_ssrc
        );
        Ok(SessionCore {
            send,
            receive,
            malformed_rtp: 0,
            malformed_rtcp: 0,
            frames_rejected: 0,
        })
    }

    /// Apply one command
    pub fn handle(&mut self, command: Command, now: Instant) -> Result<(), SessionError> {
        match command {
            Command::Datagram { data, at } => self.on_datagram_bytes(data, at),
            Command::SendFrame(unit) => self.send_frame(&unit, now)?,
            Command::RequestKeyframe => {
                if let Some(receive) = self.receive.as_mut() {
                    receive.request_keyframe(now);
                }
            }
            Command::SetNetworkAvailable(available) => {
                if let Some(send) = self.send.as_mut() {
                    send.set_network_available(available, now);
                }
            }
            Command::SetMaxAllocatedBitrate(rate) => {
                if let Some(send) = self.send.as_mut() {
                    send.set_max_allocated_bitrate(rate, now);
                }
            }
            Command::SetLinkCapacity(capacity) => {
                if let Some(send) = self.send.as_mut() {
                    send.set_link_capacity(capacity);
                }
            }
        }
        Ok(())
    }

    /// Route one datagram to the RTP or RTCP path
    pub fn on_datagram(&mut self, data: &[u8], now: Instant) {
        if is_rtcp(data) {
            self.on_rtcp(data, now);
        } else {
            self.on_rtp(RtpPacket::parse(data), data.len(), now);
        }
    }

    /// Like `on_datagram`, but media payloads share `data` instead of copying it
    pub fn on_datagram_bytes(&mut self, data: Bytes, now: Instant) {
        if is_rtcp(&data) {
            self.on_rtcp(&data, now);
        } else {
            let len = data.len();
            self.on_rtp(RtpPacket::from_bytes(data), len, now);
        }
    }

    fn on_rtcp(&mut self, data: &[u8], now: Instant) {
        match RtcpPacket::parse_compound(data) {
            Ok(packets) => {
                for packet in &packets {
                    if let Some(send) = self.send.as_mut() {
                        send.on_rtcp(packet, now);
                    }
                    if let Some(receive) = self.receive.as_mut() {
                        receive.on_rtcp(packet, now);
                    }
                }
            }
            Err(e) => {
                self.malformed_rtcp += 1;
                tracing::debug!("Dropping malformed RTCP ({} bytes): {}", data.len(), e);
            }
        }
    }

    fn on_rtp(&mut self, parsed: Result<RtpPacket, PacketError>, len: usize, now: Instant) {
        match parsed {
            Ok(packet) => {
                if let Some(receive) = self.receive.as_mut() {
                    receive.on_rtp(&packet, now);
                }
            }
            Err(e) => {
                self.malformed_rtp += 1;
                tracing::debug!("Dropping malformed RTP ({} bytes): {}", len, e);
            }
        }
    }

    pub fn send_frame(&mut self, unit: &EncodedUnit, now: Instant) -> Result<(), SessionError> {
        let send = self.send.as_mut().ok_or(SessionError::SendDisabled)?;
        if let Err(e) = send.send_frame(unit, now) {
            self.frames_rejected += 1;
            return Err(e.into());
        }
        Ok(())
    }

    pub fn process(&mut self, now: Instant) {
        if let Some(receive) = self.receive.as_mut() {
            receive.process(now);
        }
        if let Some(send) = self.send.as_mut() {
            send.process(now);
        }
    }

    /// Earliest time either half has work to do
    pub fn next_deadline(&mut self, now: Instant) -> Instant {
        let send = self.send.as_mut().map(|send| send.next_deadline(now));
        let receive = self.receive.as_ref().map(ReceiveStream::next_deadline);
        match (send, receive) {
            (Some(a), Some(b)) => a.min(b),
            (Some(at), None) | (None, Some(at)) => at,
            (None, None) => now,
        }
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            send: self.send.as_ref().map(SendStream::stats),
            receive: self.receive.as_ref().map(ReceiveStream::stats),
            malformed_rtp: self.malformed_rtp,
            malformed_rtcp: self.malformed_rtcp,
            frames_rejected: self.frames_rejected,
        }
    }
}

/// A running session
pub struct Session {
    queue: Arc<WorkQueue<Command>>,
    frames: Receiver<ReassembledFrame>,
    stats: Arc<Mutex<SessionStats>>,
    receiver: Option<Worker>,
    processor: Option<Worker>,
}

impl Session {
    /// Validate `config` and start the receive and processing threads
    pub fn start(
        config: SessionConfig,
        transport: Arc<dyn DatagramTransport>,
        events: Arc<dyn SessionEvents>,
    ) -> Result<Self, SessionError> {
        let (frames_tx, frames_rx) = bounded(config.frame_queue_capacity.max(1));
        let mut core =
            SessionCore::new(&config, transport.clone(), events, frames_tx, Instant::now())?;

        let queue = Arc::new(WorkQueue::new());
        let stats = Arc::new(Mutex::new(core.stats()));

        let inbox = queue.clone();
        let receiver = Worker::spawn("rdt-recv", move |stop| {
            receive_loop(transport.as_ref(), &inbox, &stop)
        })?;

        let inbox = queue.clone();
        let snapshot = stats.clone();
        let tick = config.process_interval;
        let processor = Worker::spawn("rdt-process", move |stop| {
            let mut scheduler = ProcessScheduler::new();
            while !stop.is_stopped() {
                let now = Instant::now();
                scheduler.request(core.next_deadline(now));
                let wake = scheduler.next_time().map_or(now + tick, |at| at.min(now + tick));

                let commands = inbox.wait_drain(wake);
                let now = Instant::now();
                let had_work = !commands.is_empty();
                for command in commands {
                    if let Err(e) = core.handle(command, now) {
                        tracing::warn!("Command failed: {}", e);
                    }
                }
                if scheduler.poll(now) || had_work {
                    core.process(now);
                }
                *snapshot.lock() = core.stats();

                if inbox.is_closed() {
                    break;
                }
            }
        })?;

        Ok(Session {
            queue,
            frames: frames_rx,
            stats,
            receiver: Some(receiver),
            processor: Some(processor),
        })
    }

    fn push(&self, command: Command) -> Result<(), SessionError> {
        if self.queue.push(command) {
            Ok(())
        } else {
            Err(SessionError::Stopped)
        }
    }

    /// Queue an encoded unit for sending
    pub fn send_frame(&self, unit: EncodedUnit) -> Result<(), SessionError> {
        self.push(Command::SendFrame(unit))
    }

    /// Completed frames from the peer
    pub fn frames(&self) -> &Receiver<ReassembledFrame> {
        &self.frames
    }

    /// Ask the peer for a keyframe
    pub fn request_keyframe(&self) -> Result<(), SessionError> {
        self.push(Command::RequestKeyframe)
    }

    pub fn set_network_available(&self, available: bool) -> Result<(), SessionError> {
        self.push(Command::SetNetworkAvailable(available))
    }

    pub fn set_max_allocated_bitrate(&self, rate: DataRate) -> Result<(), SessionError> {
        self.push(Command::SetMaxAllocatedBitrate(rate))
    }

    pub fn set_link_capacity(&self, capacity: Option<DataRate>) -> Result<(), SessionError> {
        self.push(Command::SetLinkCapacity(capacity))
    }

    /// Counters as of the last processing pass
    pub fn stats(&self) -> SessionStats {
        *self.stats.lock()
    }

    pub fn is_running(&self) -> bool {
        self.processor.as_ref().is_some_and(Worker::is_running)
    }

    /// Stop both threads; queued commands are dropped
    pub fn stop(&mut self) {
        self.queue.close();
        if let Some(mut processor) = self.processor.take() {
            processor.stop();
        }
        if let Some(mut receiver) = self.receiver.take() {
            receiver.stop();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(transport: &dyn DatagramTransport, inbox: &WorkQueue<Command>, stop: &StopFlag) {
    let mut buf = [0u8; RECV_BUFFER_SIZE];
    while !stop.is_stopped() {
        match transport.recv_bytes(&mut buf, DEFAULT_POLL_INTERVAL) {
            Ok(Some(n)) => {
                let command = Command::Datagram {
                    data: Bytes::copy_from_slice(&buf[..n]),
                    at: Instant::now(),
                };
                if !inbox.push(command) {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                tracing::debug!("Transport closed, receive thread exiting");
                break;
            }
            Err(e) => {
                // ICMP errors surface here on some platforms
                tracing::warn!("Receive failed: {}", e);
                thread::sleep(DEFAULT_POLL_INTERVAL);
            }
        }
    }
}
