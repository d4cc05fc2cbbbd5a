//! In-process datagram transport
//!
//! A connected pair of endpoints backed by `crossbeam` channels. Each
//! direction can carry a drop filter, which makes loss and reordering
//! scenarios reproducible without a real network.

use crate::socket::DatagramTransport;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Returns `true` for datagrams that should be dropped
pub type DropFilter = Box<dyn FnMut(&[u8]) -> bool + Send>;

/// One end of a loopback pair
pub struct LoopbackTransport {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    filter: Mutex<Option<DropFilter>>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl LoopbackTransport {
    /// Create two connected endpoints
    pub fn pair() -> (LoopbackTransport, LoopbackTransport) {
        let (a_tx, b_rx) = channel::unbounded();
        let (b_tx, a_rx) = channel::unbounded();
        (Self::new(a_tx, a_rx), Self::new(b_tx, b_rx))
    }

    fn new(tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>) -> Self {
        LoopbackTransport {
            tx,
            rx,
            filter: Mutex::new(None),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Drop outgoing datagrams matching `filter`
    pub fn set_drop_filter(&self, filter: DropFilter) {
        *self.filter.lock() = Some(filter);
    }

    pub fn clear_drop_filter(&self) {
        *self.filter.lock() = None;
    }

    /// Datagrams handed to the peer
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Datagrams discarded by the drop filter
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl DatagramTransport for LoopbackTransport {
    fn send_bytes(&self, buf: &[u8]) -> io::Result<usize> {
        if let Some(filter) = self.filter.lock().as_mut() {
            if filter(buf) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(buf.len());
            }
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "loopback peer closed"))?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(buf.len())
    }

    fn recv_bytes(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        match self.rx.recv_timeout(timeout) {
            Ok(datagram) => {
                // Truncate like a UDP socket would
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(Some(n))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                ErrorKind::BrokenPipe,
                "loopback peer closed",
            )),
        }
    }
}
