//! UDP datagram transport
//!
//! The transport core only needs to push whole datagrams to one peer and pull
//! datagrams back with a bounded wait. `DatagramTransport` captures that, and
//! `UdpTransport` implements it over a `socket2`-configured UDP socket.

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use thiserror::Error;

/// Socket configuration errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid socket address")]
    InvalidAddress,

    #[error("No peer address; connect first or wait for the peer to send")]
    NoPeer,
}

/// A datagram path to a single peer
///
/// Implementations are shared between the receive thread and the processing
/// thread, so both calls take `&self`.
pub trait DatagramTransport: Send + Sync {
    /// Send one datagram to the peer
    fn send_bytes(&self, buf: &[u8]) -> io::Result<usize>;

    /// Receive one datagram, waiting at most `timeout`
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    fn recv_bytes(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;
}

impl<T: DatagramTransport + ?Sized> DatagramTransport for std::sync::Arc<T> {
    fn send_bytes(&self, buf: &[u8]) -> io::Result<usize> {
        (**self).send_bytes(buf)
    }

    fn recv_bytes(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        (**self).recv_bytes(buf, timeout)
    }
}

/// UDP transport bound to a local address
///
/// The peer is either set up front with `connect` or latched from the first
/// datagram received, after which datagrams from other sources are ignored.
pub struct UdpTransport {
    socket: UdpSocket,
    peer: Mutex<Option<SocketAddr>>,
}

impl UdpTransport {
    /// Create a transport bound to the given address
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;

        tracing::debug!("UDP transport bound to {}", addr);

        Ok(UdpTransport {
            socket: socket.into(),
            peer: Mutex::new(None),
        })
    }

    /// Bind and set the peer in one step
    pub fn connect(local: SocketAddr, peer: SocketAddr) -> Result<Self, SocketError> {
        let transport = Self::bind(local)?;
        transport.set_peer(peer);
        Ok(transport)
    }

    /// Set or replace the peer address
    pub fn set_peer(&self, peer: SocketAddr) {
        *self.peer.lock() = Some(peer);
    }

    /// Current peer address, if known
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }

    /// Get the local address this socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.socket.local_addr()?)
    }

    /// Set the send buffer size
    pub fn set_send_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        SockRef::from(&self.socket).set_send_buffer_size(size)?;
        Ok(())
    }

    /// Set the receive buffer size
    pub fn set_recv_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        SockRef::from(&self.socket).set_recv_buffer_size(size)?;
        Ok(())
    }

    /// Get the send buffer size
    pub fn send_buffer_size(&self) -> Result<usize, SocketError> {
        Ok(SockRef::from(&self.socket).send_buffer_size()?)
    }

    /// Get the receive buffer size
    pub fn recv_buffer_size(&self) -> Result<usize, SocketError> {
        Ok(SockRef::from(&self.socket).recv_buffer_size()?)
    }

    /// Send to an explicit address, bypassing the peer
    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.socket.send_to(buf, target)?)
    }
}

impl DatagramTransport for UdpTransport {
    fn send_bytes(&self, buf: &[u8]) -> io::Result<usize> {
        let peer = self
            .peer_addr()
            .ok_or_else(|| io::Error::new(ErrorKind::NotConnected, SocketError::NoPeer))?;
        self.socket.send_to(buf, peer)
    }

    fn recv_bytes(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        // A zero read timeout means "block forever" to the OS
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_micros(1))))?;

        match self.socket.recv_from(buf) {
            Ok((n, from)) => {
                let mut peer = self.peer.lock();
                match *peer {
                    Some(expected) if expected != from => {
                        tracing::trace!("Ignoring {} bytes from unexpected source {}", n, from);
                        Ok(None)
                    }
                    Some(_) => Ok(Some(n)),
                    None => {
                        tracing::info!("Latched peer address {}", from);
                        *peer = Some(from);
                        Ok(Some(n))
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_socket_creation() {
        let transport = UdpTransport::bind(local()).unwrap();
        let addr = transport.local_addr().unwrap();
        assert!(addr.port() > 0);
        assert_eq!(transport.peer_addr(), None);
    }

    #[test]
    fn test_socket_buffer_sizes() {
        let transport = UdpTransport::bind(local()).unwrap();

        transport.set_send_buffer_size(262144).unwrap();
        transport.set_recv_buffer_size(262144).unwrap();

        // May not match exactly due to OS limits
        assert!(transport.send_buffer_size().unwrap() > 0);
        assert!(transport.recv_buffer_size().unwrap() > 0);
    }

    #[test]
    fn test_send_without_peer_fails() {
        let transport = UdpTransport::bind(local()).unwrap();
        let err = transport.send_bytes(b"hello").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }

    #[test]
    fn test_send_recv_latches_peer() {
        let receiver = UdpTransport::bind(local()).unwrap();
        let sender = UdpTransport::connect(local(), receiver.local_addr().unwrap()).unwrap();

        let data = b"Hello, RDT!";
        sender.send_bytes(data).unwrap();

        let mut buf = [0u8; 1024];
        let n = receiver
            .recv_bytes(&mut buf, Duration::from_secs(1))
            .unwrap()
            .expect("datagram");
        assert_eq!(&buf[..n], data);
        assert_eq!(receiver.peer_addr(), Some(sender.local_addr().unwrap()));

        // The latched peer can now be answered
        receiver.send_bytes(b"ack").unwrap();
        let n = sender
            .recv_bytes(&mut buf, Duration::from_secs(1))
            .unwrap()
            .expect("reply");
        assert_eq!(&buf[..n], b"ack");
    }

    #[test]
    fn test_recv_timeout_returns_none() {
        let transport = UdpTransport::bind(local()).unwrap();
        let mut buf = [0u8; 64];
        let result = transport.recv_bytes(&mut buf, Duration::from_millis(10)).unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_foreign_source_ignored() {
        let receiver = UdpTransport::bind(local()).unwrap();
        let peer = UdpTransport::bind(local()).unwrap();
        let stranger = UdpTransport::bind(local()).unwrap();
        receiver.set_peer(peer.local_addr().unwrap());

        stranger
            .send_to(b"spoof", receiver.local_addr().unwrap())
            .unwrap();
        let mut buf = [0u8; 64];
        let result = receiver.recv_bytes(&mut buf, Duration::from_secs(1)).unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_socket_ipv6() {
        // May fail on systems without IPv6
        if let Ok(transport) = UdpTransport::bind("[::1]:0".parse().unwrap()) {
            assert!(transport.local_addr().unwrap().is_ipv6());
        }
    }
}
