//! Packet transports the [super::Rpc] sends and receives through.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::trace;

const MTU: usize = 2048;

/// The maximum duration to backoff checking the [UdpSocket] buffer after it is empty.
/// Lower values increases CPU usage, but reduces latency, and drains the buffer faster,
/// reducing the risk of packet loss.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// Fire-and-forget datagram transport.
pub trait Transport: Send + Debug {
    /// Send a packet, errors are only worth logging.
    fn send_to(&mut self, bytes: &[u8], address: SocketAddrV4) -> io::Result<()>;

    /// Receive a single packet if one is available, without blocking for long.
    fn recv_from(&mut self) -> Option<(Vec<u8>, SocketAddrV4)>;

    /// The address this transport is bound to.
    fn local_addr(&self) -> SocketAddrV4;
}

/// Non-blocking IPv4 UDP socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddrV4,
}

impl UdpTransport {
    /// Bind to `bind_address` on `port`, or a random port if `None`.
    pub fn bind(bind_address: Ipv4Addr, port: Option<u16>) -> Result<Self, io::Error> {
        let socket = UdpSocket::bind(SocketAddr::from((bind_address, port.unwrap_or(0))))?;

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "UdpTransport does not support Ipv6",
                ))
            }
        };

        socket.set_nonblocking(true)?;

        Ok(Self { socket, local_addr })
    }
}

impl Transport for UdpTransport {
    fn send_to(&mut self, bytes: &[u8], address: SocketAddrV4) -> io::Result<()> {
        self.socket.send_to(bytes, address).map(|_| ())
    }

    fn recv_from(&mut self) -> Option<(Vec<u8>, SocketAddrV4)> {
        let mut buf = [0u8; MTU];

        match self.socket.recv_from(&mut buf) {
            Ok((amt, SocketAddr::V4(from))) => Some((buf[..amt].to_vec(), from)),
            Ok((_, SocketAddr::V6(_))) => {
                trace!(context = "socket_validation", "Received IPv6 packet");
                None
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(MAX_THREAD_BLOCK_DURATION);
                None
            }
            Err(e) => {
                trace!(context = "socket_error", ?e, "recv_from failed unexpectedly");
                None
            }
        }
    }

    fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }
}

type Inboxes = HashMap<SocketAddrV4, VecDeque<(Vec<u8>, SocketAddrV4)>>;

/// In-process, lossless network of [MemoryTransport]s.
///
/// Packets are delivered in order, and only when the receiver polls,
/// which keeps multi-node simulations deterministic.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    inboxes: Arc<Mutex<Inboxes>>,
    idle_backoff: Duration,
}

impl MemoryNetwork {
    /// A network whose transports sleep up to [MAX_THREAD_BLOCK_DURATION]
    /// when their inbox is empty, like [UdpTransport], suitable for a [crate::Dht] thread.
    pub fn new() -> Self {
        Self {
            inboxes: Default::default(),
            idle_backoff: MAX_THREAD_BLOCK_DURATION,
        }
    }

    /// A network whose transports return immediately when their inbox is
    /// empty, for [super::Rpc]s ticked by hand.
    pub fn non_blocking() -> Self {
        Self {
            inboxes: Default::default(),
            idle_backoff: Duration::ZERO,
        }
    }

    /// Attach a new transport at `address`.
    ///
    /// Fails with [io::ErrorKind::AddrInUse] while another transport is bound there.
    pub fn bind(&self, address: SocketAddrV4) -> Result<MemoryTransport, io::Error> {
        let mut inboxes = self.lock()?;

        if inboxes.contains_key(&address) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "MemoryNetwork address already bound",
            ));
        }
        inboxes.insert(address, VecDeque::new());

        Ok(MemoryTransport {
            network: self.clone(),
            local_addr: address,
        })
    }

    /// Number of packets waiting to be received across the network.
    pub fn pending(&self) -> usize {
        self.inboxes
            .lock()
            .map(|inboxes| inboxes.values().map(VecDeque::len).sum())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inboxes>, io::Error> {
        self.inboxes
            .lock()
            .map_err(|_| io::Error::other("MemoryNetwork poisoned"))
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// A transport bound to one address of a [MemoryNetwork], detached when dropped.
#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local_addr: SocketAddrV4,
}

impl Transport for MemoryTransport {
    fn send_to(&mut self, bytes: &[u8], address: SocketAddrV4) -> io::Result<()> {
        let mut inboxes = self.network.lock()?;

        match inboxes.get_mut(&address) {
            Some(inbox) => {
                inbox.push_back((bytes.to_vec(), self.local_addr));
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "No transport bound at address",
            )),
        }
    }

    fn recv_from(&mut self) -> Option<(Vec<u8>, SocketAddrV4)> {
        let packet = self
            .network
            .lock()
            .ok()?
            .get_mut(&self.local_addr)?
            .pop_front();

        if packet.is_none() && !self.network.idle_backoff.is_zero() {
            std::thread::sleep(self.network.idle_backoff);
        }

        packet
    }

    fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if let Ok(mut inboxes) = self.network.lock() {
            inboxes.remove(&self.local_addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_network_delivers_in_order() {
        let network = MemoryNetwork::non_blocking();

        let mut a = network.bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1)).unwrap();
        let mut b = network.bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 2)).unwrap();

        a.send_to(b"first", b.local_addr()).unwrap();
        a.send_to(b"second", b.local_addr()).unwrap();

        assert_eq!(network.pending(), 2);

        assert_eq!(b.recv_from(), Some((b"first".to_vec(), a.local_addr())));
        assert_eq!(b.recv_from(), Some((b"second".to_vec(), a.local_addr())));
        assert_eq!(b.recv_from(), None);
        assert_eq!(a.recv_from(), None);
    }

    #[test]
    fn memory_network_unknown_address() {
        let network = MemoryNetwork::non_blocking();
        let mut a = network.bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1)).unwrap();

        let b = network.bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 2)).unwrap();
        let b_address = b.local_addr();
        drop(b);

        assert!(a.send_to(b"lost", b_address).is_err());
    }

    #[test]
    fn memory_network_bind_twice() {
        let network = MemoryNetwork::non_blocking();
        let address = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1);

        let mut a = network.bind(address).unwrap();
        let mut b = network.bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 2)).unwrap();

        assert_eq!(
            network.bind(address).unwrap_err().kind(),
            io::ErrorKind::AddrInUse
        );

        // The failed bind did not detach the first transport.
        b.send_to(b"still here", address).unwrap();
        assert_eq!(a.recv_from(), Some((b"still here".to_vec(), b.local_addr())));

        // The address is free again once its transport is dropped.
        drop(a);
        assert!(network.bind(address).is_ok());
    }

    #[test]
    fn memory_network_backs_off_when_idle() {
        let address = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1);

        let network = MemoryNetwork::new();
        let mut transport = network.bind(address).unwrap();

        let start = std::time::Instant::now();
        assert_eq!(transport.recv_from(), None);
        assert!(start.elapsed() >= MAX_THREAD_BLOCK_DURATION);

        let network = MemoryNetwork::non_blocking();
        let mut transport = network.bind(address).unwrap();
        let mut sender = network.bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 2)).unwrap();

        sender.send_to(b"ready", address).unwrap();
        assert!(transport.recv_from().is_some());
        assert_eq!(transport.recv_from(), None);
    }

    #[test]
    fn udp_round_trip() {
        let mut a = UdpTransport::bind(Ipv4Addr::LOCALHOST, None).unwrap();
        let mut b = UdpTransport::bind(Ipv4Addr::LOCALHOST, None).unwrap();

        a.send_to(b"hello", b.local_addr()).unwrap();

        let received = loop {
            if let Some(packet) = b.recv_from() {
                break packet;
            }
        };

        assert_eq!(received, (b"hello".to_vec(), a.local_addr()));
    }
}
