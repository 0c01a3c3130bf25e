//! Packet transport between the engine and the network.
//!
//! The engine talks to the network only through the [`Transport`] trait. [`MulticastTransport`]
//! is the real implementation: one UDP socket per IPv4 interface, each with its own reader
//! thread feeding received packets into the engine's input queue.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use socket2::{Domain, Protocol, Socket, Type};

use crate::{
    engine::{EngineConfig, Input},
    hex::Hex,
    packet::MAX_MESSAGE_SIZE,
    MDNS_PORT, MDNS_V4_GROUP, MDNS_V6_GROUP,
};

/// Handle through which a [`Transport`] hands received packets and failures to the engine.
#[derive(Clone)]
pub struct PacketSink {
    tx: Sender<Input>,
}

impl PacketSink {
    pub(crate) fn new(tx: Sender<Input>) -> Self {
        Self { tx }
    }

    /// Queues a received packet. Returns `false` once the engine has stopped.
    pub fn deliver(&self, packet: Vec<u8>) -> bool {
        self.tx.send(Input::Packet(packet)).is_ok()
    }

    /// Reports a receive failure; the engine closes the transport and reopens it later.
    pub fn fail(&self, error: io::Error) {
        self.tx.send(Input::SocketFailed(error.kind())).ok();
    }
}

/// Sends and receives mDNS packets for the engine.
///
/// All methods are called from the engine's event loop thread.
pub trait Transport: Send {
    /// Acquires sockets and starts delivering received packets to `sink`.
    fn open(&mut self, sink: PacketSink) -> io::Result<()>;

    /// Sends a packet to the mDNS multicast group(s).
    fn send(&mut self, packet: &[u8]) -> io::Result<()>;

    /// Releases all sockets. No packets are delivered after this returns.
    fn close(&mut self);
}

/// Closes the wrapped transport when dropped, whichever way the engine exits.
pub(crate) struct TransportGuard {
    inner: Box<dyn Transport>,
    is_open: bool,
}

impl TransportGuard {
    pub(crate) fn new(inner: Box<dyn Transport>) -> Self {
        Self {
            inner,
            is_open: false,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.is_open
    }

    pub(crate) fn open(&mut self, sink: PacketSink) -> io::Result<()> {
        self.close();
        self.inner.open(sink)?;
        self.is_open = true;
        Ok(())
    }

    pub(crate) fn send(&mut self, packet: &[u8]) -> io::Result<()> {
        self.inner.send(packet)
    }

    pub(crate) fn close(&mut self) {
        if self.is_open {
            self.inner.close();
            self.is_open = false;
        }
    }
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        self.close();
    }
}

/// Creates a UDP socket bound to the mDNS port and joined to the IPv4 group on `interface`.
///
/// Pass [`Ipv4Addr::UNSPECIFIED`] to let the OS pick the interface.
pub(crate) fn multicast_socket_v4(interface: Ipv4Addr) -> io::Result<UdpSocket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    sock.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MDNS_PORT).into())?;
    sock.join_multicast_v4(&MDNS_V4_GROUP, &interface)?;
    if !interface.is_unspecified() {
        sock.set_multicast_if_v4(&interface)?;
    }
    sock.set_multicast_loop_v4(true)?;
    Ok(sock.into())
}

fn multicast_socket_v6() -> io::Result<UdpSocket> {
    let sock = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    sock.set_only_v6(true)?;
    sock.bind(&SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, MDNS_PORT, 0, 0).into())?;
    sock.join_multicast_v6(&MDNS_V6_GROUP, 0)?;
    sock.set_multicast_loop_v6(true)?;
    Ok(sock.into())
}

/// Returns the addresses of all active non-loopback IPv4 interfaces.
fn ipv4_interfaces() -> io::Result<Vec<Ipv4Addr>> {
    let mut addrs: Vec<_> = if_addrs::get_if_addrs()?
        .into_iter()
        .filter(|interface| !interface.is_loopback())
        .filter_map(|interface| match interface.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .collect();
    addrs.sort();
    addrs.dedup();
    Ok(addrs)
}

struct Endpoint {
    sock: Arc<UdpSocket>,
    group: SocketAddr,
}

/// UDP multicast transport on port 5353.
pub struct MulticastTransport {
    ipv6: bool,
    poll_interval: Duration,
    endpoints: Vec<Endpoint>,
    readers: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl MulticastTransport {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            ipv6: config.ipv6,
            poll_interval: config.socket_poll_interval,
            endpoints: Vec::new(),
            readers: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    fn add_endpoint(
        &mut self,
        name: String,
        sock: UdpSocket,
        group: SocketAddr,
        sink: PacketSink,
    ) -> io::Result<()> {
        // Reader threads poll the stop flag at this interval.
        sock.set_read_timeout(Some(self.poll_interval))?;
        let sock = Arc::new(sock);
        let reader = {
            let sock = sock.clone();
            let stop = self.stop.clone();
            thread::Builder::new()
                .name(name)
                .spawn(move || recv_loop(&sock, &stop, &sink))?
        };
        self.endpoints.push(Endpoint { sock, group });
        self.readers.push(reader);
        Ok(())
    }
}

fn recv_loop(sock: &UdpSocket, stop: &AtomicBool, sink: &PacketSink) {
    let mut buf = vec![0; MAX_MESSAGE_SIZE];
    while !stop.load(Ordering::Relaxed) {
        match sock.recv_from(&mut buf) {
            Ok((len, addr)) => {
                log::trace!("recv from {}: {}", addr, Hex(&buf[..len]));
                if !sink.deliver(buf[..len].to_vec()) {
                    return;
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => {
                if !stop.load(Ordering::Relaxed) {
                    log::warn!("receive failed: {}", e);
                    sink.fail(e);
                }
                return;
            }
        }
    }
}

impl Transport for MulticastTransport {
    fn open(&mut self, sink: PacketSink) -> io::Result<()> {
        self.stop = Arc::new(AtomicBool::new(false));

        let mut interfaces = ipv4_interfaces().unwrap_or_else(|e| {
            log::warn!("failed to enumerate network interfaces: {}", e);
            Vec::new()
        });
        if interfaces.is_empty() {
            interfaces.push(Ipv4Addr::UNSPECIFIED);
        }

        let group = SocketAddr::from((MDNS_V4_GROUP, MDNS_PORT));
        let mut last_err = None;
        for ip in interfaces {
            let name = format!("mdns-recv-{ip}");
            let res = multicast_socket_v4(ip)
                .and_then(|sock| self.add_endpoint(name, sock, group, sink.clone()));
            match res {
                Ok(()) => log::info!("listening for mDNS on {}", ip),
                Err(e) => {
                    log::warn!("failed to open mDNS socket on {}: {}", ip, e);
                    last_err = Some(e);
                }
            }
        }

        if self.ipv6 {
            let group = SocketAddr::from((MDNS_V6_GROUP, MDNS_PORT));
            let name = String::from("mdns-recv-v6");
            let res = multicast_socket_v6()
                .and_then(|sock| self.add_endpoint(name, sock, group, sink.clone()));
            if let Err(e) = res {
                log::warn!("failed to open IPv6 mDNS socket: {}", e);
                last_err = Some(e);
            }
        }

        match (self.endpoints.is_empty(), last_err) {
            (true, Some(e)) => Err(e),
            (true, None) => Err(io::ErrorKind::NotFound.into()),
            (false, _) => Ok(()),
        }
    }

    fn send(&mut self, packet: &[u8]) -> io::Result<()> {
        log::trace!("send: {}", Hex(packet));
        let mut sent = false;
        let mut last_err = None;
        for endpoint in &self.endpoints {
            match endpoint.sock.send_to(packet, endpoint.group) {
                Ok(_) => sent = true,
                Err(e) => {
                    log::debug!("send via {:?} failed: {}", endpoint.sock.local_addr(), e);
                    last_err = Some(e);
                }
            }
        }
        match (sent, last_err) {
            (false, Some(e)) => Err(e),
            _ => Ok(()),
        }
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.endpoints.clear();
        for reader in self.readers.drain(..) {
            if reader.join().is_err() {
                log::error!("mDNS reader thread panicked");
            }
        }
    }
}

impl Drop for MulticastTransport {
    fn drop(&mut self) {
        self.close();
    }
}
