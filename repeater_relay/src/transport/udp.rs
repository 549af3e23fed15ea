// UDP transport and acceptor.
//
// All server-side UDP transports share one socket. A single reader thread
// owns the socket's receive side and demultiplexes datagrams by source
// address: the first datagram from an unknown address creates a new
// `UdpTransport` (handed to the acceptor), later ones go to that transport's
// inbox. Each transport shares a `live` flag with the reader's peer table and
// clears it on close or drop. The reader forgets closed peers whenever it
// wakes up without traffic, and at least every `PEER_PRUNE_INTERVAL`, so
// traffic from many short-lived addresses cannot grow the table without
// bound. A forgotten address that sends again is treated as new.
//
// Datagrams carry one or more length-prefixed frames. Aggregatable sends are
// packed together at flush time, up to the transport's maximum packet size.
// Malformed datagrams are discarded: the transport is unreliable anyway.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use repeater_protocol::{
    Aggregation, Ordering, Reliability, packet_len, split_frames, write_frame,
};
use tracing::{debug, warn};

use super::{Acceptor, Transport, TransportInfo, check_packet_size};
use crate::error::{ServerError, TransportError};

/// Largest payload an IPv4 UDP datagram can carry.
pub const UDP_MAX_PACKET_SIZE: usize = 65_507;

/// How often reader threads wake up to check whether they should exit.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Upper bound between sweeps of closed peers under constant traffic.
const PEER_PRUNE_INTERVAL: Duration = Duration::from_secs(1);

/// Unreliable, unordered datagram transport.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    inbox: Option<Receiver<Bytes>>,
    received: VecDeque<Bytes>,
    pending: Vec<Bytes>,
    max_packet_size: usize,
    open: bool,
    /// Cleared on close. Stops a client transport's reader thread; lets the
    /// server's demux forget this peer.
    live: Arc<AtomicBool>,
}

impl UdpTransport {
    fn new(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        inbox: Receiver<Bytes>,
        live: Arc<AtomicBool>,
    ) -> Self {
        Self {
            socket,
            peer,
            inbox: Some(inbox),
            received: VecDeque::new(),
            pending: Vec::new(),
            max_packet_size: UDP_MAX_PACKET_SIZE,
            open: true,
            live,
        }
    }

    /// Client side: bind an ephemeral socket and talk to `server` only.
    pub fn connect(server: SocketAddr) -> io::Result<Self> {
        let local: IpAddr = match server {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = UdpSocket::bind(SocketAddr::new(local, 0))?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let socket = Arc::new(socket);

        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();
        let reader_socket = socket.clone();
        let reader_running = running.clone();
        thread::spawn(move || client_reader_loop(reader_socket, server, tx, reader_running));

        Ok(Self::new(socket, server, rx, running))
    }

    fn send_datagram(&mut self, datagram: &[u8]) -> Result<(), TransportError> {
        self.socket.send_to(datagram, self.peer)?;
        Ok(())
    }

    /// Pull any newly arrived datagrams into the frame queue.
    fn drain_inbox(&mut self) {
        let Some(inbox) = self.inbox.as_ref() else {
            return;
        };
        loop {
            match inbox.try_recv() {
                Ok(datagram) => match split_frames(datagram) {
                    Ok(bodies) => self.received.extend(bodies),
                    Err(err) => debug!(peer = %self.peer, "discarding malformed datagram: {err}"),
                },
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.open = false;
                    break;
                }
            }
        }
    }
}

impl Transport for UdpTransport {
    fn info(&self) -> TransportInfo {
        TransportInfo {
            name: "UDP",
            reliability: Reliability::Unreliable,
            ordering: Ordering::Unordered,
            peer: Some(self.peer),
        }
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Clamped to what a single datagram can carry.
    fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size.min(UDP_MAX_PACKET_SIZE);
    }

    fn send(&mut self, body: &Bytes, aggregation: Aggregation) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        check_packet_size(body, self.max_packet_size)?;
        self.pending.push(body.clone());
        if aggregation == Aggregation::Immediate {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        if !self.open {
            self.pending.clear();
            return Err(TransportError::Closed);
        }
        let mut datagram = Vec::new();
        for body in std::mem::take(&mut self.pending) {
            if !datagram.is_empty() && datagram.len() + packet_len(body.len()) > self.max_packet_size {
                self.send_datagram(&datagram)?;
                datagram.clear();
            }
            write_frame(&mut datagram, &body)?;
        }
        if !datagram.is_empty() {
            self.send_datagram(&datagram)?;
        }
        Ok(())
    }

    fn try_recv(&mut self) -> Option<Bytes> {
        if self.received.is_empty() {
            self.drain_inbox();
        }
        self.received.pop_front()
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
        self.inbox = None;
        self.pending.clear();
        self.live.store(false, AtomicOrdering::SeqCst);
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn client_reader_loop(
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    tx: Sender<Bytes>,
    running: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; UDP_MAX_PACKET_SIZE];
    while running.load(AtomicOrdering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) if from == server => {
                if tx.send(Bytes::copy_from_slice(&buf[..len])).is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(ref e) if is_transient(e) => {}
            Err(_) => break,
        }
    }
}

/// Timeouts, and ICMP port-unreachable echoes some platforms surface on UDP
/// sockets, are not reasons to stop reading.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionReset
    )
}

/// Accepts "connections" on a UDP port: one transport per source address.
pub struct UdpAcceptor {
    addr: SocketAddr,
    state: Option<UdpState>,
}

struct UdpState {
    local_addr: SocketAddr,
    keep_running: Arc<AtomicBool>,
    incoming: Receiver<io::Result<UdpTransport>>,
    thread: Option<JoinHandle<()>>,
}

impl UdpAcceptor {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, state: None }
    }
}

impl Acceptor for UdpAcceptor {
    fn start(&mut self) -> Result<(), ServerError> {
        if self.state.is_some() {
            return Ok(());
        }
        let bind_err = |source| ServerError::Bind {
            addr: self.addr,
            source,
        };
        let socket = UdpSocket::bind(self.addr).map_err(bind_err)?;
        let local_addr = socket.local_addr().map_err(bind_err)?;
        socket.set_read_timeout(Some(READ_TIMEOUT)).map_err(bind_err)?;

        let keep_running = Arc::new(AtomicBool::new(true));
        let keep_running_thread = keep_running.clone();
        let (tx, rx) = mpsc::channel();
        let socket = Arc::new(socket);
        let thread = thread::spawn(move || demux_loop(socket, tx, keep_running_thread));

        debug!(%local_addr, "UDP acceptor listening");
        self.state = Some(UdpState {
            local_addr,
            keep_running,
            incoming: rx,
            thread: Some(thread),
        });
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<Box<dyn Transport>>, TransportError> {
        let Some(state) = self.state.as_mut() else {
            return Ok(Vec::new());
        };
        let mut accepted: Vec<Box<dyn Transport>> = Vec::new();
        loop {
            match state.incoming.try_recv() {
                Ok(Ok(transport)) => accepted.push(Box::new(transport)),
                Ok(Err(err)) => return Err(TransportError::Io(err)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Err(TransportError::Closed),
            }
        }
        Ok(accepted)
    }

    fn stop(&mut self) {
        if let Some(mut state) = self.state.take() {
            state.keep_running.store(false, AtomicOrdering::SeqCst);
            if let Some(handle) = state.thread.take() {
                let _ = handle.join();
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.state.as_ref().map(|state| state.local_addr)
    }
}

impl Drop for UdpAcceptor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PeerSlot {
    inbox: Sender<Bytes>,
    live: Arc<AtomicBool>,
}

/// Source address to inbox map owned by the demux thread.
struct PeerTable {
    peers: HashMap<SocketAddr, PeerSlot>,
    last_prune: Instant,
}

impl PeerTable {
    fn new(now: Instant) -> Self {
        Self {
            peers: HashMap::new(),
            last_prune: now,
        }
    }

    /// Hand `datagram` to a known live peer. Gives it back, after forgetting
    /// the peer if it has closed, when there is nobody to deliver to.
    fn deliver(&mut self, peer: SocketAddr, datagram: Bytes) -> Result<(), Bytes> {
        let delivered = match self.peers.get(&peer) {
            None => return Err(datagram),
            Some(slot) if slot.live.load(AtomicOrdering::SeqCst) => slot
                .inbox
                .send(datagram)
                .map_err(|mpsc::SendError(datagram)| datagram),
            Some(_) => Err(datagram),
        };
        if delivered.is_err() {
            self.peers.remove(&peer);
        }
        delivered
    }

    /// Start tracking `peer`, returning the inbox and flag for its transport.
    fn register(&mut self, peer: SocketAddr) -> (Receiver<Bytes>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::channel();
        let live = Arc::new(AtomicBool::new(true));
        self.peers.insert(
            peer,
            PeerSlot {
                inbox: tx,
                live: live.clone(),
            },
        );
        (rx, live)
    }

    /// Forget every peer whose transport has closed.
    fn prune(&mut self, now: Instant) {
        self.peers.retain(|_, slot| slot.live.load(AtomicOrdering::SeqCst));
        self.last_prune = now;
    }

    fn prune_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_prune) >= PEER_PRUNE_INTERVAL
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.peers.len()
    }
}

/// Reader thread for the shared server socket.
fn demux_loop(
    socket: Arc<UdpSocket>,
    accepted: Sender<io::Result<UdpTransport>>,
    keep_running: Arc<AtomicBool>,
) {
    let mut peers = PeerTable::new(Instant::now());
    let mut buf = vec![0u8; UDP_MAX_PACKET_SIZE];
    while keep_running.load(AtomicOrdering::SeqCst) {
        let received = socket.recv_from(&mut buf);
        let now = Instant::now();
        let (len, peer) = match received {
            Ok(received) => received,
            Err(ref e) if is_transient(e) => {
                peers.prune(now);
                continue;
            }
            Err(e) => {
                warn!("UDP acceptor socket failed: {e}");
                let _ = accepted.send(Err(e));
                break;
            }
        };
        if peers.prune_due(now) {
            peers.prune(now);
        }
        let datagram = match peers.deliver(peer, Bytes::copy_from_slice(&buf[..len])) {
            Ok(()) => continue,
            Err(datagram) => datagram,
        };

        // Unknown (or previously closed) peer: start a new transport.
        let (inbox, live) = peers.register(peer);
        let transport = UdpTransport::new(socket.clone(), peer, inbox, live);
        let _ = peers.deliver(peer, datagram);
        if accepted.send(Ok(transport)).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn wait_for<T>(mut f: impl FnMut() -> Option<T>) -> T {
        let start = Instant::now();
        loop {
            if let Some(value) = f() {
                return value;
            }
            assert!(start.elapsed() < Duration::from_secs(5), "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn first_datagram_creates_transport() {
        let mut acceptor = UdpAcceptor::new("127.0.0.1:0".parse().unwrap());
        acceptor.start().unwrap();
        let addr = acceptor.local_addr().unwrap();

        let mut client = UdpTransport::connect(addr).unwrap();
        client
            .send(&Bytes::from_static(b"\x01\x00a"), Aggregation::Immediate)
            .unwrap();
        let mut server_side = wait_for(|| acceptor.poll().unwrap().pop());
        let info = server_side.info();
        assert_eq!(info.reliability, Reliability::Unreliable);

        let body = wait_for(|| server_side.try_recv());
        assert_eq!(&body[..], b"\x01\x00a");

        server_side
            .send(&Bytes::from_static(b"x"), Aggregation::Aggregatable)
            .unwrap();
        server_side
            .send(&Bytes::from_static(b"y"), Aggregation::Aggregatable)
            .unwrap();
        server_side.flush().unwrap();
        assert_eq!(&wait_for(|| client.try_recv())[..], b"x");
        assert_eq!(&wait_for(|| client.try_recv())[..], b"y");
    }

    #[test]
    fn packet_size_is_clamped_to_datagram_limit() {
        let mut acceptor = UdpAcceptor::new("127.0.0.1:0".parse().unwrap());
        acceptor.start().unwrap();
        let mut client = UdpTransport::connect(acceptor.local_addr().unwrap()).unwrap();
        client.set_max_packet_size(4 * 1024 * 1024);
        assert_eq!(client.max_packet_size(), UDP_MAX_PACKET_SIZE);
    }

    #[test]
    fn closed_peers_are_forgotten() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let start = Instant::now();
        let mut table = PeerTable::new(start);
        let mut transports = Vec::new();
        for port in 1..=50u16 {
            let peer = SocketAddr::from(([127, 0, 0, 1], port));
            assert!(table.deliver(peer, Bytes::from_static(b"x")).is_err());
            let (inbox, live) = table.register(peer);
            transports.push(UdpTransport::new(socket.clone(), peer, inbox, live));
        }
        assert_eq!(table.len(), 50);

        let kept = transports.split_off(40);
        for mut transport in transports {
            transport.close();
        }
        assert!(!table.prune_due(start));
        table.prune(start);
        assert_eq!(table.len(), 10);
        assert!(table.prune_due(start + PEER_PRUNE_INTERVAL));

        let kept_peer = SocketAddr::from(([127, 0, 0, 1], 45));
        assert!(table.deliver(kept_peer, Bytes::from_static(b"y")).is_ok());
        drop(kept);
        let err = table.deliver(kept_peer, Bytes::from_static(b"z")).unwrap_err();
        assert_eq!(&err[..], b"z");
        assert_eq!(table.len(), 9);
    }

    #[test]
    fn closed_transport_rejects_sends() {
        let mut acceptor = UdpAcceptor::new("127.0.0.1:0".parse().unwrap());
        acceptor.start().unwrap();
        let mut client = UdpTransport::connect(acceptor.local_addr().unwrap()).unwrap();
        client.close();
        assert!(!client.is_open());
        assert!(matches!(
            client.send(&Bytes::from_static(b"z"), Aggregation::Immediate),
            Err(TransportError::Closed)
        ));
    }
}
