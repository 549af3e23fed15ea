// TCP transport and acceptor.
//
// Architecture follows a thread-per-reader model:
// - **Listener thread**: non-blocking `accept()` loop that checks a
//   `keep_running` flag between attempts and hands new streams to the
//   acceptor through an `mpsc` channel.
// - **Reader thread** (one per stream): `read_message()` in a loop, pushing
//   each body into the transport's inbox. On EOF or error the thread exits
//   and drops its sender, which the transport observes as closure.
// - **Writes** happen only on the thread that owns the `TcpTransport` (the
//   server's update thread), through a `BufWriter`. Aggregatable sends stay
//   in the buffer until `flush`. Every write is bounded by a write timeout:
//   a peer that stops reading fails the write (and closes the transport)
//   instead of stalling the update thread.
//
// Closing shuts the socket down in both directions, which unblocks the
// reader thread. A transport that failed is not flushed again on close.

use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use repeater_protocol::{Aggregation, MAX_MESSAGE_SIZE, Ordering, Reliability, read_message, write_frame};
use tracing::{debug, warn};

use super::{Acceptor, Transport, TransportInfo, check_packet_size};
use crate::error::{ServerError, TransportError};

/// Sleep between non-blocking accept attempts.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default cap: the largest frame the framing layer accepts.
pub const TCP_DEFAULT_MAX_PACKET_SIZE: usize = MAX_MESSAGE_SIZE as usize;

/// Longest a single write may block before the transport is failed.
pub const TCP_DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reliable, ordered stream transport.
pub struct TcpTransport {
    peer: Option<SocketAddr>,
    writer: BufWriter<TcpStream>,
    inbox: Receiver<Bytes>,
    max_packet_size: usize,
    open: bool,
}

impl TcpTransport {
    /// Wrap a connected stream and spawn its reader thread.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        Self::with_write_timeout(stream, TCP_DEFAULT_WRITE_TIMEOUT)
    }

    /// Like `new`, with a custom bound on blocking writes. `write_timeout`
    /// must be non-zero.
    pub fn with_write_timeout(stream: TcpStream, write_timeout: Duration) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(write_timeout))?;
        let peer = stream.peer_addr().ok();
        let reader_stream = stream.try_clone()?;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || reader_loop(BufReader::new(reader_stream), tx));
        Ok(Self {
            peer,
            writer: BufWriter::new(stream),
            inbox: rx,
            max_packet_size: TCP_DEFAULT_MAX_PACKET_SIZE,
            open: true,
        })
    }

    /// Connect to a listening repeater.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        Self::new(TcpStream::connect(addr)?)
    }

    /// The stream may hold half a frame now, so nothing more is written.
    fn fail(&mut self, err: io::Error) -> TransportError {
        self.open = false;
        self.close();
        TransportError::Io(err)
    }
}

impl Transport for TcpTransport {
    fn info(&self) -> TransportInfo {
        TransportInfo {
            name: "TCP",
            reliability: Reliability::Reliable,
            ordering: Ordering::Ordered,
            peer: self.peer,
        }
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size.min(TCP_DEFAULT_MAX_PACKET_SIZE);
    }

    fn send(&mut self, body: &Bytes, aggregation: Aggregation) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        check_packet_size(body, self.max_packet_size)?;
        if let Err(err) = write_frame(&mut self.writer, body) {
            return Err(self.fail(err));
        }
        if aggregation == Aggregation::Immediate {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        if let Err(err) = self.writer.flush() {
            return Err(self.fail(err));
        }
        Ok(())
    }

    fn try_recv(&mut self) -> Option<Bytes> {
        match self.inbox.try_recv() {
            Ok(body) => Some(body),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.open = false;
                None
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            let _ = self.writer.flush();
        }
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reader thread: read framed bodies until EOF/error or until the transport
/// drops its receiver.
fn reader_loop(mut reader: BufReader<TcpStream>, tx: Sender<Bytes>) {
    while let Ok(body) = read_message(&mut reader) {
        if tx.send(Bytes::from(body)).is_err() {
            break; // Transport dropped the receiver
        }
    }
}

/// Accepts TCP connections on a listening socket.
pub struct TcpAcceptor {
    addr: SocketAddr,
    write_timeout: Duration,
    listener: Option<ListenerState>,
}

struct ListenerState {
    local_addr: SocketAddr,
    keep_running: Arc<AtomicBool>,
    incoming: Receiver<io::Result<TcpStream>>,
    thread: Option<JoinHandle<()>>,
}

impl TcpAcceptor {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            write_timeout: TCP_DEFAULT_WRITE_TIMEOUT,
            listener: None,
        }
    }

    /// Write timeout given to every accepted stream. Zero is ignored.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.write_timeout = timeout;
        }
        self
    }
}

impl Acceptor for TcpAcceptor {
    fn start(&mut self) -> Result<(), ServerError> {
        if self.listener.is_some() {
            return Ok(());
        }
        let bind_err = |source| ServerError::Bind {
            addr: self.addr,
            source,
        };
        let listener = TcpListener::bind(self.addr).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        // Non-blocking so the accept thread can check keep_running.
        listener.set_nonblocking(true).map_err(bind_err)?;

        let keep_running = Arc::new(AtomicBool::new(true));
        let keep_running_thread = keep_running.clone();
        let (tx, rx) = mpsc::channel();
        let thread = thread::spawn(move || accept_loop(listener, tx, keep_running_thread));

        debug!(%local_addr, "TCP acceptor listening");
        self.listener = Some(ListenerState {
            local_addr,
            keep_running,
            incoming: rx,
            thread: Some(thread),
        });
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<Box<dyn Transport>>, TransportError> {
        let write_timeout = self.write_timeout;
        let Some(state) = self.listener.as_mut() else {
            return Ok(Vec::new());
        };
        let mut accepted: Vec<Box<dyn Transport>> = Vec::new();
        loop {
            match state.incoming.try_recv() {
                Ok(Ok(stream)) => match TcpTransport::with_write_timeout(stream, write_timeout) {
                    Ok(transport) => accepted.push(Box::new(transport)),
                    Err(err) => warn!("could not set up accepted TCP stream: {err}"),
                },
                Ok(Err(err)) => return Err(TransportError::Io(err)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Err(TransportError::Closed),
            }
        }
        Ok(accepted)
    }

    fn stop(&mut self) {
        if let Some(mut state) = self.listener.take() {
            state.keep_running.store(false, AtomicOrdering::SeqCst);
            if let Some(handle) = state.thread.take() {
                let _ = handle.join();
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|state| state.local_addr)
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    tx: Sender<io::Result<TcpStream>>,
    keep_running: Arc<AtomicBool>,
) {
    while keep_running.load(AtomicOrdering::SeqCst) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                stream.set_nonblocking(false).ok();
                if tx.send(Ok(stream)).is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                let _ = tx.send(Err(e));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn recv_blocking(transport: &mut TcpTransport) -> Bytes {
        let start = Instant::now();
        loop {
            if let Some(body) = transport.try_recv() {
                return body;
            }
            assert!(start.elapsed() < Duration::from_secs(5), "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn accept_one(acceptor: &mut TcpAcceptor) -> Box<dyn Transport> {
        let start = Instant::now();
        loop {
            let mut accepted = acceptor.poll().unwrap();
            if let Some(transport) = accepted.pop() {
                return transport;
            }
            assert!(start.elapsed() < Duration::from_secs(5), "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn accept_and_exchange_frames() {
        let mut acceptor = TcpAcceptor::new("127.0.0.1:0".parse().unwrap());
        acceptor.start().unwrap();
        let addr = acceptor.local_addr().unwrap();

        let mut client = TcpTransport::connect(addr).unwrap();
        let mut server_side = accept_one(&mut acceptor);
        assert_eq!(server_side.info().name, "TCP");

        client
            .send(&Bytes::from_static(b"\x01\x00ping"), Aggregation::Immediate)
            .unwrap();
        let start = Instant::now();
        let body = loop {
            if let Some(body) = server_side.try_recv() {
                break body;
            }
            assert!(start.elapsed() < Duration::from_secs(5), "timed out");
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(&body[..], b"\x01\x00ping");

        server_side
            .send(&Bytes::from_static(b"one"), Aggregation::Aggregatable)
            .unwrap();
        server_side
            .send(&Bytes::from_static(b"two"), Aggregation::Aggregatable)
            .unwrap();
        server_side.flush().unwrap();
        assert_eq!(&recv_blocking(&mut client)[..], b"one");
        assert_eq!(&recv_blocking(&mut client)[..], b"two");
        acceptor.stop();
    }

    #[test]
    fn oversized_send_is_rejected() {
        let mut acceptor = TcpAcceptor::new("127.0.0.1:0".parse().unwrap());
        acceptor.start().unwrap();
        let mut client = TcpTransport::connect(acceptor.local_addr().unwrap()).unwrap();
        client.set_max_packet_size(8);
        let err = client
            .send(&Bytes::from_static(b"12345"), Aggregation::Immediate)
            .unwrap_err();
        assert!(matches!(err, TransportError::PacketTooLarge { size: 9, max: 8 }));
        assert!(client.is_open());
    }

    #[test]
    fn peer_close_is_observed() {
        let mut acceptor = TcpAcceptor::new("127.0.0.1:0".parse().unwrap());
        acceptor.start().unwrap();
        let mut client = TcpTransport::connect(acceptor.local_addr().unwrap()).unwrap();
        let mut server_side = accept_one(&mut acceptor);

        client.close();
        let start = Instant::now();
        while server_side.is_open() {
            let _ = server_side.try_recv();
            assert!(start.elapsed() < Duration::from_secs(5), "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn writes_to_a_peer_that_never_reads_time_out() {
        let mut acceptor = TcpAcceptor::new("127.0.0.1:0".parse().unwrap())
            .with_write_timeout(Duration::from_millis(100));
        acceptor.start().unwrap();
        // Connected but never read from.
        let _stalled = TcpStream::connect(acceptor.local_addr().unwrap()).unwrap();
        let mut server_side = accept_one(&mut acceptor);

        let chunk = Bytes::from(vec![0u8; 1024 * 1024]);
        let start = Instant::now();
        let mut result = Ok(());
        for _ in 0..256 {
            result = server_side.send(&chunk, Aggregation::Immediate);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(TransportError::Io(_))), "{result:?}");
        assert!(!server_side.is_open());
        assert!(start.elapsed() < Duration::from_secs(10));

        let closing = Instant::now();
        server_side.close();
        drop(server_side);
        assert!(closing.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn bind_conflict_is_reported() {
        let mut first = TcpAcceptor::new("127.0.0.1:0".parse().unwrap());
        first.start().unwrap();
        let mut second = TcpAcceptor::new(first.local_addr().unwrap());
        assert!(matches!(second.start(), Err(ServerError::Bind { .. })));
    }
}
