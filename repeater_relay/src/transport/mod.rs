// Transport abstraction.
//
// A `Transport` is one physical channel to a peer. The server core only
// relies on what this trait exposes: declared reliability/ordering, a
// maximum packet size, non-blocking send/flush, a non-blocking receive queue,
// and open/close. Everything a transport reads arrives on its own I/O thread
// and is handed to the update thread through an `mpsc` queue; all writes
// happen on the update thread.
//
// An `Acceptor` produces new transports from a listening endpoint. `poll`
// returning `Err` means the endpoint died and the server can no longer accept
// on it (reported as a fatal error).
//
// Implementations:
// - `tcp.rs`:    reliable, ordered stream transport.
// - `udp.rs`:    unreliable, unordered datagram transport sharing one socket.
// - `memory.rs`: in-process pair with configurable characteristics.

pub mod memory;
pub mod tcp;
pub mod udp;

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use repeater_protocol::{Aggregation, Ordering, Reliability, packet_len};

use crate::error::{ServerError, TransportError};

pub use memory::{MemoryAcceptor, MemoryConnector, MemoryTransport, memory_listener, memory_pair};
pub use tcp::{TcpAcceptor, TcpTransport};
pub use udp::{UdpAcceptor, UdpTransport};

/// Static description of a transport, cheap to copy into events and logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportInfo {
    pub name: &'static str,
    pub reliability: Reliability,
    pub ordering: Ordering,
    pub peer: Option<SocketAddr>,
}

impl fmt::Display for TransportInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer {
            Some(peer) => write!(
                f,
                "{} {} ({:?}/{:?})",
                self.name, peer, self.reliability, self.ordering
            ),
            None => write!(
                f,
                "{} ({:?}/{:?})",
                self.name, self.reliability, self.ordering
            ),
        }
    }
}

pub trait Transport: Send {
    fn info(&self) -> TransportInfo;

    /// Largest frame (length prefix included) this transport will send.
    fn max_packet_size(&self) -> usize;

    fn set_max_packet_size(&mut self, size: usize);

    /// Queue or write one message body. `Immediate` sends are on the wire
    /// when this returns; `Aggregatable` ones may wait for `flush`.
    fn send(&mut self, body: &Bytes, aggregation: Aggregation) -> Result<(), TransportError>;

    fn flush(&mut self) -> Result<(), TransportError>;

    /// Next received message body, if one is queued. Never blocks.
    fn try_recv(&mut self) -> Option<Bytes>;

    fn is_open(&self) -> bool;

    fn close(&mut self);
}

pub trait Acceptor: Send {
    /// Bind the endpoint. Calling `start` on a started acceptor is a no-op.
    fn start(&mut self) -> Result<(), ServerError>;

    /// Transports accepted since the last poll.
    fn poll(&mut self) -> Result<Vec<Box<dyn Transport>>, TransportError>;

    fn stop(&mut self);

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Reject bodies whose frame would exceed `max`.
pub(crate) fn check_packet_size(body: &Bytes, max: usize) -> Result<(), TransportError> {
    let size = packet_len(body.len());
    if size > max {
        return Err(TransportError::PacketTooLarge { size, max });
    }
    Ok(())
}
