// In-process transport.
//
// `memory_pair` returns two connected ends with the same declared
// reliability and ordering; either end can play server or client. The ends
// share an `open` flag so closing one is visible on the other. Messages
// already queued before the close are still delivered.
//
// `memory_listener` pairs a `MemoryAcceptor` (given to the server) with a
// `MemoryConnector` (kept by whoever plays the clients). Useful for embedding
// a repeater in-process and for exercising transports with characteristics
// TCP and UDP do not have, e.g. reliable-but-unordered.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use bytes::Bytes;
use repeater_protocol::{Aggregation, MAX_MESSAGE_SIZE, Ordering, Reliability};

use super::{Acceptor, Transport, TransportInfo, check_packet_size};
use crate::error::{ServerError, TransportError};

pub struct MemoryTransport {
    reliability: Reliability,
    ordering: Ordering,
    outbox: Sender<Bytes>,
    inbox: Receiver<Bytes>,
    pending: Vec<Bytes>,
    max_packet_size: usize,
    open: Arc<AtomicBool>,
}

/// Two connected in-process transport ends.
pub fn memory_pair(
    reliability: Reliability,
    ordering: Ordering,
) -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::channel();
    let (b_tx, a_rx) = mpsc::channel();
    let open = Arc::new(AtomicBool::new(true));
    let end = |outbox: Sender<Bytes>, inbox: Receiver<Bytes>| MemoryTransport {
        reliability,
        ordering,
        outbox,
        inbox,
        pending: Vec::new(),
        max_packet_size: MAX_MESSAGE_SIZE as usize,
        open: open.clone(),
    };
    (end(a_tx, a_rx), end(b_tx, b_rx))
}

impl MemoryTransport {
    fn deliver(&mut self, body: Bytes) -> Result<(), TransportError> {
        self.outbox.send(body).map_err(|_| {
            self.open.store(false, AtomicOrdering::SeqCst);
            TransportError::Closed
        })
    }
}

impl Transport for MemoryTransport {
    fn info(&self) -> TransportInfo {
        TransportInfo {
            name: "Memory",
            reliability: self.reliability,
            ordering: self.ordering,
            peer: None,
        }
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size;
    }

    fn send(&mut self, body: &Bytes, aggregation: Aggregation) -> Result<(), TransportError> {
        if !self.is_open() {
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
        for body in std::mem::take(&mut self.pending) {
            self.deliver(body)?;
        }
        Ok(())
    }

    fn try_recv(&mut self) -> Option<Bytes> {
        match self.inbox.try_recv() {
            Ok(body) => Some(body),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.open.store(false, AtomicOrdering::SeqCst);
                None
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(AtomicOrdering::SeqCst)
    }

    fn close(&mut self) {
        self.pending.clear();
        self.open.store(false, AtomicOrdering::SeqCst);
    }
}

/// Server side of an in-process listener.
pub struct MemoryAcceptor {
    incoming: Receiver<MemoryTransport>,
    started: bool,
}

/// Client side of an in-process listener.
#[derive(Clone)]
pub struct MemoryConnector {
    outgoing: Sender<MemoryTransport>,
}

pub fn memory_listener() -> (MemoryAcceptor, MemoryConnector) {
    let (tx, rx) = mpsc::channel();
    (
        MemoryAcceptor {
            incoming: rx,
            started: false,
        },
        MemoryConnector { outgoing: tx },
    )
}

impl MemoryConnector {
    /// Open a new transport to the acceptor. Returns `None` if the acceptor
    /// has been dropped.
    pub fn connect(&self, reliability: Reliability, ordering: Ordering) -> Option<MemoryTransport> {
        let (client_end, server_end) = memory_pair(reliability, ordering);
        self.outgoing.send(server_end).ok()?;
        Some(client_end)
    }
}

impl Acceptor for MemoryAcceptor {
    fn start(&mut self) -> Result<(), ServerError> {
        self.started = true;
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<Box<dyn Transport>>, TransportError> {
        let mut accepted: Vec<Box<dyn Transport>> = Vec::new();
        if !self.started {
            return Ok(accepted);
        }
        while let Ok(transport) = self.incoming.try_recv() {
            accepted.push(Box::new(transport));
        }
        Ok(accepted)
    }

    fn stop(&mut self) {
        self.started = false;
        while let Ok(mut transport) = self.incoming.try_recv() {
            transport.close();
        }
    }

    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_delivers_in_both_directions() {
        let (mut a, mut b) = memory_pair(Reliability::Reliable, Ordering::Ordered);
        a.send(&Bytes::from_static(b"to b"), Aggregation::Immediate)
            .unwrap();
        b.send(&Bytes::from_static(b"to a"), Aggregation::Immediate)
            .unwrap();
        assert_eq!(&b.try_recv().unwrap()[..], b"to b");
        assert_eq!(&a.try_recv().unwrap()[..], b"to a");
        assert!(a.try_recv().is_none());
    }

    #[test]
    fn aggregatable_sends_wait_for_flush() {
        let (mut a, mut b) = memory_pair(Reliability::Unreliable, Ordering::Unordered);
        a.send(&Bytes::from_static(b"later"), Aggregation::Aggregatable)
            .unwrap();
        assert!(b.try_recv().is_none());
        a.flush().unwrap();
        assert_eq!(&b.try_recv().unwrap()[..], b"later");
    }

    #[test]
    fn close_is_shared_but_queued_messages_survive() {
        let (mut a, mut b) = memory_pair(Reliability::Reliable, Ordering::Ordered);
        a.send(&Bytes::from_static(b"last words"), Aggregation::Immediate)
            .unwrap();
        a.close();
        assert!(!b.is_open());
        assert_eq!(&b.try_recv().unwrap()[..], b"last words");
    }

    #[test]
    fn acceptor_only_yields_after_start() {
        let (mut acceptor, connector) = memory_listener();
        let _client = connector
            .connect(Reliability::Reliable, Ordering::Ordered)
            .unwrap();
        assert!(acceptor.poll().unwrap().is_empty());
        acceptor.start().unwrap();
        assert_eq!(acceptor.poll().unwrap().len(), 1);
    }
}
