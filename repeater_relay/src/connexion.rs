// Connexion: one logical remote peer, possibly reachable over several
// transports.
//
// A connexion owns an ordered list of transports (insertion order = order
// added). Sends pick the first open transport whose declared reliability and
// ordering satisfy the requested delivery requirements, so adding a UDP
// transport to a TCP client never weakens what reliable traffic gets.
//
// Connexion-layer system messages are handled here and never surface as
// application messages: ping requests are answered on the transport they
// arrived on, ping responses update the round-trip estimate and the
// connexion's last-response instant, and `Goodbye` marks the connexion for
// graceful removal.
//
// A connexion is dead once it has been marked dropped or has no open
// transport left. The server removes dead connexions during its update cycle.

use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use repeater_protocol::{
    Aggregation, ClientGuid, ConnexionId, DeliveryRequirements, Message, SystemMessage, decode,
    encode, packet_len,
};
use tracing::trace;

use crate::error::{ErrorSummary, Severity, TransportError};
use crate::transport::{Transport, TransportInfo};

/// Why a connexion left the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Every transport closed.
    Closed,
    /// The peer said goodbye.
    Goodbye,
    /// No ping response within the inactive timeout.
    Inactive,
    /// A send or flush failed.
    TransportError(String),
    /// The peer sent something that could not be decoded.
    DecodeError(String),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Closed => f.write_str("transports closed"),
            DropReason::Goodbye => f.write_str("goodbye"),
            DropReason::Inactive => f.write_str("inactive"),
            DropReason::TransportError(e) => write!(f, "transport error: {e}"),
            DropReason::DecodeError(e) => write!(f, "decode error: {e}"),
        }
    }
}

/// An application (non-system) message and the transport it arrived on.
#[derive(Clone, Debug)]
pub struct Inbound {
    pub message: Message,
    pub transport: TransportInfo,
}

/// Why a send to this connexion did not happen.
#[derive(Debug)]
pub(crate) enum SendFailure {
    /// No open transport satisfies the requested delivery requirements.
    Unsatisfiable,
    TooLarge { size: usize, max: usize },
    Transport(TransportError),
}

struct OutstandingPing {
    sequence: u32,
    sent_at: Instant,
}

struct TransportSlot {
    transport: Box<dyn Transport>,
    info: TransportInfo,
    last_received: Instant,
    ping: Option<OutstandingPing>,
    round_trip: Option<Duration>,
}

pub struct Connexion {
    identity: ConnexionId,
    guid: ClientGuid,
    transports: Vec<TransportSlot>,
    last_ping_response: Instant,
    next_ping_sequence: u32,
    dropped: Option<DropReason>,
}

impl Connexion {
    pub(crate) fn new(
        identity: ConnexionId,
        guid: ClientGuid,
        transport: Box<dyn Transport>,
        now: Instant,
    ) -> Self {
        let mut connexion = Self {
            identity,
            guid,
            transports: Vec::new(),
            last_ping_response: now,
            next_ping_sequence: 0,
            dropped: None,
        };
        connexion.add_transport(transport, now);
        connexion
    }

    pub fn identity(&self) -> ConnexionId {
        self.identity
    }

    pub fn guid(&self) -> ClientGuid {
        self.guid
    }

    /// Descriptions of the attached transports, in insertion order.
    pub fn transports(&self) -> Vec<TransportInfo> {
        self.transports.iter().map(|slot| slot.info).collect()
    }

    /// When a ping response last arrived (creation time if never).
    pub fn last_ping_response(&self) -> Instant {
        self.last_ping_response
    }

    /// Most recent receive on any transport.
    pub fn last_received(&self) -> Option<Instant> {
        self.transports.iter().map(|slot| slot.last_received).max()
    }

    /// Round-trip estimate of the first transport that has one.
    pub fn round_trip(&self) -> Option<Duration> {
        self.transports.iter().find_map(|slot| slot.round_trip)
    }

    pub fn is_dead(&self) -> bool {
        self.dropped.is_some() || !self.transports.iter().any(|slot| slot.transport.is_open())
    }

    /// Marked for removal, as opposed to merely having lost its transports.
    pub fn is_dropped(&self) -> bool {
        self.dropped.is_some()
    }

    /// Mark for removal. The first reason given wins.
    pub(crate) fn mark_dropped(&mut self, reason: DropReason) {
        if self.dropped.is_none() {
            self.dropped = Some(reason);
        }
    }

    pub(crate) fn drop_reason(&self) -> DropReason {
        self.dropped.clone().unwrap_or(DropReason::Closed)
    }

    pub(crate) fn add_transport(&mut self, transport: Box<dyn Transport>, now: Instant) -> TransportInfo {
        let info = transport.info();
        self.transports.push(TransportSlot {
            transport,
            info,
            last_received: now,
            ping: None,
            round_trip: None,
        });
        info
    }

    /// Detach closed transports, returning their descriptions.
    pub(crate) fn prune_closed(&mut self) -> Vec<TransportInfo> {
        let mut removed = Vec::new();
        self.transports.retain_mut(|slot| {
            if slot.transport.is_open() {
                true
            } else {
                removed.push(slot.info);
                false
            }
        });
        removed
    }

    pub(crate) fn close_all(&mut self) {
        for slot in &mut self.transports {
            slot.transport.close();
        }
    }

    /// Drain every transport's receive queue, in transport order. System
    /// messages are consumed here; problems are appended to `errors`.
    pub(crate) fn poll(&mut self, now: Instant, errors: &mut Vec<ErrorSummary>) -> Vec<Inbound> {
        let identity = self.identity;
        let mut inbound = Vec::new();
        let mut pong = false;
        let mut goodbye = false;
        let mut failure = None;

        'transports: for slot in &mut self.transports {
            while let Some(body) = slot.transport.try_recv() {
                slot.last_received = now;
                let message = match decode(body) {
                    Ok(message) => message,
                    Err(err) => {
                        failure = Some(err.to_string());
                        break 'transports;
                    }
                };
                match message {
                    Message::System(SystemMessage::PingRequest {
                        sequence,
                        sent_millis,
                    }) => {
                        let reply = Message::System(SystemMessage::PingResponse {
                            sequence,
                            sent_millis,
                        });
                        if let Ok(body) = encode(&reply) {
                            // A failed reply closes the transport; pruning
                            // picks that up later in the cycle.
                            let _ = slot.transport.send(&body, Aggregation::Immediate);
                        }
                    }
                    Message::System(SystemMessage::PingResponse { sequence, .. }) => {
                        if let Some(ping) = slot.ping.take_if(|ping| ping.sequence == sequence) {
                            let rtt = now.saturating_duration_since(ping.sent_at);
                            slot.round_trip = Some(rtt);
                            trace!(%identity, transport = %slot.info, ?rtt, "ping response");
                        }
                        pong = true;
                    }
                    Message::System(SystemMessage::Goodbye) => {
                        goodbye = true;
                    }
                    Message::System(other) => {
                        errors.push(
                            ErrorSummary::new(
                                Severity::Information,
                                format!("ignoring unexpected system message {other:?}"),
                            )
                            .for_connexion(identity),
                        );
                    }
                    message => inbound.push(Inbound {
                        message,
                        transport: slot.info,
                    }),
                }
            }
        }

        if pong {
            self.last_ping_response = now;
        }
        if let Some(err) = failure {
            errors.push(
                ErrorSummary::new(Severity::Warning, format!("undecodable message: {err}"))
                    .for_connexion(identity),
            );
            self.mark_dropped(DropReason::DecodeError(err));
        }
        if goodbye {
            self.mark_dropped(DropReason::Goodbye);
        }
        inbound
    }

    /// Send an encoded body on the first transport able to honour `req`.
    pub(crate) fn send(&mut self, body: &Bytes, req: DeliveryRequirements) -> Result<(), SendFailure> {
        let slot = self
            .transports
            .iter_mut()
            .find(|slot| {
                slot.transport.is_open()
                    && req.satisfied_by(slot.info.reliability, slot.info.ordering)
            })
            .ok_or(SendFailure::Unsatisfiable)?;
        let size = packet_len(body.len());
        let max = slot.transport.max_packet_size();
        if size > max {
            return Err(SendFailure::TooLarge { size, max });
        }
        slot.transport
            .send(body, req.aggregation)
            .map_err(SendFailure::Transport)
    }

    /// Send a ping request on every open transport that is not already
    /// awaiting one. Succeeds if at least one transport has a ping in flight.
    pub(crate) fn ping(&mut self, now: Instant) -> Result<(), TransportError> {
        #[expect(clippy::cast_possible_truncation)]
        let sent_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let mut in_flight = false;
        let mut last_error = TransportError::Closed;

        for slot in &mut self.transports {
            if !slot.transport.is_open() {
                continue;
            }
            if slot.ping.is_some() {
                in_flight = true;
                continue;
            }
            let sequence = self.next_ping_sequence;
            self.next_ping_sequence = self.next_ping_sequence.wrapping_add(1);
            let request = Message::System(SystemMessage::PingRequest {
                sequence,
                sent_millis,
            });
            let body = match encode(&request) {
                Ok(body) => body,
                Err(err) => {
                    last_error = TransportError::Io(std::io::Error::other(err));
                    continue;
                }
            };
            match slot.transport.send(&body, Aggregation::Immediate) {
                Ok(()) => {
                    slot.ping = Some(OutstandingPing {
                        sequence,
                        sent_at: now,
                    });
                    in_flight = true;
                }
                Err(err) => last_error = err,
            }
        }

        if in_flight { Ok(()) } else { Err(last_error) }
    }

    /// Forget outstanding pings so the next `ping` issues fresh ones.
    pub(crate) fn expire_pings(&mut self) {
        for slot in &mut self.transports {
            slot.ping = None;
        }
    }

    /// Flush aggregated sends on every open transport.
    pub(crate) fn flush(&mut self) -> Result<(), TransportError> {
        for slot in &mut self.transports {
            if slot.transport.is_open() {
                slot.transport.flush()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use repeater_protocol::{MessageType, Ordering, RawMessage, Reliability};

    use super::*;
    use crate::transport::{MemoryTransport, memory_pair};

    fn connexion_with(
        reliability: Reliability,
        ordering: Ordering,
    ) -> (Connexion, MemoryTransport) {
        let (server_end, client_end) = memory_pair(reliability, ordering);
        let connexion = Connexion::new(
            ConnexionId(1),
            ClientGuid::new_random(),
            Box::new(server_end),
            Instant::now(),
        );
        (connexion, client_end)
    }

    fn send_from_client(client: &mut MemoryTransport, message: &Message) {
        client
            .send(&encode(message).unwrap(), Aggregation::Immediate)
            .unwrap();
    }

    fn recv_on_client(client: &mut MemoryTransport) -> Message {
        decode(client.try_recv().expect("nothing received")).unwrap()
    }

    #[test]
    fn reliable_send_over_unreliable_transport_is_unsatisfiable() {
        let (mut connexion, _client) = connexion_with(Reliability::Unreliable, Ordering::Unordered);
        let body = Bytes::from_static(&[1, 0]);
        assert!(matches!(
            connexion.send(&body, DeliveryRequirements::session()),
            Err(SendFailure::Unsatisfiable)
        ));
    }

    #[test]
    fn send_uses_first_satisfying_transport() {
        let (mut connexion, mut unreliable_client) =
            connexion_with(Reliability::Unreliable, Ordering::Unordered);
        let (reliable_server, mut reliable_client) =
            memory_pair(Reliability::Reliable, Ordering::Ordered);
        connexion.add_transport(Box::new(reliable_server), Instant::now());

        let body = Bytes::from_static(&[1, 0, 42]);
        connexion.send(&body, DeliveryRequirements::session()).unwrap();
        assert!(unreliable_client.try_recv().is_none());
        assert_eq!(reliable_client.try_recv().unwrap(), body);

        let unreliable = DeliveryRequirements::new(
            Reliability::Unreliable,
            Ordering::Unordered,
            Aggregation::Immediate,
        );
        connexion.send(&body, unreliable).unwrap();
        assert_eq!(unreliable_client.try_recv().unwrap(), body);
    }

    #[test]
    fn oversized_send_is_refused_before_the_transport() {
        let (mut connexion, mut client) = connexion_with(Reliability::Reliable, Ordering::Ordered);
        connexion.transports[0].transport.set_max_packet_size(10);
        let body = Bytes::from(vec![0u8; 7]);
        assert!(matches!(
            connexion.send(&body, DeliveryRequirements::session()),
            Err(SendFailure::TooLarge { size: 11, max: 10 })
        ));
        assert!(client.try_recv().is_none());
        assert!(!connexion.is_dead());
    }

    #[test]
    fn ping_roundtrip_updates_liveness() {
        let (mut connexion, mut client) = connexion_with(Reliability::Reliable, Ordering::Ordered);
        let created = connexion.last_ping_response();
        let mut errors = Vec::new();

        connexion.ping(Instant::now()).unwrap();
        let (sequence, sent_millis) = match recv_on_client(&mut client) {
            Message::System(SystemMessage::PingRequest {
                sequence,
                sent_millis,
            }) => (sequence, sent_millis),
            other => panic!("expected PingRequest, got {other:?}"),
        };

        // A second ping while one is outstanding sends nothing new.
        connexion.ping(Instant::now()).unwrap();
        assert!(client.try_recv().is_none());

        send_from_client(
            &mut client,
            &Message::System(SystemMessage::PingResponse {
                sequence,
                sent_millis,
            }),
        );
        let later = created + Duration::from_millis(20);
        let inbound = connexion.poll(later, &mut errors);
        assert!(inbound.is_empty());
        assert!(errors.is_empty());
        assert_eq!(connexion.last_ping_response(), later);
        assert!(connexion.round_trip().is_some());
    }

    #[test]
    fn client_pings_are_answered() {
        let (mut connexion, mut client) = connexion_with(Reliability::Reliable, Ordering::Ordered);
        send_from_client(
            &mut client,
            &Message::System(SystemMessage::PingRequest {
                sequence: 9,
                sent_millis: 123,
            }),
        );
        let mut errors = Vec::new();
        assert!(connexion.poll(Instant::now(), &mut errors).is_empty());
        assert_eq!(
            recv_on_client(&mut client),
            Message::System(SystemMessage::PingResponse {
                sequence: 9,
                sent_millis: 123,
            })
        );
    }

    #[test]
    fn application_messages_surface_with_transport_info() {
        let (mut connexion, mut client) = connexion_with(Reliability::Reliable, Ordering::Ordered);
        let raw = Message::Raw(RawMessage::new(MessageType::Binary as u8, 1, b"data"));
        send_from_client(&mut client, &raw);
        let mut errors = Vec::new();
        let inbound = connexion.poll(Instant::now(), &mut errors);
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].message, raw);
        assert_eq!(inbound[0].transport.reliability, Reliability::Reliable);
        assert!(connexion.last_received().is_some());
    }

    #[test]
    fn goodbye_marks_connexion_dead() {
        let (mut connexion, mut client) = connexion_with(Reliability::Reliable, Ordering::Ordered);
        send_from_client(&mut client, &Message::System(SystemMessage::Goodbye));
        let mut errors = Vec::new();
        connexion.poll(Instant::now(), &mut errors);
        assert!(connexion.is_dead());
        assert_eq!(connexion.drop_reason(), DropReason::Goodbye);
    }

    #[test]
    fn garbage_marks_connexion_dead_with_warning() {
        let (mut connexion, mut client) = connexion_with(Reliability::Reliable, Ordering::Ordered);
        client
            .send(&Bytes::from_static(&[3, 0, 1]), Aggregation::Immediate)
            .unwrap();
        let mut errors = Vec::new();
        connexion.poll(Instant::now(), &mut errors);
        assert!(connexion.is_dead());
        assert!(matches!(connexion.drop_reason(), DropReason::DecodeError(_)));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].severity, Severity::Warning);
        assert_eq!(errors[0].connexion, Some(ConnexionId(1)));
    }

    #[test]
    fn closed_transports_are_pruned() {
        let (mut connexion, mut client) = connexion_with(Reliability::Reliable, Ordering::Ordered);
        client.close();
        assert!(connexion.is_dead());
        let removed = connexion.prune_closed();
        assert_eq!(removed.len(), 1);
        assert!(connexion.transports().is_empty());
        assert_eq!(connexion.drop_reason(), DropReason::Closed);
    }
}
