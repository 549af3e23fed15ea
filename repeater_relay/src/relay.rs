// Relay handler: forward every application message to every other client.
//
// Stateless. The target set is a snapshot of the registry minus the source,
// taken when the message is dispatched. The forwarded message keeps the
// reliability and ordering of the transport it arrived on and is always sent
// `Immediate`. Payloads are never inspected: a `RawMessage` re-encodes as a
// clone of the bytes it was received in.

use repeater_protocol::{Aggregation, ConnexionId, DeliveryRequirements, Message};

use crate::server::ServerCore;
use crate::transport::TransportInfo;

/// Delivery requirements for relaying something received on `transport`.
pub fn relay_requirements(transport: &TransportInfo) -> DeliveryRequirements {
    DeliveryRequirements::new(
        transport.reliability,
        transport.ordering,
        Aggregation::Immediate,
    )
}

/// Send `message` from `from` to everybody else. Returns the number of
/// targets (0 when `from` is alone, in which case nothing is sent).
pub fn relay_message(
    core: &mut ServerCore,
    message: &Message,
    from: ConnexionId,
    transport: &TransportInfo,
) -> usize {
    let targets: Vec<ConnexionId> = core
        .connexion_ids()
        .into_iter()
        .filter(|&id| id != from)
        .collect();
    if !targets.is_empty() {
        core.send(message, &targets, relay_requirements(transport));
    }
    targets.len()
}

#[cfg(test)]
mod tests {
    use repeater_protocol::{
        ClientGuid, MessageType, Ordering, RawMessage, Reliability, SystemMessage, decode, encode,
    };

    use super::*;
    use crate::error::ErrorSummary;
    use crate::server::{Server, ServerHandler};
    use crate::transport::{MemoryTransport, Transport, memory_listener};

    #[derive(Default)]
    struct Relay {
        fan_out: Vec<usize>,
        errors: Vec<ErrorSummary>,
    }

    impl ServerHandler for Relay {
        fn message_received(
            &mut self,
            core: &mut ServerCore,
            message: &Message,
            from: ConnexionId,
            transport: &TransportInfo,
        ) {
            self.fan_out
                .push(relay_message(core, message, from, transport));
        }

        fn error(&mut self, _core: &mut ServerCore, error: &ErrorSummary) {
            self.errors.push(error.clone());
        }
    }

    fn hello(client: &mut MemoryTransport) {
        let hello = Message::System(SystemMessage::Hello {
            client_guid: ClientGuid::new_random(),
        });
        client
            .send(&encode(&hello).unwrap(), Aggregation::Immediate)
            .unwrap();
    }

    fn received(client: &mut MemoryTransport) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Some(body) = client.try_recv() {
            match decode(body).unwrap() {
                Message::System(_) => {}
                message => messages.push(message),
            }
        }
        messages
    }

    #[test]
    fn requirements_follow_the_arrival_transport() {
        let info = TransportInfo {
            name: "UDP",
            reliability: Reliability::Unreliable,
            ordering: Ordering::Unordered,
            peer: None,
        };
        let req = relay_requirements(&info);
        assert_eq!(req.reliability, Reliability::Unreliable);
        assert_eq!(req.ordering, Ordering::Unordered);
        assert_eq!(req.aggregation, Aggregation::Immediate);
    }

    #[test]
    fn fans_out_to_everyone_but_the_sender() {
        let (acceptor, connector) = memory_listener();
        let mut server = Server::new(vec![Box::new(acceptor)]);
        server.start().unwrap();
        let mut relay = Relay::default();

        let mut clients: Vec<MemoryTransport> = (0..3)
            .map(|_| {
                let mut client = connector
                    .connect(Reliability::Reliable, Ordering::Ordered)
                    .unwrap();
                hello(&mut client);
                client
            })
            .collect();
        server.update(&mut relay).unwrap();
        for client in &mut clients {
            received(client);
        }

        let m = Message::Raw(RawMessage::new(MessageType::String as u8, 2, b"hello"));
        clients[0]
            .send(&encode(&m).unwrap(), Aggregation::Immediate)
            .unwrap();
        server.update(&mut relay).unwrap();

        assert_eq!(relay.fan_out, vec![2]);
        assert!(received(&mut clients[0]).is_empty());
        assert_eq!(received(&mut clients[1]), vec![m.clone()]);
        assert_eq!(received(&mut clients[2]), vec![m]);
        assert!(relay.errors.is_empty());
    }

    #[test]
    fn single_client_is_a_no_op() {
        let (acceptor, connector) = memory_listener();
        let mut server = Server::new(vec![Box::new(acceptor)]);
        server.start().unwrap();
        let mut relay = Relay::default();

        let mut alone = connector
            .connect(Reliability::Reliable, Ordering::Ordered)
            .unwrap();
        hello(&mut alone);
        let m = Message::Raw(RawMessage::new(MessageType::Binary as u8, 0, b"echo?"));
        alone
            .send(&encode(&m).unwrap(), Aggregation::Immediate)
            .unwrap();
        server.update(&mut relay).unwrap();

        assert_eq!(relay.fan_out, vec![0]);
        assert!(received(&mut alone).is_empty());
        assert!(relay.errors.is_empty());
    }

    #[test]
    fn unreliable_traffic_is_not_upgraded() {
        let (acceptor, connector) = memory_listener();
        let mut server = Server::new(vec![Box::new(acceptor)]);
        server.start().unwrap();
        let mut relay = Relay::default();

        // Sender is reliable-only; the peer has only an unreliable transport,
        // so reliable traffic to it is refused with a warning.
        let mut sender = connector
            .connect(Reliability::Reliable, Ordering::Ordered)
            .unwrap();
        hello(&mut sender);
        let mut peer = connector
            .connect(Reliability::Unreliable, Ordering::Unordered)
            .unwrap();
        hello(&mut peer);
        server.update(&mut relay).unwrap();

        let m = Message::Raw(RawMessage::new(MessageType::Binary as u8, 0, b"x"));
        sender
            .send(&encode(&m).unwrap(), Aggregation::Immediate)
            .unwrap();
        server.update(&mut relay).unwrap();
        assert!(received(&mut peer).is_empty());
        assert_eq!(relay.errors.len(), 1);

        peer.send(&encode(&m).unwrap(), Aggregation::Immediate)
            .unwrap();
        server.update(&mut relay).unwrap();
        assert_eq!(received(&mut sender), vec![m]);
    }
}
