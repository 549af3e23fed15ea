// Session announcer: keeps every client's view of the roster current.
//
// Membership is announced with `SessionMessage`s on one dedicated channel:
// - a new client first gets one `Lives` per peer that was already present,
//   sent to it alone;
// - then every new client is announced with `Joined` to the whole registry,
//   the new client itself and the rest of its batch included;
// - a removed client is announced with `Left` to whoever remains.
//
// `Lives` for the existing roster is queued before any `Joined` of the batch,
// so a client never hears about a peer leaving before it has heard about that
// peer at all. All announcements use reliable, unordered, immediate delivery.
//
// With no channel configured the announcer does nothing.

use repeater_protocol::{
    ConnexionId, DeliveryRequirements, Message, SessionAction, SessionMessage,
};
use tracing::info;

use crate::server::{RemovedConnexion, ServerCore};
use crate::transport::TransportInfo;

pub struct SessionAnnouncer {
    channel: Option<u8>,
    /// Log transport changes (verbosity 2 and up).
    log_transports: bool,
}

impl SessionAnnouncer {
    pub fn new(channel: Option<u8>) -> Self {
        Self {
            channel,
            log_transports: false,
        }
    }

    pub fn with_transport_logging(mut self, enabled: bool) -> Self {
        self.log_transports = enabled;
        self
    }

    /// The session channel, or `None` if announcements are disabled.
    pub fn channel(&self) -> Option<u8> {
        self.channel
    }

    /// Announce a batch of new clients. `joined` must already be registered.
    pub fn clients_joined(&self, core: &mut ServerCore, joined: &[ConnexionId]) {
        let Some(channel) = self.channel else {
            return;
        };
        let registry = core.connexion_ids();
        let existing: Vec<ConnexionId> = registry
            .iter()
            .copied()
            .filter(|id| !joined.contains(id))
            .collect();

        for &newcomer in joined {
            for &other in &existing {
                let lives = SessionMessage::new(channel, other, SessionAction::Lives);
                core.send(
                    &Message::Session(lives),
                    &[newcomer],
                    DeliveryRequirements::session(),
                );
            }
        }
        for &newcomer in joined {
            let announcement = SessionMessage::new(channel, newcomer, SessionAction::Joined);
            core.send(
                &Message::Session(announcement),
                &registry,
                DeliveryRequirements::session(),
            );
        }
    }

    /// Announce departures to the remaining clients.
    pub fn clients_removed(&self, core: &mut ServerCore, removed: &[RemovedConnexion]) {
        let Some(channel) = self.channel else {
            return;
        };
        let registry = core.connexion_ids();
        for gone in removed {
            let left = SessionMessage::new(channel, gone.identity, SessionAction::Left);
            core.send(
                &Message::Session(left),
                &registry,
                DeliveryRequirements::session(),
            );
        }
    }

    pub fn transport_added(&self, connexion: ConnexionId, transport: &TransportInfo) {
        if self.log_transports {
            info!("Client {connexion}: transport added: {transport}");
        }
    }

    pub fn transport_removed(&self, connexion: ConnexionId, transport: &TransportInfo) {
        if self.log_transports {
            info!("Client {connexion}: transport removed: {transport}");
        }
    }
}

#[cfg(test)]
mod tests {
    use repeater_protocol::{
        Aggregation, ClientGuid, Ordering, Reliability, SystemMessage, decode, encode,
    };

    use super::*;
    use crate::error::ErrorSummary;
    use crate::server::{Server, ServerHandler};
    use crate::transport::{MemoryConnector, MemoryTransport, Transport, memory_listener};

    struct Announcing {
        announcer: SessionAnnouncer,
        errors: Vec<ErrorSummary>,
    }

    impl ServerHandler for Announcing {
        fn clients_joined(&mut self, core: &mut ServerCore, joined: &[ConnexionId]) {
            self.announcer.clients_joined(core, joined);
        }

        fn clients_removed(&mut self, core: &mut ServerCore, removed: &[RemovedConnexion]) {
            self.announcer.clients_removed(core, removed);
        }

        fn error(&mut self, _core: &mut ServerCore, error: &ErrorSummary) {
            self.errors.push(error.clone());
        }
    }

    fn setup(channel: Option<u8>) -> (Server, MemoryConnector, Announcing) {
        let (acceptor, connector) = memory_listener();
        let mut server = Server::new(vec![Box::new(acceptor)]);
        server.start().unwrap();
        let handler = Announcing {
            announcer: SessionAnnouncer::new(channel),
            errors: Vec::new(),
        };
        (server, connector, handler)
    }

    fn join(connector: &MemoryConnector) -> MemoryTransport {
        let mut client = connector
            .connect(Reliability::Reliable, Ordering::Ordered)
            .unwrap();
        let hello = Message::System(SystemMessage::Hello {
            client_guid: ClientGuid::new_random(),
        });
        client
            .send(&encode(&hello).unwrap(), Aggregation::Immediate)
            .unwrap();
        client
    }

    /// Session announcements received so far, as `(subject, action)`.
    fn announcements(client: &mut MemoryTransport) -> Vec<(u32, SessionAction)> {
        let mut seen = Vec::new();
        while let Some(body) = client.try_recv() {
            if let Message::Session(m) = decode(body).unwrap() {
                seen.push((m.subject.0, m.action));
            }
        }
        seen
    }

    #[test]
    fn newcomers_learn_the_roster_before_being_announced() {
        let (mut server, connector, mut handler) = setup(Some(0));

        let mut a = join(&connector);
        server.update(&mut handler).unwrap();
        assert_eq!(announcements(&mut a), vec![(1, SessionAction::Joined)]);

        let mut b = join(&connector);
        server.update(&mut handler).unwrap();
        assert_eq!(announcements(&mut a), vec![(2, SessionAction::Joined)]);
        assert_eq!(
            announcements(&mut b),
            vec![(1, SessionAction::Lives), (2, SessionAction::Joined)]
        );

        let mut c = join(&connector);
        server.update(&mut handler).unwrap();
        assert_eq!(announcements(&mut a), vec![(3, SessionAction::Joined)]);
        assert_eq!(announcements(&mut b), vec![(3, SessionAction::Joined)]);
        assert_eq!(
            announcements(&mut c),
            vec![
                (1, SessionAction::Lives),
                (2, SessionAction::Lives),
                (3, SessionAction::Joined)
            ]
        );
        assert!(handler.errors.is_empty());
    }

    #[test]
    fn same_batch_joiners_hear_about_each_other_once() {
        let (mut server, connector, mut handler) = setup(Some(5));
        let mut a = join(&connector);
        let mut b = join(&connector);
        server.update(&mut handler).unwrap();

        let expected = vec![(1, SessionAction::Joined), (2, SessionAction::Joined)];
        assert_eq!(announcements(&mut a), expected);
        assert_eq!(announcements(&mut b), expected);
    }

    #[test]
    fn batch_joiners_only_get_lives_for_existing_peers() {
        let (mut server, connector, mut handler) = setup(Some(0));
        let mut a = join(&connector);
        server.update(&mut handler).unwrap();
        announcements(&mut a);

        let mut b = join(&connector);
        let mut c = join(&connector);
        server.update(&mut handler).unwrap();

        let announced = vec![(2, SessionAction::Joined), (3, SessionAction::Joined)];
        assert_eq!(announcements(&mut a), announced);
        let mut caught_up = vec![(1, SessionAction::Lives)];
        caught_up.extend(announced.iter().copied());
        assert_eq!(announcements(&mut b), caught_up);
        assert_eq!(announcements(&mut c), caught_up);
        assert!(handler.errors.is_empty());
    }

    #[test]
    fn departures_are_announced_to_the_rest() {
        let (mut server, connector, mut handler) = setup(Some(0));
        let mut a = join(&connector);
        let mut b = join(&connector);
        let mut c = join(&connector);
        server.update(&mut handler).unwrap();
        for client in [&mut a, &mut b, &mut c] {
            announcements(client);
        }

        b.close();
        server.update(&mut handler).unwrap();
        assert_eq!(announcements(&mut a), vec![(2, SessionAction::Left)]);
        assert_eq!(announcements(&mut c), vec![(2, SessionAction::Left)]);

        server.update(&mut handler).unwrap();
        assert!(announcements(&mut a).is_empty());
    }

    #[test]
    fn announcements_use_the_configured_channel() {
        let (mut server, connector, mut handler) = setup(Some(7));
        let mut a = join(&connector);
        server.update(&mut handler).unwrap();

        let channels: Vec<u8> = std::iter::from_fn(|| a.try_recv())
            .filter_map(|body| match decode(body).unwrap() {
                Message::Session(m) => Some(m.channel),
                _ => None,
            })
            .collect();
        assert_eq!(channels, vec![7]);
    }

    #[test]
    fn disabled_channel_sends_nothing() {
        let (mut server, connector, mut handler) = setup(None);
        let mut a = join(&connector);
        let mut b = join(&connector);
        server.update(&mut handler).unwrap();
        b.close();
        server.update(&mut handler).unwrap();

        assert!(announcements(&mut a).is_empty());
        assert_eq!(handler.announcer.channel(), None);
    }
}
