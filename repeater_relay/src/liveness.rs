// Liveness monitor: evicts connexions that stop answering pings.
//
// Runs inside `ServerHandler::tick`, so it only ever marks connexions for
// removal through `ServerCore`; the removal itself (and the `Left`
// announcement) happens in the prune phase of the same update.
//
// Every `interval` the monitor makes one round over the registry:
// - a connexion whose last ping response is older than `timeout` is dropped
//   with a Warning;
// - otherwise it is pinged, unless a ping is still outstanding. A ping that
//   has gone unanswered for a whole interval is forgotten and re-sent, which
//   covers pings lost on unreliable transports;
// - a ping that cannot be sent drops the connexion like a timeout would.
//
// A zero timeout disables the monitor entirely.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use repeater_protocol::ConnexionId;
use tracing::debug;

use crate::config::RepeaterConfig;
use crate::connexion::DropReason;
use crate::error::{ErrorSummary, Severity};
use crate::server::ServerCore;

#[derive(Default)]
struct LivenessRecord {
    /// When the outstanding ping went out, if one is outstanding.
    pinged_at: Option<Instant>,
}

pub struct LivenessMonitor {
    timeout: Duration,
    interval: Duration,
    running: bool,
    last_round: Option<Instant>,
    records: HashMap<ConnexionId, LivenessRecord>,
}

impl LivenessMonitor {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            running: false,
            last_round: None,
            records: HashMap::new(),
        }
    }

    pub fn from_config(config: &RepeaterConfig) -> Self {
        Self::new(config.inactive_timeout(), config.ping_interval())
    }

    pub fn is_enabled(&self) -> bool {
        !self.timeout.is_zero()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.last_round = None;
        self.records.clear();
    }

    /// One scheduling step. Does nothing between rounds.
    pub fn tick(&mut self, core: &mut ServerCore, now: Instant) {
        if !self.running || !self.is_enabled() {
            return;
        }
        if let Some(last) = self.last_round {
            if now.saturating_duration_since(last) < self.interval {
                return;
            }
        }
        self.last_round = Some(now);
        self.records.retain(|id, _| core.contains(*id));

        for id in core.connexion_ids() {
            let Some(connexion) = core.connexion(id) else {
                continue;
            };
            if connexion.is_dead() {
                continue;
            }
            let last_response = connexion.last_ping_response();
            if now.saturating_duration_since(last_response) > self.timeout {
                self.records.remove(&id);
                core.drop_connexion(id, DropReason::Inactive);
                core.report(
                    ErrorSummary::new(Severity::Warning, "inactive connexion dropped")
                        .for_connexion(id),
                );
                continue;
            }

            let record = self.records.entry(id).or_default();
            if let Some(sent) = record.pinged_at {
                if last_response >= sent {
                    record.pinged_at = None;
                } else if now.saturating_duration_since(sent) >= self.interval {
                    debug!(%id, "ping unanswered; sending another");
                    core.expire_pings(id);
                    record.pinged_at = None;
                }
            }
            if record.pinged_at.is_some() {
                continue;
            }
            match core.ping(id, now) {
                Ok(()) => record.pinged_at = Some(now),
                Err(err) => {
                    self.records.remove(&id);
                    core.drop_connexion(id, DropReason::TransportError(err.to_string()));
                    core.report(
                        ErrorSummary::new(
                            Severity::Warning,
                            format!("ping failed: {err}; connexion dropped"),
                        )
                        .for_connexion(id),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use repeater_protocol::{
        Aggregation, ClientGuid, Message, Ordering, Reliability, SystemMessage, decode, encode,
    };

    use super::*;
    use crate::server::{RemovedConnexion, Server, ServerHandler};
    use crate::transport::{MemoryConnector, MemoryTransport, Transport, memory_listener};

    struct Monitored {
        monitor: LivenessMonitor,
        removed: Vec<RemovedConnexion>,
        errors: Vec<ErrorSummary>,
    }

    impl ServerHandler for Monitored {
        fn clients_removed(&mut self, _core: &mut ServerCore, removed: &[RemovedConnexion]) {
            self.removed.extend_from_slice(removed);
        }

        fn tick(&mut self, core: &mut ServerCore, now: Instant) {
            self.monitor.tick(core, now);
        }

        fn error(&mut self, _core: &mut ServerCore, error: &ErrorSummary) {
            self.errors.push(error.clone());
        }
    }

    fn setup(timeout_ms: u64, interval_ms: u64) -> (Server, MemoryConnector, Monitored) {
        let (acceptor, connector) = memory_listener();
        let mut server = Server::new(vec![Box::new(acceptor)]);
        server.start().unwrap();
        let mut monitor = LivenessMonitor::new(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(interval_ms),
        );
        monitor.start();
        let handler = Monitored {
            monitor,
            removed: Vec::new(),
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

    /// Answer any pending ping requests. Returns how many there were.
    fn answer_pings(client: &mut MemoryTransport) -> usize {
        let mut answered = 0;
        while let Some(body) = client.try_recv() {
            if let Message::System(SystemMessage::PingRequest {
                sequence,
                sent_millis,
            }) = decode(body).unwrap()
            {
                let reply = Message::System(SystemMessage::PingResponse {
                    sequence,
                    sent_millis,
                });
                client
                    .send(&encode(&reply).unwrap(), Aggregation::Immediate)
                    .unwrap();
                answered += 1;
            }
        }
        answered
    }

    fn run_for(
        server: &mut Server,
        handler: &mut Monitored,
        duration: Duration,
        mut between: impl FnMut(),
    ) {
        let start = Instant::now();
        while start.elapsed() < duration {
            server.update(handler).unwrap();
            between();
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn new_connexions_are_pinged() {
        let (mut server, connector, mut handler) = setup(1000, 100);
        let mut client = join(&connector);
        server.update(&mut handler).unwrap();
        assert_eq!(answer_pings(&mut client), 1);
    }

    #[test]
    fn silent_connexions_are_evicted() {
        let (mut server, connector, mut handler) = setup(40, 10);
        let _silent = join(&connector);
        run_for(&mut server, &mut handler, Duration::from_millis(300), || {});

        assert_eq!(handler.removed.len(), 1);
        assert_eq!(handler.removed[0].reason, DropReason::Inactive);
        assert_eq!(handler.errors.len(), 1);
        assert_eq!(handler.errors[0].severity, Severity::Warning);
        assert_eq!(handler.errors[0].message, "inactive connexion dropped");
        assert!(server.core().is_empty());
    }

    #[test]
    fn responsive_connexions_survive() {
        let (mut server, connector, mut handler) = setup(60, 10);
        let mut client = join(&connector);
        let mut answered = 0;
        run_for(&mut server, &mut handler, Duration::from_millis(300), || {
            answered += answer_pings(&mut client);
        });

        assert!(answered > 1);
        assert!(handler.removed.is_empty());
        assert_eq!(server.core().len(), 1);
    }

    #[test]
    fn zero_timeout_disables_monitoring() {
        let (mut server, connector, mut handler) = setup(0, 0);
        let mut client = join(&connector);
        run_for(&mut server, &mut handler, Duration::from_millis(50), || {});

        assert!(!handler.monitor.is_enabled());
        assert_eq!(answer_pings(&mut client), 0);
        assert!(handler.removed.is_empty());
    }

    #[test]
    fn stopped_monitor_does_nothing() {
        let (mut server, connector, mut handler) = setup(20, 5);
        handler.monitor.stop();
        assert!(!handler.monitor.is_running());
        let mut client = join(&connector);
        run_for(&mut server, &mut handler, Duration::from_millis(60), || {});

        assert_eq!(answer_pings(&mut client), 0);
        assert!(handler.removed.is_empty());
    }
}
