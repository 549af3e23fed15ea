// Server core: connexion registry, accept/handshake, and the update cycle.
//
// Architecture: acceptors and transports do their blocking I/O on their own
// threads and hand results over through `mpsc` queues. Everything else
// happens on whichever thread calls `Server::update()`:
//
// 1. **Accept/handshake**: poll acceptors; new transports wait in `pending`
//    until their first frame. A `Hello` either creates a connexion (reported
//    in this cycle's `clients_joined`) or attaches the transport to the
//    connexion with the same client guid (`transport_added`). The server
//    answers `Welcome` either way.
// 2. **Receive**: drain every connexion's transports in registry order and
//    hand each application message to `message_received`. Connexions whose
//    transports closed are still drained; dropped ones are not.
// 3. **Tick**: `ServerHandler::tick`, where periodic work (liveness) runs.
// 4. **Prune**: detach closed transports (`transport_removed`) and remove
//    dead connexions, reported together in one `clients_removed`.
// 5. **Flush** aggregated outbound traffic.
//
// Errors raised during a phase are queued in `ServerCore` and delivered to
// `ServerHandler::error` at the end of that phase.
//
// Handlers only ever see `&mut ServerCore`: they can send, drop connexions
// and report errors, but cannot reach `update()` or `stop()`. Together with
// `update(&mut self)` that makes a re-entrant or overlapping tick
// unrepresentable rather than a runtime check.

use std::collections::BTreeMap;
use std::mem;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use repeater_protocol::{
    Aggregation, ClientGuid, ConnexionId, DeliveryRequirements, Message, SystemMessage, decode,
    encode,
};
use tracing::{debug, trace};

use crate::config::RepeaterConfig;
use crate::connexion::{Connexion, DropReason, Inbound, SendFailure};
use crate::error::{ErrorSummary, ServerError, Severity, TransportError};
use crate::transport::{Acceptor, TcpAcceptor, Transport, TransportInfo, UdpAcceptor};

/// Default time a new transport may take to send its `Hello`.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Active,
    Stopped,
}

/// A connexion that left the registry during an update cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemovedConnexion {
    pub identity: ConnexionId,
    pub guid: ClientGuid,
    /// Transports still attached at removal time.
    pub transports: Vec<TransportInfo>,
    pub reason: DropReason,
}

/// Callbacks fired by `Server::update`. Every method defaults to doing
/// nothing.
#[allow(unused_variables)]
pub trait ServerHandler {
    /// Connexions admitted this cycle, in admission order.
    fn clients_joined(&mut self, core: &mut ServerCore, joined: &[ConnexionId]) {}

    fn message_received(
        &mut self,
        core: &mut ServerCore,
        message: &Message,
        from: ConnexionId,
        transport: &TransportInfo,
    ) {
    }

    /// Connexions removed this cycle. They are no longer in the registry.
    fn clients_removed(&mut self, core: &mut ServerCore, removed: &[RemovedConnexion]) {}

    fn transport_added(
        &mut self,
        core: &mut ServerCore,
        connexion: ConnexionId,
        transport: &TransportInfo,
    ) {
    }

    fn transport_removed(
        &mut self,
        core: &mut ServerCore,
        connexion: ConnexionId,
        transport: &TransportInfo,
    ) {
    }

    /// Runs once per cycle after receive dispatch.
    fn tick(&mut self, core: &mut ServerCore, now: Instant) {}

    fn error(&mut self, core: &mut ServerCore, error: &ErrorSummary) {}
}

/// The registry and everything a handler may do with it.
#[derive(Default)]
pub struct ServerCore {
    connexions: BTreeMap<ConnexionId, Connexion>,
    errors: Vec<ErrorSummary>,
}

impl ServerCore {
    /// Identities of all registered connexions, ascending.
    pub fn connexion_ids(&self) -> Vec<ConnexionId> {
        self.connexions.keys().copied().collect()
    }

    pub fn connexion(&self, id: ConnexionId) -> Option<&Connexion> {
        self.connexions.get(&id)
    }

    pub fn contains(&self, id: ConnexionId) -> bool {
        self.connexions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connexions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connexions.is_empty()
    }

    /// Queue an error for the handler's error sink.
    pub fn report(&mut self, error: ErrorSummary) {
        self.errors.push(error);
    }

    /// Encode `message` once and send it to each target. Per-target failures
    /// are reported and never affect the other targets:
    /// - no transport satisfying `req`: Warning;
    /// - frame larger than the transport's max packet size: Error;
    /// - transport failure: Warning, and the target is dropped.
    pub fn send(&mut self, message: &Message, targets: &[ConnexionId], req: DeliveryRequirements) {
        if targets.is_empty() {
            return;
        }
        let body = match encode(message) {
            Ok(body) => body,
            Err(err) => {
                self.report(ErrorSummary::new(
                    Severity::Error,
                    format!("could not encode message: {err}"),
                ));
                return;
            }
        };
        for &target in targets {
            let Some(connexion) = self.connexions.get_mut(&target) else {
                continue;
            };
            if connexion.is_dead() {
                continue;
            }
            let failure = match connexion.send(&body, req) {
                Ok(()) => continue,
                Err(failure) => failure,
            };
            let summary = match failure {
                SendFailure::Unsatisfiable => ErrorSummary::new(
                    Severity::Warning,
                    format!(
                        "no transport satisfies {:?}/{:?}; message dropped",
                        req.reliability, req.ordering
                    ),
                ),
                SendFailure::TooLarge { size, max } => ErrorSummary::new(
                    Severity::Error,
                    format!("message of {size} bytes exceeds maximum packet size of {max}; dropped"),
                ),
                SendFailure::Transport(err) => {
                    connexion.mark_dropped(DropReason::TransportError(err.to_string()));
                    ErrorSummary::new(Severity::Warning, format!("send failed: {err}"))
                }
            };
            self.report(summary.for_connexion(target));
        }
    }

    /// Mark a connexion for removal. Returns `false` if it is not registered.
    pub fn drop_connexion(&mut self, id: ConnexionId, reason: DropReason) -> bool {
        match self.connexions.get_mut(&id) {
            Some(connexion) => {
                connexion.mark_dropped(reason);
                true
            }
            None => false,
        }
    }

    /// Ping every transport of `id` that is not already awaiting a response.
    pub(crate) fn ping(&mut self, id: ConnexionId, now: Instant) -> Result<(), TransportError> {
        match self.connexions.get_mut(&id) {
            Some(connexion) => connexion.ping(now),
            None => Err(TransportError::Closed),
        }
    }

    pub(crate) fn expire_pings(&mut self, id: ConnexionId) {
        if let Some(connexion) = self.connexions.get_mut(&id) {
            connexion.expire_pings();
        }
    }

    /// Lowest identity not currently in use, starting at 1.
    fn allocate_identity(&self) -> ConnexionId {
        let mut candidate = 1;
        for id in self.connexions.keys() {
            if id.0 == candidate {
                candidate += 1;
            } else if id.0 > candidate {
                break;
            }
        }
        ConnexionId(candidate)
    }

    fn find_by_guid(&self, guid: ClientGuid) -> Option<ConnexionId> {
        self.connexions
            .iter()
            .find(|(_, connexion)| connexion.guid() == guid && !connexion.is_dead())
            .map(|(id, _)| *id)
    }

    /// Detach closed transports from live connexions and remove dead ones.
    fn prune(&mut self) -> (Vec<(ConnexionId, TransportInfo)>, Vec<RemovedConnexion>) {
        let mut detached = Vec::new();
        for (id, connexion) in &mut self.connexions {
            if !connexion.is_dead() {
                detached.extend(connexion.prune_closed().into_iter().map(|info| (*id, info)));
            }
        }

        let dead: Vec<ConnexionId> = self
            .connexions
            .iter()
            .filter(|(_, connexion)| connexion.is_dead())
            .map(|(id, _)| *id)
            .collect();
        let mut removed = Vec::with_capacity(dead.len());
        for id in dead {
            if let Some(mut connexion) = self.connexions.remove(&id) {
                connexion.close_all();
                removed.push(RemovedConnexion {
                    identity: id,
                    guid: connexion.guid(),
                    transports: connexion.transports(),
                    reason: connexion.drop_reason(),
                });
            }
        }
        (detached, removed)
    }

    fn flush_all(&mut self) {
        let mut failures = Vec::new();
        for (id, connexion) in &mut self.connexions {
            if connexion.is_dead() {
                continue;
            }
            if let Err(err) = connexion.flush() {
                connexion.mark_dropped(DropReason::TransportError(err.to_string()));
                failures.push(
                    ErrorSummary::new(Severity::Warning, format!("flush failed: {err}"))
                        .for_connexion(*id),
                );
            }
        }
        self.errors.extend(failures);
    }

    fn close_all(&mut self) {
        for connexion in self.connexions.values_mut() {
            connexion.close_all();
        }
        self.connexions.clear();
        self.errors.clear();
    }
}

/// A transport that has been accepted but has not sent its `Hello` yet.
struct PendingTransport {
    transport: Box<dyn Transport>,
    accepted_at: Instant,
}

enum Admission {
    Joined(ConnexionId),
    Attached(ConnexionId, TransportInfo),
}

pub struct Server {
    acceptors: Vec<Box<dyn Acceptor>>,
    max_packet_size: Option<usize>,
    handshake_timeout: Duration,
    state: ServerState,
    core: ServerCore,
    pending: Vec<PendingTransport>,
}

impl Server {
    /// A server accepting from the given endpoints, with no packet cap.
    pub fn new(acceptors: Vec<Box<dyn Acceptor>>) -> Self {
        Self {
            acceptors,
            max_packet_size: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            state: ServerState::Created,
            core: ServerCore::default(),
            pending: Vec::new(),
        }
    }

    /// TCP (and, if enabled, UDP) on the configured address.
    pub fn from_config(config: &RepeaterConfig) -> Self {
        let addr = config.listen_addr();
        let tcp = TcpAcceptor::new(addr).with_write_timeout(config.write_timeout());
        let mut acceptors: Vec<Box<dyn Acceptor>> = vec![Box::new(tcp)];
        if config.enable_udp {
            acceptors.push(Box::new(UdpAcceptor::new(addr)));
        }
        Self::new(acceptors)
            .with_max_packet_size(config.packet_cap())
            .with_handshake_timeout(config.handshake_timeout())
    }

    /// Cap applied to every accepted transport. `None` keeps transport
    /// defaults.
    pub fn with_max_packet_size(mut self, cap: Option<usize>) -> Self {
        self.max_packet_size = cap;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn core(&self) -> &ServerCore {
        &self.core
    }

    /// Direct registry access between ticks. Errors reported here reach the
    /// handler during the next `update`.
    pub fn core_mut(&mut self) -> &mut ServerCore {
        &mut self.core
    }

    /// Bound addresses of started acceptors.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.acceptors
            .iter()
            .filter_map(|acceptor| acceptor.local_addr())
            .collect()
    }

    /// Bind every acceptor. A no-op while active. If any bind fails, the
    /// ones already started are stopped again and the state is unchanged.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.state == ServerState::Active {
            return Ok(());
        }
        for index in 0..self.acceptors.len() {
            if let Err(err) = self.acceptors[index].start() {
                for acceptor in &mut self.acceptors[..index] {
                    acceptor.stop();
                }
                return Err(err);
            }
        }
        self.state = ServerState::Active;
        debug!(addrs = ?self.local_addrs(), "server started");
        Ok(())
    }

    /// Close everything without firing removal events. Idempotent.
    pub fn stop(&mut self) {
        if self.state != ServerState::Active {
            return;
        }
        for acceptor in &mut self.acceptors {
            acceptor.stop();
        }
        for pending in &mut self.pending {
            pending.transport.close();
        }
        self.pending.clear();
        self.core.close_all();
        self.state = ServerState::Stopped;
        debug!("server stopped");
    }

    /// Run one update cycle.
    pub fn update<H: ServerHandler + ?Sized>(&mut self, handler: &mut H) -> Result<(), ServerError> {
        if self.state != ServerState::Active {
            return Err(ServerError::NotActive);
        }
        let now = Instant::now();

        self.accept(now);
        let admissions = self.handshake(now);
        let mut joined = Vec::new();
        for admission in admissions {
            match admission {
                Admission::Joined(id) => joined.push(id),
                Admission::Attached(id, info) => handler.transport_added(&mut self.core, id, &info),
            }
        }
        if !joined.is_empty() {
            handler.clients_joined(&mut self.core, &joined);
        }
        self.deliver_errors(handler);

        for id in self.core.connexion_ids() {
            let inbound = match self.core.connexions.get_mut(&id) {
                // Closed transports still hand over what they queued before
                // closing, so only explicitly dropped connexions are skipped.
                Some(connexion) if !connexion.is_dropped() => {
                    connexion.poll(now, &mut self.core.errors)
                }
                _ => continue,
            };
            for Inbound { message, transport } in inbound {
                trace!(%id, %transport, tag = message.message_type_tag(), "message received");
                handler.message_received(&mut self.core, &message, id, &transport);
            }
        }
        self.deliver_errors(handler);

        handler.tick(&mut self.core, now);
        self.deliver_errors(handler);

        let (detached, removed) = self.core.prune();
        for (id, info) in detached {
            handler.transport_removed(&mut self.core, id, &info);
        }
        if !removed.is_empty() {
            handler.clients_removed(&mut self.core, &removed);
        }
        self.deliver_errors(handler);

        self.core.flush_all();
        self.deliver_errors(handler);
        Ok(())
    }

    fn deliver_errors<H: ServerHandler + ?Sized>(&mut self, handler: &mut H) {
        for error in mem::take(&mut self.core.errors) {
            handler.error(&mut self.core, &error);
        }
    }

    fn accept(&mut self, now: Instant) {
        for acceptor in &mut self.acceptors {
            match acceptor.poll() {
                Ok(transports) => {
                    for mut transport in transports {
                        if let Some(cap) = self.max_packet_size {
                            transport.set_max_packet_size(cap);
                        }
                        debug!(transport = %transport.info(), "transport accepted");
                        self.pending.push(PendingTransport {
                            transport,
                            accepted_at: now,
                        });
                    }
                }
                Err(err) => {
                    let addr = acceptor.local_addr();
                    // Stopped so the failure is reported once.
                    acceptor.stop();
                    self.core.report(ErrorSummary::new(
                        Severity::Fatal,
                        format!("acceptor {addr:?} failed: {err}"),
                    ));
                }
            }
        }
    }

    /// Advance pending transports: admit those whose `Hello` arrived, close
    /// those that misbehaved or timed out.
    fn handshake(&mut self, now: Instant) -> Vec<Admission> {
        let mut admissions = Vec::new();
        for mut pending in mem::take(&mut self.pending) {
            let info = pending.transport.info();
            let Some(body) = pending.transport.try_recv() else {
                if !pending.transport.is_open() {
                    debug!(transport = %info, "transport closed before handshake");
                } else if now.saturating_duration_since(pending.accepted_at) > self.handshake_timeout
                {
                    pending.transport.close();
                    self.core.report(ErrorSummary::new(
                        Severity::Information,
                        format!("{info}: handshake timed out"),
                    ));
                } else {
                    self.pending.push(pending);
                }
                continue;
            };
            match decode(body) {
                Ok(Message::System(SystemMessage::Hello { client_guid })) => {
                    if let Some(admission) = self.admit(pending.transport, client_guid, now) {
                        admissions.push(admission);
                    }
                }
                Ok(other) => {
                    pending.transport.close();
                    self.core.report(ErrorSummary::new(
                        Severity::Warning,
                        format!(
                            "{info}: expected Hello, got message type {}; transport closed",
                            other.message_type_tag()
                        ),
                    ));
                }
                Err(err) => {
                    pending.transport.close();
                    self.core.report(ErrorSummary::new(
                        Severity::Warning,
                        format!("{info}: undecodable handshake: {err}; transport closed"),
                    ));
                }
            }
        }
        admissions
    }

    fn admit(
        &mut self,
        mut transport: Box<dyn Transport>,
        guid: ClientGuid,
        now: Instant,
    ) -> Option<Admission> {
        let info = transport.info();
        let existing = self.core.find_by_guid(guid);
        let identity = existing.unwrap_or_else(|| self.core.allocate_identity());

        let welcome = encode(&Message::System(SystemMessage::Welcome { identity }))
            .map_err(|err| TransportError::Io(std::io::Error::other(err)))
            .and_then(|body| transport.send(&body, Aggregation::Immediate));
        if let Err(err) = welcome {
            transport.close();
            self.core.report(ErrorSummary::new(
                Severity::Warning,
                format!("{info}: could not send Welcome: {err}"),
            ));
            return None;
        }

        match existing {
            Some(id) => {
                let connexion = self.core.connexions.get_mut(&id)?;
                connexion.add_transport(transport, now);
                debug!(%id, transport = %info, "transport attached");
                Some(Admission::Attached(id, info))
            }
            None => {
                let connexion = Connexion::new(identity, guid, transport, now);
                self.core.connexions.insert(identity, connexion);
                debug!(id = %identity, %guid, transport = %info, "connexion admitted");
                Some(Admission::Joined(identity))
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
