// The client repeater: a `Server` wired to the relay handler, the session
// announcer and the liveness monitor.
//
// `Repeater` can be driven three ways:
// - `update()` from a caller-owned loop (after `start()`);
// - `run()`, a blocking loop on the calling thread that sleeps
//   `tick_interval` between updates;
// - `spawn()`, which binds on the calling thread and then runs the loop on a
//   dedicated thread, returning a `RepeaterHandle`.
//
// `run()` exits after the in-flight tick once its `StopSignal` is triggered
// (from any thread), or with `ServerError::Fatal` after a Fatal error event.
// The server and monitor are stopped either way.
//
// Every error event is logged at a level matching its severity and then
// handed to the listeners registered with `on_error`. Other chatter is gated
// by `verbosity`: 1 logs joins and leaves, 2 adds transport changes, 3 adds
// every relayed message.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use repeater_protocol::{ConnexionId, Message};
use tracing::{debug, error, info, warn};

use crate::config::RepeaterConfig;
use crate::error::{ErrorSummary, ServerError, Severity};
use crate::liveness::LivenessMonitor;
use crate::relay::relay_message;
use crate::server::{RemovedConnexion, Server, ServerCore, ServerHandler};
use crate::session::SessionAnnouncer;
use crate::transport::TransportInfo;

type ErrorListener = Box<dyn FnMut(&ErrorSummary) + Send>;

/// Cross-thread request to leave the run loop.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

struct RepeaterHandler {
    announcer: SessionAnnouncer,
    monitor: LivenessMonitor,
    verbosity: u8,
    listeners: Vec<ErrorListener>,
    fatal: Option<String>,
}

fn describe_transports(transports: &[TransportInfo]) -> String {
    let mut out = String::new();
    for transport in transports {
        let _ = write!(out, " {{{transport}}}");
    }
    out
}

impl ServerHandler for RepeaterHandler {
    fn clients_joined(&mut self, core: &mut ServerCore, joined: &[ConnexionId]) {
        if self.verbosity > 0 {
            for &id in joined {
                if let Some(connexion) = core.connexion(id) {
                    info!(
                        "Client joined: {id}:{}:{}",
                        connexion.guid(),
                        describe_transports(&connexion.transports())
                    );
                }
            }
        }
        self.announcer.clients_joined(core, joined);
    }

    fn message_received(
        &mut self,
        core: &mut ServerCore,
        message: &Message,
        from: ConnexionId,
        transport: &TransportInfo,
    ) {
        let targets = relay_message(core, message, from, transport);
        if self.verbosity > 2 {
            info!(
                "Client {from}: message type {} on channel {} via {transport} relayed to {targets} client(s)",
                message.message_type_tag(),
                message.channel()
            );
        }
    }

    fn clients_removed(&mut self, core: &mut ServerCore, removed: &[RemovedConnexion]) {
        if self.verbosity > 0 {
            for gone in removed {
                info!(
                    "Client left: {}:{}:{} ({})",
                    gone.identity,
                    gone.guid,
                    describe_transports(&gone.transports),
                    gone.reason
                );
            }
        }
        self.announcer.clients_removed(core, removed);
    }

    fn transport_added(
        &mut self,
        _core: &mut ServerCore,
        connexion: ConnexionId,
        transport: &TransportInfo,
    ) {
        self.announcer.transport_added(connexion, transport);
    }

    fn transport_removed(
        &mut self,
        _core: &mut ServerCore,
        connexion: ConnexionId,
        transport: &TransportInfo,
    ) {
        self.announcer.transport_removed(connexion, transport);
    }

    fn tick(&mut self, core: &mut ServerCore, now: Instant) {
        self.monitor.tick(core, now);
    }

    fn error(&mut self, _core: &mut ServerCore, summary: &ErrorSummary) {
        match summary.severity {
            Severity::Information if self.verbosity > 0 => info!("{summary}"),
            Severity::Information => debug!("{summary}"),
            Severity::Warning => warn!("{summary}"),
            Severity::Error => error!("{summary}"),
            Severity::Fatal => {
                error!("{summary}; the repeater cannot continue and should be shut down");
                self.fatal.get_or_insert_with(|| summary.message.clone());
            }
        }
        for listener in &mut self.listeners {
            listener(summary);
        }
    }
}

pub struct Repeater {
    config: RepeaterConfig,
    server: Server,
    handler: RepeaterHandler,
    stop: StopSignal,
}

impl Repeater {
    /// A repeater listening as `config` says (TCP, plus UDP if enabled).
    pub fn new(config: RepeaterConfig) -> Self {
        let server = Server::from_config(&config);
        Self::with_server(server, config)
    }

    /// A repeater around a caller-built server, e.g. one with in-process
    /// acceptors. Listener settings in `config` are ignored.
    pub fn with_server(server: Server, config: RepeaterConfig) -> Self {
        let handler = RepeaterHandler {
            announcer: SessionAnnouncer::new(config.session_channel)
                .with_transport_logging(config.verbosity > 1),
            monitor: LivenessMonitor::from_config(&config),
            verbosity: config.verbosity,
            listeners: Vec::new(),
            fatal: None,
        };
        Self {
            config,
            server,
            handler,
            stop: StopSignal::new(),
        }
    }

    pub fn config(&self) -> &RepeaterConfig {
        &self.config
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.server.local_addrs()
    }

    /// Register a listener for every error event, called after logging.
    pub fn on_error(&mut self, listener: impl FnMut(&ErrorSummary) + Send + 'static) {
        self.handler.listeners.push(Box::new(listener));
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Bind the listeners and start the liveness monitor.
    pub fn start(&mut self) -> Result<(), ServerError> {
        self.server.start()?;
        self.handler.monitor.start();
        Ok(())
    }

    /// One update cycle.
    pub fn update(&mut self) -> Result<(), ServerError> {
        self.server.update(&mut self.handler)
    }

    /// Close everything. Idempotent.
    pub fn stop(&mut self) {
        self.handler.monitor.stop();
        self.server.stop();
    }

    /// Start if needed and update every `tick_interval` until stopped.
    pub fn run(&mut self) -> Result<(), ServerError> {
        self.start()?;
        let tick = self.config.tick_interval();
        let result = loop {
            if self.stop.is_stopped() {
                break Ok(());
            }
            if let Err(err) = self.update() {
                break Err(err);
            }
            if let Some(message) = self.handler.fatal.take() {
                break Err(ServerError::Fatal(message));
            }
            thread::sleep(tick);
        };
        self.stop();
        result
    }

    /// Bind on this thread, then run the loop on a new one.
    pub fn spawn(mut self) -> Result<RepeaterHandle, ServerError> {
        self.start()?;
        let addrs = self.local_addrs();
        let stop = self.stop_signal();
        let thread = thread::Builder::new()
            .name("client-repeater".into())
            .spawn(move || self.run())
            .map_err(|err| ServerError::Fatal(format!("could not spawn repeater thread: {err}")))?;
        Ok(RepeaterHandle {
            stop,
            addrs,
            thread,
        })
    }
}

/// Handle to a repeater running on its own thread.
pub struct RepeaterHandle {
    stop: StopSignal,
    addrs: Vec<SocketAddr>,
    thread: JoinHandle<Result<(), ServerError>>,
}

impl RepeaterHandle {
    /// Addresses bound when the repeater started.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Signal the loop to stop and wait for it.
    pub fn stop(self) -> Result<(), ServerError> {
        self.stop.stop();
        self.thread
            .join()
            .unwrap_or_else(|_| Err(ServerError::Fatal("repeater thread panicked".into())))
    }
}
