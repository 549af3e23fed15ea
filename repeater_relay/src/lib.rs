// repeater_relay: the client repeater, a session-oriented message relay.
//
// Clients connect over TCP (optionally adding a UDP transport), say Hello,
// and from then on everything they send is relayed to every other connected
// client. Joins and leaves are announced on a session channel, and clients
// that stop answering pings are evicted. The repeater never looks inside
// application payloads.
//
// Module overview:
// - `transport/`:  `Transport`/`Acceptor` traits with TCP, UDP and in-memory
//                  implementations. I/O threads feed `mpsc` queues.
// - `connexion.rs`: One logical client over an ordered set of transports;
//                  capability-based transport selection, ping bookkeeping.
// - `server.rs`:   Registry, accept/handshake, and the phased `update()`
//                  cycle that fires `ServerHandler` callbacks.
// - `relay.rs`:    Fan-out of every application message to all but its
//                  sender.
// - `session.rs`:  Lives/Joined/Left announcements.
// - `liveness.rs`: Ping-based eviction of silent connexions.
// - `repeater.rs`: `Repeater`, wiring the above together with logging,
//                  error listeners and the run loop.
// - `client.rs`:   Blocking client used by tests and tools.
// - `config.rs`, `error.rs`: configuration and error types.
//
// Dependencies: `repeater_protocol` (messages, framing, marshalling).
//
// The repeater can run as a standalone binary (`main.rs`) or be embedded via
// `Repeater::spawn` / `Repeater::update`.

pub mod client;
pub mod config;
pub mod connexion;
pub mod error;
pub mod liveness;
pub mod relay;
pub mod repeater;
pub mod server;
pub mod session;
pub mod transport;

pub use client::RepeaterClient;
pub use config::{DEFAULT_MAX_PACKET_SIZE, DEFAULT_PORT, RepeaterConfig};
pub use connexion::{Connexion, DropReason};
pub use error::{ClientError, ConfigError, ErrorSummary, ServerError, Severity, TransportError};
pub use liveness::LivenessMonitor;
pub use repeater::{Repeater, RepeaterHandle, StopSignal};
pub use server::{RemovedConnexion, Server, ServerCore, ServerHandler, ServerState};
pub use session::SessionAnnouncer;
