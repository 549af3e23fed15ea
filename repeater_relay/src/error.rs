// Error types for the repeater.
//
// Two families:
// - Hard failures of an API call (`ServerError`, `TransportError`,
//   `ConfigError`, `ClientError`): returned as `Result`s. Binding a listener is the only
//   operation of the running server that fails this way.
// - Operational problems while the server runs (a peer sent garbage, a send
//   did not fit, a connexion went quiet): reported as `ErrorSummary` values
//   through the server's single error sink and never propagated as `Err`.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use repeater_protocol::{ConnexionId, MarshalError};
use thiserror::Error;

/// Severity of an `ErrorSummary`. Only `Fatal` means the server can no
/// longer make progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    Information,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Information => "information",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// An operational error event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorSummary {
    pub severity: Severity,
    pub message: String,
    /// The connexion the event concerns, if any.
    pub connexion: Option<ConnexionId>,
}

impl ErrorSummary {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            connexion: None,
        }
    }

    pub fn for_connexion(mut self, id: ConnexionId) -> Self {
        self.connexion = Some(id);
        self
    }
}

impl fmt::Display for ErrorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.connexion {
            Some(id) => write!(f, "[{}] connexion {}: {}", self.severity, id, self.message),
            None => write!(f, "[{}] {}", self.severity, self.message),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("packet of {size} bytes exceeds the transport maximum of {max}")]
    PacketTooLarge { size: usize, max: usize },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("server is not active")]
    NotActive,
    #[error("fatal server error: {0}")]
    Fatal(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("port must be greater than 0")]
    InvalidPort,
    #[error("ping interval ({interval_ms} ms) must be shorter than the inactive timeout ({timeout_ms} ms)")]
    PingInterval { interval_ms: u128, timeout_ms: u128 },
    #[error("tick interval must be greater than 0")]
    InvalidTickInterval,
    #[error("write timeout must be greater than 0")]
    InvalidWriteTimeout,
}

/// Failures of the blocking client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("could not encode or decode a message: {0}")]
    Marshal(#[from] MarshalError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("no UDP transport attached")]
    NoUdp,
}
