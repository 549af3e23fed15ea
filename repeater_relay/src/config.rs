// Repeater configuration.
//
// All tunable server parameters live in `RepeaterConfig`. It can be built in
// code (tests, embedding), loaded from a JSON file, and is finally overridden
// by command-line flags in `main.rs`. Every field has a default so partial
// JSON files are accepted.
//
// Durations are stored as integer milliseconds/seconds so the JSON form stays
// readable; use the accessor methods to get `Duration`s.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 9999;

/// Default cap on outbound packets. This does not limit what the repeater
/// can receive, only what it will relay.
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 4 * 1024 * 1024;

/// Upper bound on the derived ping interval.
const MAX_DERIVED_PING_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepeaterConfig {
    /// Address the TCP and UDP listeners bind to.
    pub bind_address: IpAddr,
    /// Listening port. 0 lets the OS pick one (useful in tests).
    pub port: u16,
    /// Hard cap applied to every transport. 0 keeps each transport's default.
    pub max_packet_size: u32,
    /// Channel for Joined/Left/Lives announcements; `None` disables them.
    pub session_channel: Option<u8>,
    /// 0 = warnings/errors only, 1 = joins/leaves, 2 = transport details,
    /// 3 = every message.
    pub verbosity: u8,
    /// Drop connexions that have not answered a ping for this long. 0
    /// disables the liveness monitor.
    pub inactive_timeout_secs: u64,
    /// Interval between liveness pings. Defaults to a quarter of the
    /// timeout, capped at 10 s. Must be shorter than the timeout.
    pub ping_interval_ms: Option<u64>,
    /// Sleep between update ticks when the repeater owns its loop.
    pub tick_interval_ms: u64,
    /// How long a new transport may stay silent before its Hello arrives.
    pub handshake_timeout_ms: u64,
    /// Bound on a single blocking TCP write. A peer that stops reading for
    /// this long loses its connexion.
    pub write_timeout_ms: u64,
    /// Also listen for UDP on the same port.
    pub enable_udp: bool,
}

impl Default for RepeaterConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            session_channel: Some(0),
            verbosity: 1,
            inactive_timeout_secs: 300,
            ping_interval_ms: None,
            tick_interval_ms: 1,
            handshake_timeout_ms: 5000,
            write_timeout_ms: 5000,
            enable_udp: true,
        }
    }
}

impl RepeaterConfig {
    /// Default configuration listening on `port`.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidTickInterval);
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::InvalidWriteTimeout);
        }
        let timeout = self.inactive_timeout();
        if !timeout.is_zero() {
            let interval = self.ping_interval();
            if interval >= timeout {
                return Err(ConfigError::PingInterval {
                    interval_ms: interval.as_millis(),
                    timeout_ms: timeout.as_millis(),
                });
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn inactive_timeout(&self) -> Duration {
        Duration::from_secs(self.inactive_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        match self.ping_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => (self.inactive_timeout() / 4).min(MAX_DERIVED_PING_INTERVAL),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// The cap to apply to transports, if any.
    pub fn packet_cap(&self) -> Option<usize> {
        (self.max_packet_size > 0).then_some(self.max_packet_size as usize)
    }
}
