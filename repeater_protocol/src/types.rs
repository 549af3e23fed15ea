// Core ID and delivery-policy types for the repeater protocol.
//
// `ConnexionId` is the compact identity the server assigns to each logical
// peer; it is what session messages talk about. `ClientGuid` is chosen by the
// client and lets several transports (e.g. TCP + UDP) from the same process
// be folded into one connexion.
//
// Delivery requirements are attached to each send, never stored with a
// message. Reliability and ordering are totally ordered so that "a transport
// satisfies a request" is a simple `>=` comparison on both axes.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-assigned connexion identity. Unique among active connexions and
/// reused once a connexion has been reclaimed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnexionId(pub u32);

impl fmt::Display for ConnexionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client instance identifier, stable across reconnects and transports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientGuid(pub Uuid);

impl ClientGuid {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClientGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether the transport must guarantee delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Reliability {
    Unreliable,
    Reliable,
}

/// Whether, and how strictly, send order must be preserved on arrival.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Ordering {
    /// Messages may arrive in any order.
    Unordered,
    /// Late messages may be dropped, but never delivered out of order.
    Sequenced,
    /// Every message is delivered, in send order.
    Ordered,
}

/// Whether a transport may hold a message back to batch it with others.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Aggregation {
    /// Flush as soon as the message is written.
    Immediate,
    /// May sit in the transport's buffer until the end of the update cycle.
    Aggregatable,
}

/// Per-send delivery policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryRequirements {
    pub reliability: Reliability,
    pub ordering: Ordering,
    pub aggregation: Aggregation,
}

impl DeliveryRequirements {
    pub fn new(reliability: Reliability, ordering: Ordering, aggregation: Aggregation) -> Self {
        Self {
            reliability,
            ordering,
            aggregation,
        }
    }

    /// Policy used for synthesized session traffic: reliable, unordered,
    /// flushed immediately.
    pub fn session() -> Self {
        Self::new(
            Reliability::Reliable,
            Ordering::Unordered,
            Aggregation::Immediate,
        )
    }

    /// True if a transport with the given characteristics can honour these
    /// requirements.
    pub fn satisfied_by(&self, reliability: Reliability, ordering: Ordering) -> bool {
        reliability >= self.reliability && ordering >= self.ordering
    }
}
