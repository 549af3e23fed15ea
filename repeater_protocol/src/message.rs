// Protocol messages exchanged between the repeater and its clients.
//
// Three kinds of message travel on the wire:
// - `SystemMessage`: connexion-layer control (handshake, pings, goodbye).
//   Consumed by the server's connexion layer, never relayed.
// - `SessionMessage`: membership announcements (Joined/Left/Lives) on a
//   dedicated channel. Fixed 5-byte payload.
// - `RawMessage`: every other message type. The repeater never looks inside
//   these; the payload stays as the `Bytes` of the frame it arrived in so
//   relaying it to N peers costs N refcount bumps, not N copies.
//
// Every message carries a one-byte type tag and a one-byte channel. The tag
// values are shared with existing clients and must not change.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::types::{ClientGuid, ConnexionId};

/// Length of the `[type][channel]` header at the start of every body.
pub const BODY_HEADER_LEN: usize = 2;

/// Message type tags as they appear on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    System = 0,
    Binary = 1,
    Object = 2,
    Session = 3,
    String = 4,
    Tuple1D = 5,
    Tuple2D = 6,
    Tuple3D = 7,
}

impl MessageType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::System,
            1 => Self::Binary,
            2 => Self::Object,
            3 => Self::Session,
            4 => Self::String,
            5 => Self::Tuple1D,
            6 => Self::Tuple2D,
            7 => Self::Tuple3D,
            _ => return None,
        })
    }
}

/// A decoded message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    System(SystemMessage),
    Session(SessionMessage),
    Raw(RawMessage),
}

impl Message {
    pub fn channel(&self) -> u8 {
        match self {
            Message::System(_) => 0,
            Message::Session(m) => m.channel,
            Message::Raw(m) => m.channel(),
        }
    }

    pub fn message_type_tag(&self) -> u8 {
        match self {
            Message::System(_) => MessageType::System as u8,
            Message::Session(_) => MessageType::Session as u8,
            Message::Raw(m) => m.message_type(),
        }
    }
}

/// Connexion-layer control messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemMessage {
    /// First frame on every new transport.
    Hello { client_guid: ClientGuid },
    /// Server's answer to `Hello`, carrying the connexion identity.
    Welcome { identity: ConnexionId },
    /// Liveness probe. `sent_millis` is opaque to the receiver and echoed back.
    PingRequest { sequence: u32, sent_millis: u64 },
    PingResponse { sequence: u32, sent_millis: u64 },
    /// The peer is closing the connexion.
    Goodbye,
}

/// What a session message announces about its subject.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionAction {
    /// The subject has just joined.
    Joined = 1,
    /// The subject has left.
    Left = 2,
    /// The subject was already present (catch-up for a new joiner).
    Lives = 3,
}

impl SessionAction {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Joined),
            2 => Some(Self::Left),
            3 => Some(Self::Lives),
            _ => None,
        }
    }
}

/// Membership announcement about `subject`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionMessage {
    pub channel: u8,
    pub subject: ConnexionId,
    pub action: SessionAction,
}

impl SessionMessage {
    pub fn new(channel: u8, subject: ConnexionId, action: SessionAction) -> Self {
        Self {
            channel,
            subject,
            action,
        }
    }
}

/// An uninterpreted message. Holds the complete body (header included) so
/// that re-encoding is a clone of the `Bytes` handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    body: Bytes,
}

impl RawMessage {
    /// Build a raw message from its parts. `message_type` should not be the
    /// System or Session tag; such a body would decode as that kind instead.
    pub fn new(message_type: u8, channel: u8, payload: &[u8]) -> Self {
        let mut body = BytesMut::with_capacity(BODY_HEADER_LEN + payload.len());
        body.put_u8(message_type);
        body.put_u8(channel);
        body.put_slice(payload);
        Self {
            body: body.freeze(),
        }
    }

    /// Wrap a body that has already been validated to hold a header.
    pub(crate) fn from_body(body: Bytes) -> Self {
        debug_assert!(body.len() >= BODY_HEADER_LEN);
        Self { body }
    }

    pub fn message_type(&self) -> u8 {
        self.body[0]
    }

    pub fn channel(&self) -> u8 {
        self.body[1]
    }

    pub fn payload(&self) -> Bytes {
        self.body.slice(BODY_HEADER_LEN..)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}
