// Lightweight marshaller.
//
// Decodes only what the server itself acts on (system and session messages)
// and passes every other message type through as a `RawMessage` that shares
// the received buffer. Decoding cost for application traffic is therefore a
// two-byte header check regardless of payload size.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::message::{
    BODY_HEADER_LEN, Message, MessageType, RawMessage, SessionAction, SessionMessage,
};
use crate::types::ConnexionId;

/// Length of a session message payload: u32 subject + u8 action.
const SESSION_PAYLOAD_LEN: usize = 5;

#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("message body shorter than its 2-byte header")]
    Truncated,
    #[error("session message payload is {0} bytes, expected 5")]
    BadSessionLength(usize),
    #[error("unknown session action tag {0}")]
    UnknownSessionAction(u8),
    #[error("malformed system message: {0}")]
    System(#[from] serde_json::Error),
}

/// Encode a message into a body (without the length prefix).
pub fn encode(message: &Message) -> Result<Bytes, MarshalError> {
    match message {
        Message::Raw(raw) => Ok(raw.body().clone()),
        Message::Session(session) => {
            let mut body = BytesMut::with_capacity(BODY_HEADER_LEN + SESSION_PAYLOAD_LEN);
            body.put_u8(MessageType::Session as u8);
            body.put_u8(session.channel);
            body.put_u32(session.subject.0);
            body.put_u8(session.action as u8);
            Ok(body.freeze())
        }
        Message::System(system) => {
            let json = serde_json::to_vec(system)?;
            let mut body = BytesMut::with_capacity(BODY_HEADER_LEN + json.len());
            body.put_u8(MessageType::System as u8);
            body.put_u8(0);
            body.put_slice(&json);
            Ok(body.freeze())
        }
    }
}

/// Decode a body produced by `encode` (or by any compatible client).
pub fn decode(body: Bytes) -> Result<Message, MarshalError> {
    if body.len() < BODY_HEADER_LEN {
        return Err(MarshalError::Truncated);
    }
    let payload = &body[BODY_HEADER_LEN..];
    match MessageType::from_tag(body[0]) {
        Some(MessageType::System) => Ok(Message::System(serde_json::from_slice(payload)?)),
        Some(MessageType::Session) => {
            if payload.len() != SESSION_PAYLOAD_LEN {
                return Err(MarshalError::BadSessionLength(payload.len()));
            }
            let subject = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            let action = SessionAction::from_tag(payload[4])
                .ok_or(MarshalError::UnknownSessionAction(payload[4]))?;
            Ok(Message::Session(SessionMessage::new(
                body[1],
                ConnexionId(subject),
                action,
            )))
        }
        _ => Ok(Message::Raw(RawMessage::from_body(body))),
    }
}
