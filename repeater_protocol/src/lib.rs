// repeater_protocol: wire protocol shared by the client repeater and its
// clients.
//
// This crate defines the message types, framing, and lightweight marshalling
// used by the repeater server (`repeater_relay`) and by clients. It has no
// networking code of its own.
//
// Module overview:
// - `types.rs`:    `ConnexionId`, `ClientGuid`, and the per-send delivery
//                  policy (`Reliability`, `Ordering`, `Aggregation`).
// - `message.rs`:  `Message` = System | Session | Raw, plus the session
//                  message and its action enum.
// - `framing.rs`:  Length-delimited framing over `Read`/`Write` streams and
//                  frame splitting for datagrams.
// - `marshal.rs`:  Encode/decode between bodies and `Message`. Only system and
//                  session messages are interpreted.
//
// Design decisions:
// - **Opaque application payloads.** The repeater relays everything it does
//   not need to understand as shared `Bytes`, never re-serializing it.
// - **Fixed binary session messages.** Channel, subject and action tags are
//   bit-compatible with existing clients.
// - **JSON only for system messages.** They are rare and small, and serde
//   keeps them easy to extend.
// - **No async runtime.** Framing uses `std::io::Read`/`Write`, compatible
//   with blocking TCP streams and buffered wrappers.

pub mod framing;
pub mod marshal;
pub mod message;
pub mod types;

pub use framing::{
    FRAME_PREFIX_LEN, MAX_MESSAGE_SIZE, packet_len, read_message, split_frames, write_frame,
    write_message,
};
pub use marshal::{MarshalError, decode, encode};
pub use message::{
    Message, MessageType, RawMessage, SessionAction, SessionMessage, SystemMessage,
};
pub use types::{Aggregation, ClientGuid, ConnexionId, DeliveryRequirements, Ordering, Reliability};

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::Bytes;

    use super::*;

    /// Encode, frame, read back, decode.
    fn wire_roundtrip(msg: &Message) -> Message {
        let body = encode(msg).unwrap();
        let mut wire = Vec::new();
        write_message(&mut wire, &body).unwrap();

        let mut cursor = Cursor::new(&wire);
        let recovered = read_message(&mut cursor).unwrap();
        decode(Bytes::from(recovered)).unwrap()
    }

    #[test]
    fn session_messages_survive_the_wire() {
        for action in [SessionAction::Joined, SessionAction::Left, SessionAction::Lives] {
            let msg = Message::Session(SessionMessage::new(0, ConnexionId(12), action));
            assert_eq!(wire_roundtrip(&msg), msg);
        }
    }

    #[test]
    fn ping_survives_the_wire() {
        let msg = Message::System(SystemMessage::PingRequest {
            sequence: 3,
            sent_millis: 1_700_000_000_000,
        });
        assert_eq!(wire_roundtrip(&msg), msg);
    }

    #[test]
    fn raw_string_survives_the_wire() {
        let msg = Message::Raw(RawMessage::new(MessageType::String as u8, 2, b"hi there"));
        let out = wire_roundtrip(&msg);
        assert_eq!(out, msg);
        assert_eq!(out.channel(), 2);
        assert_eq!(out.message_type_tag(), MessageType::String as u8);
    }
}
