// Length-delimited message framing.
//
// Wire format: a 4-byte big-endian length prefix followed by the message
// body (`[type][channel][payload]`, see `message.rs`). Stream transports
// write one frame after another; datagram transports may pack several frames
// into one datagram and use `split_frames` on receipt.
//
// `write_frame` does not flush, so buffered writers can aggregate several
// frames; `write_message` is the flushing variant used for immediate sends.
//
// A `MAX_MESSAGE_SIZE` constant (16 MB) protects against unbounded allocation
// from malformed or malicious length prefixes.

use std::io::{self, Read, Write};

use bytes::Bytes;

/// Maximum allowed body size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Length of the big-endian length prefix.
pub const FRAME_PREFIX_LEN: usize = 4;

/// Size on the wire of a frame carrying a body of `body_len` bytes.
pub fn packet_len(body_len: usize) -> usize {
    FRAME_PREFIX_LEN + body_len
}

/// Write a length-delimited frame without flushing.
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    let len = body.len();
    if len > MAX_MESSAGE_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    #[expect(clippy::cast_possible_truncation)]
    let len_bytes = (len as u32).to_be_bytes();
    writer.write_all(&len_bytes)?;
    writer.write_all(body)?;
    Ok(())
}

/// Write a length-delimited frame and flush the writer.
pub fn write_message<W: Write>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    write_frame(writer, body)?;
    writer.flush()
}

/// Read a length-delimited message: 4-byte big-endian length, then body.
///
/// Returns `UnexpectedEof` if the stream closes cleanly before or during a
/// message. Returns `InvalidData` if the length exceeds `MAX_MESSAGE_SIZE`.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; FRAME_PREFIX_LEN];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Split a datagram holding one or more back-to-back frames into bodies.
/// The returned bodies share the datagram's allocation.
pub fn split_frames(datagram: Bytes) -> io::Result<Vec<Bytes>> {
    let mut bodies = Vec::new();
    let mut offset = 0;
    while offset < datagram.len() {
        if datagram.len() - offset < FRAME_PREFIX_LEN {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated frame prefix in datagram",
            ));
        }
        let mut len_buf = [0u8; FRAME_PREFIX_LEN];
        len_buf.copy_from_slice(&datagram[offset..offset + FRAME_PREFIX_LEN]);
        let len = u32::from_be_bytes(len_buf) as usize;
        let start = offset + FRAME_PREFIX_LEN;
        let end = start + len;
        if end > datagram.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("frame of {len} bytes overruns datagram"),
            ));
        }
        bodies.push(datagram.slice(start..end));
        offset = end;
    }
    Ok(bodies)
}
