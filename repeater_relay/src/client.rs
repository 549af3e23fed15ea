// Blocking client for the client repeater.
//
// Provides a non-blocking interface for a caller's own loop. Architecture:
// - `connect()` performs TCP connect + Hello/Welcome handshake on the
//   calling thread, then spawns a background reader thread.
// - The reader thread calls `read_message()` in a loop and pushes raw bodies
//   into an `mpsc` channel.
// - The calling thread holds a `BufWriter<TcpStream>` for sending.
// - `poll()` drains the inbox non-blocking, answers pings, and returns the
//   session and application messages.
//
// A UDP transport can be attached with `attach_udp()`. It says Hello with
// the same client guid, so the repeater adds it to the existing connexion
// rather than creating a new one. Unreliable sends then go over UDP, and
// anything the repeater relays over UDP comes back through `poll()` too.
//
// Used by the integration tests and handy for poking at a running repeater.

use std::io::{BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use repeater_protocol::{
    Aggregation, ClientGuid, ConnexionId, Message, RawMessage, SystemMessage, decode, encode,
    read_message, write_message,
};
use tracing::warn;

use crate::error::ClientError;
use crate::transport::{Transport, UdpTransport};

/// How long `connect` and `attach_udp` wait for the Welcome.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Resend interval for the UDP Hello, which may be lost.
const UDP_HELLO_RETRY: Duration = Duration::from_millis(200);

pub struct RepeaterClient {
    identity: ConnexionId,
    guid: ClientGuid,
    writer: BufWriter<TcpStream>,
    inbox: Receiver<Bytes>,
    _reader_thread: JoinHandle<()>,
    udp: Option<UdpTransport>,
    answer_pings: bool,
    connected: bool,
}

impl RepeaterClient {
    /// Connect with a fresh client guid.
    pub fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        Self::connect_with_guid(addr, ClientGuid::new_random())
    }

    /// Connect, say Hello as `guid`, and wait for the Welcome.
    pub fn connect_with_guid(addr: SocketAddr, guid: ClientGuid) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        let reader_stream = stream.try_clone()?;
        let mut writer = BufWriter::new(stream);

        let hello = encode(&Message::System(SystemMessage::Hello { client_guid: guid }))?;
        write_message(&mut writer, &hello)?;

        let mut reader = BufReader::new(reader_stream);
        let response = read_message(&mut reader)
            .map_err(|e| ClientError::Handshake(format!("no Welcome: {e}")))?;
        let identity = match decode(Bytes::from(response))? {
            Message::System(SystemMessage::Welcome { identity }) => identity,
            other => {
                return Err(ClientError::Handshake(format!(
                    "unexpected response: {other:?}"
                )));
            }
        };

        // The long-lived reader blocks indefinitely.
        reader.get_ref().set_read_timeout(None)?;
        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::spawn(move || {
            while let Ok(body) = read_message(&mut reader) {
                if tx.send(Bytes::from(body)).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            identity,
            guid,
            writer,
            inbox: rx,
            _reader_thread: reader_thread,
            udp: None,
            answer_pings: true,
            connected: true,
        })
    }

    /// Identity assigned by the repeater.
    pub fn identity(&self) -> ConnexionId {
        self.identity
    }

    pub fn guid(&self) -> ClientGuid {
        self.guid
    }

    /// False once the repeater has closed the TCP connection.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Stop answering liveness pings, as a hung peer would.
    pub fn set_answer_pings(&mut self, answer: bool) {
        self.answer_pings = answer;
    }

    /// Attach a UDP transport to this connexion.
    pub fn attach_udp(&mut self, addr: SocketAddr) -> Result<(), ClientError> {
        let mut udp = UdpTransport::connect(addr)?;
        let hello = encode(&Message::System(SystemMessage::Hello {
            client_guid: self.guid,
        }))?;
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let mut last_hello: Option<Instant> = None;
        loop {
            if last_hello.is_none_or(|sent| sent.elapsed() >= UDP_HELLO_RETRY) {
                udp.send(&hello, Aggregation::Immediate)?;
                last_hello = Some(Instant::now());
            }
            while let Some(body) = udp.try_recv() {
                if let Message::System(SystemMessage::Welcome { identity }) = decode(body)? {
                    if identity != self.identity {
                        return Err(ClientError::Handshake(format!(
                            "UDP welcomed as {identity}, TCP as {}",
                            self.identity
                        )));
                    }
                    self.udp = Some(udp);
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(ClientError::Handshake("no Welcome over UDP".into()));
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Send an application message over TCP.
    pub fn send_raw(&mut self, message: &RawMessage) -> Result<(), ClientError> {
        self.send_tcp(&Message::Raw(message.clone()))
    }

    /// Send an application message over the attached UDP transport.
    pub fn send_raw_unreliable(&mut self, message: &RawMessage) -> Result<(), ClientError> {
        let udp = self.udp.as_mut().ok_or(ClientError::NoUdp)?;
        udp.send(message.body(), Aggregation::Immediate)?;
        Ok(())
    }

    /// Drain everything received so far (non-blocking). System messages are
    /// handled here; session and application messages are returned.
    pub fn poll(&mut self) -> Vec<Message> {
        let mut bodies = Vec::new();
        loop {
            match self.inbox.try_recv() {
                Ok(body) => bodies.push((body, false)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.connected = false;
                    break;
                }
            }
        }
        if let Some(udp) = self.udp.as_mut() {
            while let Some(body) = udp.try_recv() {
                bodies.push((body, true));
            }
        }

        let mut messages = Vec::new();
        for (body, over_udp) in bodies {
            let message = match decode(body) {
                Ok(message) => message,
                Err(err) => {
                    warn!("discarding undecodable message from the repeater: {err}");
                    continue;
                }
            };
            match message {
                Message::System(SystemMessage::PingRequest {
                    sequence,
                    sent_millis,
                }) if self.answer_pings => {
                    let reply = Message::System(SystemMessage::PingResponse {
                        sequence,
                        sent_millis,
                    });
                    let sent = if over_udp {
                        self.send_udp(&reply)
                    } else {
                        self.send_tcp(&reply)
                    };
                    if let Err(err) = sent {
                        warn!("could not answer ping: {err}");
                    }
                }
                Message::System(_) => {}
                message => messages.push(message),
            }
        }
        messages
    }

    /// Say goodbye and close the connection.
    pub fn disconnect(&mut self) {
        let _ = self.send_tcp(&Message::System(SystemMessage::Goodbye));
        if let Some(mut udp) = self.udp.take() {
            udp.close();
        }
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
        self.connected = false;
    }

    fn send_tcp(&mut self, message: &Message) -> Result<(), ClientError> {
        let body = encode(message)?;
        write_message(&mut self.writer, &body)?;
        Ok(())
    }

    fn send_udp(&mut self, message: &Message) -> Result<(), ClientError> {
        let udp = self.udp.as_mut().ok_or(ClientError::NoUdp)?;
        udp.send(&encode(message)?, Aggregation::Immediate)?;
        Ok(())
    }
}

impl Drop for RepeaterClient {
    fn drop(&mut self) {
        let _ = self.writer.flush();
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }
}
