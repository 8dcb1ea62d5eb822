//! TCP transport for Raft messages.
//!
//! # Protocol
//!
//! Each frame is length-prefixed:
//! - 4 bytes: frame length (big-endian u32), covering everything below
//! - 2 bytes: sender address length (big-endian u16)
//! - N bytes: sender's Raft address, UTF-8
//! - rest: protobuf-encoded `Message`
//!
//! The sender address lets a node answer peers it has not yet learned about
//! from the log, e.g. a joining node replying to the leader before it has
//! applied the entry that names the leader.
//!
//! Connections are long-lived: one outbound connection per peer, owned by a
//! dedicated sender thread, and one reader thread per inbound connection.

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use prost::Message as ProstMessage;
use raft::prelude::Message;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
/// Upper bound on a single frame, mostly to reject garbage lengths.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
/// Frames buffered per peer before new ones are dropped. Raft retransmits.
const PEER_QUEUE_DEPTH: usize = 1024;

/// A message received from a peer, tagged with where it came from.
#[derive(Debug)]
pub struct Inbound {
    pub from_addr: String,
    pub message: Message,
}

pub fn encode_frame(from_addr: &str, msg: &Message) -> io::Result<Vec<u8>> {
    let addr = from_addr.as_bytes();
    let addr_len = u16::try_from(addr.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "address too long"))?;
    let body = msg.encode_to_vec();
    let frame_len = 2 + addr.len() + body.len();
    let len = u32::try_from(frame_len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;

    let mut buf = Vec::with_capacity(4 + frame_len);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&addr_len.to_be_bytes());
    buf.extend_from_slice(addr);
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Reads one frame. Returns `Ok(None)` on a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Inbound>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if !(2..=MAX_FRAME_LEN).contains(&len) {
        return Err(invalid_data(format!("bad frame length {len}")));
    }

    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame)?;
    let addr_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    if 2 + addr_len > len {
        return Err(invalid_data("sender address overruns frame".to_string()));
    }
    let from_addr = std::str::from_utf8(&frame[2..2 + addr_len])
        .map_err(|err| invalid_data(err.to_string()))?
        .to_string();
    let message =
        Message::decode(&frame[2 + addr_len..]).map_err(|err| invalid_data(err.to_string()))?;

    Ok(Some(Inbound { from_addr, message }))
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Accepts peer connections on `listener` and forwards every decoded
/// message to `tx`.
pub fn spawn_listener(listener: TcpListener, tx: Sender<Inbound>) -> Result<()> {
    let local = listener
        .local_addr()
        .context("listener has no local address")?;
    thread::Builder::new()
        .name(format!("raft-net-listener-{local}"))
        .spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let tx = tx.clone();
                        let spawned = thread::Builder::new()
                            .name("raft-net-conn".to_string())
                            .spawn(move || {
                                if let Err(err) = handle_connection(stream, tx) {
                                    debug!(error = %err, "peer connection closed with error");
                                }
                            });
                        if let Err(err) = spawned {
                            warn!(error = %err, "failed to spawn connection handler");
                        }
                    }
                    Err(err) => warn!(error = %err, "accept error"),
                }
            }
        })
        .map(|_| ())
        .context("failed to spawn network listener")
}

fn handle_connection(stream: TcpStream, tx: Sender<Inbound>) -> io::Result<()> {
    let mut reader = BufReader::new(stream);
    while let Some(inbound) = read_frame(&mut reader)? {
        if tx.send(inbound).is_err() {
            // Worker gone, node is shutting down.
            break;
        }
    }
    Ok(())
}

/// Outbound side: routes frames to per-peer sender threads.
pub struct Outbox {
    local_addr: String,
    peers: HashMap<String, Sender<Vec<u8>>>,
}

impl Outbox {
    pub fn new(local_addr: impl Into<String>) -> Self {
        Self {
            local_addr: local_addr.into(),
            peers: HashMap::new(),
        }
    }

    /// Queues `msg` for `addr`. Never blocks; drops the message if the
    /// peer's queue is full or its sender thread could not be started.
    pub fn send(&mut self, addr: &str, msg: &Message) {
        let frame = match encode_frame(&self.local_addr, msg) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(to = msg.to, error = %err, "failed to encode message");
                return;
            }
        };

        if !self.peers.contains_key(addr) {
            match spawn_peer_sender(addr.to_string()) {
                Ok(tx) => {
                    self.peers.insert(addr.to_string(), tx);
                }
                Err(err) => {
                    warn!(peer = addr, error = %err, "failed to start peer sender");
                    return;
                }
            }
        }
        let Some(tx) = self.peers.get(addr) else {
            return;
        };

        match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(peer = addr, "peer queue full, dropping message");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.peers.remove(addr);
            }
        }
    }
}

fn spawn_peer_sender(addr: String) -> Result<Sender<Vec<u8>>> {
    let (tx, rx) = bounded(PEER_QUEUE_DEPTH);
    thread::Builder::new()
        .name(format!("raft-net-sender-{addr}"))
        .spawn(move || run_peer_sender(&addr, rx))
        .context("failed to spawn peer sender")?;
    Ok(tx)
}

/// Writes frames to one peer over a reused connection, reconnecting once
/// per frame on failure. Exits when the outbox drops the channel.
fn run_peer_sender(addr: &str, rx: Receiver<Vec<u8>>) {
    let mut conn: Option<BufWriter<TcpStream>> = None;
    for frame in rx {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = match conn.take() {
                Some(writer) => Ok(writer),
                None => connect(addr),
            }
            .and_then(|mut writer| {
                write_frame(&mut writer, &frame)?;
                Ok(writer)
            });
            match result {
                Ok(writer) => {
                    conn = Some(writer);
                    break;
                }
                Err(err) => {
                    if attempts >= 2 {
                        debug!(peer = addr, error = %err, "failed to send message");
                        break;
                    }
                }
            }
        }
    }
}

fn connect(addr: &str) -> io::Result<BufWriter<TcpStream>> {
    let socket_addr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address did not resolve"))?;
    let stream = TcpStream::connect_timeout(&socket_addr, CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    Ok(BufWriter::new(stream))
}

fn write_frame(writer: &mut BufWriter<TcpStream>, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft::prelude::MessageType;

    fn heartbeat() -> Message {
        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgHeartbeat);
        msg.from = 1;
        msg.to = 2;
        msg.term = 7;
        msg.commit = 3;
        msg
    }

    #[test]
    fn frames_round_trip_through_a_reader() {
        let mut wire = encode_frame("127.0.0.1:12000", &heartbeat()).unwrap();
        wire.extend(encode_frame("127.0.0.1:12001", &heartbeat()).unwrap());
        let mut reader = wire.as_slice();

        let first = read_frame(&mut reader).unwrap().expect("first frame");
        let second = read_frame(&mut reader).unwrap().expect("second frame");

        assert_eq!(first.from_addr, "127.0.0.1:12000");
        assert_eq!(second.from_addr, "127.0.0.1:12001");
        assert_eq!(first.message, heartbeat());
        assert!(read_frame(&mut reader).unwrap().is_none());
    }

    #[test]
    fn garbage_length_is_rejected() {
        let mut reader: &[u8] = &[0xff, 0xff, 0xff, 0xff, 0, 0];
        let err = read_frame(&mut reader).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn listener_forwards_messages_from_outbox() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = crossbeam_channel::unbounded();
        spawn_listener(listener, tx).unwrap();

        let mut outbox = Outbox::new("127.0.0.1:1");
        outbox.send(&addr, &heartbeat());
        outbox.send(&addr, &heartbeat());

        for _ in 0..2 {
            let inbound = rx
                .recv_timeout(Duration::from_secs(5))
                .expect("message should arrive");
            assert_eq!(inbound.from_addr, "127.0.0.1:1");
            assert_eq!(inbound.message.term, 7);
        }
    }
}
