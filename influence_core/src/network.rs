//! TCP transport: a relay that fans frames out to every other connection,
//! and a [`ReplicationChannel`] client for it.
//!
//! Frames are a little-endian `u32` length followed by a JSON envelope.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, TryRecvError};
use influence_proto::{decode_envelope, encode_envelope, ClientId, SyncEnvelope};
use parking_lot::Mutex;

use crate::channel::{ChannelError, ReplicationChannel};

const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub const DEFAULT_RELAY_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

struct RelayClient {
    connection: u64,
    stream: TcpStream,
}

pub struct RelayServer {
    local_addr: SocketAddr,
    clients: Arc<Mutex<Vec<RelayClient>>>,
}

impl RelayServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }
}

pub fn start_relay_server(bind_addr: SocketAddr) -> Option<RelayServer> {
    start_relay_server_with_timeout(bind_addr, Some(DEFAULT_RELAY_WRITE_TIMEOUT))
}

/// Starts the relay. Fan-out holds the client list while it writes, so a peer
/// whose socket stays full for longer than `write_timeout` is dropped.
pub fn start_relay_server_with_timeout(
    bind_addr: SocketAddr,
    write_timeout: Option<Duration>,
) -> Option<RelayServer> {
    let listener = match TcpListener::bind(bind_addr) {
        Ok(listener) => listener,
        Err(err) => {
            tracing::warn!(
                target: "influence_sync::relay",
                bind = %bind_addr,
                error = %err,
                "relay.bind_failed"
            );
            return None;
        }
    };
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::warn!(target: "influence_sync::relay", error = %err, "relay.addr_unknown");
            return None;
        }
    };

    let clients: Arc<Mutex<Vec<RelayClient>>> = Arc::new(Mutex::new(Vec::new()));
    let accept_clients = Arc::clone(&clients);
    thread::spawn(move || accept_loop(listener, accept_clients, write_timeout));

    tracing::info!(target: "influence_sync::relay", addr = %local_addr, "relay.listening");
    Some(RelayServer {
        local_addr,
        clients,
    })
}

fn accept_loop(
    listener: TcpListener,
    clients: Arc<Mutex<Vec<RelayClient>>>,
    write_timeout: Option<Duration>,
) {
    let next_connection = AtomicU64::new(1);
    for incoming in listener.incoming() {
        let stream = match incoming {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(target: "influence_sync::relay", error = %err, "relay.accept_failed");
                continue;
            }
        };
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        if let Err(err) = stream.set_nodelay(true) {
            tracing::warn!(target: "influence_sync::relay", %peer, error = %err, "relay.nodelay_failed");
        }
        let writer = match stream.try_clone() {
            Ok(writer) => writer,
            Err(err) => {
                tracing::warn!(target: "influence_sync::relay", %peer, error = %err, "relay.clone_failed");
                continue;
            }
        };
        if let Err(err) = writer.set_write_timeout(write_timeout) {
            tracing::warn!(target: "influence_sync::relay", %peer, error = %err, "relay.write_timeout_failed");
        }

        let connection = next_connection.fetch_add(1, Ordering::Relaxed);
        clients.lock().push(RelayClient {
            connection,
            stream: writer,
        });
        tracing::info!(target: "influence_sync::relay", %peer, connection, "relay.client_connected");

        let relay_clients = Arc::clone(&clients);
        thread::spawn(move || relay_connection(stream, connection, relay_clients));
    }
}

fn relay_connection(mut stream: TcpStream, connection: u64, clients: Arc<Mutex<Vec<RelayClient>>>) {
    loop {
        match read_frame(&mut stream) {
            Ok(frame) => relay_frame(&clients, connection, &frame),
            Err(err) => {
                tracing::info!(
                    target: "influence_sync::relay",
                    connection,
                    reason = %err,
                    "relay.client_disconnected"
                );
                break;
            }
        }
    }
    clients
        .lock()
        .retain(|client| client.connection != connection);
}

fn relay_frame(clients: &Arc<Mutex<Vec<RelayClient>>>, origin: u64, frame: &[u8]) {
    let mut guard = clients.lock();
    guard.retain_mut(|client| {
        if client.connection == origin {
            return true;
        }
        match write_frame(&mut client.stream, frame) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(
                    target: "influence_sync::relay",
                    connection = client.connection,
                    error = %err,
                    "relay.client_dropped"
                );
                false
            }
        }
    });
}

fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> io::Result<()> {
    let len = u32::try_from(frame.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    let mut buffer = Vec::with_capacity(4 + frame.len());
    buffer.extend_from_slice(&len.to_le_bytes());
    buffer.extend_from_slice(frame);
    stream.write_all(&buffer)
}

fn read_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

/// Client side of the relay.
pub struct TcpChannel {
    id: ClientId,
    writer: Mutex<TcpStream>,
    receiver: Receiver<SyncEnvelope>,
}

impl TcpChannel {
    pub fn connect(addr: SocketAddr, id: ClientId) -> Result<Self, ChannelError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let mut reader = stream.try_clone()?;
        let (sender, receiver) = unbounded();
        let reader_id = id.clone();

        thread::spawn(move || loop {
            let frame = match read_frame(&mut reader) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::debug!(
                        target: "influence_sync::channel",
                        client = %reader_id,
                        reason = %err,
                        "tcp.reader_closed"
                    );
                    break;
                }
            };
            match decode_envelope(&frame) {
                Ok(envelope) => {
                    if sender.send(envelope).is_err() {
                        break;
                    }
                }
                Err(err) => tracing::warn!(
                    target: "influence_sync::channel",
                    client = %reader_id,
                    error = %err,
                    "tcp.frame_dropped=undecodable"
                ),
            }
        });

        tracing::info!(target: "influence_sync::channel", client = %id, %addr, "tcp.connected");
        Ok(Self {
            id,
            writer: Mutex::new(stream),
            receiver,
        })
    }
}

impl ReplicationChannel for TcpChannel {
    fn local_id(&self) -> &ClientId {
        &self.id
    }

    fn broadcast(&self, envelope: &SyncEnvelope) -> Result<(), ChannelError> {
        let frame = encode_envelope(envelope)?;
        let mut writer = self.writer.lock();
        write_frame(&mut writer, &frame)?;
        Ok(())
    }

    fn try_recv(&self) -> Result<Option<SyncEnvelope>, ChannelError> {
        match self.receiver.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ChannelError::Disconnected),
        }
    }
}
