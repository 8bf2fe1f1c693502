// TCP relay. The relay engine lives in a single actor task; connection tasks
// only move bytes. Each connection gets a reader task (frames -> actor) and a
// writer task (actor -> socket) fed by a bounded channel. A peer that stops
// reading fills its queue and is disconnected; the relay never waits on it.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};

use drift::net::encode;
use drift::{FrameDecoder, Message, NetworkStats, Outbound, RelayConfig, RelayEngine};

use crate::events::ServerEvent;
use crate::server::ServerStats;

const SWEEP_INTERVAL: Duration = Duration::from_millis(250);
const READ_BUFFER_SIZE: usize = 4096;
/// Frames queued for one peer before it counts as stalled.
const OUTBOX_CAPACITY: usize = 256;

#[derive(Debug)]
struct Connection {
    outbox: mpsc::Sender<Vec<u8>>,
    kick: oneshot::Sender<()>,
}

#[derive(Debug)]
enum RelayCommand {
    Connected {
        endpoint: SocketAddr,
        connection: Connection,
    },
    Inbound {
        endpoint: SocketAddr,
        message: Message,
        size: usize,
    },
    Malformed {
        endpoint: SocketAddr,
        error: String,
    },
    Disconnected {
        endpoint: SocketAddr,
    },
}

pub struct StreamServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: RelayConfig,
}

impl StreamServer {
    pub async fn bind(addr: SocketAddr, config: RelayConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until `shutdown` flips to true. Events and stats
    /// are published for the dashboard; both receivers may be dropped.
    pub async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
        events: mpsc::UnboundedSender<ServerEvent>,
        stats: watch::Sender<ServerStats>,
    ) -> io::Result<()> {
        let _ = events.send(ServerEvent::Started {
            description: format!("TCP relay listening on {}", self.local_addr),
        });

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let actor = tokio::spawn(relay_actor(
            commands_rx,
            self.config,
            self.local_addr,
            shutdown.clone(),
            events.clone(),
            stats,
        ));

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, endpoint)) => {
                            log::debug!("Accepted {}", endpoint);
                            tokio::spawn(handle_connection(
                                stream,
                                endpoint,
                                commands_tx.clone(),
                                shutdown.clone(),
                            ));
                        }
                        Err(e) => {
                            log::warn!("Accept failed: {}", e);
                            let _ = events.send(ServerEvent::Error {
                                message: format!("Accept failed: {}", e),
                            });
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        drop(commands_tx);
        let _ = actor.await;
        log::info!("TCP relay stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    endpoint: SocketAddr,
    commands: mpsc::UnboundedSender<RelayCommand>,
    shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("set_nodelay failed for {}: {}", endpoint, e);
    }
    let (reader, writer) = stream.into_split();
    let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
    let (kick_tx, kick_rx) = oneshot::channel();

    let connection = Connection {
        outbox: outbox_tx,
        kick: kick_tx,
    };
    if commands
        .send(RelayCommand::Connected {
            endpoint,
            connection,
        })
        .is_err()
    {
        return;
    }

    let writer_task = tokio::spawn(write_frames(writer, outbox_rx, endpoint));

    tokio::select! {
        _ = read_frames(reader, endpoint, &commands, shutdown) => {
            let _ = commands.send(RelayCommand::Disconnected { endpoint });
            // The actor drops the outbox on disconnect, which ends the writer
            // once anything already queued is flushed.
            let _ = writer_task.await;
        }
        Ok(()) = kick_rx => {
            log::debug!("Closing stalled connection {}", endpoint);
            writer_task.abort();
        }
    }
}

async fn read_frames(
    mut reader: OwnedReadHalf,
    endpoint: SocketAddr,
    commands: &mpsc::UnboundedSender<RelayCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            read = reader.read(&mut buffer) => {
                let n = match read {
                    Ok(0) => return,
                    Ok(n) => n,
                    Err(e) => {
                        log::debug!("Read from {} failed: {}", endpoint, e);
                        return;
                    }
                };
                decoder.extend(&buffer[..n]);

                loop {
                    let before = decoder.buffered();
                    match decoder.next_message() {
                        Ok(Some(message)) => {
                            let size = before - decoder.buffered();
                            let command = RelayCommand::Inbound { endpoint, message, size };
                            if commands.send(command).is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            // The stream is out of sync; drop the connection.
                            let _ = commands.send(RelayCommand::Malformed {
                                endpoint,
                                error: e.to_string(),
                            });
                            return;
                        }
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn write_frames(
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::Receiver<Vec<u8>>,
    endpoint: SocketAddr,
) {
    while let Some(frame) = outbox.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            log::debug!("Write to {} failed: {}", endpoint, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn relay_actor(
    mut commands: mpsc::UnboundedReceiver<RelayCommand>,
    config: RelayConfig,
    local_addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<ServerEvent>,
    stats: watch::Sender<ServerStats>,
) {
    let start_time = Instant::now();
    let mut relay = RelayEngine::new(config);
    let mut connections: HashMap<SocketAddr, Connection> = HashMap::new();
    let mut network = NetworkStats::default();
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);

    loop {
        let outbound = tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                match command {
                    RelayCommand::Connected { endpoint, connection } => {
                        connections.insert(endpoint, connection);
                        Vec::new()
                    }
                    RelayCommand::Inbound { endpoint, message, size } => {
                        network.record_received(size);
                        relay.handle_message(endpoint, message, Instant::now())
                    }
                    RelayCommand::Malformed { endpoint, error } => {
                        network.record_malformed();
                        log::warn!("Malformed frame from {}: {}", endpoint, error);
                        connections.remove(&endpoint);
                        relay.handle_disconnect(endpoint)
                    }
                    RelayCommand::Disconnected { endpoint } => {
                        connections.remove(&endpoint);
                        relay.handle_disconnect(endpoint)
                    }
                }
            }
            _ = sweep.tick() => relay.sweep(Instant::now()),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                Vec::new()
            }
        };

        let mut outbound = outbound;
        loop {
            let stalled = deliver(&connections, &mut network, outbound);
            if stalled.is_empty() {
                break;
            }
            outbound = Vec::new();
            for endpoint in stalled {
                if let Some(connection) = connections.remove(&endpoint) {
                    let _ = connection.kick.send(());
                }
                outbound.extend(relay.handle_disconnect(endpoint));
            }
        }

        for event in relay.drain_events() {
            let _ = events.send(ServerEvent::from(event));
        }
        let _ = stats.send(ServerStats::collect(
            &relay,
            network.clone(),
            start_time,
            "tcp",
            local_addr,
        ));
    }
}

/// Queues each frame without waiting. Returns the peers whose queue was full;
/// frames for them are dropped.
fn deliver(
    connections: &HashMap<SocketAddr, Connection>,
    network: &mut NetworkStats,
    outbound: Vec<Outbound>,
) -> Vec<SocketAddr> {
    let mut stalled = Vec::new();
    for out in outbound {
        let Some(connection) = connections.get(&out.to) else {
            continue;
        };
        if stalled.contains(&out.to) {
            network.record_send_error();
            continue;
        }
        match encode(&out.message) {
            Ok(frame) => {
                let len = frame.len();
                match connection.outbox.try_send(frame) {
                    Ok(()) => network.record_sent(len),
                    Err(TrySendError::Full(_)) => {
                        log::warn!("{} stopped reading, disconnecting it", out.to);
                        network.record_send_error();
                        stalled.push(out.to);
                    }
                    Err(TrySendError::Closed(_)) => network.record_send_error(),
                }
            }
            Err(e) => {
                log::error!("Failed to encode {}: {}", out.message.kind(), e);
                network.record_send_error();
            }
        }
    }
    stalled
}
