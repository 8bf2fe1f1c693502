use std::fmt;
use std::time::{Duration, Instant};

use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::entity::{EntityId, Position};
use crate::interpolation::RemoteEntities;
use crate::net::{Message, PlayerEntry, Transport, TransportError};

pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub update_interval: Duration,
    pub introduce_timeout: Duration,
    pub ping_interval: Duration,
    pub server_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            update_interval: DEFAULT_UPDATE_INTERVAL,
            introduce_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(2),
            server_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Connecting,
    Introducing,
    Synchronized,
    Disconnected,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Connecting => "connecting",
            SyncState::Introducing => "introducing",
            SyncState::Synchronized => "synchronized",
            SyncState::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Left,
    Rejected(String),
    Timeout,
    TransportClosed,
    ConnectFailed(String),
    MalformedReply,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Left => f.write_str("left"),
            DisconnectReason::Rejected(reason) => write!(f, "rejected: {}", reason),
            DisconnectReason::Timeout => f.write_str("timed out"),
            DisconnectReason::TransportClosed => f.write_str("connection closed"),
            DisconnectReason::ConnectFailed(reason) => write!(f, "connect failed: {}", reason),
            DisconnectReason::MalformedReply => f.write_str("malformed reply"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("not connected")]
    NotConnected,
    #[error("introduction rejected: {0}")]
    Rejected(String),
    #[error("timed out waiting for the server")]
    Timeout,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// What the presentation layer draws.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityView {
    pub identifier: EntityId,
    pub position: Position,
    pub local: bool,
}

/// Client half of the protocol. Driven by the caller's tick: `update` polls
/// the transport, applies what arrived, integrates local movement and sends
/// position updates on a fixed cadence.
pub struct SyncClient<T: Transport> {
    identifier: EntityId,
    config: SyncConfig,
    state: SyncState,
    transport: Option<T>,
    position: Position,
    sequence: u32,
    remotes: RemoteEntities,
    introduced_at: Option<Instant>,
    last_heard: Option<Instant>,
    last_update_sent: Option<Instant>,
    last_ping_sent: Option<Instant>,
    ping_sent_at: Option<Instant>,
    rtt: Option<Duration>,
    disconnect_reason: Option<DisconnectReason>,
}

impl<T: Transport> SyncClient<T> {
    pub fn new(identifier: EntityId, config: SyncConfig) -> Self {
        Self {
            identifier,
            config,
            state: SyncState::Connecting,
            transport: None,
            position: Position::ZERO,
            sequence: 0,
            remotes: RemoteEntities::new(),
            introduced_at: None,
            last_heard: None,
            last_update_sent: None,
            last_ping_sent: None,
            ping_sent_at: None,
            rtt: None,
            disconnect_reason: None,
        }
    }

    pub fn identifier(&self) -> &EntityId {
        &self.identifier
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    pub fn disconnect_reason(&self) -> Option<&DisconnectReason> {
        self.disconnect_reason.as_ref()
    }

    pub fn remotes(&self) -> &RemoteEntities {
        &self.remotes
    }

    /// Establishes the transport and sends `Introduce`. A failed connect is
    /// terminal.
    pub fn connect<F>(&mut self, connector: F, now: Instant) -> Result<(), SyncError>
    where
        F: FnOnce() -> Result<T, TransportError>,
    {
        match self.state {
            SyncState::Connecting => {}
            SyncState::Disconnected => return Err(SyncError::NotConnected),
            SyncState::Introducing | SyncState::Synchronized => return Ok(()),
        }

        let transport = match connector() {
            Ok(transport) => transport,
            Err(e) => {
                self.disconnect(DisconnectReason::ConnectFailed(e.to_string()));
                return Err(e.into());
            }
        };
        self.transport = Some(transport);

        let intro = Message::Introduce {
            identifier: self.identifier.clone(),
        };
        self.send(&intro)?;

        log::info!("Introducing as `{}`", self.identifier);
        self.state = SyncState::Introducing;
        self.introduced_at = Some(now);
        Ok(())
    }

    pub fn update(&mut self, now: Instant, movement: Vec2) -> Result<(), SyncError> {
        match self.state {
            SyncState::Connecting | SyncState::Disconnected => return Err(SyncError::NotConnected),
            SyncState::Introducing | SyncState::Synchronized => {}
        }

        self.process_inbound(now)?;

        match self.state {
            SyncState::Introducing => {
                let waited = self
                    .introduced_at
                    .map_or(Duration::ZERO, |at| now.saturating_duration_since(at));
                if waited > self.config.introduce_timeout {
                    log::warn!("No player list after {:?}", waited);
                    self.disconnect(DisconnectReason::Timeout);
                    return Err(SyncError::Timeout);
                }
            }
            SyncState::Synchronized => {
                let silent = self
                    .last_heard
                    .map_or(Duration::ZERO, |at| now.saturating_duration_since(at));
                if silent > self.config.server_timeout {
                    log::warn!("Server silent for {:?}", silent);
                    self.disconnect(DisconnectReason::Timeout);
                    return Err(SyncError::Timeout);
                }

                for identifier in self.remotes.expire(now, self.config.server_timeout) {
                    log::info!("`{}` went silent, dropping it", identifier);
                }

                self.position += movement;

                let update_due = self.last_update_sent.is_none_or(|at| {
                    now.saturating_duration_since(at) >= self.config.update_interval
                });
                if update_due {
                    self.send_update(now)?;
                }

                let ping_due = self.last_ping_sent.is_none_or(|at| {
                    now.saturating_duration_since(at) >= self.config.ping_interval
                });
                if ping_due {
                    self.send(&Message::Ping {
                        identifier: self.identifier.clone(),
                    })?;
                    self.last_ping_sent = Some(now);
                    self.ping_sent_at = Some(now);
                }
            }
            SyncState::Connecting | SyncState::Disconnected => {}
        }

        Ok(())
    }

    /// Sends the local position right away, outside the regular cadence.
    pub fn send_update(&mut self, now: Instant) -> Result<(), SyncError> {
        if self.state != SyncState::Synchronized {
            return Err(SyncError::NotConnected);
        }
        self.sequence = self.sequence.wrapping_add(1);
        let message = Message::update(self.identifier.clone(), self.sequence, self.position);
        self.send(&message)?;
        self.last_update_sent = Some(now);
        Ok(())
    }

    /// Sends `Leave` and closes the transport.
    pub fn leave(&mut self) -> Result<(), SyncError> {
        match self.state {
            SyncState::Disconnected => return Err(SyncError::NotConnected),
            SyncState::Connecting => {
                self.disconnect(DisconnectReason::Left);
                return Ok(());
            }
            SyncState::Introducing | SyncState::Synchronized => {}
        }

        let leave = Message::Leave {
            identifier: self.identifier.clone(),
        };
        let result = self.send(&leave);
        if self.state != SyncState::Disconnected {
            self.disconnect(DisconnectReason::Left);
        }
        result
    }

    /// The local entity first, then every remote entity at its smoothed
    /// position.
    pub fn entities(&self, now: Instant) -> Vec<EntityView> {
        let mut views = Vec::with_capacity(self.remotes.len() + 1);
        views.push(EntityView {
            identifier: self.identifier.clone(),
            position: self.position,
            local: true,
        });
        views.extend(
            self.remotes
                .positions_at(now)
                .into_iter()
                .map(|(identifier, position)| EntityView {
                    identifier,
                    position,
                    local: false,
                }),
        );
        views
    }

    fn process_inbound(&mut self, now: Instant) -> Result<(), SyncError> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(SyncError::NotConnected);
        };

        let inbound = match transport.poll() {
            Ok(inbound) => inbound,
            Err(e) => {
                log::warn!("Transport failed: {}", e);
                self.disconnect(DisconnectReason::TransportClosed);
                return Err(e.into());
            }
        };

        for item in inbound {
            let message = match item {
                Ok(message) => message,
                Err(e) if self.state == SyncState::Introducing => {
                    log::warn!("Malformed reply to introduction: {}", e);
                    self.disconnect(DisconnectReason::MalformedReply);
                    return Err(TransportError::Packet(e).into());
                }
                Err(e) => {
                    log::warn!("Dropping malformed message: {}", e);
                    continue;
                }
            };

            self.last_heard = Some(now);
            self.handle_message(message, now)?;
            if self.state == SyncState::Disconnected {
                break;
            }
        }

        Ok(())
    }

    fn handle_message(&mut self, message: Message, now: Instant) -> Result<(), SyncError> {
        match message {
            Message::PlayerListSnapshot { entries } => {
                self.apply_snapshot(&entries, now);
                if self.state == SyncState::Introducing {
                    log::info!("Synchronized with {} other player(s)", entries.len());
                    self.state = SyncState::Synchronized;
                    self.send_update(now)?;
                }
            }
            Message::Update {
                identifier,
                sequence,
                x,
                y,
            } => {
                if identifier == self.identifier {
                    log::debug!("Ignoring echo of own update");
                } else {
                    self.remotes
                        .apply_update(&identifier, sequence, Position::new(x, y), now);
                }
            }
            Message::Leave { identifier } => {
                if self.remotes.remove(&identifier) {
                    log::info!("`{}` left", identifier);
                }
            }
            Message::Ping { .. } => {
                if self.state == SyncState::Synchronized {
                    self.send_update(now)?;
                }
            }
            Message::Pong { .. } => {
                if let Some(sent) = self.ping_sent_at.take() {
                    self.rtt = Some(now.saturating_duration_since(sent));
                }
            }
            Message::Rejected { reason } => {
                log::warn!("Server rejected `{}`: {}", self.identifier, reason);
                self.disconnect(DisconnectReason::Rejected(reason.clone()));
                return Err(SyncError::Rejected(reason));
            }
            Message::Introduce { identifier } => {
                log::debug!("Unexpected introduce for `{}` from server", identifier);
            }
        }
        Ok(())
    }

    fn apply_snapshot(&mut self, entries: &[PlayerEntry], now: Instant) {
        for entry in entries {
            if entry.identifier == self.identifier {
                continue;
            }
            self.remotes
                .insert_snapshot_entry(&entry.identifier, entry.position(), now);
        }
    }

    fn send(&mut self, message: &Message) -> Result<(), SyncError> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(SyncError::NotConnected);
        };
        if let Err(e) = transport.send(message) {
            log::warn!("Failed to send {}: {}", message.kind(), e);
            self.disconnect(DisconnectReason::TransportClosed);
            return Err(e.into());
        }
        Ok(())
    }

    fn disconnect(&mut self, reason: DisconnectReason) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        log::info!("Disconnected: {}", reason);
        self.state = SyncState::Disconnected;
        self.disconnect_reason = Some(reason);
        self.remotes.clear();
    }
}
