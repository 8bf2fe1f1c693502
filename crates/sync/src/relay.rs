use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::entity::{EntityId, Position};
use crate::net::{Message, PlayerEntry};
use crate::registry::{DEFAULT_MAX_SESSIONS, SessionRegistry};

pub const DEFAULT_PING_AFTER: Duration = Duration::from_secs(10);
pub const DEFAULT_DROP_AFTER: Duration = Duration::from_secs(20);

/// How the relay notices sessions that went away without a `Leave`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LivenessPolicy {
    /// Probe silent sessions once, then drop them.
    Ping {
        ping_after: Duration,
        drop_after: Duration,
    },
    /// Rely on the stream transport reporting closed connections.
    TransportDisconnect,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self::Ping {
            ping_after: DEFAULT_PING_AFTER,
            drop_after: DEFAULT_DROP_AFTER,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub max_sessions: usize,
    pub liveness: LivenessPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            liveness: LivenessPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: SocketAddr,
    pub message: Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    Graceful,
    Timeout,
    TransportClosed,
}

impl LeaveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaveReason::Graceful => "left",
            LeaveReason::Timeout => "timed out",
            LeaveReason::TransportClosed => "connection closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Joined {
        identifier: EntityId,
        endpoint: SocketAddr,
    },
    Rejected {
        endpoint: SocketAddr,
        reason: String,
    },
    Left {
        identifier: EntityId,
        reason: LeaveReason,
    },
    Pinged {
        identifier: EntityId,
    },
    Anomaly {
        endpoint: SocketAddr,
        description: String,
    },
}

/// Server-side relay. Transport agnostic: callers feed it decoded messages
/// with their source endpoint and deliver the returned `Outbound` list.
#[derive(Debug)]
pub struct RelayEngine {
    registry: SessionRegistry,
    config: RelayConfig,
    pending_events: VecDeque<RelayEvent>,
}

impl RelayEngine {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            registry: SessionRegistry::new(config.max_sessions),
            config,
            pending_events: VecDeque::new(),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = RelayEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn handle_message(
        &mut self,
        from: SocketAddr,
        message: Message,
        now: Instant,
    ) -> Vec<Outbound> {
        self.registry.touch(&from, now);

        match message {
            Message::Introduce { identifier } => self.handle_introduce(from, identifier, now),
            Message::Update {
                identifier,
                sequence,
                x,
                y,
            } => self.handle_update(from, identifier, sequence, Position::new(x, y), now),
            Message::Leave { identifier } => self.handle_leave(from, identifier),
            Message::Ping { .. } => {
                if self.registry.lookup_by_endpoint(&from).is_none() {
                    log::debug!("Ping from unregistered endpoint {}", from);
                    return Vec::new();
                }
                vec![Outbound {
                    to: from,
                    message: Message::Pong {
                        identifier: EntityId::server(),
                    },
                }]
            }
            Message::Pong { .. } => Vec::new(),
            other @ (Message::PlayerListSnapshot { .. } | Message::Rejected { .. }) => {
                self.anomaly(from, format!("unexpected `{}` from client", other.kind()));
                Vec::new()
            }
        }
    }

    /// Removes the session bound to a closed stream connection.
    pub fn handle_disconnect(&mut self, endpoint: SocketAddr) -> Vec<Outbound> {
        match self.registry.remove_by_endpoint(&endpoint) {
            Some(session) => self.depart(session.identifier, LeaveReason::TransportClosed),
            None => Vec::new(),
        }
    }

    /// Liveness pass. Does nothing under `LivenessPolicy::TransportDisconnect`.
    pub fn sweep(&mut self, now: Instant) -> Vec<Outbound> {
        let LivenessPolicy::Ping {
            ping_after,
            drop_after,
        } = self.config.liveness
        else {
            return Vec::new();
        };

        let mut outbound = Vec::new();
        let mut expired = Vec::new();
        let mut to_ping = Vec::new();

        for session in self.registry.iter() {
            let silent = session.silent_for(now);
            if silent > drop_after {
                expired.push(session.identifier.clone());
            } else if silent > ping_after && !session.pinged {
                to_ping.push(session.handle());
            }
        }

        for handle in to_ping {
            self.registry.mark_pinged(&handle.identifier);
            outbound.push(Outbound {
                to: handle.endpoint,
                message: Message::Ping {
                    identifier: EntityId::server(),
                },
            });
            self.pending_events.push_back(RelayEvent::Pinged {
                identifier: handle.identifier,
            });
        }

        for identifier in expired {
            if self.registry.remove(&identifier).is_some() {
                outbound.extend(self.depart(identifier, LeaveReason::Timeout));
            }
        }

        outbound
    }

    fn handle_introduce(
        &mut self,
        from: SocketAddr,
        identifier: EntityId,
        now: Instant,
    ) -> Vec<Outbound> {
        if let Err(e) = identifier.validate_client() {
            return self.reject(from, e.to_string());
        }

        let rejoin = self
            .registry
            .get(&identifier)
            .is_some_and(|s| s.endpoint == from);

        if let Err(e) = self.registry.register(identifier.clone(), from, now) {
            return self.reject(from, e.to_string());
        }

        if !rejoin {
            log::info!("`{}` joined from {}", identifier, from);
            self.pending_events.push_back(RelayEvent::Joined {
                identifier: identifier.clone(),
                endpoint: from,
            });
        }

        let entries = self
            .registry
            .snapshot_excluding(&identifier)
            .into_iter()
            .map(|(id, position)| PlayerEntry::new(id, position))
            .collect();

        vec![Outbound {
            to: from,
            message: Message::PlayerListSnapshot { entries },
        }]
    }

    fn handle_update(
        &mut self,
        from: SocketAddr,
        identifier: EntityId,
        sequence: u32,
        position: Position,
        now: Instant,
    ) -> Vec<Outbound> {
        let Some(handle) = self.registry.lookup_by_endpoint(&from) else {
            self.anomaly(from, format!("update for `{}` from unregistered endpoint", identifier));
            return Vec::new();
        };

        if handle.identifier != identifier {
            self.anomaly(
                from,
                format!(
                    "update for `{}` from the endpoint of `{}`",
                    identifier, handle.identifier
                ),
            );
            return Vec::new();
        }

        if !self.registry.accept_sequence(&identifier, sequence) {
            log::debug!("Dropping stale update {} from `{}`", sequence, identifier);
            return Vec::new();
        }

        if self
            .registry
            .update_position(&identifier, position, now)
            .is_err()
        {
            return Vec::new();
        }

        let message = Message::update(identifier.clone(), sequence, position);
        self.broadcast_except(&identifier, &message)
    }

    fn handle_leave(&mut self, from: SocketAddr, identifier: EntityId) -> Vec<Outbound> {
        let Some(handle) = self.registry.lookup_by_endpoint(&from) else {
            log::debug!("Leave for `{}` from unregistered endpoint {}", identifier, from);
            return Vec::new();
        };

        if handle.identifier != identifier {
            self.anomaly(
                from,
                format!(
                    "leave for `{}` from the endpoint of `{}`",
                    identifier, handle.identifier
                ),
            );
            return Vec::new();
        }

        self.registry.remove(&identifier);
        self.depart(identifier, LeaveReason::Graceful)
    }

    /// Records the departure and tells the remaining sessions. The session
    /// must already be gone from the registry.
    fn depart(&mut self, identifier: EntityId, reason: LeaveReason) -> Vec<Outbound> {
        log::info!("`{}` {}", identifier, reason.as_str());
        let message = Message::Leave {
            identifier: identifier.clone(),
        };
        let outbound = self.broadcast_except(&identifier, &message);
        self.pending_events
            .push_back(RelayEvent::Left { identifier, reason });
        outbound
    }

    fn broadcast_except(&self, except: &EntityId, message: &Message) -> Vec<Outbound> {
        self.registry
            .iter()
            .filter(|s| &s.identifier != except)
            .map(|s| Outbound {
                to: s.endpoint,
                message: message.clone(),
            })
            .collect()
    }

    fn reject(&mut self, endpoint: SocketAddr, reason: String) -> Vec<Outbound> {
        log::warn!("Rejected introduction from {}: {}", endpoint, reason);
        self.pending_events.push_back(RelayEvent::Rejected {
            endpoint,
            reason: reason.clone(),
        });
        vec![Outbound {
            to: endpoint,
            message: Message::Rejected { reason },
        }]
    }

    fn anomaly(&mut self, endpoint: SocketAddr, description: String) {
        log::warn!("Anomaly from {}: {}", endpoint, description);
        self.pending_events.push_back(RelayEvent::Anomaly {
            endpoint,
            description,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: &str) -> EntityId {
        EntityId::new(value).unwrap()
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn introduce(relay: &mut RelayEngine, name: &str, port: u16, now: Instant) -> Vec<Outbound> {
        relay.handle_message(
            addr(port),
            Message::Introduce {
                identifier: id(name),
            },
            now,
        )
    }

    fn ping_relay(ping_secs: u64, drop_secs: u64) -> RelayEngine {
        RelayEngine::new(RelayConfig {
            max_sessions: 8,
            liveness: LivenessPolicy::Ping {
                ping_after: Duration::from_secs(ping_secs),
                drop_after: Duration::from_secs(drop_secs),
            },
        })
    }

    #[test]
    fn test_introduce_replies_with_snapshot_excluding_requester() {
        let mut relay = RelayEngine::new(RelayConfig::default());
        let now = Instant::now();

        let out = introduce(&mut relay, "p1", 1000, now);
        assert_eq!(
            out,
            vec![Outbound {
                to: addr(1000),
                message: Message::PlayerListSnapshot { entries: vec![] },
            }]
        );

        let out = introduce(&mut relay, "p2", 2000, now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, addr(2000));
        assert_eq!(
            out[0].message,
            Message::PlayerListSnapshot {
                entries: vec![PlayerEntry::new(id("p1"), Position::ZERO)],
            }
        );
        assert_eq!(relay.sessions().len(), 2);

        let events: Vec<_> = relay.drain_events().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RelayEvent::Joined { .. }));
    }

    #[test]
    fn test_duplicate_introduce_rejected() {
        let mut relay = RelayEngine::new(RelayConfig::default());
        let now = Instant::now();

        introduce(&mut relay, "p1", 1000, now);
        let out = introduce(&mut relay, "p1", 2000, now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, addr(2000));
        assert!(matches!(out[0].message, Message::Rejected { .. }));
        assert_eq!(relay.sessions().len(), 1);
        assert_eq!(
            relay.sessions().get(&id("p1")).unwrap().endpoint,
            addr(1000)
        );
    }

    #[test]
    fn test_reintroduce_same_endpoint_resends_snapshot() {
        let mut relay = RelayEngine::new(RelayConfig::default());
        let now = Instant::now();

        introduce(&mut relay, "p1", 1000, now);
        relay.drain_events().for_each(drop);

        let out = introduce(&mut relay, "p1", 1000, now);
        assert!(matches!(
            out[0].message,
            Message::PlayerListSnapshot { .. }
        ));
        assert_eq!(relay.drain_events().count(), 0);
    }

    #[test]
    fn test_reserved_identifier_rejected() {
        let mut relay = RelayEngine::new(RelayConfig::default());
        let out = relay.handle_message(
            addr(1000),
            Message::Introduce {
                identifier: EntityId::server(),
            },
            Instant::now(),
        );
        assert!(matches!(out[0].message, Message::Rejected { .. }));
        assert!(relay.sessions().is_empty());
    }

    #[test]
    fn test_update_broadcast_excludes_sender() {
        let mut relay = RelayEngine::new(RelayConfig::default());
        let now = Instant::now();

        introduce(&mut relay, "a", 1000, now);
        introduce(&mut relay, "b", 2000, now);
        introduce(&mut relay, "c", 3000, now);

        let update = Message::update(id("a"), 1, Position::new(5.0, 5.0));
        let out = relay.handle_message(addr(1000), update.clone(), now);

        let mut targets: Vec<_> = out.iter().map(|o| o.to).collect();
        targets.sort();
        assert_eq!(targets, vec![addr(2000), addr(3000)]);
        assert!(out.iter().all(|o| o.message == update));
        assert_eq!(
            relay.sessions().get(&id("a")).unwrap().position,
            Position::new(5.0, 5.0)
        );
    }

    #[test]
    fn test_stale_update_not_relayed() {
        let mut relay = RelayEngine::new(RelayConfig::default());
        let now = Instant::now();

        introduce(&mut relay, "a", 1000, now);
        introduce(&mut relay, "b", 2000, now);

        let fresh = Message::update(id("a"), 7, Position::new(7.0, 0.0));
        let stale = Message::update(id("a"), 6, Position::new(6.0, 0.0));
        assert_eq!(relay.handle_message(addr(1000), fresh.clone(), now).len(), 1);
        assert!(relay.handle_message(addr(1000), fresh, now).is_empty());
        assert!(relay.handle_message(addr(1000), stale, now).is_empty());
        assert_eq!(
            relay.sessions().get(&id("a")).unwrap().position,
            Position::new(7.0, 0.0)
        );
    }

    #[test]
    fn test_ghost_update_not_relayed() {
        let mut relay = RelayEngine::new(RelayConfig::default());
        let now = Instant::now();

        introduce(&mut relay, "a", 1000, now);
        introduce(&mut relay, "b", 2000, now);
        relay.drain_events().for_each(drop);

        let spoofed = Message::update(id("b"), 1, Position::ONE);
        assert!(relay.handle_message(addr(1000), spoofed, now).is_empty());

        let unknown = Message::update(id("z"), 1, Position::ONE);
        assert!(relay.handle_message(addr(9000), unknown, now).is_empty());

        let anomalies = relay
            .drain_events()
            .filter(|e| matches!(e, RelayEvent::Anomaly { .. }))
            .count();
        assert_eq!(anomalies, 2);
        assert_eq!(relay.sessions().get(&id("b")).unwrap().position, Position::ZERO);
    }

    #[test]
    fn test_leave_broadcasts_to_remaining() {
        let mut relay = RelayEngine::new(RelayConfig::default());
        let now = Instant::now();

        introduce(&mut relay, "a", 1000, now);
        introduce(&mut relay, "b", 2000, now);

        let out = relay.handle_message(addr(1000), Message::Leave { identifier: id("a") }, now);
        assert_eq!(
            out,
            vec![Outbound {
                to: addr(2000),
                message: Message::Leave { identifier: id("a") },
            }]
        );
        assert!(relay.sessions().get(&id("a")).is_none());

        // Second leave is a no-op.
        let out = relay.handle_message(addr(1000), Message::Leave { identifier: id("a") }, now);
        assert!(out.is_empty());
    }

    #[test]
    fn test_ping_answered_with_server_pong() {
        let mut relay = RelayEngine::new(RelayConfig::default());
        let now = Instant::now();

        assert!(
            relay
                .handle_message(addr(1000), Message::Ping { identifier: id("a") }, now)
                .is_empty()
        );

        introduce(&mut relay, "a", 1000, now);
        let out = relay.handle_message(addr(1000), Message::Ping { identifier: id("a") }, now);
        assert_eq!(
            out,
            vec![Outbound {
                to: addr(1000),
                message: Message::Pong {
                    identifier: EntityId::server()
                },
            }]
        );
    }

    #[test]
    fn test_sweep_pings_once_then_drops() {
        let mut relay = ping_relay(10, 20);
        let start = Instant::now();

        introduce(&mut relay, "a", 1000, start);
        introduce(&mut relay, "b", 2000, start);
        relay.drain_events().for_each(drop);

        assert!(relay.sweep(start + Duration::from_secs(5)).is_empty());

        // b keeps talking, a goes quiet.
        let t = start + Duration::from_secs(11);
        relay.handle_message(addr(2000), Message::Pong { identifier: id("b") }, t);
        let out = relay.sweep(t);
        assert_eq!(
            out,
            vec![Outbound {
                to: addr(1000),
                message: Message::Ping {
                    identifier: EntityId::server()
                },
            }]
        );
        assert!(relay.sweep(start + Duration::from_secs(15)).is_empty());

        let t = start + Duration::from_secs(21);
        relay.handle_message(addr(2000), Message::Pong { identifier: id("b") }, t);
        let out = relay.sweep(t);
        assert_eq!(
            out,
            vec![Outbound {
                to: addr(2000),
                message: Message::Leave { identifier: id("a") },
            }]
        );
        assert!(relay.sessions().get(&id("a")).is_none());

        let events: Vec<_> = relay.drain_events().collect();
        assert!(events.contains(&RelayEvent::Pinged { identifier: id("a") }));
        assert!(events.contains(&RelayEvent::Left {
            identifier: id("a"),
            reason: LeaveReason::Timeout,
        }));
    }

    #[test]
    fn test_traffic_after_ping_rearms_probe() {
        let mut relay = ping_relay(10, 20);
        let start = Instant::now();

        introduce(&mut relay, "a", 1000, start);
        assert_eq!(relay.sweep(start + Duration::from_secs(11)).len(), 1);

        let t = start + Duration::from_secs(12);
        let update = Message::update(id("a"), 1, Position::ONE);
        relay.handle_message(addr(1000), update, t);
        assert!(!relay.sessions().get(&id("a")).unwrap().pinged);

        assert_eq!(relay.sweep(t + Duration::from_secs(11)).len(), 1);
        assert_eq!(relay.sessions().len(), 1);
    }

    #[test]
    fn test_transport_disconnect_policy() {
        let mut relay = RelayEngine::new(RelayConfig {
            max_sessions: 8,
            liveness: LivenessPolicy::TransportDisconnect,
        });
        let start = Instant::now();

        introduce(&mut relay, "a", 1000, start);
        introduce(&mut relay, "b", 2000, start);
        assert!(relay.sweep(start + Duration::from_secs(3600)).is_empty());
        assert_eq!(relay.sessions().len(), 2);

        let out = relay.handle_disconnect(addr(1000));
        assert_eq!(
            out,
            vec![Outbound {
                to: addr(2000),
                message: Message::Leave { identifier: id("a") },
            }]
        );
        assert!(relay.handle_disconnect(addr(1000)).is_empty());
    }

    #[test]
    fn test_server_full_rejects() {
        let mut relay = RelayEngine::new(RelayConfig {
            max_sessions: 1,
            ..Default::default()
        });
        let now = Instant::now();

        introduce(&mut relay, "a", 1000, now);
        let out = introduce(&mut relay, "b", 2000, now);
        assert!(matches!(out[0].message, Message::Rejected { .. }));
        assert_eq!(relay.sessions().len(), 1);
    }
}
