use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::entity::{EntityId, Position};
use crate::net::sequence_greater_than;

pub const DEFAULT_MAX_SESSIONS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("identifier `{0}` is already taken")]
    NameTaken(EntityId),
    #[error("endpoint {endpoint} is already registered as `{identifier}`")]
    EndpointInUse {
        endpoint: SocketAddr,
        identifier: EntityId,
    },
    #[error("server full ({0} sessions)")]
    Full(usize),
    #[error("no session for `{0}`")]
    UnknownEntity(EntityId),
}

#[derive(Debug, Clone)]
pub struct Session {
    pub identifier: EntityId,
    pub endpoint: SocketAddr,
    pub position: Position,
    pub joined_at: Instant,
    pub last_seen: Instant,
    pub last_sequence: Option<u32>,
    pub pinged: bool,
}

impl Session {
    fn new(identifier: EntityId, endpoint: SocketAddr, now: Instant) -> Self {
        Self {
            identifier,
            endpoint,
            position: Position::ZERO,
            joined_at: now,
            last_seen: now,
            last_sequence: None,
            pinged: false,
        }
    }

    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            identifier: self.identifier.clone(),
            endpoint: self.endpoint,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_seen = now;
        self.pinged = false;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub identifier: EntityId,
    pub endpoint: SocketAddr,
}

/// Authoritative set of connected sessions. Owned by exactly one task (the
/// UDP loop or the TCP relay actor), so every operation is atomic with
/// respect to the others.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<EntityId, Session>,
    by_endpoint: HashMap<SocketAddr, EntityId>,
    // Join order, for snapshots.
    order: Vec<EntityId>,
    max_sessions: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS)
    }
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            by_endpoint: HashMap::new(),
            order: Vec::new(),
            max_sessions,
        }
    }

    pub fn register(
        &mut self,
        identifier: EntityId,
        endpoint: SocketAddr,
        now: Instant,
    ) -> Result<SessionHandle, RegistryError> {
        if let Some(existing) = self.sessions.get_mut(&identifier) {
            if existing.endpoint == endpoint {
                existing.touch(now);
                return Ok(existing.handle());
            }
            return Err(RegistryError::NameTaken(identifier));
        }

        if let Some(bound) = self.by_endpoint.get(&endpoint) {
            return Err(RegistryError::EndpointInUse {
                endpoint,
                identifier: bound.clone(),
            });
        }

        if self.sessions.len() >= self.max_sessions {
            return Err(RegistryError::Full(self.max_sessions));
        }

        let session = Session::new(identifier.clone(), endpoint, now);
        let handle = session.handle();
        self.by_endpoint.insert(endpoint, identifier.clone());
        self.order.push(identifier.clone());
        self.sessions.insert(identifier, session);
        Ok(handle)
    }

    pub fn lookup_by_endpoint(&self, endpoint: &SocketAddr) -> Option<SessionHandle> {
        self.by_endpoint
            .get(endpoint)
            .and_then(|id| self.sessions.get(id))
            .map(Session::handle)
    }

    pub fn get(&self, identifier: &EntityId) -> Option<&Session> {
        self.sessions.get(identifier)
    }

    pub fn update_position(
        &mut self,
        identifier: &EntityId,
        position: Position,
        now: Instant,
    ) -> Result<(), RegistryError> {
        match self.sessions.get_mut(identifier) {
            Some(session) => {
                session.position = position;
                session.touch(now);
                Ok(())
            }
            None => {
                log::warn!("Position update from ghost `{}`", identifier);
                Err(RegistryError::UnknownEntity(identifier.clone()))
            }
        }
    }

    /// Returns false when `sequence` is not newer than the last one accepted
    /// for `identifier`; the update should then be dropped.
    pub fn accept_sequence(&mut self, identifier: &EntityId, sequence: u32) -> bool {
        let Some(session) = self.sessions.get_mut(identifier) else {
            return false;
        };
        match session.last_sequence {
            Some(last) if !sequence_greater_than(sequence, last) => false,
            _ => {
                session.last_sequence = Some(sequence);
                true
            }
        }
    }

    /// Refreshes liveness for whatever session owns `endpoint`.
    pub fn touch(&mut self, endpoint: &SocketAddr, now: Instant) -> bool {
        let Some(id) = self.by_endpoint.get(endpoint) else {
            return false;
        };
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.touch(now);
                true
            }
            None => false,
        }
    }

    pub fn mark_pinged(&mut self, identifier: &EntityId) {
        if let Some(session) = self.sessions.get_mut(identifier) {
            session.pinged = true;
        }
    }

    pub fn remove(&mut self, identifier: &EntityId) -> Option<Session> {
        let session = self.sessions.remove(identifier)?;
        self.by_endpoint.remove(&session.endpoint);
        self.order.retain(|id| id != identifier);
        Some(session)
    }

    pub fn remove_by_endpoint(&mut self, endpoint: &SocketAddr) -> Option<Session> {
        let identifier = self.by_endpoint.get(endpoint)?.clone();
        self.remove(&identifier)
    }

    pub fn snapshot(&self) -> Vec<(EntityId, Position)> {
        self.iter()
            .map(|s| (s.identifier.clone(), s.position))
            .collect()
    }

    pub fn snapshot_excluding(&self, identifier: &EntityId) -> Vec<(EntityId, Position)> {
        self.iter()
            .filter(|s| &s.identifier != identifier)
            .map(|s| (s.identifier.clone(), s.position))
            .collect()
    }

    /// Sessions in join order.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.order.iter().filter_map(|id| self.sessions.get(id))
    }

    pub fn silent_for(&self, now: Instant, threshold: Duration) -> Vec<SessionHandle> {
        self.iter()
            .filter(|s| s.silent_for(now) > threshold)
            .map(Session::handle)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
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

    #[test]
    fn test_register_and_lookup() {
        let mut registry = SessionRegistry::default();
        let now = Instant::now();

        let handle = registry.register(id("p1"), addr(1000), now).unwrap();
        assert_eq!(handle.identifier, id("p1"));
        assert_eq!(registry.lookup_by_endpoint(&addr(1000)), Some(handle));
        assert_eq!(registry.lookup_by_endpoint(&addr(1001)), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_name_taken_keeps_original() {
        let mut registry = SessionRegistry::default();
        let now = Instant::now();

        registry.register(id("p1"), addr(1000), now).unwrap();
        assert_eq!(
            registry.register(id("p1"), addr(2000), now),
            Err(RegistryError::NameTaken(id("p1")))
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&id("p1")).unwrap().endpoint, addr(1000));
        assert!(registry.lookup_by_endpoint(&addr(2000)).is_none());
    }

    #[test]
    fn test_reregister_same_endpoint_is_idempotent() {
        let mut registry = SessionRegistry::default();
        let now = Instant::now();

        let first = registry.register(id("p1"), addr(1000), now).unwrap();
        let second = registry.register(id("p1"), addr(1000), now).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_endpoint_in_use() {
        let mut registry = SessionRegistry::default();
        let now = Instant::now();

        registry.register(id("p1"), addr(1000), now).unwrap();
        assert!(matches!(
            registry.register(id("p2"), addr(1000), now),
            Err(RegistryError::EndpointInUse { .. })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_full() {
        let mut registry = SessionRegistry::new(1);
        let now = Instant::now();

        registry.register(id("p1"), addr(1000), now).unwrap();
        assert_eq!(
            registry.register(id("p2"), addr(2000), now),
            Err(RegistryError::Full(1))
        );
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut registry = SessionRegistry::default();
        assert!(registry.remove(&id("nobody")).is_none());
        assert!(registry.is_empty());

        registry
            .register(id("p1"), addr(1000), Instant::now())
            .unwrap();
        assert!(registry.remove(&id("p1")).is_some());
        assert!(registry.remove(&id("p1")).is_none());
        assert!(registry.lookup_by_endpoint(&addr(1000)).is_none());
    }

    #[test]
    fn test_remove_by_endpoint() {
        let mut registry = SessionRegistry::default();
        registry
            .register(id("p1"), addr(1000), Instant::now())
            .unwrap();

        let removed = registry.remove_by_endpoint(&addr(1000)).unwrap();
        assert_eq!(removed.identifier, id("p1"));
        assert!(registry.get(&id("p1")).is_none());
        assert!(registry.remove_by_endpoint(&addr(1000)).is_none());
    }

    #[test]
    fn test_update_position_unknown_entity() {
        let mut registry = SessionRegistry::default();
        assert_eq!(
            registry.update_position(&id("ghost"), Position::ONE, Instant::now()),
            Err(RegistryError::UnknownEntity(id("ghost")))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_in_join_order() {
        let mut registry = SessionRegistry::default();
        let now = Instant::now();

        for (i, name) in ["c", "a", "b"].iter().enumerate() {
            registry.register(id(name), addr(1000 + i as u16), now).unwrap();
        }
        registry
            .update_position(&id("a"), Position::new(1.0, 2.0), now)
            .unwrap();

        let names: Vec<_> = registry
            .snapshot()
            .into_iter()
            .map(|(id, _)| id.to_string())
            .collect();
        assert_eq!(names, ["c", "a", "b"]);

        let without_a = registry.snapshot_excluding(&id("a"));
        assert_eq!(without_a.len(), 2);
        assert!(without_a.iter().all(|(id, _)| id.as_str() != "a"));

        registry.remove(&id("a"));
        registry.register(id("a"), addr(2000), now).unwrap();
        let names: Vec<_> = registry.iter().map(|s| s.identifier.to_string()).collect();
        assert_eq!(names, ["c", "b", "a"]);
    }

    #[test]
    fn test_silent_for_and_touch() {
        let mut registry = SessionRegistry::default();
        let start = Instant::now();

        registry.register(id("p1"), addr(1000), start).unwrap();
        registry.register(id("p2"), addr(2000), start).unwrap();

        let later = start + Duration::from_secs(5);
        assert!(registry.touch(&addr(2000), later));
        assert!(!registry.touch(&addr(3000), later));

        let silent = registry.silent_for(later, Duration::from_secs(1));
        assert_eq!(silent.len(), 1);
        assert_eq!(silent[0].identifier, id("p1"));
    }

    #[test]
    fn test_accept_sequence() {
        let mut registry = SessionRegistry::default();
        registry
            .register(id("p1"), addr(1000), Instant::now())
            .unwrap();

        assert!(registry.accept_sequence(&id("p1"), 5));
        assert!(!registry.accept_sequence(&id("p1"), 5));
        assert!(!registry.accept_sequence(&id("p1"), 4));
        assert!(registry.accept_sequence(&id("p1"), 6));
        assert!(!registry.accept_sequence(&id("ghost"), 1));
    }

    #[test]
    fn test_touch_clears_pinged() {
        let mut registry = SessionRegistry::default();
        let now = Instant::now();

        registry.register(id("p1"), addr(1000), now).unwrap();
        registry.mark_pinged(&id("p1"));
        assert!(registry.get(&id("p1")).unwrap().pinged);

        registry.touch(&addr(1000), now);
        assert!(!registry.get(&id("p1")).unwrap().pinged);
    }
}
