// Remote entities are drawn one arrival interval behind their latest sample:
// when a new sample arrives the entity is shown at the previous one and glides
// to the new one over the gap that separated the two arrivals, then holds.
// There is no extrapolation past the latest sample.

use std::time::{Duration, Instant};

use crate::entity::{EntityId, Position};
use crate::net::sequence_greater_than;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub position: Position,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct InterpolatedEntity {
    identifier: EntityId,
    previous: Option<Sample>,
    current: Sample,
    last_sequence: Option<u32>,
}

impl InterpolatedEntity {
    pub fn new(
        identifier: EntityId,
        position: Position,
        at: Instant,
        sequence: Option<u32>,
    ) -> Self {
        Self {
            identifier,
            previous: None,
            current: Sample { position, at },
            last_sequence: sequence,
        }
    }

    pub fn current(&self) -> Sample {
        self.current
    }

    pub fn previous(&self) -> Option<Sample> {
        self.previous
    }

    /// Accepts a new sample unless it duplicates what is already known.
    /// Sequenced samples must be newer than the last accepted sequence.
    /// Unsequenced ones (snapshot entries) carry no ordering, so they are
    /// refused once a sequenced sample was accepted, and otherwise must
    /// differ from the current position. Returns whether the sample was taken.
    pub fn push(&mut self, position: Position, at: Instant, sequence: Option<u32>) -> bool {
        match (sequence, self.last_sequence) {
            (Some(seq), Some(last)) if !sequence_greater_than(seq, last) => return false,
            (Some(seq), _) => self.last_sequence = Some(seq),
            (None, Some(_)) => return false,
            (None, None) => {
                if position == self.current.position {
                    return false;
                }
            }
        }

        self.previous = Some(self.current);
        self.current = Sample { position, at };
        true
    }

    pub fn position_at(&self, now: Instant) -> Position {
        let Some(previous) = self.previous else {
            return self.current.position;
        };

        let interval = self
            .current
            .at
            .saturating_duration_since(previous.at)
            .as_secs_f32();
        if interval <= 0.0 {
            return self.current.position;
        }

        let elapsed = now.saturating_duration_since(self.current.at).as_secs_f32();
        let ratio = (elapsed / interval).clamp(0.0, 1.0);
        previous.position.lerp(self.current.position, ratio)
    }
}

/// Remote entities known to a client, in the order they were first seen.
#[derive(Debug, Default)]
pub struct RemoteEntities {
    entities: Vec<InterpolatedEntity>,
}

impl RemoteEntities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_update(
        &mut self,
        identifier: &EntityId,
        sequence: u32,
        position: Position,
        at: Instant,
    ) -> bool {
        match self.get_mut(identifier) {
            Some(entity) => entity.push(position, at, Some(sequence)),
            None => {
                self.entities.push(InterpolatedEntity::new(
                    identifier.clone(),
                    position,
                    at,
                    Some(sequence),
                ));
                true
            }
        }
    }

    /// Snapshot entries never override a sequenced update that got here
    /// first.
    pub fn insert_snapshot_entry(
        &mut self,
        identifier: &EntityId,
        position: Position,
        at: Instant,
    ) -> bool {
        match self.get_mut(identifier) {
            Some(entity) => entity.push(position, at, None),
            None => {
                self.entities
                    .push(InterpolatedEntity::new(identifier.clone(), position, at, None));
                true
            }
        }
    }

    pub fn remove(&mut self, identifier: &EntityId) -> bool {
        let before = self.entities.len();
        self.entities.retain(|e| &e.identifier != identifier);
        self.entities.len() != before
    }

    pub fn get(&self, identifier: &EntityId) -> Option<&InterpolatedEntity> {
        self.entities.iter().find(|e| &e.identifier == identifier)
    }

    fn get_mut(&mut self, identifier: &EntityId) -> Option<&mut InterpolatedEntity> {
        self.entities.iter_mut().find(|e| &e.identifier == identifier)
    }

    pub fn contains(&self, identifier: &EntityId) -> bool {
        self.get(identifier).is_some()
    }

    pub fn positions_at(&self, now: Instant) -> Vec<(EntityId, Position)> {
        self.entities
            .iter()
            .map(|e| (e.identifier.clone(), e.position_at(now)))
            .collect()
    }

    /// Drops entities with no accepted sample for longer than `max_silence`
    /// and returns their identifiers. Covers a `Leave` lost in transit.
    pub fn expire(&mut self, now: Instant, max_silence: Duration) -> Vec<EntityId> {
        let mut expired = Vec::new();
        self.entities.retain(|e| {
            let silent = now.saturating_duration_since(e.current.at) > max_silence;
            if silent {
                expired.push(e.identifier.clone());
            }
            !silent
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn clear(&mut self) {
        self.entities.clear();
    }
}
