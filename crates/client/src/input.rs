use std::time::{Duration, Instant};

use bitflags::bitflags;
use crossterm::event::KeyCode;
use glam::Vec2;

/// Most terminals never report key releases, so a press counts as held for
/// this long after the last repeat.
pub const KEY_HOLD: Duration = Duration::from_millis(150);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MoveKeys: u8 {
        const UP = 1 << 0;
        const DOWN = 1 << 1;
        const LEFT = 1 << 2;
        const RIGHT = 1 << 3;
    }
}

impl MoveKeys {
    pub fn from_key(code: KeyCode) -> Option<Self> {
        match code {
            KeyCode::Up | KeyCode::Char('w') => Some(MoveKeys::UP),
            KeyCode::Down | KeyCode::Char('s') => Some(MoveKeys::DOWN),
            KeyCode::Left | KeyCode::Char('a') => Some(MoveKeys::LEFT),
            KeyCode::Right | KeyCode::Char('d') => Some(MoveKeys::RIGHT),
            _ => None,
        }
    }

    /// Unit-length direction, or zero when nothing (or only opposing keys)
    /// is held. Y grows upwards.
    pub fn direction(self) -> Vec2 {
        let mut dir = Vec2::ZERO;
        if self.contains(MoveKeys::UP) {
            dir.y += 1.0;
        }
        if self.contains(MoveKeys::DOWN) {
            dir.y -= 1.0;
        }
        if self.contains(MoveKeys::LEFT) {
            dir.x -= 1.0;
        }
        if self.contains(MoveKeys::RIGHT) {
            dir.x += 1.0;
        }
        dir.normalize_or_zero()
    }
}

#[derive(Debug, Default)]
pub struct HeldKeys {
    pressed: Vec<(MoveKeys, Instant)>,
}

impl HeldKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn press(&mut self, key: MoveKeys, now: Instant) {
        self.pressed.retain(|(k, _)| *k != key);
        self.pressed.push((key, now));
    }

    pub fn release(&mut self, key: MoveKeys) {
        self.pressed.retain(|(k, _)| *k != key);
    }

    pub fn active(&mut self, now: Instant) -> MoveKeys {
        self.pressed
            .retain(|(_, at)| now.saturating_duration_since(*at) < KEY_HOLD);
        self.pressed
            .iter()
            .fold(MoveKeys::empty(), |acc, (k, _)| acc | *k)
    }

    /// Movement for one frame of length `dt`.
    pub fn movement(&mut self, now: Instant, speed: f32, dt: Duration) -> Vec2 {
        self.active(now).direction() * speed * dt.as_secs_f32()
    }
}
