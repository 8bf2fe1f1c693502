use std::time::Duration;

use glam::Vec2;

use crate::arena::ARENA_HALF_EXTENT;

/// Headless driver that wanders around the arena so a relay can be exercised
/// without a terminal attached.
#[derive(Debug, Clone)]
pub struct Wanderer {
    phase: f32,
    elapsed: f32,
    speed: f32,
}

impl Wanderer {
    pub fn new(seed: u64, speed: f32) -> Self {
        Self {
            phase: (seed % 6283) as f32 / 1000.0,
            elapsed: 0.0,
            speed,
        }
    }

    fn heading(&self) -> f32 {
        self.phase + self.elapsed * 0.3 + (self.elapsed * 0.7).sin() * 1.5
    }

    /// Movement for the next `dt`, turning back towards the centre once the
    /// current position nears the arena edge.
    pub fn step(&mut self, position: Vec2, dt: Duration) -> Vec2 {
        self.elapsed += dt.as_secs_f32();

        let limit = ARENA_HALF_EXTENT as f32 * 0.9;
        let direction = if position.x.abs() > limit || position.y.abs() > limit {
            (-position).normalize_or_zero()
        } else {
            Vec2::from_angle(self.heading())
        };

        direction * self.speed * dt.as_secs_f32()
    }
}
