use core::convert::Infallible;
use core::f32::consts::TAU;

use libm::fabsf;

/// Rotor position source.
pub trait Sensor {
    type Error: core::fmt::Debug;

    /// Mechanical angle in radians. Single turn readings in [0..2PI) are
    /// unwrapped by [`ShaftTracker`], multi-turn readings pass through.
    fn angle(&mut self) -> Result<f32, Self::Error>;

    /// `true` while the sensor has a home index that has not been seen yet.
    /// Sensors without an index never need a search.
    fn needs_search(&self) -> bool {
        false
    }
}

/// Placeholder sensor type for motors driven purely open loop.
#[derive(Debug)]
pub enum NoSensor {}

impl Sensor for NoSensor {
    type Error = Infallible;

    fn angle(&mut self) -> Result<f32, Self::Error> {
        match *self {}
    }
}

/// Multi-turn shaft angle and raw velocity estimate
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ShaftState {
    /// Radians
    pub angle: f32,
    /// Radians per second
    pub velocity: f32,
}

/// Tracks whole rotations across single turn readings.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShaftTracker {
    full_rotations: i32,
    // Previous raw reading
    previous: Option<f32>,
    state: ShaftState,
}

impl ShaftTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a fresh reading taken `dt` seconds after the previous one.
    pub fn update(&mut self, reading: f32, dt: f32) -> ShaftState {
        if let Some(previous) = self.previous {
            let delta = reading - previous;
            // A jump of most of a turn is a wrap, not real movement
            if fabsf(delta) > 0.8 * TAU {
                self.full_rotations += if delta > 0. { -1 } else { 1 };
            }
        }
        let angle = self.full_rotations as f32 * TAU + reading;
        let velocity = match self.previous {
            Some(_) if dt > 0. => (angle - self.state.angle) / dt,
            _ => 0.,
        };
        self.previous = Some(reading);
        self.state = ShaftState { angle, velocity };
        self.state
    }

    /// Advances the estimate on the last known velocity when no reading is
    /// available.
    pub fn extrapolate(&mut self, dt: f32) -> ShaftState {
        self.state.angle += self.state.velocity * dt;
        self.state
    }

    pub fn state(&self) -> ShaftState {
        self.state
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_rotations_across_wrap() {
        let mut tracker = ShaftTracker::new();
        tracker.update(TAU - 0.1, 1E-3);
        let state = tracker.update(0.1, 1E-3);
        assert!(fabsf(state.angle - (TAU + 0.1)) < 1E-5);
        assert!(fabsf(state.velocity - 200.) < 1E-1);

        let state = tracker.update(TAU - 0.1, 1E-3);
        assert!(fabsf(state.angle - (TAU - 0.1)) < 1E-5);
        assert!(state.velocity < 0.);
    }

    #[test]
    fn first_reading_has_no_velocity() {
        let mut tracker = ShaftTracker::new();
        let state = tracker.update(1., 1E-3);
        assert_eq!(state, ShaftState { angle: 1., velocity: 0. });
    }

    #[test]
    fn extrapolates_on_last_velocity() {
        let mut tracker = ShaftTracker::new();
        tracker.update(1., 1E-3);
        tracker.update(1.01, 1E-3);
        let state = tracker.extrapolate(1E-3);
        assert!(fabsf(state.angle - 1.02) < 1E-4);
        assert_eq!(tracker.state(), state);
    }
}
