//! Open loop angle generators.
//!
//! Both generators are plain functions of the previous state and the elapsed
//! time, so they can be driven by any clock (or none at all in tests).
use libm::fabsf;

use crate::util::normalize_angle;

/// Timestep substituted for stale or non-monotonic timestamps, seconds
pub const NOMINAL_TIMESTEP: f32 = 1E-3;
/// Longest gap between iterations that is still integrated, seconds
pub const MAX_TIMESTEP: f32 = 0.5;

/// Replaces an unusable timestep with [`NOMINAL_TIMESTEP`].
///
/// A gap longer than [`MAX_TIMESTEP`] (first call after enabling, a stalled
/// host) would otherwise produce a jump in the generated angle.
pub fn clamp_timestep(dt: f32) -> f32 {
    if !(dt > 0.) || dt > MAX_TIMESTEP {
        NOMINAL_TIMESTEP
    } else {
        dt
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenLoop {
    /// Radians, mechanical
    shaft_angle: f32,
    /// Radians per second, mechanical
    shaft_velocity: f32,
}

impl OpenLoop {
    pub fn new(shaft_angle: f32) -> Self {
        OpenLoop {
            shaft_angle,
            shaft_velocity: 0.,
        }
    }

    /// Moves the shaft at `target_velocity` rad/s for `dt` seconds and
    /// returns the new shaft angle, wrapped to [0..2PI).
    pub fn velocity(&mut self, target_velocity: f32, dt: f32) -> f32 {
        let dt = clamp_timestep(dt);
        self.shaft_angle = normalize_angle(self.shaft_angle + target_velocity * dt);
        self.shaft_velocity = target_velocity;
        self.shaft_angle
    }

    /// Moves the shaft towards `target_angle` no faster than
    /// `velocity_limit` rad/s and returns the new shaft angle. Once the
    /// target is within one step it is taken exactly.
    pub fn angle(&mut self, target_angle: f32, velocity_limit: f32, dt: f32) -> f32 {
        let dt = clamp_timestep(dt);
        let max_step = fabsf(velocity_limit) * dt;
        let error = target_angle - self.shaft_angle;
        if fabsf(error) > max_step {
            let direction = if error.is_sign_positive() { 1. } else { -1. };
            self.shaft_angle += direction * max_step;
            self.shaft_velocity = direction * fabsf(velocity_limit);
        } else {
            self.shaft_angle = target_angle;
            self.shaft_velocity = 0.;
        }
        self.shaft_angle
    }

    pub fn shaft_angle(&self) -> f32 {
        self.shaft_angle
    }

    pub fn shaft_velocity(&self) -> f32 {
        self.shaft_velocity
    }

    /// Restarts generation from a known shaft angle
    pub fn reset(&mut self, shaft_angle: f32) {
        self.shaft_angle = shaft_angle;
        self.shaft_velocity = 0.;
    }
}

#[cfg(test)]
mod tests {
    use core::f32::consts::TAU;

    use super::*;
    use crate::util::angle_difference;

    #[test]
    fn velocity_integrates_over_elapsed_time() {
        let mut generator = OpenLoop::default();
        let mut previous = generator.shaft_angle();
        for _ in 0..1000 {
            let angle = generator.velocity(10., 2E-3);
            assert!(fabsf(angle_difference(previous, angle) - 10. * 2E-3) < 1E-4);
            assert!((0. ..TAU).contains(&angle));
            previous = angle;
        }
        assert_eq!(generator.shaft_velocity(), 10.);
    }

    #[test]
    fn stale_timestep_does_not_jump() {
        let mut generator = OpenLoop::default();
        let angle = generator.velocity(10., 30.);
        assert!(fabsf(angle - 10. * NOMINAL_TIMESTEP) < 1E-6);
        let angle = generator.velocity(10., -1.);
        assert!(fabsf(angle - 20. * NOMINAL_TIMESTEP) < 1E-6);
    }

    #[test]
    fn angle_is_rate_limited_and_terminates() {
        let mut generator = OpenLoop::default();
        // 2 rad/s for 10 ms is a 20 mrad step
        let angle = generator.angle(1., 2., 1E-2);
        assert!(fabsf(angle - 0.02) < 1E-6);
        assert_eq!(generator.shaft_velocity(), 2.);

        let mut steps = 0;
        while generator.angle(1., 2., 1E-2) != 1. {
            steps += 1;
            assert!(steps < 100, "never reached the target");
        }
        assert_eq!(generator.shaft_velocity(), 0.);
        // Stays put once there
        assert_eq!(generator.angle(1., 2., 1E-2), 1.);
    }

    #[test]
    fn angle_moves_backwards() {
        let mut generator = OpenLoop::new(3.);
        let angle = generator.angle(-3., 5., 0.1);
        assert!(fabsf(angle - 2.5) < 1E-6);
        assert_eq!(generator.shaft_velocity(), -5.);
    }
}
