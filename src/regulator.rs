//! Closed loop control laws for velocity and angle targets.
use crate::pid::{self, Pid};
use crate::sensor::ShaftState;

/// What `HybridStepper::move_to` targets mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Controller {
    /// Volts on the q axis. Amps instead when the phase resistance is
    /// known, converted to volts with the resistance and back-EMF.
    #[default]
    Voltage,
    /// Radians per second, closed loop when calibrated
    Velocity,
    /// Radians, closed loop when calibrated
    Angle,
    /// Radians per second, never uses the sensor
    VelocityOpenLoop,
    /// Radians, never uses the sensor
    AngleOpenLoop,
}

impl Controller {
    pub fn is_open_loop(self) -> bool {
        matches!(self, Controller::VelocityOpenLoop | Controller::AngleOpenLoop)
    }
}

/// Closed loop setpoint handed to a [`ControlLaw`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Motion {
    /// Radians per second
    Velocity(f32),
    /// Radians. Be careful with sensors that track multiple rotations, the
    /// regulator drives back across every turn between the shaft and the
    /// target.
    Angle(f32),
}

/// Computes a torque command from a setpoint and the measured shaft state.
///
/// The command is in the same unit as a [`Controller::Voltage`] target, so
/// the motor converts both to rotor frame voltages the same way.
pub trait ControlLaw {
    fn update(&mut self, motion: Motion, shaft: ShaftState, dt: f32) -> f32;

    /// Drops integrator and derivative history, called on enable.
    fn reset(&mut self);
}

/// Cascaded angle P -> velocity PI regulator
#[derive(Debug, Clone)]
pub struct Regulator {
    velocity_pid: Pid,
    angle_pid: Pid,
}

impl Regulator {
    pub fn new(velocity_consts: pid::Constants, angle_consts: pid::Constants) -> Self {
        Regulator {
            velocity_pid: Pid::new(velocity_consts),
            angle_pid: Pid::new(angle_consts),
        }
    }
}

impl ControlLaw for Regulator {
    fn update(&mut self, motion: Motion, shaft: ShaftState, dt: f32) -> f32 {
        let velocity_setpoint = match motion {
            Motion::Velocity(velocity) => velocity,
            // Output limit of the angle loop is the velocity limit
            Motion::Angle(angle) => self.angle_pid.update(shaft.angle, angle, dt),
        };
        self.velocity_pid.update(shaft.velocity, velocity_setpoint, dt)
    }

    fn reset(&mut self) {
        self.velocity_pid.reset();
        self.angle_pid.reset();
    }
}
