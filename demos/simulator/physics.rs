use std::f32::consts::TAU;

use hybrid_foc::modulation::{demodulate, Modulation, PhaseVoltages};
use hybrid_foc::Vector;

#[derive(Debug, Clone, Copy)]
pub struct RotorProperties {
    /// kg m^2
    pub inertia: f32,
    pub pole_pairs: u32,
    /// Ohms
    pub phase_resistance: f32,
    /// N m / A
    pub torque_constant: f32,
    /// N m s / rad
    pub viscous_friction: f32,
}

/// Two phase hybrid stepper rotor on a frictionless shaft, integrated with
/// explicit Euler steps.
pub struct RotorSimulator {
    rotor: RotorProperties,
    modulation: Modulation,
    phase_voltages: PhaseVoltages,
    perturbation_torque: f32,
    // Mechanical, multi-turn
    angle: f32,
    angular_velocity: f32,
}

impl RotorSimulator {
    pub fn new(rotor: RotorProperties, modulation: Modulation) -> Self {
        RotorSimulator {
            rotor,
            modulation,
            phase_voltages: PhaseVoltages::default(),
            perturbation_torque: 0.,
            angle: 0.,
            angular_velocity: 0.,
        }
    }

    pub fn step(&mut self, dt: f32) {
        // Assume that the current instantaneously follows the voltage
        let (alpha, beta) = demodulate(self.phase_voltages, self.modulation);
        let current = Vector::from_components(
            alpha / self.rotor.phase_resistance,
            beta / self.rotor.phase_resistance,
        );
        let electrical = self.angle * self.rotor.pole_pairs as f32;
        let torque = current.magnitude
            * self.rotor.torque_constant
            * (current.phase - electrical).sin()
            - self.angular_velocity * self.rotor.viscous_friction
            + self.perturbation_torque;

        self.angular_velocity += torque / self.rotor.inertia * dt;
        self.angle += self.angular_velocity * dt;
    }

    pub fn set_phase_voltages(&mut self, phase_voltages: PhaseVoltages) {
        self.phase_voltages = phase_voltages;
    }

    pub fn set_perturbation_torque(&mut self, torque: f32) {
        self.perturbation_torque = torque;
    }

    /// Single turn reading, as an absolute magnetic encoder reports it
    pub fn encoder_angle(&self, offset: f32) -> f32 {
        (self.angle + offset).rem_euclid(TAU)
    }

    pub fn angle(&self) -> f32 {
        self.angle
    }

    pub fn angular_velocity(&self) -> f32 {
        self.angular_velocity
    }
}
