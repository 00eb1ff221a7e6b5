//! Field oriented control core for hybrid stepper motors.
//!
//! The crate turns a voltage, velocity or angle target into terminal voltages
//! for a [`driver::Driver`], using a [`sensor::Sensor`] for the rotor angle
//! once it has been aligned. Without a sensor (or before alignment) velocity
//! and angle targets are followed open loop.
#![no_std]
pub mod align;
pub mod driver;
pub mod lpf;
pub mod modulation;
pub mod motor;
pub mod open_loop;
pub mod pid;
pub mod regulator;
pub mod sensor;
pub mod time;
mod util;

#[cfg(test)]
mod sim;

pub use align::{AlignConfig, AlignError, AlignPhase, Calibration, Direction};
pub use motor::{FocError, HybridStepper, Lifecycle, Limits, MotorConfig, MotorProperties};
pub use util::{angle_difference, electrical_angle, normalize_angle, Vector};
