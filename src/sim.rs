//! Simulated rig for tests: an ideal, infinitely stiff rotor that snaps to
//! the stator field, a single turn sensor, a driver that records every
//! command and a clock advanced by the delays.
extern crate std;

use core::cell::RefCell;
use core::f32::consts::TAU;
use std::vec::Vec;

use embedded_hal::delay::DelayNs;
use libm::{atan2f, hypotf};

use crate::driver::Driver;
use crate::modulation::{demodulate, Modulation, PhaseVoltages};
use crate::sensor::Sensor;
use crate::time::Clock;
use crate::util::{angle_difference, normalize_angle};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Index {
    Absent,
    /// Found once the rotor reaches this mechanical angle
    At(f32),
    Never,
}

#[derive(Debug)]
pub struct Rig {
    pub time_ns: u64,
    /// Mechanical, radians, multi-turn
    pub rotor_angle: f32,
    pub pole_pairs: u32,
    pub modulation: Modulation,
    pub driver_limit: f32,
    pub driver_enabled: bool,
    /// Rotor ignores the field
    pub locked: bool,
    pub sensor_offset: f32,
    /// Sensor counts against positive electrical rotation
    pub sensor_reversed: bool,
    pub sensor_fails: bool,
    pub index: Index,
    pub index_found: bool,
    pub commands: Vec<PhaseVoltages>,
}

impl Rig {
    pub fn new(pole_pairs: u32) -> Self {
        Rig {
            time_ns: 0,
            rotor_angle: 0.,
            pole_pairs,
            modulation: Modulation::default(),
            driver_limit: 12.,
            driver_enabled: false,
            locked: false,
            sensor_offset: 0.,
            sensor_reversed: false,
            sensor_fails: false,
            index: Index::Absent,
            index_found: false,
            commands: Vec::new(),
        }
    }

    pub fn advance_us(&mut self, us: u32) {
        self.time_ns += us as u64 * 1000;
    }

    pub fn sensor_reading(&self) -> f32 {
        let sign = if self.sensor_reversed { -1. } else { 1. };
        normalize_angle(sign * self.rotor_angle + self.sensor_offset)
    }

    /// Count of commands with a non-zero terminal voltage
    pub fn energized_commands(&self) -> usize {
        self.commands.iter().filter(|v| v.peak() > 0.).count()
    }

    fn apply(&mut self, voltages: PhaseVoltages) {
        self.commands.push(voltages);
        let (alpha, beta) = demodulate(voltages, self.modulation);
        if !self.driver_enabled || self.locked || hypotf(alpha, beta) < 1E-3 {
            return;
        }
        // Rotor d axis lines up with the field, taking the nearest pole
        let field = atan2f(beta, alpha);
        let rotor_electrical = normalize_angle(self.rotor_angle * self.pole_pairs as f32);
        self.rotor_angle +=
            angle_difference(rotor_electrical, field) / self.pole_pairs as f32;
        if let Index::At(at) = self.index {
            if self.rotor_angle >= at {
                self.index_found = true;
            }
        }
    }
}

pub struct SimDriver<'a>(pub &'a RefCell<Rig>);

impl Driver for SimDriver<'_> {
    fn voltage_limit(&self) -> f32 {
        self.0.borrow().driver_limit
    }
    fn enable(&mut self) {
        self.0.borrow_mut().driver_enabled = true;
    }
    fn disable(&mut self) {
        self.0.borrow_mut().driver_enabled = false;
    }
    fn set_phase_voltages(&mut self, voltages: PhaseVoltages) {
        self.0.borrow_mut().apply(voltages);
    }
}

#[derive(Debug)]
pub struct SimSensorError;

pub struct SimSensor<'a>(pub &'a RefCell<Rig>);

impl Sensor for SimSensor<'_> {
    type Error = SimSensorError;

    fn angle(&mut self) -> Result<f32, Self::Error> {
        let rig = self.0.borrow();
        if rig.sensor_fails {
            Err(SimSensorError)
        } else {
            Ok(rig.sensor_reading())
        }
    }

    fn needs_search(&self) -> bool {
        let rig = self.0.borrow();
        rig.index != Index::Absent && !rig.index_found
    }
}

pub struct SimClock<'a>(pub &'a RefCell<Rig>);

impl Clock for SimClock<'_> {
    fn now_us(&self) -> u32 {
        (self.0.borrow().time_ns / 1000) as u32
    }
}

pub struct SimDelay<'a>(pub &'a RefCell<Rig>);

impl DelayNs for SimDelay<'_> {
    fn delay_ns(&mut self, ns: u32) {
        self.0.borrow_mut().time_ns += ns as u64;
    }
}

/// Expected calibration offset for a rig whose sensor reads
/// `rotor + offset` (or `-rotor + offset` when reversed)
pub fn expected_offset(rig: &Rig) -> f32 {
    let sign = if rig.sensor_reversed { -1. } else { 1. };
    normalize_angle(sign * rig.sensor_offset * rig.pole_pairs as f32 % TAU)
}
