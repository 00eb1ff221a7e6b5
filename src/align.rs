//! Sensor to rotor alignment.
//!
//! Alignment finds which way the sensor counts relative to positive
//! electrical rotation, optionally spins the rotor until an indexed sensor
//! reports its home position, and finally measures the sensor reading at
//! electrical zero. The sequence blocks the caller for a bounded time.
use core::f32::consts::{PI, TAU};
use core::fmt;

use embedded_hal::delay::DelayNs;
use libm::fabsf;

use crate::driver::Driver;
use crate::modulation::Vqd;
use crate::motor::HybridStepper;
use crate::open_loop::OpenLoop;
use crate::regulator::ControlLaw;
use crate::sensor::Sensor;
use crate::time::{elapsed_s, Clock};
use crate::util::{electrical_angle, MIN_ANGLE_DETECT_MOVEMENT};

/// Electrical angle at which a pure q voltage pulls the rotor to electrical
/// zero.
const ZERO_FIELD_ANGLE: f32 = 3. * PI / 2.;

/// Counting direction of the sensor relative to positive electrical
/// rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Sensor counts up with positive electrical rotation
    #[default]
    Cw,
    /// Sensor counts down with positive electrical rotation
    Ccw,
}

impl Direction {
    pub fn sign(self) -> f32 {
        match self {
            Direction::Cw => 1.,
            Direction::Ccw => -1.,
        }
    }
}

/// Result of a successful alignment, or a known calibration supplied by the
/// caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    /// Electrical angle reported at the rotor's electrical zero, radians
    pub zero_electric_offset: f32,
    pub sensor_direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignError {
    /// The sensor failed to produce a reading
    NoReading,
    /// The rotor did not visibly move during the direction sweep
    NoMovement,
    /// The observed counting direction contradicts the configured one
    DirectionMismatch,
    /// The index was not seen within the search span or timeout
    IndexNotFound,
}

impl fmt::Display for AlignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlignError::NoReading => write!(f, "sensor produced no reading"),
            AlignError::NoMovement => write!(f, "no rotor movement detected"),
            AlignError::DirectionMismatch => {
                write!(f, "sensor direction does not match configuration")
            }
            AlignError::IndexNotFound => write!(f, "sensor index not found"),
        }
    }
}

/// Where the alignment state machine is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlignPhase {
    #[default]
    Idle,
    /// Direction sweep and electrical zero measurement
    VoltageAlign,
    AbsoluteZeroSearch,
    Complete,
    Failed(AlignError),
}

#[derive(Debug, Clone, Copy)]
pub struct AlignConfig {
    /// Volts on the q axis while aligning
    pub voltage: f32,
    /// Steps per electrical revolution of the direction sweep
    pub sweep_steps: u32,
    pub sweep_step_ms: u32,
    /// Time the rotor is held at electrical zero before sampling
    pub settle_ms: u32,
    /// Time the field is kept on after sampling the zero offset
    pub hold_ms: u32,
    /// Time with zero output after each stage
    pub release_ms: u32,
    /// Smallest sweep travel accepted as movement, radians
    pub min_movement: f32,
    /// Accepted error of the pole pair check, electrical radians
    pub pole_pair_tolerance: f32,
    /// Radians per second
    pub index_search_velocity: f32,
    /// Largest rotation of the index search, radians
    pub index_search_span: f32,
    pub index_search_timeout_ms: u32,
    pub index_search_step_ms: u32,
    /// Counting direction known in advance. Alignment still sweeps and
    /// fails if the sensor disagrees.
    pub expected_direction: Option<Direction>,
}

impl Default for AlignConfig {
    fn default() -> Self {
        AlignConfig {
            voltage: 3.,
            sweep_steps: 500,
            sweep_step_ms: 2,
            settle_ms: 700,
            hold_ms: 20,
            release_ms: 200,
            min_movement: MIN_ANGLE_DETECT_MOVEMENT,
            pole_pair_tolerance: 0.5,
            index_search_velocity: 1.,
            index_search_span: TAU,
            index_search_timeout_ms: 20_000,
            index_search_step_ms: 1,
            expected_direction: None,
        }
    }
}

impl<D, S, C, L> HybridStepper<D, S, C, L>
where
    D: Driver,
    S: Sensor,
    C: Clock,
    L: ControlLaw,
{
    /// Runs the whole alignment sequence. Output is back at zero when this
    /// returns, whatever the outcome.
    pub(crate) fn align_sensor(&mut self, delay: &mut impl DelayNs) -> Result<Calibration, AlignError> {
        log::info!("Aligning sensor");
        self.align_phase = AlignPhase::VoltageAlign;
        let result = self.run_alignment(delay);
        self.set_phase_voltage(Vqd::default(), 0.);
        self.align_phase = match result {
            Ok(calibration) => {
                log::info!(
                    "Alignment complete, offset: {}, direction: {:?}",
                    calibration.zero_electric_offset,
                    calibration.sensor_direction
                );
                AlignPhase::Complete
            }
            Err(err) => {
                log::warn!("Alignment failed: {}", err);
                AlignPhase::Failed(err)
            }
        };
        result
    }

    fn run_alignment(&mut self, delay: &mut impl DelayNs) -> Result<Calibration, AlignError> {
        let sensor_direction = self.find_direction(delay)?;

        if self.sensor_needs_search() {
            self.align_phase = AlignPhase::AbsoluteZeroSearch;
            self.absolute_zero_search(delay)?;
            self.align_phase = AlignPhase::VoltageAlign;
        }

        let zero_electric_offset = self.measure_zero_offset(sensor_direction, delay)?;
        Ok(Calibration {
            zero_electric_offset,
            sensor_direction,
        })
    }

    fn align_sample(&mut self) -> Result<f32, AlignError> {
        self.read_shaft_raw().map_err(|err| {
            log::debug!("Alignment read failed: {:?}", err);
            AlignError::NoReading
        })
    }

    /// Sweeps one electrical revolution forwards and back, comparing the
    /// sensor reading at the turning point and at the end.
    fn find_direction(&mut self, delay: &mut impl DelayNs) -> Result<Direction, AlignError> {
        let config = self.align;
        let steps = config.sweep_steps.max(1);
        let voltage = Vqd::new(config.voltage, 0.);
        let sweep_angle = |i: u32| ZERO_FIELD_ANGLE + TAU * i as f32 / steps as f32;

        for i in 0..=steps {
            self.set_phase_voltage(voltage, sweep_angle(i));
            self.align_sample()?;
            delay.delay_ms(config.sweep_step_ms);
        }
        let mid_angle = self.align_sample()?;

        for i in (0..=steps).rev() {
            self.set_phase_voltage(voltage, sweep_angle(i));
            self.align_sample()?;
            delay.delay_ms(config.sweep_step_ms);
        }
        let end_angle = self.align_sample()?;

        self.set_phase_voltage(Vqd::default(), 0.);
        delay.delay_ms(config.release_ms);

        let moved = fabsf(mid_angle - end_angle);
        log::debug!(
            "Direction sweep, mid: {}, end: {}, moved: {}",
            mid_angle,
            end_angle,
            moved
        );
        if moved < config.min_movement {
            return Err(AlignError::NoMovement);
        }

        let observed = if mid_angle < end_angle {
            Direction::Ccw
        } else {
            Direction::Cw
        };
        log::info!("Sensor direction: {:?}", observed);

        // One electrical revolution should move the shaft 2PI / pole_pairs
        let pole_pairs = self.motor.pole_pairs as f32;
        if fabsf(moved * pole_pairs - TAU) > config.pole_pair_tolerance {
            log::warn!(
                "Pole pair check failed, estimated pole pairs: {}",
                TAU / moved
            );
        } else {
            log::debug!("Pole pair check passed");
        }

        match config.expected_direction {
            Some(expected) if expected != observed => {
                log::warn!(
                    "Expected sensor direction {:?}, observed {:?}",
                    expected,
                    observed
                );
                Err(AlignError::DirectionMismatch)
            }
            _ => Ok(observed),
        }
    }

    /// Turns the rotor open loop until the sensor stops asking for a search,
    /// bounded both in rotation and in time.
    fn absolute_zero_search(&mut self, delay: &mut impl DelayNs) -> Result<(), AlignError> {
        let config = self.align;
        log::info!("Searching for sensor index");

        let voltage = Vqd::new(config.voltage, 0.);
        let step_ms = config.index_search_step_ms.max(1);
        // Bounds the search even if the clock is not advancing
        let max_iterations = config.index_search_timeout_ms / step_ms + 1;
        let start_us = self.clock.now_us();
        let mut prev_us = start_us;
        let mut generator = OpenLoop::new(0.);

        for _ in 0..max_iterations {
            if !self.sensor_needs_search() {
                break;
            }
            let now_us = self.clock.now_us();
            if generator.shaft_angle() >= config.index_search_span
                || elapsed_s(start_us, now_us) * 1E3 >= config.index_search_timeout_ms as f32
            {
                break;
            }
            let shaft_angle = generator.angle(
                1.5 * config.index_search_span,
                config.index_search_velocity,
                elapsed_s(prev_us, now_us),
            );
            prev_us = now_us;
            self.set_phase_voltage(
                voltage,
                electrical_angle(shaft_angle, self.motor.pole_pairs),
            );
            self.align_sample()?;
            delay.delay_ms(step_ms);
        }

        self.set_phase_voltage(Vqd::default(), 0.);
        if self.sensor_needs_search() {
            log::warn!(
                "Index not found after {} rad",
                generator.shaft_angle()
            );
            Err(AlignError::IndexNotFound)
        } else {
            log::info!("Index found");
            Ok(())
        }
    }

    /// Holds the rotor at electrical zero and reads the sensor there.
    fn measure_zero_offset(
        &mut self,
        direction: Direction,
        delay: &mut impl DelayNs,
    ) -> Result<f32, AlignError> {
        let config = self.align;
        self.set_phase_voltage(Vqd::new(config.voltage, 0.), ZERO_FIELD_ANGLE);
        delay.delay_ms(config.settle_ms);
        let angle = self.align_sample()?;
        let offset = electrical_angle(direction.sign() * angle, self.motor.pole_pairs);
        log::debug!("Sensor at electrical zero: {}, offset: {}", angle, offset);
        delay.delay_ms(config.hold_ms);
        self.set_phase_voltage(Vqd::default(), 0.);
        delay.delay_ms(config.release_ms);
        Ok(offset)
    }
}
