//! Field oriented control of a hybrid stepper motor.
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use embedded_hal::delay::DelayNs;
use libm::{fabsf, fminf};

use crate::align::{AlignConfig, AlignError, AlignPhase, Calibration};
use crate::driver::Driver;
use crate::lpf::LowPassFilter;
use crate::modulation::{modulate, Modulation, PhaseVoltages, Vqd};
use crate::open_loop::{clamp_timestep, OpenLoop};
use crate::pid;
use crate::regulator::{ControlLaw, Controller, Motion, Regulator};
use crate::sensor::{Sensor, ShaftState, ShaftTracker};
use crate::time::{elapsed_s, Clock};
use crate::util::{electrical_angle, normalize_angle};

/// rpm to rad/s
const RPM_TO_RADS: f32 = 0.104_719_755;

#[derive(Debug, Clone, Copy)]
pub struct MotorProperties {
    /// Electrical revolutions per mechanical revolution
    pub pole_pairs: u32,
    /// Ohms
    pub phase_resistance: Option<f32>,
    /// rpm per volt
    pub kv_rating: Option<f32>,
    /// Henries
    pub phase_inductance: Option<f32>,
}

impl MotorProperties {
    pub fn new(pole_pairs: u32) -> Self {
        MotorProperties {
            pole_pairs,
            phase_resistance: None,
            kv_rating: None,
            phase_inductance: None,
        }
    }

    /// Back-EMF at `shaft_velocity` rad/s, zero when the KV rating is unknown
    pub fn back_emf(&self, shaft_velocity: f32) -> f32 {
        match self.kv_rating {
            Some(kv) if kv > 0. => shaft_velocity / (kv * RPM_TO_RADS),
            _ => 0.,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Volts
    pub voltage: f32,
    /// Radians per second
    pub velocity: f32,
    /// Amps, only meaningful with a known phase resistance
    pub current: Option<f32>,
    // Block construction
    _private: (),
}

impl Limits {
    pub fn new(voltage: f32, velocity: f32, current: Option<f32>) -> Self {
        if !(voltage > 0.) {
            log::error!("Invalid voltage limit");
            panic!();
        }

        if !(velocity > 0.) {
            log::error!("Invalid velocity limit");
            panic!();
        }

        if let Some(limit) = current {
            if !(limit > 0.) {
                log::error!("Invalid current limit");
                panic!();
            }
        }

        Limits {
            voltage,
            velocity,
            current,
            _private: (),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Limits::new(12., 20., None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifecycle {
    #[default]
    Uninitialized,
    Disabled,
    Enabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocError {
    /// No driver linked, output stays off
    NoDriver,
    /// Alignment needs the motor enabled
    NotEnabled,
    /// No sensor linked, only open loop control is available
    NoSensor,
    /// Supplied calibration has a non-finite offset
    InvalidCalibration,
    Align(AlignError),
}

impl fmt::Display for FocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FocError::NoDriver => write!(f, "no driver linked"),
            FocError::NotEnabled => write!(f, "motor not enabled"),
            FocError::NoSensor => write!(f, "no sensor linked"),
            FocError::InvalidCalibration => write!(f, "invalid calibration"),
            FocError::Align(err) => write!(f, "alignment failed: {}", err),
        }
    }
}

impl From<AlignError> for FocError {
    fn from(err: AlignError) -> Self {
        FocError::Align(err)
    }
}

/// Target shared between `move_to` and `loop_foc`. Stored as a single word
/// so a reader never observes a half written value.
#[derive(Debug, Default)]
pub struct Setpoint(AtomicU32);

impl Setpoint {
    pub fn new(value: f32) -> Self {
        let setpoint = Setpoint::default();
        setpoint.set(value);
        setpoint
    }
    /// Non-finite values are ignored
    pub fn set(&self, value: f32) {
        if !value.is_finite() {
            log::warn!("Ignoring non-finite target: {}", value);
            return;
        }
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone)]
pub struct MotorConfig {
    motor: MotorProperties,
    limits: Limits,
    align: AlignConfig,
    modulation: Modulation,
    controller: Controller,
    open_loop_voltage_ratio: f32,
    velocity_consts: Option<pid::Constants>,
    angle_consts: Option<pid::Constants>,
    velocity_filter_tf: f32,
}

impl MotorConfig {
    pub fn new(motor: MotorProperties) -> Self {
        if motor.pole_pairs == 0 {
            log::error!("Invalid pole pair count");
            panic!();
        }
        MotorConfig {
            motor,
            limits: Limits::default(),
            align: AlignConfig::default(),
            modulation: Modulation::default(),
            controller: Controller::default(),
            open_loop_voltage_ratio: 1.,
            velocity_consts: None,
            angle_consts: None,
            velocity_filter_tf: 5E-3,
        }
    }
    /// Realize a `HybridStepper` with the default cascade regulator
    pub fn realize<D, S, C>(&self, clock: C) -> HybridStepper<D, S, C, Regulator> {
        let regulator = Regulator::new(self.velocity_consts(), self.angle_consts());
        self.realize_with(clock, regulator)
    }
    /// Realize a `HybridStepper` driven by a custom control law
    pub fn realize_with<D, S, C, L>(&self, clock: C, law: L) -> HybridStepper<D, S, C, L> {
        HybridStepper {
            motor: self.motor,
            limits: self.limits,
            align: self.align,
            modulation: self.modulation,
            controller: self.controller,
            open_loop_voltage_ratio: self.open_loop_voltage_ratio,
            driver: None,
            sensor: None,
            clock,
            law,
            target: Setpoint::default(),
            lifecycle: Lifecycle::Uninitialized,
            calibration: None,
            align_phase: AlignPhase::Idle,
            tracker: ShaftTracker::new(),
            velocity_filter: LowPassFilter::new(self.velocity_filter_tf),
            shaft: ShaftState::default(),
            open_loop: OpenLoop::default(),
            prev_us: None,
            electrical_angle: 0.,
            voltage: Vqd::default(),
            phase_voltages: PhaseVoltages::default(),
        }
    }
    pub fn set_limits(&mut self, limits: Limits) -> &mut Self {
        self.limits = limits;
        self
    }
    pub fn set_align(&mut self, align: AlignConfig) -> &mut Self {
        self.align = align;
        self
    }
    pub fn set_modulation(&mut self, modulation: Modulation) -> &mut Self {
        self.modulation = modulation;
        self
    }
    pub fn set_controller(&mut self, controller: Controller) -> &mut Self {
        self.controller = controller;
        self
    }
    /// Fraction of the voltage limit applied in open loop, [0..1]
    pub fn set_open_loop_voltage_ratio(&mut self, ratio: f32) -> &mut Self {
        self.open_loop_voltage_ratio = ratio.clamp(0., 1.);
        self
    }
    pub fn set_velocity_consts(&mut self, velocity_consts: pid::Constants) -> &mut Self {
        self.velocity_consts = Some(velocity_consts);
        self
    }
    pub fn set_angle_consts(&mut self, angle_consts: pid::Constants) -> &mut Self {
        self.angle_consts = Some(angle_consts);
        self
    }
    /// Time constant of the shaft velocity filter, seconds
    pub fn set_velocity_filter_tf(&mut self, tf: f32) -> &mut Self {
        self.velocity_filter_tf = tf;
        self
    }

    fn velocity_consts(&self) -> pid::Constants {
        self.velocity_consts.unwrap_or_else(|| {
            // The velocity loop commands amps when the resistance is known
            let limit = match (self.motor.phase_resistance, self.limits.current) {
                (Some(_), Some(current)) => current,
                (Some(resistance), None) => self.limits.voltage / resistance,
                (None, _) => self.limits.voltage,
            };
            let ki = 10.;
            pid::Constants::new(0.5, ki, 0., limit / ki, limit).with_ramp(1000.)
        })
    }

    fn angle_consts(&self) -> pid::Constants {
        self.angle_consts
            .unwrap_or_else(|| pid::Constants::new(20., 0., 0., 0., self.limits.velocity))
    }
}

/// Field oriented controller for one hybrid stepper.
///
/// Typical use: `link_driver`, `link_sensor`, `init`, `init_foc`, then call
/// `loop_foc` as often as possible and `move_to` whenever the target
/// changes.
pub struct HybridStepper<D, S, C, L = Regulator> {
    pub(crate) motor: MotorProperties,
    limits: Limits,
    pub(crate) align: AlignConfig,
    modulation: Modulation,
    controller: Controller,
    open_loop_voltage_ratio: f32,
    driver: Option<D>,
    sensor: Option<S>,
    pub(crate) clock: C,
    law: L,
    target: Setpoint,
    lifecycle: Lifecycle,
    calibration: Option<Calibration>,
    pub(crate) align_phase: AlignPhase,
    tracker: ShaftTracker,
    velocity_filter: LowPassFilter,
    // Direction corrected, filtered velocity
    shaft: ShaftState,
    open_loop: OpenLoop,
    // Timestamp of the previous control iteration
    prev_us: Option<u32>,
    electrical_angle: f32,
    voltage: Vqd,
    phase_voltages: PhaseVoltages,
}

impl<D, S, C, L> HybridStepper<D, S, C, L>
where
    D: Driver,
    S: Sensor,
    C: Clock,
    L: ControlLaw,
{
    pub fn link_driver(&mut self, driver: D) -> &mut Self {
        self.driver = Some(driver);
        self
    }

    pub fn link_sensor(&mut self, sensor: S) -> &mut Self {
        self.sensor = Some(sensor);
        self
    }

    /// Reconciles the limits with the driver and enables the motor.
    pub fn init(&mut self) -> Result<(), FocError> {
        let driver_limit = match self.driver.as_ref() {
            Some(driver) => driver.voltage_limit(),
            None => {
                log::error!("No driver linked, output disabled");
                self.lifecycle = Lifecycle::Uninitialized;
                return Err(FocError::NoDriver);
            }
        };
        if self.limits.voltage > driver_limit {
            log::info!("Voltage limit reduced to driver limit: {}", driver_limit);
            self.limits.voltage = driver_limit;
        }
        if self.align.voltage > self.limits.voltage {
            self.align.voltage = self.limits.voltage;
        }
        self.lifecycle = Lifecycle::Disabled;
        log::info!("Motor initialized");
        self.enable();
        Ok(())
    }

    pub fn enable(&mut self) {
        if self.lifecycle == Lifecycle::Uninitialized {
            log::warn!("Enable requested before init");
            return;
        }
        if let Some(driver) = self.driver.as_mut() {
            driver.enable();
        }
        self.lifecycle = Lifecycle::Enabled;
        self.set_phase_voltage(Vqd::default(), 0.);
        self.law.reset();
        self.velocity_filter.reset();
        self.prev_us = None;
        log::info!("Motor enabled");
    }

    pub fn disable(&mut self) {
        if self.lifecycle == Lifecycle::Uninitialized {
            return;
        }
        self.set_phase_voltage(Vqd::default(), 0.);
        self.lifecycle = Lifecycle::Disabled;
        if let Some(driver) = self.driver.as_mut() {
            driver.disable();
        }
        log::info!("Motor disabled");
    }

    /// Establishes the sensor calibration needed for closed loop control.
    ///
    /// A `preset` calibration is taken as is and no voltage is applied.
    /// Otherwise the alignment sequence runs, which needs the motor enabled.
    /// Every error leaves the motor usable open loop.
    pub fn init_foc(
        &mut self,
        preset: Option<Calibration>,
        delay: &mut impl DelayNs,
    ) -> Result<Calibration, FocError> {
        if self.driver.is_none() {
            log::error!("No driver linked, output disabled");
            return Err(FocError::NoDriver);
        }
        if self.sensor.is_none() {
            log::warn!("No sensor linked, running open loop");
            self.calibration = None;
            return Err(FocError::NoSensor);
        }

        let calibration = match preset {
            Some(calibration) if !calibration.zero_electric_offset.is_finite() => {
                log::error!(
                    "Rejecting calibration offset: {}",
                    calibration.zero_electric_offset
                );
                self.calibration = None;
                return Err(FocError::InvalidCalibration);
            }
            Some(calibration) => {
                log::info!("Using supplied calibration, skipping alignment");
                self.align_phase = AlignPhase::Complete;
                calibration
            }
            None => {
                if self.lifecycle != Lifecycle::Enabled {
                    log::warn!("Alignment requested while not enabled");
                    return Err(FocError::NotEnabled);
                }
                self.calibration = None;
                match self.align_sensor(delay) {
                    Ok(calibration) => calibration,
                    Err(err) => return Err(err.into()),
                }
            }
        };
        self.calibration = Some(calibration);

        // Seed the shaft estimate so the first closed loop iteration does
        // not see a jump
        self.tracker.reset();
        self.velocity_filter.reset();
        match self.read_shaft_raw() {
            Ok(angle) => {
                let angle = calibration.sensor_direction.sign() * angle;
                self.shaft = ShaftState {
                    angle,
                    velocity: 0.,
                };
                self.open_loop.reset(angle);
            }
            Err(err) => log::warn!("Sensor read failed after calibration: {:?}", err),
        }
        self.prev_us = None;
        log::info!("Motor ready");
        Ok(calibration)
    }

    /// One control iteration. Call as often as the host allows.
    pub fn loop_foc(&mut self) {
        if self.lifecycle != Lifecycle::Enabled {
            return;
        }
        let dt = self.tick();
        let target = self.target.get();

        let calibration = match (self.calibration, self.sensor.is_some()) {
            (Some(calibration), true) if !self.controller.is_open_loop() => Some(calibration),
            _ => None,
        };
        let (voltage, angle) = match calibration {
            Some(calibration) => self.closed_loop(calibration, target, dt),
            None => self.open_loop(target, dt),
        };
        log::trace!(
            "Target: {}, voltage: {:?}, electrical angle: {}",
            target,
            voltage,
            angle
        );
        self.set_phase_voltage(voltage, angle);
    }

    /// Stores a new target for the active controller. `None` keeps the
    /// current one. Takes effect on the next `loop_foc`.
    pub fn move_to(&self, target: Option<f32>) {
        if let Some(target) = target {
            self.target.set(target);
        }
    }

    /// Applies a rotor frame voltage at electrical angle `angle`. Output is
    /// forced to zero unless the motor is enabled.
    pub fn set_phase_voltage(&mut self, voltage: Vqd, angle: f32) {
        let voltage = if self.lifecycle == Lifecycle::Enabled {
            voltage
        } else {
            Vqd::default()
        };
        self.electrical_angle = normalize_angle(angle);
        self.voltage = voltage;
        self.phase_voltages = modulate(
            voltage,
            self.electrical_angle,
            self.limits.voltage,
            self.modulation,
        );
        if let Some(driver) = self.driver.as_mut() {
            driver.set_phase_voltages(self.phase_voltages);
        }
    }

    pub fn set_controller(&mut self, controller: Controller) {
        if controller != self.controller {
            log::info!("Controller: {:?}", controller);
            self.controller = controller;
            self.law.reset();
            // Continue open loop generation from wherever the shaft is
            self.open_loop.reset(self.shaft.angle);
        }
    }

    pub fn controller(&self) -> Controller {
        self.controller
    }

    /// Shared target, for hosts that update it from another context
    pub fn setpoint(&self) -> &Setpoint {
        &self.target
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn align_phase(&self) -> AlignPhase {
        self.align_phase
    }

    pub fn calibration(&self) -> Option<Calibration> {
        self.calibration
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Last commanded rotor frame voltage
    pub fn voltage(&self) -> Vqd {
        self.voltage
    }

    /// Last terminal voltages sent to the driver
    pub fn phase_voltages(&self) -> PhaseVoltages {
        self.phase_voltages
    }

    pub fn electrical_angle(&self) -> f32 {
        self.electrical_angle
    }

    /// Radians, measured when closed loop and generated when open loop
    pub fn shaft_angle(&self) -> f32 {
        self.shaft.angle
    }

    /// Radians per second
    pub fn shaft_velocity(&self) -> f32 {
        self.shaft.velocity
    }

    pub fn driver(&self) -> Option<&D> {
        self.driver.as_ref()
    }

    pub fn sensor(&self) -> Option<&S> {
        self.sensor.as_ref()
    }

    pub(crate) fn sensor_needs_search(&self) -> bool {
        self.sensor
            .as_ref()
            .map_or(false, |sensor| sensor.needs_search())
    }

    /// Reads the sensor and returns the unwrapped angle, before direction
    /// correction.
    pub(crate) fn read_shaft_raw(&mut self) -> Result<f32, Option<S::Error>> {
        let now_us = self.clock.now_us();
        let dt = self.prev_us.map_or(0., |prev_us| elapsed_s(prev_us, now_us));
        self.prev_us = Some(now_us);
        let sensor = self.sensor.as_mut().ok_or(None)?;
        let reading = sensor.angle().map_err(Some)?;
        Ok(self.tracker.update(reading, dt).angle)
    }

    /// Seconds since the previous iteration, stale gaps replaced
    fn tick(&mut self) -> f32 {
        let now_us = self.clock.now_us();
        let dt = self.prev_us.map_or(0., |prev_us| elapsed_s(prev_us, now_us));
        self.prev_us = Some(now_us);
        clamp_timestep(dt)
    }

    /// Refreshes the shaft state from the sensor. A failed read extrapolates
    /// the previous estimate for this iteration.
    fn update_shaft(&mut self, calibration: Calibration, dt: f32) -> ShaftState {
        let reading = self.sensor.as_mut().map(|sensor| sensor.angle());
        let raw = match reading {
            Some(Ok(angle)) => self.tracker.update(angle, dt),
            Some(Err(err)) => {
                log::debug!("Sensor read failed: {:?}", err);
                self.tracker.extrapolate(dt)
            }
            None => self.tracker.extrapolate(dt),
        };
        let sign = calibration.sensor_direction.sign();
        self.shaft = ShaftState {
            angle: sign * raw.angle,
            velocity: sign * self.velocity_filter.update(raw.velocity, dt),
        };
        self.shaft
    }

    fn closed_loop(&mut self, calibration: Calibration, target: f32, dt: f32) -> (Vqd, f32) {
        let shaft = self.update_shaft(calibration, dt);
        let angle = electrical_angle(shaft.angle, self.motor.pole_pairs)
            - calibration.zero_electric_offset;
        let torque = match self.controller {
            Controller::Voltage => target,
            Controller::Velocity | Controller::VelocityOpenLoop => {
                self.law.update(Motion::Velocity(target), shaft, dt)
            }
            Controller::Angle | Controller::AngleOpenLoop => {
                self.law.update(Motion::Angle(target), shaft, dt)
            }
        };
        (self.torque_voltage(torque), normalize_angle(angle))
    }

    fn open_loop(&mut self, target: f32, dt: f32) -> (Vqd, f32) {
        let shaft_angle = match self.controller {
            // No rotor angle to commutate against
            Controller::Voltage => return (Vqd::default(), self.electrical_angle),
            Controller::Velocity | Controller::VelocityOpenLoop => {
                self.open_loop.velocity(target, dt)
            }
            Controller::Angle | Controller::AngleOpenLoop => {
                self.open_loop.angle(target, self.limits.velocity, dt)
            }
        };
        self.shaft = ShaftState {
            angle: shaft_angle,
            velocity: self.open_loop.shaft_velocity(),
        };
        (
            Vqd::new(self.open_loop_voltage(), 0.),
            electrical_angle(shaft_angle, self.motor.pole_pairs),
        )
    }

    /// q voltage used while running open loop
    fn open_loop_voltage(&self) -> f32 {
        match (self.motor.phase_resistance, self.limits.current) {
            (Some(resistance), Some(current)) => {
                let bemf = self.motor.back_emf(self.shaft.velocity);
                fminf(current * resistance + fabsf(bemf), self.limits.voltage)
            }
            _ => self.open_loop_voltage_ratio * self.limits.voltage,
        }
    }

    /// Converts a torque command into a rotor frame voltage. Commands are
    /// amps when the phase resistance is known and volts otherwise.
    fn torque_voltage(&self, torque: f32) -> Vqd {
        let limit = self.limits.voltage;
        match self.motor.phase_resistance {
            Some(resistance) => {
                let q = torque * resistance + self.motor.back_emf(self.shaft.velocity);
                // Compensates the current lag of the winding inductance
                let d = self.motor.phase_inductance.map_or(0., |inductance| {
                    -torque * self.shaft.velocity * self.motor.pole_pairs as f32 * inductance
                });
                Vqd::new(q.clamp(-limit, limit), d.clamp(-limit, limit))
            }
            None => Vqd::new(torque.clamp(-limit, limit), 0.),
        }
    }
}
