//! Headless closed loop run of a simulated hybrid stepper: align the
//! encoder, spin up, then seek a position while a load torque is applied.
use std::cell::RefCell;
use std::convert::Infallible;
use std::num::Wrapping;
use std::rc::Rc;

use embedded_hal::delay::DelayNs;

use hybrid_foc::driver::Driver;
use hybrid_foc::modulation::{Modulation, PhaseVoltages};
use hybrid_foc::regulator::Controller;
use hybrid_foc::sensor::Sensor;
use hybrid_foc::time::Clock;
use hybrid_foc::{HybridStepper, Limits, MotorConfig, MotorProperties};

mod physics;

use physics::{RotorProperties, RotorSimulator};

// Physics integration step
const SUBSTEP_US: u32 = 20;
// Control loop period
const LOOP_US: u32 = 100;
const ENCODER_OFFSET: f32 = 2.1;

struct World {
    time_us: Wrapping<u32>,
    rotor: RotorSimulator,
    driver_enabled: bool,
}

impl World {
    fn advance(&mut self, us: u32) {
        for _ in 0..(us / SUBSTEP_US).max(1) {
            self.rotor.step(1E-6 * SUBSTEP_US as f32);
            self.time_us += SUBSTEP_US;
        }
    }
}

type Shared = Rc<RefCell<World>>;

struct Bridge(Shared);

impl Driver for Bridge {
    fn voltage_limit(&self) -> f32 {
        12.
    }
    fn enable(&mut self) {
        self.0.borrow_mut().driver_enabled = true;
    }
    fn disable(&mut self) {
        let mut world = self.0.borrow_mut();
        world.driver_enabled = false;
        world.rotor.set_phase_voltages(PhaseVoltages::default());
    }
    fn set_phase_voltages(&mut self, voltages: PhaseVoltages) {
        let mut world = self.0.borrow_mut();
        if world.driver_enabled {
            world.rotor.set_phase_voltages(voltages);
        }
    }
}

struct Encoder(Shared);

impl Sensor for Encoder {
    type Error = Infallible;

    fn angle(&mut self) -> Result<f32, Self::Error> {
        Ok(self.0.borrow().rotor.encoder_angle(ENCODER_OFFSET))
    }
}

struct SimClock(Shared);

impl Clock for SimClock {
    fn now_us(&self) -> u32 {
        self.0.borrow().time_us.0
    }
}

/// Blocking waits let simulated time pass
struct SimDelay(Shared);

impl DelayNs for SimDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.0.borrow_mut().advance(ns / 1000);
    }
}

fn run(
    motor: &mut HybridStepper<Bridge, Encoder, SimClock>,
    world: &Shared,
    duration_ms: u32,
) {
    for i in 0..(duration_ms * 1000 / LOOP_US) {
        world.borrow_mut().advance(LOOP_US);
        motor.loop_foc();
        if i % 2000 == 0 {
            let world = world.borrow();
            log::info!(
                "t: {:.3} s, angle: {:.3} rad, velocity: {:.2} rad/s, uq: {:.2} V",
                1E-6 * world.time_us.0 as f32,
                world.rotor.angle(),
                world.rotor.angular_velocity(),
                motor.voltage().q
            );
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let modulation = Modulation::SpaceVectorPwm;
    let world: Shared = Rc::new(RefCell::new(World {
        time_us: Wrapping(0),
        rotor: RotorSimulator::new(
            RotorProperties {
                inertia: 5.7E-6,
                pole_pairs: 50,
                phase_resistance: 1.65,
                torque_constant: 0.25,
                viscous_friction: 2E-4,
            },
            modulation,
        ),
        driver_enabled: false,
    }));

    let mut properties = MotorProperties::new(50);
    properties.phase_resistance = Some(1.65);
    let mut motor = MotorConfig::new(properties)
        .set_limits(Limits::new(12., 30., Some(1.5)))
        .set_modulation(modulation)
        .set_controller(Controller::Velocity)
        .realize(SimClock(world.clone()));
    motor
        .link_driver(Bridge(world.clone()))
        .link_sensor(Encoder(world.clone()));

    if let Err(err) = motor.init() {
        log::error!("Init failed: {}", err);
        return;
    }
    match motor.init_foc(None, &mut SimDelay(world.clone())) {
        Ok(calibration) => log::info!("Calibrated: {:?}", calibration),
        Err(err) => log::warn!("Running open loop: {}", err),
    }

    log::info!("Spinning up");
    motor.move_to(Some(10.));
    run(&mut motor, &world, 1000);

    log::info!("Seeking position under load");
    motor.set_controller(Controller::Angle);
    motor.move_to(Some(motor.shaft_angle() + 3.));
    world.borrow_mut().rotor.set_perturbation_torque(-0.05);
    run(&mut motor, &world, 1000);

    motor.disable();
}
