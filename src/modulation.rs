//! Rotating to stationary frame transforms.
//!
//! Every scheme here produces voltages centred on 0 V. The driver is
//! responsible for adding its own mid-rail offset when turning them into
//! duty cycles.
use core::ops::Add;

use libm::{fabsf, fmaxf, fminf};

use crate::util::{normalize_angle, Vector};

const SQRT_3: f32 = 1.732_050_8;
const FRAC_1_SQRT_3: f32 = 0.577_350_26;

/// Voltage in the rotor (rotating) frame, volts
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vqd {
    pub q: f32,
    pub d: f32,
}

impl Vqd {
    pub fn new(q: f32, d: f32) -> Self {
        Vqd { q, d }
    }
}

/// Stator terminal voltages, volts
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseVoltages {
    pub a: f32,
    pub b: f32,
    pub c: f32,
}

impl PhaseVoltages {
    pub fn new(a: f32, b: f32, c: f32) -> Self {
        PhaseVoltages { a, b, c }
    }

    /// Largest magnitude over all three terminals
    pub fn peak(&self) -> f32 {
        fmaxf(fabsf(self.a), fmaxf(fabsf(self.b), fabsf(self.c)))
    }
}

impl Add for PhaseVoltages {
    type Output = PhaseVoltages;
    fn add(self, rhs: Self) -> Self::Output {
        PhaseVoltages {
            a: self.a + rhs.a,
            b: self.b + rhs.b,
            c: self.c + rhs.c,
        }
    }
}

/// How a stationary frame voltage is spread over the three terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Modulation {
    /// Hybrid stepper wiring: coil A across terminals a/c, coil B across
    /// b/c. The common terminal `c` is held at the 0 V neutral, so each coil
    /// sees at most the terminal headroom.
    #[default]
    SinePwm,
    /// Hybrid stepper wiring with the common terminal shifted to centre all
    /// three terminals. Terminals stay within `|U| / sqrt(2)`, so the coils
    /// can reach sqrt(2) times the terminal headroom.
    SpaceVectorPwm,
    /// Three-phase star connection, 120 degrees apart. Terminals sum to 0 V
    /// and each peaks at `|U|`.
    Balanced,
}

/// Inverse Park transform, `angle` in electrical radians.
/// Returns the stationary `(alpha, beta)` components.
pub fn inverse_park(voltage: Vqd, angle: f32) -> (f32, f32) {
    if voltage.q == 0. && voltage.d == 0. {
        return (0., 0.);
    }
    // d lies on the rotor flux axis, q leads it by 90 degrees
    Vector::from_components(voltage.d, voltage.q)
        .rotated(normalize_angle(angle))
        .components()
}

/// Converts a rotor frame voltage at electrical angle `angle` into terminal
/// voltages. The `(q, d)` magnitude is saturated to `voltage_limit`, which
/// keeps every terminal within `voltage_limit` for all schemes.
pub fn modulate(
    voltage: Vqd,
    angle: f32,
    voltage_limit: f32,
    modulation: Modulation,
) -> PhaseVoltages {
    let vector = Vector::from_components(voltage.d, voltage.q);
    let voltage = if vector.magnitude > voltage_limit {
        log::trace!(
            "Saturating voltage magnitude {} to {}",
            vector.magnitude,
            voltage_limit
        );
        let (d, q) = vector.clamped_magnitude(voltage_limit).components();
        Vqd { q, d }
    } else {
        voltage
    };
    let (alpha, beta) = inverse_park(voltage, angle);

    match modulation {
        Modulation::SinePwm => PhaseVoltages::new(alpha, beta, 0.),
        Modulation::SpaceVectorPwm => {
            let max = fmaxf(fmaxf(alpha, beta), 0.);
            let min = fminf(fminf(alpha, beta), 0.);
            let center = -(max + min) / 2.;
            PhaseVoltages::new(alpha, beta, 0.) + PhaseVoltages::new(center, center, center)
        }
        // Inverse Clarke
        Modulation::Balanced => PhaseVoltages::new(
            alpha,
            (-alpha + SQRT_3 * beta) / 2.,
            (-alpha - SQRT_3 * beta) / 2.,
        ),
    }
}

/// Recovers the stationary `(alpha, beta)` voltage from terminal voltages
/// produced with `modulation`.
pub fn demodulate(phases: PhaseVoltages, modulation: Modulation) -> (f32, f32) {
    match modulation {
        Modulation::SinePwm | Modulation::SpaceVectorPwm => {
            (phases.a - phases.c, phases.b - phases.c)
        }
        // Clarke, without assuming the terminals sum to zero
        Modulation::Balanced => (
            (2. * phases.a - phases.b - phases.c) / 3.,
            FRAC_1_SQRT_3 * (phases.b - phases.c),
        ),
    }
}

/// Park transform, the inverse of [`inverse_park`]
pub fn park(alpha: f32, beta: f32, angle: f32) -> Vqd {
    let (d, q) = Vector::from_components(alpha, beta)
        .rotated(-normalize_angle(angle))
        .components();
    Vqd { q, d }
}
