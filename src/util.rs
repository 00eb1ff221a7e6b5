use core::f32::consts::{PI, TAU};

use libm::{atan2f, cosf, floorf, fmodf, hypotf, sinf};

/// Smallest movement the alignment sweep is able to detect, radians
pub const MIN_ANGLE_DETECT_MOVEMENT: f32 = TAU / 101.;

#[derive(Debug, Clone, Copy)]
pub struct Vector {
    pub magnitude: f32,
    pub phase: f32,
    // Block construction so magnitude invariants can be upheld
    _private: (),
}

impl Vector {
    pub fn from_components(x: f32, y: f32) -> Self {
        Vector {
            magnitude: hypotf(x, y),
            phase: atan2f(y, x),
            _private: (),
        }
    }
    pub fn clamped_magnitude(self, limit: f32) -> Self {
        Vector {
            magnitude: self.magnitude.clamp(0., limit),
            ..self
        }
    }
    pub fn rotated(self, angle: f32) -> Self {
        Vector {
            phase: self.phase + angle,
            ..self
        }
    }
    /// Cartesian `(x, y)` components
    pub fn components(self) -> (f32, f32) {
        (
            self.magnitude * cosf(self.phase),
            self.magnitude * sinf(self.phase),
        )
    }
}

/// Wraps any finite angle into [0..2PI)
pub fn normalize_angle(angle: f32) -> f32 {
    let wrapped = fmodf(angle, TAU);
    let wrapped = if wrapped < 0. { wrapped + TAU } else { wrapped };
    // `fmodf` of a tiny negative number lands exactly on 2PI
    if wrapped >= TAU {
        0.
    } else {
        wrapped
    }
}

/// Electrical angle of the rotor for a given (already direction corrected)
/// mechanical angle, before any sensor offset is applied.
pub fn electrical_angle(shaft_angle: f32, pole_pairs: u32) -> f32 {
    // Only the fractional part of the mechanical turn matters. Reducing it
    // first keeps precision on multi-turn angles.
    let turns = shaft_angle / TAU;
    let fraction = turns - floorf(turns);
    normalize_angle(fraction * TAU * pole_pairs as f32)
}

/// Signed shortest distance from `from` to `to`, in (-PI..PI]
pub fn angle_difference(from: f32, to: f32) -> f32 {
    let diff = normalize_angle(to - from);
    if diff > PI {
        diff - TAU
    } else {
        diff
    }
}

#[cfg(test)]
mod tests {
    use libm::fabsf;

    use super::*;

    #[test]
    fn normalize_wraps_negative_and_large_angles() {
        assert!(fabsf(normalize_angle(-0.5) - (TAU - 0.5)) < 1E-5);
        assert!(fabsf(normalize_angle(3. * TAU + 1.) - 1.) < 1E-4);
        assert_eq!(normalize_angle(0.), 0.);
        assert!(normalize_angle(-1E-9) < TAU);
    }

    #[test]
    fn electrical_angle_scales_by_pole_pairs() {
        let angle = electrical_angle(0.1, 7);
        assert!(fabsf(angle - 0.7) < 1E-5);
        // One full mechanical turn later the electrical angle is unchanged
        let angle = electrical_angle(0.1 + TAU, 7);
        assert!(fabsf(angle - 0.7) < 1E-3);
    }

    #[test]
    fn angle_difference_takes_short_way_round() {
        assert!(fabsf(angle_difference(0.1, TAU - 0.1) + 0.2) < 1E-5);
        assert!(fabsf(angle_difference(TAU - 0.1, 0.1) - 0.2) < 1E-5);
    }

    #[test]
    fn vector_components_round_trip() {
        let (x, y) = Vector::from_components(3., -4.).components();
        assert!(fabsf(x - 3.) < 1E-5);
        assert!(fabsf(y + 4.) < 1E-5);
        let clamped = Vector::from_components(3., 4.).clamped_magnitude(1.);
        assert!(fabsf(clamped.magnitude - 1.) < 1E-6);
    }
}
