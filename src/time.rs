/// Monotonic microsecond time source, wrapping allowed.
pub trait Clock {
    fn now_us(&self) -> u32;
}

/// Seconds elapsed between two wrapping microsecond timestamps.
pub fn elapsed_s(prev_us: u32, now_us: u32) -> f32 {
    // Handle a wrapping timestamp
    1E-6 * now_us.wrapping_sub(prev_us) as f32
}

#[cfg(test)]
mod tests {
    use libm::fabsf;

    use super::*;

    #[test]
    fn elapsed_handles_wrap() {
        assert!(fabsf(elapsed_s(u32::MAX - 499, 500) - 1E-3) < 1E-9);
        assert!(fabsf(elapsed_s(1000, 3000) - 2E-3) < 1E-9);
    }
}
