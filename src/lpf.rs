/// First order low pass filter with time constant `tf` seconds.
#[derive(Clone, Copy, Debug)]
pub struct LowPassFilter {
    tf: f32,
    previous: Option<f32>,
}

impl LowPassFilter {
    pub fn new(tf: f32) -> Self {
        LowPassFilter { tf, previous: None }
    }

    pub fn update(&mut self, value: f32, dt: f32) -> f32 {
        let filtered = match self.previous {
            // Long gaps make the history meaningless
            Some(previous) if dt > 0. && dt < 0.3 && self.tf > 0. => {
                let alpha = self.tf / (self.tf + dt);
                alpha * previous + (1. - alpha) * value
            }
            _ => value,
        };
        self.previous = Some(filtered);
        filtered
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}
