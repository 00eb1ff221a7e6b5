use libm::fabsf;

#[derive(Clone, Copy, Debug)]
pub struct Constants {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    /// Maximum magnitude of the accumulator, used for anti-windup
    pub la: f32,
    /// Maximum magnitude of the output
    pub limit: f32,
    /// Maximum rate of change of the output, units per second.
    /// `None` disables ramping.
    pub ramp: Option<f32>,
}

impl Constants {
    pub fn new(kp: f32, ki: f32, kd: f32, la: f32, limit: f32) -> Self {
        Constants {
            kp,
            ki,
            kd,
            la,
            limit,
            ramp: None,
        }
    }

    pub fn with_ramp(self, ramp: f32) -> Self {
        Constants {
            ramp: Some(ramp),
            ..self
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Pid {
    constants: Constants,
    accumulator: f32,
    // Previous value of the process variable
    previous: Option<f32>,
    // The output calculated from the last update
    output: f32,
}

impl Pid {
    pub fn new(constants: Constants) -> Self {
        Pid {
            constants,
            accumulator: 0.,
            previous: None,
            output: 0.,
        }
    }

    pub fn update(&mut self, val: f32, setpoint: f32, dt: f32) -> f32 {
        if !val.is_finite() || !(dt > 0.) {
            log::warn!("Invalid argument, val was: {}, dt was: {} ", val, dt);
            return self.output;
        }

        let Constants {
            kp,
            ki,
            kd,
            la,
            limit,
            ramp,
        } = self.constants;

        let err = setpoint - val;
        self.accumulator += err * dt;
        if fabsf(self.accumulator) > la {
            log::trace!("Accumulator limiter triggered");
            self.accumulator = self.accumulator.clamp(-la, la);
        }
        // Derivative on measurement so setpoint steps do not kick the output
        let derivative = if let Some(previous) = self.previous {
            -(val - previous) / dt
        } else {
            0.
        };

        self.previous = Some(val);

        let output = (kp * err + ki * self.accumulator + kd * derivative).clamp(-limit, limit);
        self.output = match ramp {
            Some(rate) => {
                let step = rate * dt;
                output.clamp(self.output - step, self.output + step)
            }
            None => output,
        };
        self.output
    }

    pub fn output(&self) -> f32 {
        self.output
    }

    pub fn reset(&mut self) {
        self.accumulator = 0.;
        self.previous = None;
        self.output = 0.;
    }
}
