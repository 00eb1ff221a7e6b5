use crate::modulation::PhaseVoltages;

/// Power stage that turns terminal voltages into switching signals.
///
/// Voltages handed to the driver are centred on 0 V; mapping them onto the
/// supply rail (and clamping to it) is the driver's job.
pub trait Driver {
    /// Largest terminal voltage magnitude the driver accepts, volts
    fn voltage_limit(&self) -> f32;

    fn enable(&mut self);

    fn disable(&mut self);

    fn set_phase_voltages(&mut self, voltages: PhaseVoltages);
}
