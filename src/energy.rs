pub const DEFAULT_VOLTAGE: f64 = 200.0;
pub const DEFAULT_POWER_FACTOR: f64 = 1.0;

/// Electrical constants used to turn a current into energy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElectricalProfile {
    pub voltage: f64,
    pub power_factor: f64,
}

impl Default for ElectricalProfile {
    fn default() -> Self {
        Self {
            voltage: DEFAULT_VOLTAGE,
            power_factor: DEFAULT_POWER_FACTOR,
        }
    }
}

impl ElectricalProfile {
    /// Energy in kWh drawn by `current` amps over `hours`.
    pub fn energy_kwh(&self, current: f64, hours: f64) -> f64 {
        energy_kwh(current, self.voltage, hours, self.power_factor)
    }
}

/// `current * voltage * power_factor * hours / 1000`.
///
/// NaN in means NaN out; callers feed it normalized values only.
pub fn energy_kwh(current: f64, voltage: f64, hours: f64, power_factor: f64) -> f64 {
    current * voltage * power_factor * hours / 1000.0
}
