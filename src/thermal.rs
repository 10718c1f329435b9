//! Board temperature sampling, fan control and the hard thermal ceiling.

use crate::constants::THERMAL_MARGIN;
use crate::error::Result;
use crate::hardware::{DigitalOutput, McuTemperature, TemperatureSensor};
use crate::types::{Config, TemperatureSet};

/// Result of one temperature scan
#[derive(Debug, Clone, PartialEq)]
pub struct ThermalReading {
    pub temperatures: TemperatureSet,
    /// Hottest reading exceeded `max_temp + THERMAL_MARGIN`
    pub shutdown: bool,
}

/// Convert a raw 16-bit thermistor count to degrees C
pub fn raw_to_celsius(raw: u16) -> f64 {
    (150.0 / 1.5) * ((raw as f64 * 3.3 / 65536.0) - 0.5)
}

fn round_centi(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Sample every thermistor plus the MCU sensor and drive the fan
///
/// The fan follows a plain threshold on the hottest reading. The caller is
/// responsible for acting on `shutdown`.
pub fn read_temps(
    thermistors: &mut [Box<dyn TemperatureSensor>],
    mcu: &mut dyn McuTemperature,
    fan: &mut dyn DigitalOutput,
    config: &Config,
) -> Result<ThermalReading> {
    let mut readings = Vec::with_capacity(thermistors.len() + 1);
    for sensor in thermistors.iter_mut() {
        readings.push(round_centi(raw_to_celsius(sensor.read_raw()?)));
    }
    readings.push(round_centi(mcu.celsius()?));

    let temperatures = TemperatureSet { readings };
    let hottest = temperatures.max();
    fan.set(hottest > config.fan_trigger_temp)?;

    Ok(ThermalReading {
        shutdown: exceeds_ceiling(hottest, config),
        temperatures,
    })
}

/// True when a temperature is past the hard ceiling for this configuration
pub fn exceeds_ceiling(celsius: f64, config: &Config) -> bool {
    celsius > config.max_temp + THERMAL_MARGIN
}
