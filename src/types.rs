use crate::constants::{BANK_WIDTH, CELL_COUNT, DEFAULT_WIRING, DRAIN_CAPACITY};
use crate::error::BmsError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Operating mode of the unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Mode {
    /// Monitoring only
    #[default]
    Idle = 0,
    /// Charging, discharging or balancing towards the target voltage
    Active = 1,
    /// Safe hold: relay open, drains cleared, ADC asleep
    Shutdown = 2,
}

impl Mode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Mode {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Mode::Idle),
            1 => Ok(Mode::Active),
            2 => Ok(Mode::Shutdown),
            other => Err(other),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Idle => "idle",
            Mode::Active => "active",
            Mode::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Host-writable runtime parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub mode: Mode,
    /// Soft temperature limit in degrees C
    pub max_temp: f64,
    /// Fan switches on above this temperature
    pub fan_trigger_temp: f64,
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub target_voltage: f64,
    /// Balance tolerance band in volts
    pub dv: f64,
    /// Length of a charge/balance window between measurements
    pub balance_window_seconds: u32,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mode: Mode::Idle,
            max_temp: 80.0,
            fan_trigger_temp: 50.0,
            min_voltage: 3.4,
            max_voltage: 4.25,
            target_voltage: 3.85,
            dv: 0.01,
            balance_window_seconds: 32,
            verbose: false,
        }
    }
}

impl Config {
    /// True when the target voltage lies inside the permitted cell band
    pub fn target_in_band(&self) -> bool {
        self.target_voltage >= self.min_voltage && self.target_voltage <= self.max_voltage
    }
}

/// Aggregate view of one telemetry read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackSnapshot {
    /// Cell voltages in logical order
    pub cells: [f64; CELL_COUNT],
    pub total_voltage: f64,
    pub mean_voltage: f64,
    pub min_voltage: f64,
    pub min_index: usize,
    pub max_voltage: f64,
    pub max_index: usize,
    /// Capacity in percent, always within 0..=100
    pub capacity: u8,
}

impl PackSnapshot {
    /// Difference between the highest and lowest cell
    pub fn spread(&self) -> f64 {
        self.max_voltage - self.min_voltage
    }
}

/// Board temperatures in degrees C, MCU sensor last
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSet {
    pub readings: Vec<f64>,
}

impl TemperatureSet {
    /// Hottest reading, or negative infinity when nothing was sampled
    pub fn max(&self) -> f64 {
        self.readings
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
    }
}

/// Per-slot discharge intent, sized to the expander hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainPlan {
    slots: [bool; DRAIN_CAPACITY],
}

impl Default for DrainPlan {
    fn default() -> Self {
        DrainPlan {
            slots: [false; DRAIN_CAPACITY],
        }
    }
}

impl DrainPlan {
    /// Plan with every switch open
    pub fn cleared() -> Self {
        Self::default()
    }

    /// Mark a cell for discharge; slots beyond the cell count are ignored
    pub fn drain(&mut self, cell: usize) {
        if cell < CELL_COUNT {
            self.slots[cell] = true;
        }
    }

    pub fn is_draining(&self, slot: usize) -> bool {
        self.slots.get(slot).copied().unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|&&on| on).count()
    }

    /// Logical cells currently marked for discharge
    pub fn draining_cells(&self) -> Vec<usize> {
        (0..DRAIN_CAPACITY).filter(|&i| self.slots[i]).collect()
    }

    /// Output byte for each expander bank, bit `n` driving slot `8 * bank + n`
    pub fn bank_bytes(&self) -> Vec<u8> {
        self.slots
            .chunks(BANK_WIDTH)
            .map(|bank| {
                bank.iter()
                    .enumerate()
                    .filter(|&(_, &on)| on)
                    .fold(0u8, |byte, (bit, _)| byte | (1 << bit))
            })
            .collect()
    }
}

/// Status indicator colour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// Logical cell to physical ADC channel mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wiring {
    channels: [usize; CELL_COUNT],
}

impl Wiring {
    /// Validate a wiring table: every cell must map to a distinct channel
    pub fn new(channels: [usize; CELL_COUNT]) -> Result<Self, BmsError> {
        for (cell, channel) in channels.iter().enumerate() {
            if channels[..cell].contains(channel) {
                return Err(BmsError::InvalidWiring(format!(
                    "channel {} assigned to more than one cell",
                    channel
                )));
            }
        }
        Ok(Wiring { channels })
    }

    /// Physical channel feeding a logical cell
    pub fn channel(&self, cell: usize) -> usize {
        self.channels[cell]
    }

    /// Highest physical channel referenced
    pub fn highest_channel(&self) -> usize {
        self.channels.iter().copied().max().unwrap_or(0)
    }
}

impl Default for Wiring {
    fn default() -> Self {
        Wiring {
            channels: DEFAULT_WIRING,
        }
    }
}

/// What the driver loop should do after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    /// Time to wait before calling `tick` again
    pub wait: Duration,
    /// Mode after the tick
    pub mode: Mode,
}

/// Snapshot of controller state for host-side dumps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub timestamp: DateTime<Utc>,
    pub config: Config,
    pub pack: PackSnapshot,
    pub temperatures: TemperatureSet,
    pub draining: Vec<usize>,
    pub relay_closed: bool,
    pub fan_on: bool,
    pub alarm_on: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wiring_rejects_shared_channels() {
        let mut channels = DEFAULT_WIRING;
        assert!(Wiring::new(channels).is_ok());
        channels[3] = channels[0];
        assert!(matches!(Wiring::new(channels), Err(BmsError::InvalidWiring(_))));
    }

    #[test]
    fn test_default_wiring_skips_channel_eight() {
        let wiring = Wiring::default();
        assert_eq!(wiring.channel(0), 18);
        assert_eq!(wiring.channel(19), 14);
        assert_eq!(wiring.highest_channel(), 20);
        assert!((0..CELL_COUNT).all(|cell| wiring.channel(cell) != 8));
    }

    #[test]
    fn test_drain_plan_bank_bytes() {
        let mut plan = DrainPlan::cleared();
        plan.drain(0);
        plan.drain(9);
        plan.drain(19);
        plan.drain(22);
        assert_eq!(plan.bank_bytes(), vec![0b0000_0001, 0b0000_0010, 0b0000_1000]);
        assert_eq!(plan.active_count(), 3);
        assert!(plan.is_draining(9));
        assert!(!plan.is_draining(22));
    }

    #[test]
    fn test_mode_codes() {
        assert_eq!(Mode::try_from(2), Ok(Mode::Shutdown));
        assert_eq!(Mode::try_from(3), Err(3));
        assert_eq!(Mode::Active.code(), 1);
        assert_eq!(Mode::default(), Mode::Idle);
    }

    #[test]
    fn test_config_target_band() {
        let mut config = Config::default();
        assert!(config.target_in_band());
        config.target_voltage = 4.5;
        assert!(!config.target_in_band());
    }
}
