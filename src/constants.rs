//! Pack, timing and protocol constants for the BMS controller.
//!
//! This module defines the fixed pack geometry, safety margins, phase
//! durations and the serial register map shared by the controller and the
//! host-side client.

use std::time::Duration;

/// Number of series cells monitored by the unit
pub const CELL_COUNT: usize = 20;

/// Discharge switch slots provided by the I/O-expander banks (3 x 8)
pub const DRAIN_CAPACITY: usize = 24;

/// Outputs per I/O-expander bank
pub const BANK_WIDTH: usize = 8;

/// Maximum number of cells allowed to drain at the same time
pub const MAX_CONCURRENT_DRAINS: usize = CELL_COUNT / 2;

/// Physical ADC channel feeding each logical cell, in wiring order
pub const DEFAULT_WIRING: [usize; CELL_COUNT] = [
    18, 15, 12, 6, 3, 9, 0, 7, 16, 13, 10, 19, 1, 4, 20, 17, 11, 5, 2, 14,
];

/// Pack voltage reported as 100% capacity
pub const V_FULL: f64 = 84.0;

/// Pack voltage reported as 0% capacity
pub const V_EMPTY: f64 = 68.0;

/// Largest per-cell change between snapshots still considered stable (volts)
pub const NOISE_THRESHOLD: f64 = 0.05;

/// Headroom below `max_voltage` required before the charger may be enabled (volts)
pub const CHARGE_HEADROOM: f64 = 0.05;

/// Hard thermal ceiling above the configured `max_temp` (degrees C)
pub const THERMAL_MARGIN: f64 = 20.0;

/// Telemetry attempts per tick before an unstable reading becomes a fault
pub const MEASUREMENT_ATTEMPTS: u8 = 4;

/// Balanced ticks required before a charge/balance cycle is declared complete
pub const SETTLE_CONFIRMATIONS: u8 = 4;

/// Pause before measuring in Active mode so cells recover from draining
pub const SETTLE_PAUSE: Duration = Duration::from_secs(5);

/// Length of one temperature-check slice inside a balance window, and of
/// the pause between settle confirmations
pub const WINDOW_SLICE: Duration = Duration::from_secs(8);

/// Alarm pulse for voltage-limit and misconfiguration faults
pub const FAULT_PULSE: Duration = Duration::from_secs(1);

/// On/off time of each chirp in the completion signal
pub const CHIRP: Duration = Duration::from_millis(100);

/// Number of chirps sounded when a cycle completes
pub const COMPLETION_CHIRPS: usize = 2;

/// Delay suggested to the driver loop between ordinary ticks
pub const IDLE_POLL: Duration = Duration::from_millis(100);

/// ADC reference configuration byte (MUX1 register)
pub const ADC_REFERENCE: u8 = 0x40;

/// ADC gain and data-rate configuration byte (SYS0 register)
pub const ADC_GAIN: u8 = 0x03;

/// Negative input shared by every cell measurement
pub const ADC_NEGATIVE_INPUT: u8 = 3;

/// Positive inputs sampled on each converter
pub const ADC_POSITIVE_INPUTS: [u8; 7] = [0, 1, 2, 4, 5, 6, 7];

/// Persistent store address of the fault latch byte
pub const FAULT_LATCH_ADDRESS: usize = 0x0;

/// Baud rate of the host link
pub const BAUD_RATE: u32 = 9600;

/// Non-blocking poll timeout for the host link in milliseconds
pub const TIMEOUT_MS: u64 = 100;

/// Receive buffer size of the host link
pub const RX_BUFFER_SIZE: usize = 16;

/// Byte announced on the link once the unit is ready
pub const READY_BYTE: u8 = 127;

/// Response sent when a write payload cannot be decoded
pub const ERROR_BYTE: u8 = 255;

/// Bit marking a request as a register write
pub const WRITE_FLAG: u8 = 0x80;

/// Width of single float responses
pub const FLOAT_WIDTH: usize = 7;

/// Width of each cell voltage line
pub const CELL_WIDTH: usize = 7;

/// Width of each temperature line
pub const TEMP_WIDTH: usize = 5;

/// Number of thermistors on the board (the MCU sensor is appended after them)
pub const THERMISTOR_COUNT: usize = 4;
