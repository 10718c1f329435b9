//! Interfaces to the hardware the controller drives.
//!
//! The analog front end, I/O expanders, sensors and digital outputs are
//! owned by board support code; the controller only talks to them through
//! these traits. Every call may fail with a `BmsError`, which the controller
//! propagates out of `tick`.

use crate::error::Result;
use crate::link::SerialLink;
use crate::types::Rgb;

/// Array of delta-sigma converters digitizing the cell taps
pub trait AdcArray {
    /// Bring every converter out of sleep
    fn wake(&mut self) -> Result<()>;

    /// Write gain/data-rate and reference configuration to every converter
    fn configure(&mut self, gain: u8, reference: u8) -> Result<()>;

    /// Run offset self-calibration on every converter
    fn self_calibrate_offset(&mut self) -> Result<()>;

    /// Sample `positive_inputs` against `negative_input` on each converter
    ///
    /// Returns the voltages of all converters concatenated, indexed by
    /// physical channel.
    fn read_all_channels(&mut self, negative_input: u8, positive_inputs: &[u8]) -> Result<Vec<f64>>;

    /// Put every converter to sleep
    fn sleep(&mut self) -> Result<()>;
}

/// One 8-bit I/O-expander bank driving discharge switches
pub trait IoExpander {
    /// Set the direction register; a cleared bit is an output
    fn set_direction_mask(&mut self, mask: u8) -> Result<()>;

    fn write_outputs(&mut self, outputs: u8) -> Result<()>;
}

/// Analog thermistor channel
pub trait TemperatureSensor {
    /// Raw 16-bit conversion result
    fn read_raw(&mut self) -> Result<u16>;
}

/// Die temperature of the microcontroller
pub trait McuTemperature {
    fn celsius(&mut self) -> Result<f64>;
}

/// Buzzer, charge relay or fan
pub trait DigitalOutput {
    fn set(&mut self, on: bool) -> Result<()>;

    fn is_on(&self) -> bool;
}

/// RGB status LED
pub trait StatusIndicator {
    fn fill(&mut self, colour: Rgb) -> Result<()>;
}

/// Byte-addressable storage that survives a reset
pub trait PersistentStore {
    fn read_byte(&mut self, address: usize) -> Result<u8>;

    fn write_byte(&mut self, address: usize, value: u8) -> Result<()>;
}

/// Every collaborator the controller needs, handed over at construction
pub struct Board {
    pub adc: Box<dyn AdcArray>,
    /// Expander banks in slot order, eight drain slots each
    pub expanders: Vec<Box<dyn IoExpander>>,
    pub thermistors: Vec<Box<dyn TemperatureSensor>>,
    pub mcu: Box<dyn McuTemperature>,
    pub buzzer: Box<dyn DigitalOutput>,
    pub relay: Box<dyn DigitalOutput>,
    pub fan: Box<dyn DigitalOutput>,
    pub indicator: Box<dyn StatusIndicator>,
    pub store: Box<dyn PersistentStore>,
    pub link: Box<dyn SerialLink>,
}
