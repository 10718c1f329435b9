//! Host command protocol.
//!
//! Every request starts with one header byte. With bit 7 set the low bits
//! select a parameter to write and the rest of the receive buffer carries
//! the new value as ASCII text. With bit 7 clear the low bits select a
//! telemetry register to read.
//!
//! | Header | Register                           | Payload / response            |
//! |--------|------------------------------------|-------------------------------|
//! | 128    | mode                               | integer 0, 1, 2               |
//! | 129    | maximum temperature                | float                         |
//! | 130    | fan trigger temperature            | float                         |
//! | 131    | minimum cell voltage               | float                         |
//! | 132    | maximum cell voltage               | float                         |
//! | 133    | target cell voltage                | float                         |
//! | 134    | balance tolerance (dV)             | float                         |
//! | 135    | balance window in seconds          | integer                       |
//! | 136    | verbosity                          | boolean                       |
//! | 1      | pack voltage                       | 7 chars                       |
//! | 2      | capacity percentage                | integer text                  |
//! | 3      | mean cell voltage                  | 7 chars                       |
//! | 4      | all cell voltages                  | 20 x (7 chars + `\n`)         |
//! | 5      | board temperatures                 | 5 x (5 chars + `\n`)          |
//! | 6      | shutdown status                    | `"1"` or `"0"`                |
//!
//! Successful writes are not acknowledged; a payload that does not decode
//! is answered with the single byte 255 and discarded.

use crate::constants::*;
use crate::error::{BmsError, Result};
use crate::link::SerialLink;
use crate::types::{Config, Mode, PackSnapshot, TemperatureSet};
use log::debug;

/// Host-writable parameters, by register code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WriteRegister {
    Mode = 0,
    MaxTemp = 1,
    FanTriggerTemp = 2,
    MinVoltage = 3,
    MaxVoltage = 4,
    TargetVoltage = 5,
    Dv = 6,
    BalanceWindow = 7,
    Verbose = 8,
}

/// Telemetry registers, by register code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadRegister {
    PackVoltage = 1,
    Capacity = 2,
    MeanVoltage = 3,
    CellVoltages = 4,
    Temperatures = 5,
    Status = 6,
}

/// Decoded header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Write(WriteRegister),
    Read(ReadRegister),
    /// Header naming no known register; ignored
    Unknown(u8),
}

impl WriteRegister {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => WriteRegister::Mode,
            1 => WriteRegister::MaxTemp,
            2 => WriteRegister::FanTriggerTemp,
            3 => WriteRegister::MinVoltage,
            4 => WriteRegister::MaxVoltage,
            5 => WriteRegister::TargetVoltage,
            6 => WriteRegister::Dv,
            7 => WriteRegister::BalanceWindow,
            8 => WriteRegister::Verbose,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            WriteRegister::Mode => "mode",
            WriteRegister::MaxTemp => "maximum temperature",
            WriteRegister::FanTriggerTemp => "fan trigger temperature",
            WriteRegister::MinVoltage => "minimum cell voltage",
            WriteRegister::MaxVoltage => "maximum cell voltage",
            WriteRegister::TargetVoltage => "target cell voltage",
            WriteRegister::Dv => "maximum cell voltage difference",
            WriteRegister::BalanceWindow => "charge/balance time",
            WriteRegister::Verbose => "verbosity",
        }
    }

    /// Header byte carrying this register
    pub fn header(self) -> u8 {
        WRITE_FLAG | self as u8
    }

    /// Decode a payload into a setting for this register
    pub fn parse(self, payload: &[u8]) -> Result<Setting> {
        let text = String::from_utf8_lossy(payload);
        let token = text.trim();
        let malformed = || BmsError::Payload {
            register: self.name(),
            payload: text.to_string(),
        };
        let float = || token.parse::<f64>().map_err(|_| malformed());

        Ok(match self {
            WriteRegister::Mode => {
                // Integers outside 0..=2 are refused the same way as non-numeric text
                let code = token.parse::<u8>().map_err(|_| malformed())?;
                Setting::Mode(Mode::try_from(code).map_err(|_| malformed())?)
            }
            WriteRegister::MaxTemp => Setting::MaxTemp(float()?),
            WriteRegister::FanTriggerTemp => Setting::FanTriggerTemp(float()?),
            WriteRegister::MinVoltage => Setting::MinVoltage(float()?),
            WriteRegister::MaxVoltage => Setting::MaxVoltage(float()?),
            WriteRegister::TargetVoltage => Setting::TargetVoltage(float()?),
            WriteRegister::Dv => Setting::Dv(float()?),
            WriteRegister::BalanceWindow => {
                Setting::BalanceWindow(token.parse::<u32>().map_err(|_| malformed())?)
            }
            WriteRegister::Verbose => Setting::Verbose(parse_flag(token).ok_or_else(|| malformed())?),
        })
    }
}

fn parse_flag(token: &str) -> Option<bool> {
    match token.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

impl ReadRegister {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => ReadRegister::PackVoltage,
            2 => ReadRegister::Capacity,
            3 => ReadRegister::MeanVoltage,
            4 => ReadRegister::CellVoltages,
            5 => ReadRegister::Temperatures,
            6 => ReadRegister::Status,
            _ => return None,
        })
    }

    pub fn header(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            ReadRegister::PackVoltage => "battery voltage",
            ReadRegister::Capacity => "battery capacity",
            ReadRegister::MeanVoltage => "mean cell voltage",
            ReadRegister::CellVoltages => "all cell voltages",
            ReadRegister::Temperatures => "all temperatures",
            ReadRegister::Status => "current status",
        }
    }
}

impl Request {
    pub fn decode(header: u8) -> Self {
        let code = header & !WRITE_FLAG;
        let known = if header & WRITE_FLAG != 0 {
            WriteRegister::from_code(code).map(Request::Write)
        } else {
            ReadRegister::from_code(code).map(Request::Read)
        };
        known.unwrap_or(Request::Unknown(header))
    }
}

/// A decoded parameter write
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Setting {
    Mode(Mode),
    MaxTemp(f64),
    FanTriggerTemp(f64),
    MinVoltage(f64),
    MaxVoltage(f64),
    TargetVoltage(f64),
    Dv(f64),
    BalanceWindow(u32),
    Verbose(bool),
}

impl Setting {
    /// Store the value in `config`
    pub fn apply(self, config: &mut Config) {
        match self {
            Setting::Mode(mode) => config.mode = mode,
            Setting::MaxTemp(v) => config.max_temp = v,
            Setting::FanTriggerTemp(v) => config.fan_trigger_temp = v,
            Setting::MinVoltage(v) => config.min_voltage = v,
            Setting::MaxVoltage(v) => config.max_voltage = v,
            Setting::TargetVoltage(v) => config.target_voltage = v,
            Setting::Dv(v) => config.dv = v,
            Setting::BalanceWindow(s) => config.balance_window_seconds = s,
            Setting::Verbose(on) => config.verbose = on,
        }
    }

    pub fn register(self) -> WriteRegister {
        match self {
            Setting::Mode(_) => WriteRegister::Mode,
            Setting::MaxTemp(_) => WriteRegister::MaxTemp,
            Setting::FanTriggerTemp(_) => WriteRegister::FanTriggerTemp,
            Setting::MinVoltage(_) => WriteRegister::MinVoltage,
            Setting::MaxVoltage(_) => WriteRegister::MaxVoltage,
            Setting::TargetVoltage(_) => WriteRegister::TargetVoltage,
            Setting::Dv(_) => WriteRegister::Dv,
            Setting::BalanceWindow(_) => WriteRegister::BalanceWindow,
            Setting::Verbose(_) => WriteRegister::Verbose,
        }
    }

    /// Header byte followed by the ASCII payload
    pub fn encode(self) -> Vec<u8> {
        let payload = match self {
            Setting::Mode(mode) => mode.code().to_string(),
            Setting::MaxTemp(v)
            | Setting::FanTriggerTemp(v)
            | Setting::MinVoltage(v)
            | Setting::MaxVoltage(v)
            | Setting::TargetVoltage(v)
            | Setting::Dv(v) => float_text(v),
            Setting::BalanceWindow(s) => s.to_string(),
            Setting::Verbose(on) => String::from(if on { "1" } else { "0" }),
        };
        let mut frame = vec![self.register().header()];
        frame.extend_from_slice(payload.as_bytes());
        frame
    }
}

/// One command taken off the link
#[derive(Debug)]
pub enum Command {
    /// Write with its decoded payload, or the decode failure
    Write(WriteRegister, Result<Setting>),
    Read(ReadRegister),
    Unknown(u8),
}

/// Take at most one command from the link; `None` when nothing arrived
pub fn receive(link: &mut dyn SerialLink) -> Result<Option<Command>> {
    let header = match link.read_byte()? {
        Some(byte) => byte,
        None => return Ok(None),
    };
    debug!(target: "bms_control::uart", "Received command: {}", header);

    Ok(Some(match Request::decode(header) {
        Request::Write(register) => {
            let payload = link.read_available()?;
            debug!(
                target: "bms_control::uart",
                "Received data: {:?}",
                String::from_utf8_lossy(&payload)
            );
            Command::Write(register, register.parse(&payload))
        }
        Request::Read(register) => Command::Read(register),
        Request::Unknown(byte) => {
            if byte & WRITE_FLAG != 0 {
                let payload = link.read_available()?;
                debug!(
                    target: "bms_control::uart",
                    "Discarded data: {:?}",
                    String::from_utf8_lossy(&payload)
                );
            }
            Command::Unknown(byte)
        }
    }))
}

/// Render a float with at least one fractional digit
pub fn float_text(value: f64) -> String {
    let text = value.to_string();
    if value.is_finite() && !text.contains('.') {
        format!("{}.0", text)
    } else {
        text
    }
}

/// Fit `text` to exactly `width` characters, right-padding with ASCII '0'
pub fn pad_field(text: &str, width: usize) -> String {
    let mut field: String = text.chars().take(width).collect();
    while field.len() < width {
        field.push('0');
    }
    field
}

/// Values a read request may report
#[derive(Debug, Clone, Copy)]
pub struct TelemetryView<'a> {
    pub pack: &'a PackSnapshot,
    pub temperatures: &'a TemperatureSet,
    pub mode: Mode,
}

/// Serialize the response to a read request
pub fn encode_response(register: ReadRegister, view: &TelemetryView<'_>) -> Vec<u8> {
    let text = match register {
        ReadRegister::PackVoltage => pad_field(&float_text(view.pack.total_voltage), FLOAT_WIDTH),
        ReadRegister::Capacity => view.pack.capacity.to_string(),
        ReadRegister::MeanVoltage => pad_field(&float_text(view.pack.mean_voltage), FLOAT_WIDTH),
        ReadRegister::CellVoltages => view
            .pack
            .cells
            .iter()
            .map(|&v| pad_field(&float_text(v), CELL_WIDTH) + "\n")
            .collect(),
        ReadRegister::Temperatures => view
            .temperatures
            .readings
            .iter()
            .map(|&t| pad_field(&float_text(t), TEMP_WIDTH) + "\n")
            .collect(),
        ReadRegister::Status => {
            if view.mode == Mode::Shutdown {
                "1".to_string()
            } else {
                "0".to_string()
            }
        }
    };
    text.into_bytes()
}
