//! Byte transport between the unit and the host.

use crate::constants::*;
use crate::error::Result;
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

/// Half-duplex byte link to the host
pub trait SerialLink {
    /// Read one byte, returning `None` when nothing arrived within the poll timeout
    fn read_byte(&mut self) -> Result<Option<u8>>;

    /// Drain whatever is currently buffered
    fn read_available(&mut self) -> Result<Vec<u8>>;

    fn write_all(&mut self, data: &[u8]) -> Result<()>;
}

/// Host link over a UART exposed as a `serialport` device
pub struct UartLink {
    port: Box<dyn SerialPort>,
}

impl UartLink {
    /// Open the UART at the unit's baud rate with the short poll timeout
    pub fn open(port_name: &str) -> Result<Self> {
        let port = serialport::new(port_name, BAUD_RATE)
            .timeout(Duration::from_millis(TIMEOUT_MS))
            .open()?;
        Ok(UartLink { port })
    }

    /// Wrap an already configured port
    pub fn from_port(port: Box<dyn SerialPort>) -> Self {
        UartLink { port }
    }
}

impl SerialLink for UartLink {
    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.port.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_available(&mut self) -> Result<Vec<u8>> {
        let pending = self.port.bytes_to_read()? as usize;
        let mut data = vec![0u8; pending.min(RX_BUFFER_SIZE)];
        if data.is_empty() {
            return Ok(data);
        }
        match self.port.read(&mut data) {
            Ok(n) => {
                data.truncate(n);
                Ok(data)
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        Ok(())
    }
}
