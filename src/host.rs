//! Host side of the command protocol.

use crate::constants::*;
use crate::error::{BmsError, Result};
use crate::link::{SerialLink, UartLink};
use crate::protocol::{ReadRegister, Setting};
use crate::types::Mode;
use log::debug;

/// Talks to a unit over its serial link
pub struct BmsClient {
    link: Box<dyn SerialLink>,
}

impl BmsClient {
    /// Open a client on a serial port
    pub fn open(port_name: &str) -> Result<Self> {
        Ok(Self::from_link(Box::new(UartLink::open(port_name)?)))
    }

    pub fn from_link(link: Box<dyn SerialLink>) -> Self {
        BmsClient { link }
    }

    /// List available serial ports
    pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>> {
        Ok(serialport::available_ports()?)
    }

    /// Wait for the unit's startup byte, discarding anything before it
    pub fn wait_ready(&mut self, polls: usize) -> Result<()> {
        for _ in 0..polls {
            if self.link.read_byte()? == Some(READY_BYTE) {
                return Ok(());
            }
        }
        Err(BmsError::Timeout)
    }

    /// Send a parameter write without waiting for a reply
    pub fn send_setting(&mut self, setting: Setting) -> Result<()> {
        let frame = setting.encode();
        debug!(target: "bms_control::uart", "Sending {:?}", frame);
        self.link.write_all(&frame)
    }

    /// Send a parameter write and watch up to `polls` read timeouts for a rejection
    ///
    /// The unit stays silent on success and only answers on its next tick,
    /// which may come after a settle pause or a whole balance window. A
    /// rejection arriving after the last poll is missed and the write
    /// reported as accepted.
    pub fn write_setting(&mut self, setting: Setting, polls: usize) -> Result<()> {
        self.send_setting(setting)?;
        for _ in 0..polls {
            if self.link.read_byte()? == Some(ERROR_BYTE) {
                return Err(BmsError::Rejected {
                    register: setting.register().name(),
                });
            }
        }
        Ok(())
    }

    pub fn send_request(&mut self, register: ReadRegister) -> Result<()> {
        self.link.write_all(&[register.header()])
    }

    /// Collect a read response, stopping at its fixed length or when the link goes quiet
    pub fn receive_response(&mut self, register: ReadRegister) -> Result<Vec<u8>> {
        let expected = response_len(register);
        let mut response = Vec::new();
        while expected.map_or(true, |len| response.len() < len) {
            match self.link.read_byte()? {
                Some(byte) => response.push(byte),
                None => break,
            }
        }
        debug!(
            target: "bms_control::uart",
            "Received {:?}",
            String::from_utf8_lossy(&response)
        );
        if response.is_empty() {
            return Err(BmsError::Timeout);
        }
        Ok(response)
    }

    pub fn read(&mut self, register: ReadRegister) -> Result<Vec<u8>> {
        self.send_request(register)?;
        self.receive_response(register)
    }

    pub fn pack_voltage(&mut self) -> Result<f64> {
        let response = self.read(ReadRegister::PackVoltage)?;
        parse_value(&response)
    }

    pub fn capacity(&mut self) -> Result<u8> {
        let response = self.read(ReadRegister::Capacity)?;
        parse_value(&response)
    }

    pub fn mean_voltage(&mut self) -> Result<f64> {
        let response = self.read(ReadRegister::MeanVoltage)?;
        parse_value(&response)
    }

    pub fn cell_voltages(&mut self) -> Result<Vec<f64>> {
        let response = self.read(ReadRegister::CellVoltages)?;
        parse_lines(&response)
    }

    pub fn temperatures(&mut self) -> Result<Vec<f64>> {
        let response = self.read(ReadRegister::Temperatures)?;
        parse_lines(&response)
    }

    pub fn is_shutdown(&mut self) -> Result<bool> {
        let response = self.read(ReadRegister::Status)?;
        Ok(response == b"1")
    }

    pub fn set_mode(&mut self, mode: Mode, polls: usize) -> Result<()> {
        self.write_setting(Setting::Mode(mode), polls)
    }
}

/// Byte length of a fixed-size response; capacity varies
pub fn response_len(register: ReadRegister) -> Option<usize> {
    match register {
        ReadRegister::PackVoltage | ReadRegister::MeanVoltage => Some(FLOAT_WIDTH),
        ReadRegister::Capacity => None,
        ReadRegister::CellVoltages => Some(CELL_COUNT * (CELL_WIDTH + 1)),
        ReadRegister::Temperatures => Some((THERMISTOR_COUNT + 1) * (TEMP_WIDTH + 1)),
        ReadRegister::Status => Some(1),
    }
}

fn parse_value<T: std::str::FromStr>(bytes: &[u8]) -> Result<T> {
    let text = String::from_utf8_lossy(bytes);
    text.trim()
        .parse()
        .map_err(|_| BmsError::Parse(format!("unexpected response {:?}", text)))
}

fn parse_lines(bytes: &[u8]) -> Result<Vec<f64>> {
    bytes
        .split(|&b| b == b'\n')
        .filter(|field| !field.is_empty())
        .map(parse_value::<f64>)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLink;

    fn client() -> (BmsClient, MockLink) {
        let (host, unit) = MockLink::pair();
        (BmsClient::from_link(Box::new(host)), unit)
    }

    #[test]
    fn test_wait_ready_skips_noise() {
        let (mut client, mut unit) = client();
        unit.write_all(&[0, 12, READY_BYTE]).unwrap();
        client.wait_ready(5).unwrap();

        assert!(matches!(client.wait_ready(3), Err(BmsError::Timeout)));
    }

    #[test]
    fn test_rejected_write_is_reported() {
        let (mut client, mut unit) = client();
        unit.write_all(&[ERROR_BYTE]).unwrap();
        let err = client.write_setting(Setting::MaxTemp(70.0), 1).unwrap_err();
        assert!(matches!(err, BmsError::Rejected { register: "maximum temperature" }));
        assert_eq!(unit.read_available().unwrap(), b"\x8170.0");
    }

    #[test]
    fn test_silent_write_is_accepted() {
        let (mut client, _unit) = client();
        client.set_mode(Mode::Active, 3).unwrap();
    }

    #[test]
    fn test_late_rejection_is_caught_within_polls() {
        let (host, unit) = MockLink::pair();
        let mut client = BmsClient::from_link(Box::new(ScriptedLink {
            inner: host,
            quiet_polls: 2,
        }));
        let mut unit = unit;
        unit.write_all(&[ERROR_BYTE]).unwrap();
        assert!(client.write_setting(Setting::Dv(0.02), 2).is_ok());
        unit.write_all(&[ERROR_BYTE]).unwrap();
        assert!(matches!(
            client.write_setting(Setting::Dv(0.02), 5),
            Err(BmsError::Rejected { .. })
        ));
    }

    /// Link that stays quiet for a number of polls before delivering bytes
    struct ScriptedLink {
        inner: MockLink,
        quiet_polls: usize,
    }

    impl SerialLink for ScriptedLink {
        fn read_byte(&mut self) -> Result<Option<u8>> {
            if self.quiet_polls > 0 {
                self.quiet_polls -= 1;
                return Ok(None);
            }
            self.inner.read_byte()
        }

        fn read_available(&mut self) -> Result<Vec<u8>> {
            self.inner.read_available()
        }

        fn write_all(&mut self, data: &[u8]) -> Result<()> {
            self.inner.write_all(data)
        }
    }

    #[test]
    fn test_fixed_length_response_stops_at_width() {
        let (mut client, mut unit) = client();
        unit.write_all(b"77.00001").unwrap();
        assert_eq!(client.pack_voltage().unwrap(), 77.0);
        assert_eq!(unit.read_byte().unwrap(), Some(ReadRegister::PackVoltage.header()));
    }

    #[test]
    fn test_line_responses_parse() {
        let (mut client, mut unit) = client();
        unit.write_all(b"25.50\n30.12\n41.00\n19.99\n38.70\n").unwrap();
        assert_eq!(client.temperatures().unwrap(), vec![25.5, 30.12, 41.0, 19.99, 38.7]);
    }

    #[test]
    fn test_garbage_response_is_a_parse_error() {
        let (mut client, mut unit) = client();
        unit.write_all(b"x").unwrap();
        assert!(matches!(client.capacity(), Err(BmsError::Parse(_))));
    }

    #[test]
    fn test_quiet_link_times_out() {
        let (mut client, _unit) = client();
        assert!(matches!(client.is_shutdown(), Err(BmsError::Timeout)));
    }
}
