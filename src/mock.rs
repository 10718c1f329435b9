//! In-memory collaborators for tests and host-side simulation.
//!
//! Each mock is a cheap handle around shared state: clone it, box one copy
//! into the `Board`, and keep the other to inject readings or inspect what
//! the controller did.

#![cfg(any(test, feature = "mock"))]

use crate::constants::*;
use crate::error::{BmsError, Result};
use crate::hardware::*;
use crate::link::SerialLink;
use crate::types::{Rgb, Wiring};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

/// Three converters with seven inputs each
const MOCK_ADC_CHANNELS: usize = 21;

#[derive(Debug)]
struct AdcState {
    channels: Vec<f64>,
    script: VecDeque<Vec<f64>>,
    awake: bool,
    configured: Option<(u8, u8)>,
    calibrated: bool,
    reads: usize,
}

/// ADC array returning programmable channel voltages
///
/// Reads fail while the array is asleep.
#[derive(Debug, Clone)]
pub struct MockAdc {
    state: Rc<RefCell<AdcState>>,
}

impl Default for MockAdc {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdc {
    /// Every cell at 3.85 V
    pub fn new() -> Self {
        Self::with_channel_count(MOCK_ADC_CHANNELS)
    }

    pub fn with_channel_count(count: usize) -> Self {
        MockAdc {
            state: Rc::new(RefCell::new(AdcState {
                channels: vec![3.85; count],
                script: VecDeque::new(),
                awake: true,
                configured: None,
                calibrated: false,
                reads: 0,
            })),
        }
    }

    fn channels_for(wiring: &Wiring, cells: &[f64; CELL_COUNT]) -> Vec<f64> {
        let mut channels = vec![0.0; MOCK_ADC_CHANNELS.max(wiring.highest_channel() + 1)];
        for (cell, &v) in cells.iter().enumerate() {
            channels[wiring.channel(cell)] = v;
        }
        channels
    }

    /// Steady cell voltages returned once any scripted reads are used up
    pub fn set_cells(&self, wiring: &Wiring, cells: &[f64; CELL_COUNT]) {
        self.state.borrow_mut().channels = Self::channels_for(wiring, cells);
    }

    /// Queue a one-off read ahead of the steady voltages
    pub fn queue_cells(&self, wiring: &Wiring, cells: &[f64; CELL_COUNT]) {
        self.state
            .borrow_mut()
            .script
            .push_back(Self::channels_for(wiring, cells));
    }

    pub fn is_awake(&self) -> bool {
        self.state.borrow().awake
    }

    pub fn configured(&self) -> Option<(u8, u8)> {
        self.state.borrow().configured
    }

    pub fn is_calibrated(&self) -> bool {
        self.state.borrow().calibrated
    }

    pub fn reads(&self) -> usize {
        self.state.borrow().reads
    }
}

impl AdcArray for MockAdc {
    fn wake(&mut self) -> Result<()> {
        self.state.borrow_mut().awake = true;
        Ok(())
    }

    fn configure(&mut self, gain: u8, reference: u8) -> Result<()> {
        self.state.borrow_mut().configured = Some((gain, reference));
        Ok(())
    }

    fn self_calibrate_offset(&mut self) -> Result<()> {
        self.state.borrow_mut().calibrated = true;
        Ok(())
    }

    fn read_all_channels(&mut self, _negative_input: u8, _positive_inputs: &[u8]) -> Result<Vec<f64>> {
        let mut state = self.state.borrow_mut();
        if !state.awake {
            return Err(BmsError::hardware("adc", "read while asleep"));
        }
        state.reads += 1;
        match state.script.pop_front() {
            Some(channels) => Ok(channels),
            None => Ok(state.channels.clone()),
        }
    }

    fn sleep(&mut self) -> Result<()> {
        self.state.borrow_mut().awake = false;
        Ok(())
    }
}

/// Expander bank remembering its last direction mask and output byte
#[derive(Debug, Clone)]
pub struct MockExpander {
    direction: Rc<Cell<u8>>,
    outputs: Rc<Cell<u8>>,
}

impl MockExpander {
    pub fn new() -> Self {
        MockExpander {
            direction: Rc::new(Cell::new(0xFF)),
            outputs: Rc::new(Cell::new(0)),
        }
    }

    pub fn direction(&self) -> u8 {
        self.direction.get()
    }

    pub fn outputs(&self) -> u8 {
        self.outputs.get()
    }
}

impl IoExpander for MockExpander {
    fn set_direction_mask(&mut self, mask: u8) -> Result<()> {
        self.direction.set(mask);
        Ok(())
    }

    fn write_outputs(&mut self, outputs: u8) -> Result<()> {
        self.outputs.set(outputs);
        Ok(())
    }
}

/// Thermistor with a settable raw count
#[derive(Debug, Clone)]
pub struct MockThermistor {
    raw: Rc<Cell<u16>>,
}

impl MockThermistor {
    pub fn new(raw: u16) -> Self {
        MockThermistor {
            raw: Rc::new(Cell::new(raw)),
        }
    }

    pub fn at_celsius(celsius: f64) -> Self {
        let sensor = Self::new(0);
        sensor.set_celsius(celsius);
        sensor
    }

    /// Program the raw count closest to `celsius`
    pub fn set_celsius(&self, celsius: f64) {
        let raw = ((celsius / 100.0) + 0.5) * 65536.0 / 3.3;
        self.raw.set(raw.round().clamp(0.0, u16::MAX as f64) as u16);
    }
}

impl TemperatureSensor for MockThermistor {
    fn read_raw(&mut self) -> Result<u16> {
        Ok(self.raw.get())
    }
}

/// MCU die sensor
#[derive(Debug, Clone)]
pub struct MockMcu {
    celsius: Rc<Cell<f64>>,
}

impl MockMcu {
    pub fn new(celsius: f64) -> Self {
        MockMcu {
            celsius: Rc::new(Cell::new(celsius)),
        }
    }

    pub fn set(&self, celsius: f64) {
        self.celsius.set(celsius);
    }
}

impl McuTemperature for MockMcu {
    fn celsius(&mut self) -> Result<f64> {
        Ok(self.celsius.get())
    }
}

/// Digital output recording every level written
#[derive(Debug, Clone, Default)]
pub struct MockOutput {
    history: Rc<RefCell<Vec<bool>>>,
}

impl MockOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Levels in the order they were written
    pub fn history(&self) -> Vec<bool> {
        self.history.borrow().clone()
    }

    /// Number of off-to-on transitions seen
    pub fn rising_edges(&self) -> usize {
        let history = self.history.borrow();
        let mut level = false;
        let mut edges = 0;
        for &on in history.iter() {
            if on && !level {
                edges += 1;
            }
            level = on;
        }
        edges
    }
}

impl DigitalOutput for MockOutput {
    fn set(&mut self, on: bool) -> Result<()> {
        self.history.borrow_mut().push(on);
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.history.borrow().last().copied().unwrap_or(false)
    }
}

/// Status LED remembering the last colour
#[derive(Debug, Clone, Default)]
pub struct MockIndicator {
    last: Rc<Cell<Option<Rgb>>>,
}

impl MockIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<Rgb> {
        self.last.get()
    }
}

impl StatusIndicator for MockIndicator {
    fn fill(&mut self, colour: Rgb) -> Result<()> {
        self.last.set(Some(colour));
        Ok(())
    }
}

/// Persistent store backed by a shared byte vector, all zero initially
#[derive(Debug, Clone)]
pub struct MockStore {
    bytes: Rc<RefCell<Vec<u8>>>,
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStore {
    pub fn new() -> Self {
        MockStore {
            bytes: Rc::new(RefCell::new(vec![0; 256])),
        }
    }

    pub fn byte(&self, address: usize) -> u8 {
        self.bytes.borrow().get(address).copied().unwrap_or(0)
    }
}

impl PersistentStore for MockStore {
    fn read_byte(&mut self, address: usize) -> Result<u8> {
        self.bytes
            .borrow()
            .get(address)
            .copied()
            .ok_or_else(|| BmsError::hardware("store", format!("address {} out of range", address)))
    }

    fn write_byte(&mut self, address: usize, value: u8) -> Result<()> {
        let mut bytes = self.bytes.borrow_mut();
        match bytes.get_mut(address) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(BmsError::hardware("store", format!("address {} out of range", address))),
        }
    }
}

/// Host link with injectable receive bytes and a captured transmit buffer
#[derive(Debug, Clone, Default)]
pub struct MockLink {
    rx: Rc<RefCell<VecDeque<u8>>>,
    tx: Rc<RefCell<VecDeque<u8>>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Two ends of one cable: bytes written on one arrive on the other
    pub fn pair() -> (MockLink, MockLink) {
        let a_to_b = Rc::new(RefCell::new(VecDeque::new()));
        let b_to_a = Rc::new(RefCell::new(VecDeque::new()));
        (
            MockLink {
                rx: b_to_a.clone(),
                tx: a_to_b.clone(),
            },
            MockLink {
                rx: a_to_b,
                tx: b_to_a,
            },
        )
    }

    /// Queue bytes as if sent by the host
    pub fn inject(&self, data: &[u8]) {
        self.rx.borrow_mut().extend(data.iter().copied());
    }

    /// Bytes transmitted by the unit since the last call
    pub fn take_tx(&self) -> Vec<u8> {
        self.tx.borrow_mut().drain(..).collect()
    }
}

impl SerialLink for MockLink {
    fn read_byte(&mut self) -> Result<Option<u8>> {
        Ok(self.rx.borrow_mut().pop_front())
    }

    fn read_available(&mut self) -> Result<Vec<u8>> {
        let mut rx = self.rx.borrow_mut();
        let n = rx.len().min(RX_BUFFER_SIZE);
        Ok(rx.drain(..n).collect())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.tx.borrow_mut().extend(data.iter().copied());
        Ok(())
    }
}

/// Handles to every mock collaborator of one board
#[derive(Debug, Clone)]
pub struct MockBoard {
    pub adc: MockAdc,
    pub expanders: Vec<MockExpander>,
    pub thermistors: Vec<MockThermistor>,
    pub mcu: MockMcu,
    pub buzzer: MockOutput,
    pub relay: MockOutput,
    pub fan: MockOutput,
    pub indicator: MockIndicator,
    pub store: MockStore,
    pub link: MockLink,
}

impl Default for MockBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBoard {
    /// Balanced pack at 3.85 V per cell, board at 25 C, MCU at 30 C
    pub fn new() -> Self {
        MockBoard {
            adc: MockAdc::new(),
            expanders: (0..DRAIN_CAPACITY / BANK_WIDTH).map(|_| MockExpander::new()).collect(),
            thermistors: (0..THERMISTOR_COUNT)
                .map(|_| MockThermistor::at_celsius(25.0))
                .collect(),
            mcu: MockMcu::new(30.0),
            buzzer: MockOutput::new(),
            relay: MockOutput::new(),
            fan: MockOutput::new(),
            indicator: MockIndicator::new(),
            store: MockStore::new(),
            link: MockLink::new(),
        }
    }

    /// Fresh board sharing this one's persistent store, as after a power cycle
    pub fn power_cycled(&self) -> Self {
        MockBoard {
            store: self.store.clone(),
            ..Self::new()
        }
    }

    /// Steady cell voltages through the default wiring
    pub fn set_cells(&self, cells: &[f64; CELL_COUNT]) {
        self.adc.set_cells(&Wiring::default(), cells);
    }

    /// Queue a one-off cell read through the default wiring
    pub fn queue_cells(&self, cells: &[f64; CELL_COUNT]) {
        self.adc.queue_cells(&Wiring::default(), cells);
    }

    /// Set every thermistor and the MCU sensor to the same temperature
    pub fn set_board_temperature(&self, celsius: f64) {
        for sensor in &self.thermistors {
            sensor.set_celsius(celsius);
        }
        self.mcu.set(celsius);
    }

    /// Cells whose drain switch is currently closed
    pub fn draining_cells(&self) -> Vec<usize> {
        let mut cells = Vec::new();
        for (bank, expander) in self.expanders.iter().enumerate() {
            for bit in 0..BANK_WIDTH {
                if expander.outputs() & (1 << bit) != 0 {
                    cells.push(bank * BANK_WIDTH + bit);
                }
            }
        }
        cells
    }

    /// Boxed collaborators for the controller
    pub fn board(&self) -> Board {
        Board {
            adc: Box::new(self.adc.clone()),
            expanders: self
                .expanders
                .iter()
                .map(|e| Box::new(e.clone()) as Box<dyn IoExpander>)
                .collect(),
            thermistors: self
                .thermistors
                .iter()
                .map(|t| Box::new(t.clone()) as Box<dyn TemperatureSensor>)
                .collect(),
            mcu: Box::new(self.mcu.clone()),
            buzzer: Box::new(self.buzzer.clone()),
            relay: Box::new(self.relay.clone()),
            fan: Box::new(self.fan.clone()),
            indicator: Box::new(self.indicator.clone()),
            store: Box::new(self.store.clone()),
            link: Box::new(self.link.clone()),
        }
    }
}
