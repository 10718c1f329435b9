//! Mode state machine and tick orchestration.
//!
//! `Bms::tick` runs one pass of the control loop and returns how long the
//! driver should wait before the next call. Pauses the hardware needs
//! (cell settling, balance windows, buzzer pulses) are expressed as phases
//! spread across calls rather than sleeps, so a call never blocks.
//!
//! A ready tick in Idle or Active runs, in order: drain push, telemetry
//! (validated in Active), voltage-limit scan, thermal scan, balancing
//! (Active) and protocol service. In Shutdown it runs the thermal scan,
//! the power-down actions and protocol service.

use crate::constants::*;
use crate::error::Result;
use crate::fault_latch::FaultLatch;
use crate::hardware::Board;
use crate::planner::{self, BalanceTarget, PlanOutcome, SettleStep, SettleTracker};
use crate::protocol::{self, Command, Setting, TelemetryView};
use crate::telemetry::CellTelemetry;
use crate::thermal;
use crate::types::*;
use crate::validator::MeasurementValidator;
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

/// Log at info when verbose output is enabled, at debug otherwise
macro_rules! diag {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            info!($($arg)+)
        } else {
            debug!($($arg)+)
        }
    };
}

/// Where the controller is inside a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Next call starts a fresh cycle
    Ready,
    /// Settle pause elapsed; next call measures and runs the Active cycle
    Settling,
    /// Charging/balancing; each call re-checks temperature
    Window { checks_left: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BuzzerStep {
    on: bool,
    hold: Duration,
}

/// The battery management controller
pub struct Bms {
    board: Board,
    config: Config,
    telemetry: CellTelemetry,
    validator: MeasurementValidator,
    latch: FaultLatch,
    pack: PackSnapshot,
    temperatures: TemperatureSet,
    drain: DrainPlan,
    settle: SettleTracker,
    phase: Phase,
    buzzer_steps: VecDeque<BuzzerStep>,
    /// Thermal alarm holds the buzzer on until the host changes mode
    alarm_latched: bool,
    adc_asleep: bool,
    previous_fault: bool,
}

impl Bms {
    /// Bring up a controller with the default wiring and configuration
    pub fn new(board: Board) -> Result<Self> {
        Self::with_config(board, Wiring::default(), Config::default())
    }

    /// Bring up the hardware and take the first measurement
    pub fn with_config(mut board: Board, wiring: Wiring, config: Config) -> Result<Self> {
        board.adc.wake()?;
        board.adc.configure(ADC_GAIN, ADC_REFERENCE)?;
        info!("Calibrating ADCs.");
        board.adc.self_calibrate_offset()?;

        for expander in board.expanders.iter_mut() {
            expander.set_direction_mask(0x00)?;
            expander.write_outputs(0x00)?;
        }

        board.link.write_all(&[READY_BYTE])?;

        let latch = FaultLatch::default();
        let previous_fault = latch.read_and_clear(board.store.as_mut())?;
        if previous_fault {
            warn!("A measurement error or severe battery error occurred during previous operation.");
        }

        let telemetry = CellTelemetry::new(wiring);
        let pack = telemetry.read_cells(board.adc.as_mut(), board.indicator.as_mut())?;

        Ok(Bms {
            validator: MeasurementValidator::new(&pack),
            board,
            config,
            telemetry,
            latch,
            pack,
            temperatures: TemperatureSet::default(),
            drain: DrainPlan::cleared(),
            settle: SettleTracker::default(),
            phase: Phase::Ready,
            buzzer_steps: VecDeque::new(),
            alarm_latched: false,
            adc_asleep: false,
            previous_fault,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    pub fn pack(&self) -> &PackSnapshot {
        &self.pack
    }

    pub fn temperatures(&self) -> &TemperatureSet {
        &self.temperatures
    }

    pub fn drain_plan(&self) -> &DrainPlan {
        &self.drain
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether the fault latch was set when this controller started
    pub fn previous_session_faulted(&self) -> bool {
        self.previous_fault
    }

    /// Serializable snapshot of the controller state
    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            timestamp: Utc::now(),
            config: self.config.clone(),
            pack: self.pack.clone(),
            temperatures: self.temperatures.clone(),
            draining: self.drain.draining_cells(),
            relay_closed: self.board.relay.is_on(),
            fan_on: self.board.fan.is_on(),
            alarm_on: self.board.buzzer.is_on(),
        }
    }

    /// Run one pass of the control loop
    pub fn tick(&mut self) -> Result<TickOutcome> {
        if let Some(step) = self.buzzer_steps.pop_front() {
            self.board.buzzer.set(step.on)?;
            return Ok(self.outcome(step.hold));
        }

        let wait = match self.phase {
            Phase::Window { checks_left } => self.window_step(checks_left)?,
            Phase::Settling => {
                self.phase = Phase::Ready;
                self.cycle()?
            }
            Phase::Ready => match self.config.mode {
                Mode::Active => {
                    self.push_drain()?;
                    diag!(self.config.verbose, "Allowing cells to settle...");
                    self.phase = Phase::Settling;
                    SETTLE_PAUSE
                }
                Mode::Idle => {
                    self.push_drain()?;
                    self.cycle()?
                }
                Mode::Shutdown => self.cycle()?,
            },
        };
        Ok(self.outcome(wait))
    }

    /// Drive the controller with real sleeps until `stop` returns true
    pub fn run_until<F>(&mut self, mut stop: F) -> Result<()>
    where
        F: FnMut(&Bms, &TickOutcome) -> bool,
    {
        loop {
            let outcome = self.tick()?;
            if stop(self, &outcome) {
                return Ok(());
            }
            thread::sleep(outcome.wait);
        }
    }

    fn outcome(&self, wait: Duration) -> TickOutcome {
        TickOutcome {
            wait,
            mode: self.config.mode,
        }
    }

    fn cycle(&mut self) -> Result<Duration> {
        if self.config.mode != Mode::Shutdown {
            if let Some(wait) = self.measure()? {
                return Ok(wait);
            }
        }

        let reading = thermal::read_temps(
            &mut self.board.thermistors,
            self.board.mcu.as_mut(),
            self.board.fan.as_mut(),
            &self.config,
        )?;
        diag!(
            self.config.verbose,
            "Board temperatures: {:?}",
            reading.temperatures.readings
        );
        self.temperatures = reading.temperatures;
        if reading.shutdown {
            self.thermal_trip()?;
        }

        let mut wait = IDLE_POLL;
        match self.config.mode {
            Mode::Active => {
                if self.temperatures.max() < self.config.max_temp {
                    wait = self.balance()?;
                    if let Phase::Window { .. } = self.phase {
                        return Ok(wait);
                    }
                } else {
                    info!("Unable to charge/balance due to high temperatures.");
                }
            }
            Mode::Shutdown => self.power_down()?,
            Mode::Idle => {}
        }

        self.serve_protocol()?;
        Ok(wait)
    }

    /// Telemetry, validation and the voltage-limit scan
    ///
    /// Returns a wait when a fault ended the cycle early.
    fn measure(&mut self) -> Result<Option<Duration>> {
        let validate = self.config.mode == Mode::Active;
        let telemetry = &self.telemetry;
        let adc = self.board.adc.as_mut();
        let indicator = self.board.indicator.as_mut();
        let measurement = self
            .validator
            .measure(validate, || telemetry.read_cells(&mut *adc, &mut *indicator))?;
        self.pack = measurement.snapshot;

        let verbose = self.config.verbose;
        if !measurement.stable {
            self.board.buzzer.set(true)?;
            self.latch.set(self.board.store.as_mut())?;
            self.change_mode(Mode::Shutdown);
            warn!(
                "Cell voltage changed rapidly between measurements. \
                 This could be due to a faulty measurement, or a severe battery issue. \
                 To avoid possible damage the BMS will shut down."
            );
        }
        diag!(verbose, "Mean change in voltage per cell: {}", measurement.mean_delta);
        diag!(verbose, "Battery voltage: {}v", self.pack.total_voltage);
        diag!(verbose, "Battery capacity: {}%", self.pack.capacity);

        if self.config.mode == Mode::Shutdown {
            return Ok(Some(IDLE_POLL));
        }
        self.board.buzzer.set(false)?;

        let mut violated = false;
        for (i, &v) in self.pack.cells.iter().enumerate() {
            if v > self.config.max_voltage {
                warn!(
                    "Cell_{} is above maximum voltage of {} at {}!",
                    i, self.config.max_voltage, v
                );
                violated = true;
            } else if v < self.config.min_voltage {
                warn!(
                    "Cell_{} is below minimum voltage of {} at {}!",
                    i, self.config.min_voltage, v
                );
                violated = true;
            }
        }
        if violated {
            self.change_mode(Mode::Shutdown);
            return self.pulse(FAULT_PULSE).map(Some);
        }

        diag!(
            verbose,
            "Minimum cell is Cell_{} with voltage of {}v.",
            self.pack.min_index,
            self.pack.min_voltage
        );
        diag!(
            verbose,
            "Maximum cell is Cell_{} with voltage of {}v.",
            self.pack.max_index,
            self.pack.max_voltage
        );
        diag!(verbose, "Mean cell voltage: {}v", self.pack.mean_voltage);
        diag!(verbose, "Cell voltage range: {}v", self.pack.spread());
        Ok(None)
    }

    fn thermal_trip(&mut self) -> Result<()> {
        warn!("Thermal shutdown.");
        self.board.buzzer.set(true)?;
        self.alarm_latched = true;
        self.change_mode(Mode::Shutdown);
        Ok(())
    }

    /// Plan and start one charge/balance step
    fn balance(&mut self) -> Result<Duration> {
        let verbose = self.config.verbose;
        match planner::plan(&self.pack, &self.config) {
            PlanOutcome::Misconfigured => {
                warn!("Target voltage exceeds acceptable voltage range, terminating charge/balance cycle.");
                self.board.relay.set(false)?;
                self.change_mode(Mode::Idle);
                self.drain = DrainPlan::cleared();
                self.push_drain()?;
                self.pulse(FAULT_PULSE)
            }
            PlanOutcome::Settled => match self.settle.observe() {
                SettleStep::Confirming(n) => {
                    info!("Confirming successful charge/balance [{}]...", n);
                    Ok(WINDOW_SLICE)
                }
                SettleStep::Complete => {
                    info!("Charge/balance complete!");
                    info!("All cells: {:?}", self.pack.cells);
                    info!("Switching to idle.");
                    self.change_mode(Mode::Idle);
                    let mut pattern = Vec::with_capacity(COMPLETION_CHIRPS * 2);
                    for _ in 0..COMPLETION_CHIRPS {
                        pattern.push((true, CHIRP));
                        pattern.push((false, CHIRP));
                    }
                    self.sound(&pattern)
                }
            },
            PlanOutcome::Working(work) => {
                self.settle.reset();
                if work.charge {
                    diag!(
                        verbose,
                        "Mean cell voltage is {}v less than target cell voltage of {}v.",
                        self.config.target_voltage - self.pack.mean_voltage,
                        self.config.target_voltage
                    );
                    info!("Charging...");
                    self.board.relay.set(true)?;
                }
                match work.target {
                    Some(BalanceTarget::LowestCell(_)) => {
                        diag!(
                            verbose,
                            "Cell voltage range is {}v more than {}v.",
                            self.pack.spread() - self.config.dv,
                            self.config.dv
                        );
                        info!("Balancing...");
                    }
                    Some(BalanceTarget::Nominal(_)) => {
                        diag!(
                            verbose,
                            "Mean cell voltage is {}v more than target cell voltage of {}v.",
                            self.pack.mean_voltage - self.config.target_voltage,
                            self.config.target_voltage
                        );
                        info!("Discharging...");
                    }
                    None => {}
                }
                self.drain = work.drain;
                self.push_drain()?;

                self.phase = Phase::Window {
                    checks_left: self.config.balance_window_seconds / WINDOW_SLICE.as_secs() as u32,
                };
                Ok(Duration::ZERO)
            }
        }
    }

    /// One temperature check inside a charge/balance window
    fn window_step(&mut self, checks_left: u32) -> Result<Duration> {
        if checks_left > 0 {
            let reading = thermal::read_temps(
                &mut self.board.thermistors,
                self.board.mcu.as_mut(),
                self.board.fan.as_mut(),
                &self.config,
            )?;
            self.temperatures = reading.temperatures;
            if reading.shutdown {
                self.thermal_trip()?;
            }
            if self.temperatures.max() > self.config.max_temp {
                info!("Temperature exceeded maximum permitted temperature while balancing.");
            } else {
                self.phase = Phase::Window {
                    checks_left: checks_left - 1,
                };
                return Ok(WINDOW_SLICE);
            }
        }

        // Window over: open everything, re-plan from fresh telemetry next tick
        self.phase = Phase::Ready;
        self.drain = DrainPlan::cleared();
        self.push_drain()?;
        self.board.relay.set(false)?;
        self.serve_protocol()?;
        Ok(IDLE_POLL)
    }

    fn power_down(&mut self) -> Result<()> {
        if !self.alarm_latched {
            self.board.buzzer.set(false)?;
        }
        self.board.relay.set(false)?;
        self.drain = DrainPlan::cleared();
        self.push_drain()?;
        if !self.adc_asleep {
            self.board.adc.sleep()?;
            self.adc_asleep = true;
        }
        Ok(())
    }

    fn push_drain(&mut self) -> Result<()> {
        planner::push_plan(&self.drain, &mut self.board.expanders)
    }

    /// Play a buzzer pattern; the first step starts now
    fn sound(&mut self, pattern: &[(bool, Duration)]) -> Result<Duration> {
        let mut steps = pattern.iter().map(|&(on, hold)| BuzzerStep { on, hold });
        let first = match steps.next() {
            Some(step) => step,
            None => return Ok(Duration::ZERO),
        };
        self.buzzer_steps.extend(steps);
        self.board.buzzer.set(first.on)?;
        Ok(first.hold)
    }

    fn pulse(&mut self, length: Duration) -> Result<Duration> {
        self.sound(&[(true, length), (false, Duration::ZERO)])
    }

    fn change_mode(&mut self, mode: Mode) {
        if self.config.mode != mode {
            self.settle.reset();
        }
        self.config.mode = mode;
    }

    fn serve_protocol(&mut self) -> Result<()> {
        let verbose = self.config.verbose;
        match protocol::receive(self.board.link.as_mut())? {
            None => {}
            Some(Command::Write(register, Ok(setting))) => {
                self.apply_setting(setting)?;
                diag!(self.config.verbose, "Set {} to {:?}", register.name(), setting);
            }
            Some(Command::Write(register, Err(e))) => {
                self.board.link.write_all(&[ERROR_BYTE])?;
                diag!(verbose, "UART command was formatted incorrectly. Discarding. ({})", e);
                debug!(target: "bms_control::uart", "Rejected write to {}", register.name());
            }
            Some(Command::Read(register)) => {
                let view = TelemetryView {
                    pack: &self.pack,
                    temperatures: &self.temperatures,
                    mode: self.config.mode,
                };
                let response = protocol::encode_response(register, &view);
                self.board.link.write_all(&response)?;
                diag!(verbose, "Sent {}.", register.name());
            }
            Some(Command::Unknown(header)) => {
                debug!(target: "bms_control::uart", "Ignoring unknown command {}", header);
            }
        }
        Ok(())
    }

    fn apply_setting(&mut self, setting: Setting) -> Result<()> {
        let mode = match setting {
            Setting::Mode(mode) => mode,
            other => {
                other.apply(&mut self.config);
                return Ok(());
            }
        };

        if mode != Mode::Shutdown {
            self.alarm_latched = false;
            if self.adc_asleep {
                self.board.adc.wake()?;
                self.adc_asleep = false;
                let pack = self
                    .telemetry
                    .read_cells(self.board.adc.as_mut(), self.board.indicator.as_mut())?;
                self.validator = MeasurementValidator::new(&pack);
                self.pack = pack;
            }
        }
        self.change_mode(mode);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::DigitalOutput;
    use crate::mock::MockBoard;

    fn controller(mock: &MockBoard) -> Bms {
        Bms::new(mock.board()).unwrap()
    }

    fn write(mock: &MockBoard, header: u8, payload: &str) {
        mock.link.inject(&[header]);
        mock.link.inject(payload.as_bytes());
    }

    #[test]
    fn test_startup_sequence() {
        let mock = MockBoard::new();
        let bms = controller(&mock);

        assert_eq!(mock.adc.configured(), Some((ADC_GAIN, ADC_REFERENCE)));
        assert!(mock.adc.is_calibrated());
        for expander in &mock.expanders {
            assert_eq!(expander.direction(), 0x00);
            assert_eq!(expander.outputs(), 0x00);
        }
        assert_eq!(mock.link.take_tx(), vec![READY_BYTE]);
        assert_eq!(bms.mode(), Mode::Idle);
        assert!(!bms.previous_session_faulted());
        assert!(mock.indicator.last().is_some());
    }

    #[test]
    fn test_idle_tick_serves_reads() {
        let mock = MockBoard::new();
        let mut bms = controller(&mock);
        mock.link.take_tx();

        mock.link.inject(&[6]);
        let outcome = bms.tick().unwrap();
        assert_eq!(outcome.mode, Mode::Idle);
        assert_eq!(outcome.wait, IDLE_POLL);
        assert_eq!(mock.link.take_tx(), b"0");
        assert_eq!(bms.temperatures().readings.len(), THERMISTOR_COUNT + 1);
    }

    #[test]
    fn test_active_tick_settles_before_measuring() {
        let mock = MockBoard::new();
        let mut bms = controller(&mock);
        write(&mock, 128, "1");
        bms.tick().unwrap();
        assert_eq!(bms.mode(), Mode::Active);

        let reads = mock.adc.reads();
        let outcome = bms.tick().unwrap();
        assert_eq!(outcome.wait, SETTLE_PAUSE);
        assert_eq!(bms.phase(), Phase::Settling);
        assert_eq!(mock.adc.reads(), reads);

        bms.tick().unwrap();
        assert!(mock.adc.reads() > reads);
    }

    #[test]
    fn test_voltage_limit_forces_shutdown_with_pulse() {
        let mock = MockBoard::new();
        let mut bms = controller(&mock);
        let mut cells = [3.85; CELL_COUNT];
        cells[5] = 4.30;
        mock.set_cells(&cells);

        let outcome = bms.tick().unwrap();
        assert_eq!(outcome.mode, Mode::Shutdown);
        assert_eq!(outcome.wait, FAULT_PULSE);
        assert!(mock.buzzer.is_on());

        let outcome = bms.tick().unwrap();
        assert_eq!(outcome.wait, Duration::ZERO);
        assert!(!mock.buzzer.is_on());

        bms.tick().unwrap();
        assert!(!mock.adc.is_awake());
        assert!(!mock.relay.is_on());
    }

    #[test]
    fn test_low_cell_forces_shutdown_with_pulse() {
        let mock = MockBoard::new();
        let mut bms = controller(&mock);
        let mut cells = [3.85; CELL_COUNT];
        cells[12] = 3.30;
        mock.set_cells(&cells);

        let outcome = bms.tick().unwrap();
        assert_eq!(outcome.mode, Mode::Shutdown);
        assert_eq!(outcome.wait, FAULT_PULSE);
        assert!(mock.buzzer.is_on());

        assert_eq!(bms.tick().unwrap().wait, Duration::ZERO);
        assert!(!mock.buzzer.is_on());
        assert_eq!(mock.buzzer.rising_edges(), 1);
        assert_eq!(mock.store.byte(FAULT_LATCH_ADDRESS), 0);
    }

    #[test]
    fn test_thermal_trip_holds_alarm_until_mode_written() {
        let mock = MockBoard::new();
        let mut bms = controller(&mock);
        mock.set_board_temperature(101.0);

        let outcome = bms.tick().unwrap();
        assert_eq!(outcome.mode, Mode::Shutdown);
        assert!(mock.buzzer.is_on());
        assert!(mock.fan.is_on());

        bms.tick().unwrap();
        assert!(mock.buzzer.is_on());

        mock.set_board_temperature(25.0);
        write(&mock, 128, "0");
        bms.tick().unwrap();
        assert_eq!(bms.mode(), Mode::Idle);
        assert!(mock.adc.is_awake());

        bms.tick().unwrap();
        assert!(!mock.buzzer.is_on());
    }

    #[test]
    fn test_malformed_write_answers_error_byte() {
        let mock = MockBoard::new();
        let mut bms = controller(&mock);
        mock.link.take_tx();

        write(&mock, 129, "abc");
        bms.tick().unwrap();
        assert_eq!(mock.link.take_tx(), vec![ERROR_BYTE]);
        assert_eq!(bms.config().max_temp, 80.0);
    }

    #[test]
    fn test_successful_write_is_silent() {
        let mock = MockBoard::new();
        let mut bms = controller(&mock);
        mock.link.take_tx();

        write(&mock, 134, "0.02");
        bms.tick().unwrap();
        assert!(mock.link.take_tx().is_empty());
        assert_eq!(bms.config().dv, 0.02);
    }

    #[test]
    fn test_misconfigured_target_returns_to_idle() {
        let mock = MockBoard::new();
        let mut bms = controller(&mock);
        write(&mock, 133, "4.5");
        bms.tick().unwrap();
        write(&mock, 128, "1");
        bms.tick().unwrap();

        bms.tick().unwrap(); // settle
        let outcome = bms.tick().unwrap();
        assert_eq!(outcome.mode, Mode::Idle);
        assert_eq!(outcome.wait, FAULT_PULSE);
        assert!(mock.buzzer.is_on());
        assert!(!mock.relay.is_on());
        assert!(mock.draining_cells().is_empty());
        assert!(bms.drain_plan().draining_cells().is_empty());
    }

    #[test]
    fn test_verbose_flag_written_over_protocol() {
        let mock = MockBoard::new();
        let mut bms = controller(&mock);
        write(&mock, 136, "1");
        bms.tick().unwrap();
        assert!(bms.config().verbose);
    }

    #[test]
    fn test_run_until_stops_without_sleeping_past_predicate() {
        let mock = MockBoard::new();
        let mut bms = controller(&mock);
        let mut ticks = 0;
        bms.run_until(|_, _| {
            ticks += 1;
            ticks == 3
        })
        .unwrap();
        assert_eq!(ticks, 3);
    }

    #[test]
    fn test_status_report_serializes() {
        let mock = MockBoard::new();
        let mut bms = controller(&mock);
        bms.tick().unwrap();
        let report = bms.status_report();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["config"]["mode"], "Idle");
        assert_eq!(json["draining"].as_array().unwrap().len(), 0);
        assert_eq!(json["temperatures"]["readings"].as_array().unwrap().len(), 5);
    }
}
