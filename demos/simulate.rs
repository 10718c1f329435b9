//! Simulation Example
//!
//! Runs the controller against mock hardware with an unbalanced pack:
//! - Switches the unit to Active over the (mock) command link
//! - Bleeds drained cells and lifts all cells while the charger relay is closed
//! - Stops when the unit returns to Idle or the simulated clock runs out
//! - Dumps the final status as JSON
//!
//! Usage:
//!   cargo run --example simulate
//!
//! Set RUST_LOG environment variable to control logging:
//!   RUST_LOG=debug cargo run --example simulate

use bms_control::constants::CELL_COUNT;
use bms_control::hardware::DigitalOutput;
use bms_control::mock::MockBoard;
use bms_control::protocol::Setting;
use bms_control::{Bms, Mode, Result};
use log::info;
use std::time::Duration;

/// Volts lost per simulated second by a draining cell
const BLEED_RATE: f64 = 0.0005;
/// Volts gained per simulated second by every cell while charging
const CHARGE_RATE: f64 = 0.0002;
const SIMULATED_LIMIT: Duration = Duration::from_secs(4 * 3600);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mock = MockBoard::new();
    let mut cells = [3.80; CELL_COUNT];
    for (i, v) in cells.iter_mut().enumerate() {
        *v += (i % 5) as f64 * 0.01;
    }
    mock.set_cells(&cells);

    let mut bms = Bms::new(mock.board())?;
    mock.link.take_tx();
    mock.link.inject(&Setting::Mode(Mode::Active).encode());

    let mut elapsed = Duration::ZERO;
    let mut started = false;
    while elapsed < SIMULATED_LIMIT {
        let outcome = bms.tick()?;
        started |= outcome.mode == Mode::Active;
        if started && outcome.mode != Mode::Active {
            break;
        }

        let seconds = outcome.wait.as_secs_f64();
        let draining = mock.draining_cells();
        let charging = mock.relay.is_on();
        for (i, v) in cells.iter_mut().enumerate() {
            if draining.contains(&i) {
                *v -= BLEED_RATE * seconds;
            }
            if charging {
                *v += CHARGE_RATE * seconds;
            }
        }
        mock.set_cells(&cells);
        elapsed += outcome.wait;
    }

    info!("Finished in {} simulated seconds, mode {}", elapsed.as_secs(), bms.mode());
    let report = bms.status_report();
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{}", json),
        Err(e) => log::error!("Could not serialize status: {}", e),
    }
    Ok(())
}
