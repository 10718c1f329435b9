//! # BMS Control Library
//!
//! Control logic for a 20-cell series battery management unit. The library
//! samples cell voltages and board temperatures, validates readings, plans
//! charging and passive balancing, enforces voltage and thermal limits, and
//! answers a byte-oriented command protocol over a serial link.
//!
//! ## Features
//!
//! - Cell telemetry through a configurable wiring table
//! - Measurement validation with a persistent fault latch
//! - Charge/balance planning with a cap on concurrent drains
//! - Thermal monitoring with fan control and a hard shutdown ceiling
//! - Non-blocking tick loop: every pause is returned to the caller as a wait
//! - Host client for the serial command protocol
//!
//! ## Example
//!
//! ```no_run
//! use bms_control::mock::MockBoard;
//! use bms_control::Bms;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let board = MockBoard::new();
//!     let mut bms = Bms::new(board.board())?;
//!     let outcome = bms.tick()?;
//!     println!("Mode {} for {:?}", outcome.mode, outcome.wait);
//!     Ok(())
//! }
//! ```

pub mod constants;
pub mod controller;
pub mod error;
pub mod fault_latch;
pub mod hardware;
pub mod host;
pub mod link;
pub mod planner;
pub mod protocol;
pub mod telemetry;
pub mod thermal;
pub mod types;
pub mod validator;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use controller::Bms;
pub use error::{BmsError, Result};
pub use host::BmsClient;
pub use types::*;
