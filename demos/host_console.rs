//! Host Console Example
//!
//! Interactive console for a unit attached over a serial port:
//! - Interactive serial port selection (or command-line argument)
//! - Telemetry reads (voltages, capacity, temperatures, status)
//! - Parameter writes (mode, limits, target voltage, verbosity)
//!
//! Usage:
//!   cargo run --example host_console                  # Interactive mode
//!   cargo run --example host_console -- /dev/ttyUSB0  # Specify port
//!
//! Set RUST_LOG environment variable to control logging:
//!   RUST_LOG=debug cargo run --example host_console

use bms_control::protocol::{Setting, WriteRegister};
use bms_control::{BmsClient, BmsError, Result};
use inquire::{Select, Text};
use log::{error, info};

const ACTIONS: &[&str] = &[
    "Read pack voltage",
    "Read capacity",
    "Read mean cell voltage",
    "Read cell voltages",
    "Read temperatures",
    "Read status",
    "Write parameter",
    "Quit",
];

/// Read timeouts to wait for a rejection; covers the unit's settle pause
const REJECTION_POLLS: usize = 60;

fn prompt_error(e: inquire::InquireError) -> BmsError {
    BmsError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("Selection cancelled: {}", e),
    ))
}

/// Interactive serial port selection using inquire
fn select_port() -> Result<String> {
    let ports = BmsClient::list_ports()?;

    if ports.is_empty() {
        eprintln!("No serial ports found!");
        std::process::exit(1);
    }

    let port_names: Vec<String> = ports
        .iter()
        .map(|p| format!("{} - {:?}", p.port_name, p.port_type))
        .collect();

    let selection = Select::new("Select a serial port:", port_names)
        .prompt()
        .map_err(prompt_error)?;

    // Port name is everything before " - "
    Ok(selection
        .split(" - ")
        .next()
        .unwrap_or(&selection)
        .to_string())
}

fn prompt_setting() -> Result<Setting> {
    let registers: Vec<&str> = (0..=8)
        .filter_map(WriteRegister::from_code)
        .map(WriteRegister::name)
        .collect();
    let name = Select::new("Parameter:", registers)
        .prompt()
        .map_err(prompt_error)?;
    let register = (0..=8)
        .filter_map(WriteRegister::from_code)
        .find(|r| r.name() == name)
        .ok_or_else(|| BmsError::Parse(name.to_string()))?;

    let value = Text::new("Value:").prompt().map_err(prompt_error)?;
    register.parse(value.as_bytes())
}

fn run_action(client: &mut BmsClient, action: &str) -> Result<()> {
    match action {
        "Read pack voltage" => info!("Pack voltage: {}V", client.pack_voltage()?),
        "Read capacity" => info!("Capacity: {}%", client.capacity()?),
        "Read mean cell voltage" => info!("Mean cell voltage: {}V", client.mean_voltage()?),
        "Read cell voltages" => {
            for (i, v) in client.cell_voltages()?.iter().enumerate() {
                info!("Cell_{}: {}V", i, v);
            }
        }
        "Read temperatures" => info!("Temperatures: {:?}", client.temperatures()?),
        "Read status" => {
            let state = if client.is_shutdown()? { "shut down" } else { "running" };
            info!("Unit is {}", state);
        }
        "Write parameter" => {
            let setting = prompt_setting()?;
            client.write_setting(setting, REJECTION_POLLS)?;
            info!("Wrote {:?}", setting);
        }
        _ => {}
    }
    Ok(())
}

fn main() -> Result<()> {
    // Initialize logger with default info level if RUST_LOG is not set
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let port_name = std::env::args()
        .nth(1)
        .map(Ok)
        .unwrap_or_else(select_port)?;

    info!("Connecting to unit on {}...", port_name);
    let mut client = BmsClient::open(&port_name)?;

    loop {
        let action = Select::new("Action:", ACTIONS.to_vec())
            .prompt()
            .map_err(prompt_error)?;
        if action == "Quit" {
            break;
        }
        // Errors from one request should not end the session
        if let Err(e) = run_action(&mut client, action) {
            error!("{}", e);
        }
    }

    Ok(())
}
