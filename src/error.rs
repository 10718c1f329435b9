//! Error types for BMS controller operations.

use thiserror::Error;

/// Result type alias for BMS operations.
pub type Result<T> = std::result::Result<T, BmsError>;

/// Error types for the BMS controller and its host link.
///
/// Battery faults (over-temperature, voltage limits, unstable readings) are
/// not errors; they change the operating mode. These variants cover
/// collaborator failures and malformed input.
#[derive(Error, Debug)]
pub enum BmsError {
    /// Serial port communication error
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A hardware collaborator reported a failure
    #[error("{device} failure: {reason}")]
    Hardware {
        /// Collaborator that failed
        device: &'static str,
        /// Description of the failure
        reason: String,
    },

    /// The wiring table is not a permutation of distinct channels
    #[error("Invalid wiring: {0}")]
    InvalidWiring(String),

    /// The ADC array returned fewer channels than the wiring references
    #[error("ADC channel {channel} missing ({available} channels read)")]
    MissingChannel {
        /// Physical channel requested by the wiring table
        channel: usize,
        /// Number of channels actually returned
        available: usize,
    },

    /// A write payload could not be decoded for its register
    #[error("Malformed payload {payload:?} for register {register}")]
    Payload {
        /// Register the payload was addressed to
        register: &'static str,
        /// Payload text as received
        payload: String,
    },

    /// Communication timeout (no response from the unit)
    #[error("Communication timeout")]
    Timeout,

    /// Unit rejected a write with the error byte
    #[error("Write to {register} rejected by unit")]
    Rejected {
        /// Register the write was addressed to
        register: &'static str,
    },

    /// Response text could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),
}

impl BmsError {
    /// Shorthand for a collaborator failure
    pub fn hardware(device: &'static str, reason: impl Into<String>) -> Self {
        BmsError::Hardware {
            device,
            reason: reason.into(),
        }
    }
}
