//! `bert-types` – shared vocabulary of the Bert control stack.
//!
//! # Modules
//!
//! - [`model`] – closed enumerations for joints, limbs, joint properties,
//!   commands, metrics, motor families and peripheral sources.
//! - [`envelope`] – [`RequestEnvelope`], the request/response value object
//!   that travels from a peripheral to the motor buses and back.
//! - [`motor`] – [`MotorConfiguration`] and the [`MotorRegistry`] that owns
//!   every configuration for the lifetime of the process.

pub mod envelope;
pub mod model;
pub mod motor;

use thiserror::Error;

pub use envelope::{ExecutionControl, JointGoal, RequestEnvelope, RequestKind, Target};
pub use model::{CommandKind, Joint, JointProperty, Limb, MetricKind, MotorKind, Source};
pub use motor::{MotorConfiguration, MotorRegistry, SharedMotor, read_motor, write_motor};

/// Errors raised anywhere in the stack.
///
/// Motor and protocol failures are normally written onto the envelope's
/// `error` field rather than propagated; these variants cover the cases
/// where a component itself cannot continue.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BertError {
    /// A request failed a limit or consistency check.
    #[error("Validation failed: {0}")]
    Validation(String),
    /// A motor or serial device reported a failure.
    #[error("Device fault on bus '{bus}': {details}")]
    Device { bus: String, details: String },
    /// Bytes on the wire could not be interpreted.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// A request or reply had nowhere to go.
    #[error("Routing error: {0}")]
    Routing(String),
    /// A name did not match any member of a closed enumeration.
    #[error("Parse error: {0}")]
    Parse(String),
    /// An internal channel was closed or had no receivers.
    #[error("Channel error: {0}")]
    Channel(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for BertError {
    fn from(e: std::io::Error) -> Self {
        BertError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_bus() {
        let err = BertError::Device {
            bus: "lower".into(),
            details: "Motor 12 encountered overheating".into(),
        };
        assert_eq!(
            err.to_string(),
            "Device fault on bus 'lower': Motor 12 encountered overheating"
        );
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no tty");
        let err: BertError = io.into();
        assert!(matches!(err, BertError::Io(msg) if msg.contains("no tty")));
    }
}
