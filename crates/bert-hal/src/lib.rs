//! `bert-hal` – the motor-bus protocol engine.
//!
//! # Modules
//!
//! - [`conversions`] – engineering units to and from raw control-table words.
//! - [`codec`] – Dynamixel protocol 1 frame builders and status decoding.
//! - [`port`] – the [`SerialPort`] seam, a real tty port and a simulated
//!   chain of motors.
//! - [`engine`] – [`BusEngine`], one protocol state machine per serial bus.
//! - [`aggregator`] – [`BusAggregator`], fan-out to every engine and the
//!   counting barrier that merges their answers.
//!
//! # Data flow
//!
//! ```text
//! hub ──dispatch──► BusAggregator ──submit──► BusEngine (one per bus)
//!                        ▲                        │  frames ▼  ▲ bytes
//!                        └────── BusReply ────────┘     SerialPort
//! ```

pub mod aggregator;
pub mod codec;
pub mod conversions;
pub mod engine;
pub mod port;

pub use aggregator::{AggregatorHandle, BusAggregator, ContributionLedger, static_answer};
pub use engine::{BusEngine, BusReply, EngineHandle, EngineOptions, ReplyStyle};
pub use port::{ByteReceiver, DevicePort, SerialPort, SimHandle, SimulatedPort};
