//! `bert-middleware` – peripheral plumbing.
//!
//! Moves envelopes between the hub and the outside world without caring
//! what they mean.
//!
//! # Modules
//!
//! - [`bus`] – [`ReplyBus`]: one broadcast lane per peripheral, used by the
//!   hub to deliver replies.
//! - [`network`] – [`NetworkPeripheral`]: WebSocket endpoint that accepts
//!   JSON envelopes from the tablet app and streams replies back.

pub mod bus;
pub mod network;

pub use bus::{ReplyBus, ReplyReceiver, Submitter};
pub use network::{NetworkPeripheral, parse_request};
