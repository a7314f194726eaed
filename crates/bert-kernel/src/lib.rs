//! `bert-kernel` – pacing and safety.
//!
//! Nothing here talks to a motor.  These pieces decide *when* a request may
//! go out, *what* it expands into, and whether it may go out at all.
//!
//! # Modules
//!
//! - [`delay_queue`] – [`DelayQueue`]: time-ordered release with a pacing
//!   watermark between successive entries.
//! - [`sequencer`] – [`Sequencer`]: one lane per downstream subsystem, each
//!   owning a delay queue and holding back its next entry until the
//!   subsystem reports ready.  Also expands poses and actions.
//! - [`catalog`] – [`PoseCatalog`][catalog::PoseCatalog]: pose goals, action
//!   steps and follow-on actions, with an in-memory
//!   [`StaticCatalog`][catalog::StaticCatalog].
//! - [`validator`] – [`Validator`]: the rule engine the hub's local
//!   classifier runs so that out-of-range writes never reach a bus.
//! - [`watchdog`] – [`Watchdog`]: reports lanes whose subsystem has not
//!   answered within a threshold.

pub mod catalog;
pub mod delay_queue;
pub mod sequencer;
pub mod validator;
pub mod watchdog;

pub use catalog::{ActionStep, PoseCatalog, StaticCatalog};
pub use delay_queue::DelayQueue;
pub use sequencer::{Lane, Released, Sequencer, SequencerHandle};
pub use validator::{AngleLimitRule, CatalogRule, Rule, SpeedCapRule, TargetRule, Validator};
pub use watchdog::{LaneHealth, Watchdog};
