//! `bert-runtime` – orchestration of the Bert control stack.
//!
//! # Modules
//!
//! - [`dispatcher`] – the dispatch [`Hub`]: classifies peripheral requests,
//!   sends released entries downstream and routes replies back.  [`launch`]
//!   wires the whole system together.
//! - [`local`] – answers for requests no subsystem is needed for (metrics,
//!   locations, acknowledgements).
//! - [`metrics`] – EWMA cycle accounting behind the metric queries.
//! - [`internet`] – OpenAI-compatible client and worker for internet
//!   queries.
//! - [`telemetry`] – `tracing` subscriber and optional OTLP export.

pub mod dispatcher;
pub mod internet;
pub mod local;
pub mod metrics;
pub mod telemetry;

pub use dispatcher::{Hub, HubOptions, HubParts, READY_PHRASES, Running, Wiring, launch};
pub use internet::{InternetClient, InternetError, InternetService, InternetWorker};
pub use local::{Kinematics, LocalResponder, NoKinematics, RobotProfile};
pub use metrics::CycleMetrics;
