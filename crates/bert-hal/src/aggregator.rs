//! [`BusAggregator`] – fan-out to every bus engine and the counting barrier
//! that turns their answers back into one reply.
//!
//! Requests that configuration alone can answer (motor ids, types, offsets,
//! orientations and static limits) never reach a bus: see
//! [`static_answer`].  Everything else is handed to every engine.  Each
//! engine answers exactly once, in one of four [`ReplyStyle`]s:
//!
//! | Style | Counted | Forwarded |
//! |---|---|---|
//! | `Aggregated` | yes | when every bus has contributed |
//! | `Synthesized` | yes | when every bus has contributed |
//! | `Trivial` | yes | when every bus has contributed |
//! | `Single` | yes | immediately |
//!
//! The ledger entry for a request is retired once every bus has answered,
//! whichever style forwarded it.

use std::collections::HashMap;
use std::sync::Arc;

use bert_types::{
    BertError, Joint, JointProperty, MotorConfiguration, MotorRegistry, RequestEnvelope, RequestKind, Target,
    read_motor,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conversions;
use crate::engine::{BusReply, EngineHandle, ReplyStyle};

// ────────────────────────────────────────────────────────────────────────────
// Static answers
// ────────────────────────────────────────────────────────────────────────────

/// Properties held in configuration rather than read from a motor.
pub fn is_configuration_property(property: JointProperty) -> bool {
    property.is_static()
        || matches!(
            property,
            JointProperty::MaximumAngle
                | JointProperty::MinimumAngle
                | JointProperty::MaximumSpeed
                | JointProperty::MaximumTorque
        )
}

fn describe(mc: &MotorConfiguration, property: JointProperty) -> String {
    let joint = mc.joint.spoken();
    match property {
        JointProperty::Id => format!("The id of my {joint} is {}", mc.id),
        JointProperty::MotorType => format!("My {joint} is a dynamixel {}", mc.kind.spoken()),
        JointProperty::Offset => format!("The offset of my {joint} is {:.0} degrees", mc.offset),
        JointProperty::Orientation => format!(
            "The orientation of my {joint} is {}",
            if mc.direct { "direct" } else { "indirect" }
        ),
        JointProperty::MaximumAngle => format!("The maximum angle of my {joint} is {:.0} degrees", mc.max_angle),
        JointProperty::MinimumAngle => format!("The minimum angle of my {joint} is {:.0} degrees", mc.min_angle),
        JointProperty::MaximumSpeed => format!(
            "The maximum speed of my {joint} is {}",
            conversions::text_for_value(property, mc.max_speed)
        ),
        JointProperty::MaximumTorque => format!(
            "The maximum torque of my {joint} is {}",
            conversions::text_for_value(property, mc.max_torque)
        ),
        other => format!("The {} of my {joint} is unknown", other.spoken()),
    }
}

/// Answer `envelope` from configuration if it asks only for configured
/// values.  Returns `true` when the envelope has been answered (text or
/// error filled in) and needs no bus traffic.
pub fn static_answer(registry: &MotorRegistry, envelope: &mut RequestEnvelope) -> bool {
    match envelope.kind.clone() {
        RequestKind::GetMotorProperty(property) if is_configuration_property(property) => {
            let Some(joint) = envelope.joint() else {
                envelope.assign_error(format!("A joint is required to read its {}", property.spoken()));
                return true;
            };
            match registry.motor(joint) {
                Some(motor) => envelope.text = Some(describe(&read_motor(&motor), property)),
                None => envelope.assign_error(not_connected(joint)),
            }
            true
        }
        RequestKind::ListMotorProperty(property) if is_configuration_property(property) => {
            for motor in registry.all() {
                let mc = read_motor(&motor);
                info!(joint = %mc.joint, "{}", describe(&mc, property));
            }
            envelope.text = Some(format!("The {}s of all motors have been logged", property.spoken()));
            true
        }
        RequestKind::GetConfiguration => {
            for motor in registry.all() {
                let mc = read_motor(&motor);
                info!(
                    joint = %mc.joint,
                    bus = %mc.bus,
                    id = mc.id,
                    kind = mc.kind.spoken(),
                    direct = mc.direct,
                    offset = mc.offset,
                    min = mc.min_angle,
                    max = mc.max_angle,
                    "motor configuration"
                );
            }
            envelope.text = Some("Motor configuration parameters have been logged".to_string());
            true
        }
        RequestKind::SetMotorProperty { property, .. } if is_configuration_property(property) => {
            envelope.assign_error(format!("I cannot change a motor {}", property.spoken()));
            true
        }
        RequestKind::SetLimbProperty { property, .. } if is_configuration_property(property) => {
            envelope.assign_error(format!("I cannot change {} for all joints in the limb", property.spoken()));
            true
        }
        _ => false,
    }
}

fn not_connected(joint: Joint) -> String {
    format!("My {} is not connected to any motor bus", joint.spoken())
}

// ────────────────────────────────────────────────────────────────────────────
// Contribution ledger
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Entry {
    envelope: RequestEnvelope,
    contributions: usize,
    forwarded: bool,
}

/// Counting barrier keyed by request id.
#[derive(Debug)]
pub struct ContributionLedger {
    bus_count: usize,
    entries: HashMap<Uuid, Entry>,
}

impl ContributionLedger {
    pub fn new(bus_count: usize) -> Self {
        Self {
            bus_count,
            entries: HashMap::new(),
        }
    }

    /// Start waiting for contributions to `envelope`.
    pub fn open(&mut self, envelope: RequestEnvelope) {
        self.entries.insert(
            envelope.id,
            Entry {
                envelope,
                contributions: 0,
                forwarded: false,
            },
        );
    }

    /// Requests still waiting on at least one bus.
    pub fn open_count(&self) -> usize {
        self.entries.len()
    }

    /// Count one engine's answer.  Returns the envelope to forward, if this
    /// answer completes it.
    pub fn record(&mut self, reply: BusReply) -> Option<RequestEnvelope> {
        let id = reply.envelope.id;
        let Some(entry) = self.entries.get_mut(&id) else {
            warn!(bus = %reply.bus, request = %id, "reply for a request that is not pending");
            return None;
        };
        entry.contributions += 1;

        let mut forward = None;
        if reply.style == ReplyStyle::Single {
            if !entry.forwarded {
                entry.forwarded = true;
                forward = Some(reply.envelope);
            }
        } else {
            merge(&mut entry.envelope, &reply);
        }

        if entry.contributions >= self.bus_count
            && let Some(entry) = self.entries.remove(&id)
        {
            debug!(request = %id, contributions = entry.contributions, "barrier complete");
            if !entry.forwarded {
                forward = Some(finish(entry.envelope));
            }
        }
        forward
    }
}

fn merge(into: &mut RequestEnvelope, reply: &BusReply) {
    let from = &reply.envelope;
    if let Some(error) = from.error.as_deref().filter(|e| !e.is_empty()) {
        into.assign_error(error);
    }
    if into.text.is_none() {
        into.text = from.text.clone();
    }
    into.control.travel_time = into.control.travel_time.max(from.control.travel_time);
    if let Some(outstanding) = from.control.outstanding.get(&reply.bus) {
        into.control.outstanding.insert(reply.bus.clone(), *outstanding);
    }
}

/// Fill in what no single bus could: a summary for list reads, and an
/// error for a joint request no bus owned.
fn finish(mut envelope: RequestEnvelope) -> RequestEnvelope {
    match envelope.kind.clone() {
        RequestKind::GetMotorProperty(_)
        | RequestKind::SetMotorProperty { .. }
        | RequestKind::GetGoals
        | RequestKind::GetLimits => match envelope.joint() {
            Some(joint) => envelope.assign_error(not_connected(joint)),
            None => envelope.assign_error(format!("A joint is required for {}", envelope.kind.label())),
        },
        RequestKind::ListMotorProperty(property) if envelope.text.is_none() && !envelope.has_error() => {
            envelope.text = Some(match envelope.target {
                Target::Limb(limb) => format!("The {}s of my {} have been logged", property.spoken(), limb.spoken()),
                _ => format!("The {}s of all motors have been logged", property.spoken()),
            });
        }
        _ => {}
    }
    envelope
}

// ────────────────────────────────────────────────────────────────────────────
// BusAggregator task
// ────────────────────────────────────────────────────────────────────────────

/// Sender side of the aggregator's request queue.
#[derive(Clone, Debug)]
pub struct AggregatorHandle {
    tx: mpsc::Sender<RequestEnvelope>,
}

impl AggregatorHandle {
    pub async fn dispatch(&self, envelope: RequestEnvelope) -> Result<(), BertError> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| BertError::Channel("bus aggregator has stopped".into()))
    }
}

/// Single owner of the contribution ledger.
pub struct BusAggregator {
    registry: Arc<MotorRegistry>,
    engines: Vec<EngineHandle>,
    ledger: ContributionLedger,
    requests: mpsc::Receiver<RequestEnvelope>,
    replies: mpsc::Receiver<BusReply>,
    hub: mpsc::Sender<RequestEnvelope>,
}

impl BusAggregator {
    /// `replies` must be the receiving end of the channel every engine in
    /// `engines` answers on.  Finished envelopes are sent to `hub`.
    pub fn new(
        registry: Arc<MotorRegistry>,
        engines: Vec<EngineHandle>,
        replies: mpsc::Receiver<BusReply>,
        hub: mpsc::Sender<RequestEnvelope>,
    ) -> (Self, AggregatorHandle) {
        let (tx, requests) = mpsc::channel(64);
        let aggregator = Self {
            registry,
            ledger: ContributionLedger::new(engines.len()),
            engines,
            requests,
            replies,
            hub,
        };
        (aggregator, AggregatorHandle { tx })
    }

    pub async fn run(mut self) {
        info!(buses = self.engines.len(), "bus aggregator started");
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(envelope) => self.dispatch(envelope).await,
                    None => break,
                },
                Some(reply) = self.replies.recv() => {
                    if let Some(envelope) = self.ledger.record(reply) {
                        self.forward(envelope).await;
                    }
                }
            }
        }
        info!(pending = self.ledger.open_count(), "bus aggregator stopped");
    }

    async fn dispatch(&mut self, mut envelope: RequestEnvelope) {
        if static_answer(&self.registry, &mut envelope) {
            self.forward(envelope).await;
            return;
        }
        if self.engines.is_empty() {
            envelope.assign_error("No motor buses are configured");
            self.forward(envelope).await;
            return;
        }
        self.ledger.open(envelope.clone());
        for engine in &self.engines {
            if let Err(e) = engine.submit(envelope.clone()).await {
                // A dead engine still has to count toward the barrier.
                warn!(bus = %engine.bus(), error = %e, "could not hand request to bus engine");
                let mut failed = envelope.clone();
                failed.assign_error(e.to_string());
                let reply = BusReply {
                    bus: engine.bus().to_string(),
                    style: ReplyStyle::Aggregated,
                    envelope: failed,
                };
                if let Some(done) = self.ledger.record(reply) {
                    self.forward(done).await;
                }
            }
        }
    }

    async fn forward(&self, envelope: RequestEnvelope) {
        if self.hub.send(envelope).await.is_err() {
            warn!("dispatch hub has stopped, reply dropped");
        }
    }
}
