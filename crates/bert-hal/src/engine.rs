//! [`BusEngine`] – the protocol state machine for one serial bus.
//!
//! Each engine runs as its own task.  It services its request queue
//! strictly in arrival order: a request is encoded into frames, the frames
//! are written with a minimum spacing, and the engine then waits until every
//! expected status reply has arrived (or the reply timeout passes) before it
//! looks at the next request.
//!
//! Byte arrival is a second input to the same task, so the reassembly
//! buffer and the outstanding-reply count have a single owner.  The
//! synchronous half of the engine lives in [`EngineCore`], which is where
//! the framing rules are tested.
//!
//! Every fanned-out request is answered exactly once per engine.  Requests
//! that address no motor on this bus get an immediate
//! [`ReplyStyle::Trivial`] answer so that the aggregator's barrier always
//! completes.

use std::sync::Arc;
use std::time::Duration;

use bert_types::{
    BertError, CommandKind, Joint, JointGoal, JointProperty, MotorConfiguration, MotorRegistry, RequestEnvelope,
    RequestKind, Target, read_motor, write_motor,
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{self, HEADER};
use crate::conversions::{self, raw_to_degree, raw_to_speed, raw_to_torque, raw_to_torque_limit, word};
use crate::port::{ByteReceiver, SerialPort};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// How an engine's answer should be counted by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStyle {
    /// A partial result; forwarded once every bus has contributed.
    Aggregated,
    /// A write the devices never acknowledge, answered once it was sent.
    Synthesized,
    /// The only bus that could answer; forwarded without waiting.
    Single,
    /// Nothing on this bus was addressed.
    Trivial,
}

/// One engine's answer to one request.
#[derive(Debug, Clone)]
pub struct BusReply {
    pub bus: String,
    pub style: ReplyStyle,
    pub envelope: RequestEnvelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Writing,
    AwaitingReply,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Minimum time between two writes on the bus.
    pub write_spacing: Duration,
    /// How long to wait for outstanding status replies before failing the
    /// request.
    pub reply_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            write_spacing: Duration::from_millis(100),
            reply_timeout: Duration::from_secs(1),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Frame reassembly
// ────────────────────────────────────────────────────────────────────────────

/// Joins arbitrarily split byte chunks back into whole frames.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    leftover: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every frame now complete.  Leading bytes
    /// that cannot start a frame are dropped; an incomplete tail is kept
    /// for the next call.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.leftover.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            let Some(start) = codec::legal_start(&self.leftover) else {
                // A lone trailing 0xFF may be the first half of a header.
                let keep = usize::from(self.leftover.last() == Some(&HEADER));
                let cut = self.leftover.len() - keep;
                if cut > 0 {
                    warn!(dropped = cut, "no frame start in received bytes, discarded");
                    self.leftover.drain(..cut);
                }
                break;
            };
            if start > 0 {
                warn!(dropped = start, "discarded bytes ahead of frame start");
                self.leftover.drain(..start);
            }
            let Some(len) = codec::message_length(&self.leftover) else {
                break;
            };
            if len < 6 {
                warn!(declared = len, "impossible frame length, resynchronizing");
                self.leftover.drain(..2);
                continue;
            }
            if self.leftover.len() < len {
                break;
            }
            frames.push(self.leftover.drain(..len).collect());
        }
        frames
    }

    pub fn pending(&self) -> usize {
        self.leftover.len()
    }

    pub fn clear(&mut self) {
        self.leftover.clear();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Planning
// ────────────────────────────────────────────────────────────────────────────

/// How to interpret the parameters of each expected status reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decode {
    Acknowledge,
    Property(JointProperty),
    Goals,
    Limits,
}

/// A value to record on a motor once the request has succeeded.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Update {
    joint: Joint,
    property: JointProperty,
    value: f64,
}

/// Everything needed to put one request on the wire.
#[derive(Debug)]
pub struct Plan {
    envelope: RequestEnvelope,
    style: ReplyStyle,
    frames: Vec<Vec<u8>>,
    expected: u32,
    decode: Decode,
    updates: Vec<Update>,
}

impl Plan {
    fn new(envelope: RequestEnvelope, style: ReplyStyle) -> Self {
        Self {
            envelope,
            style,
            frames: Vec::new(),
            expected: 0,
            decode: Decode::Acknowledge,
            updates: Vec::new(),
        }
    }

    fn failed(mut envelope: RequestEnvelope, style: ReplyStyle, error: BertError) -> Self {
        envelope.assign_error(error_text(error));
        Self::new(envelope, style)
    }

    pub fn style(&self) -> ReplyStyle {
        self.style
    }

    pub fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }
}

fn error_text(error: BertError) -> String {
    match error {
        BertError::Validation(msg) | BertError::Protocol(msg) => msg,
        other => other.to_string(),
    }
}

fn selects(target: &Target, mc: &MotorConfiguration) -> bool {
    match target {
        Target::None | Target::All => true,
        Target::Joint(joint) => mc.joint == *joint,
        Target::Limb(limb) => mc.limb == *limb,
        Target::Bus(bus) => mc.bus == *bus,
    }
}

#[derive(Debug)]
struct InFlight {
    envelope: RequestEnvelope,
    style: ReplyStyle,
    expected: u32,
    remaining: u32,
    decode: Decode,
    updates: Vec<Update>,
    deadline: Instant,
}

// ────────────────────────────────────────────────────────────────────────────
// EngineCore
// ────────────────────────────────────────────────────────────────────────────

/// The synchronous state of a bus engine: planning, reassembly and reply
/// accounting.  Owns no I/O.
pub struct EngineCore {
    bus: String,
    registry: Arc<MotorRegistry>,
    assembler: FrameAssembler,
    in_flight: Option<InFlight>,
    state: EngineState,
}

impl EngineCore {
    pub fn new(bus: impl Into<String>, registry: Arc<MotorRegistry>) -> Self {
        Self {
            bus: bus.into(),
            registry,
            assembler: FrameAssembler::new(),
            in_flight: None,
            state: EngineState::Idle,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().map(|f| f.deadline)
    }

    /// Snapshot of the motors on this bus selected by `target`.
    fn motors(&self, target: &Target) -> Vec<MotorConfiguration> {
        self.registry
            .motors_on_bus(&self.bus)
            .iter()
            .map(|m| read_motor(m).clone())
            .filter(|mc| selects(target, mc))
            .collect()
    }

    /// The configuration of `joint` if it is wired to this bus.
    fn own_motor(&self, joint: Joint) -> Option<MotorConfiguration> {
        self.registry
            .motor(joint)
            .map(|m| read_motor(&m).clone())
            .filter(|mc| mc.bus == self.bus)
    }

    /// Encode `envelope` for this bus.
    pub fn plan(&self, envelope: RequestEnvelope) -> Plan {
        let kind = envelope.kind.clone();
        match kind {
            RequestKind::Command(CommandKind::Reset) => Plan::new(envelope, ReplyStyle::Synthesized),
            RequestKind::Command(CommandKind::Freeze) => self.plan_torque(envelope, true),
            RequestKind::Command(CommandKind::Relax) => self.plan_torque(envelope, false),
            RequestKind::GetMotorProperty(property) => self.plan_single(envelope, |mc| {
                Ok((codec::get_property(mc, property)?, Decode::Property(property), Vec::new()))
            }),
            RequestKind::SetMotorProperty { property, value } => self.plan_single(envelope, |mc| {
                let (frame, _) = codec::set_property(mc, property, value)?;
                let value = match property {
                    JointProperty::Angle => conversions::clamp_angle(mc, value),
                    _ => value,
                };
                let update = Update { joint: mc.joint, property, value };
                Ok((frame, Decode::Acknowledge, vec![update]))
            }),
            RequestKind::GetGoals => {
                self.plan_single(envelope, |mc| Ok((codec::get_goals(mc.id), Decode::Goals, Vec::new())))
            }
            RequestKind::GetLimits => {
                self.plan_single(envelope, |mc| Ok((codec::get_limits(mc.id), Decode::Limits, Vec::new())))
            }
            RequestKind::ListMotorProperty(property) => self.plan_list(envelope, property),
            RequestKind::SetLimbProperty { property, value } => self.plan_limb(envelope, property, value),
            RequestKind::InitializeJoints => self.plan_initialize(envelope),
            RequestKind::ExecutePose { goals, .. } => self.plan_pose(envelope, &goals),
            _ => Plan::new(envelope, ReplyStyle::Trivial),
        }
    }

    fn plan_single<F>(&self, envelope: RequestEnvelope, encode: F) -> Plan
    where
        F: FnOnce(&MotorConfiguration) -> Result<(Vec<u8>, Decode, Vec<Update>), BertError>,
    {
        let Some(mc) = envelope.joint().and_then(|j| self.own_motor(j)) else {
            return Plan::new(envelope, ReplyStyle::Trivial);
        };
        match encode(&mc) {
            Ok((frame, decode, updates)) => Plan {
                envelope,
                style: ReplyStyle::Single,
                frames: vec![frame],
                expected: 1,
                decode,
                updates,
            },
            Err(e) => Plan::failed(envelope, ReplyStyle::Single, e),
        }
    }

    fn plan_list(&self, envelope: RequestEnvelope, property: JointProperty) -> Plan {
        let motors = self.motors(&envelope.target);
        if motors.is_empty() {
            return Plan::new(envelope, ReplyStyle::Trivial);
        }
        match codec::list_property(&motors, property) {
            Ok(frames) => Plan {
                envelope,
                style: ReplyStyle::Aggregated,
                frames,
                expected: motors.len() as u32,
                decode: Decode::Property(property),
                updates: Vec::new(),
            },
            Err(e) => Plan::failed(envelope, ReplyStyle::Aggregated, e),
        }
    }

    fn plan_limb(&self, envelope: RequestEnvelope, property: JointProperty, value: f64) -> Plan {
        let motors = self.motors(&envelope.target);
        if motors.is_empty() {
            return Plan::new(envelope, ReplyStyle::Trivial);
        }
        match codec::sync_set_property(&motors, property, value) {
            Ok(frame) => {
                let mut plan = Plan::new(envelope, ReplyStyle::Synthesized);
                plan.frames.extend(frame);
                plan.updates = motors
                    .iter()
                    .map(|mc| Update {
                        joint: mc.joint,
                        property,
                        value: match property {
                            JointProperty::Angle => conversions::clamp_angle(mc, value),
                            _ => value,
                        },
                    })
                    .collect();
                plan
            }
            Err(e) => Plan::failed(envelope, ReplyStyle::Synthesized, e),
        }
    }

    /// FREEZE holds every motor at its last read position and engages
    /// torque; RELAX releases torque.
    fn plan_torque(&self, envelope: RequestEnvelope, enable: bool) -> Plan {
        let motors = self.motors(&envelope.target);
        if motors.is_empty() {
            return Plan::new(envelope, ReplyStyle::Trivial);
        }
        let value = if enable { 1.0 } else { 0.0 };
        let mut plan = Plan::new(envelope, ReplyStyle::Synthesized);
        if enable {
            let holds: Vec<(&MotorConfiguration, f64)> = motors.iter().map(|mc| (mc, mc.position)).collect();
            plan.frames.extend(codec::sync_positions(&holds));
        }
        match codec::sync_set_property(&motors, JointProperty::State, value) {
            Ok(frame) => plan.frames.extend(frame),
            Err(e) => plan.envelope.assign_error(error_text(e)),
        }
        plan.updates = motors
            .iter()
            .map(|mc| Update { joint: mc.joint, property: JointProperty::State, value })
            .collect();
        plan
    }

    fn plan_initialize(&self, envelope: RequestEnvelope) -> Plan {
        let motors = self.motors(&Target::All);
        if motors.is_empty() {
            return Plan::new(envelope, ReplyStyle::Trivial);
        }
        let (frame, moves) = codec::initialize_positions(&motors);
        let mut plan = Plan::new(envelope, ReplyStyle::Synthesized);
        plan.frames.extend(frame);
        plan.updates = moves
            .into_iter()
            .map(|(index, angle)| Update {
                joint: motors[index].joint,
                property: JointProperty::Angle,
                value: angle,
            })
            .collect();
        plan
    }

    fn plan_pose(&self, envelope: RequestEnvelope, goals: &[JointGoal]) -> Plan {
        let motors: Vec<MotorConfiguration> = self
            .motors(&Target::All)
            .into_iter()
            .filter(|mc| goals.iter().any(|g| g.joint == mc.joint))
            .collect();
        if motors.is_empty() {
            return Plan::new(envelope, ReplyStyle::Trivial);
        }
        let mut plan = Plan::new(envelope, ReplyStyle::Synthesized);
        plan.frames = codec::set_pose(&motors, goals);
        for mc in &motors {
            let Some(goal) = goals.iter().find(|g| g.joint == mc.joint) else {
                continue;
            };
            if let Some(torque) = goal.torque {
                plan.updates.push(Update { joint: mc.joint, property: JointProperty::Torque, value: torque });
            }
            if let Some(speed) = goal.speed {
                plan.updates.push(Update { joint: mc.joint, property: JointProperty::Speed, value: speed });
            }
            plan.updates.push(Update {
                joint: mc.joint,
                property: JointProperty::Angle,
                value: conversions::clamp_angle(mc, goal.angle),
            });
        }
        plan
    }

    // ── Reply accounting ────────────────────────────────────────────────────

    /// Wait for the replies `plan` expects, or complete it at once when it
    /// expects none.
    pub fn begin(&mut self, plan: Plan, deadline: Instant) -> Option<BusReply> {
        let Plan { mut envelope, style, expected, decode, updates, .. } = plan;
        envelope.control.outstanding.insert(self.bus.clone(), expected);
        self.in_flight = Some(InFlight {
            envelope,
            style,
            expected,
            remaining: expected,
            decode,
            updates,
            deadline,
        });
        if expected == 0 {
            return self.complete();
        }
        self.state = EngineState::AwaitingReply;
        None
    }

    /// Feed bytes from the device.  Returns the finished reply once the last
    /// expected status has been consumed.
    pub fn on_bytes(&mut self, bytes: &[u8]) -> Option<BusReply> {
        let mut finished = None;
        for frame in self.assembler.push(bytes) {
            if let Some(reply) = self.on_frame(&frame) {
                finished = Some(reply);
            }
        }
        finished
    }

    fn on_frame(&mut self, frame: &[u8]) -> Option<BusReply> {
        let Some(flight) = self.in_flight.as_mut() else {
            warn!(bus = %self.bus, frame = %codec::dump(frame), "status frame with no request in flight");
            return None;
        };
        match codec::parse_status(frame) {
            Err(e) => flight.envelope.assign_error(error_text(e)),
            Ok(status) => {
                if let Some(message) = status.error_message() {
                    warn!(bus = %self.bus, id = status.id, error = status.error, "{message}");
                    flight.envelope.assign_error(message);
                } else {
                    decode_status(&self.registry, &self.bus, flight, &status);
                }
            }
        }
        flight.remaining = flight.remaining.saturating_sub(1);
        flight.envelope.control.outstanding.insert(self.bus.clone(), flight.remaining);
        if flight.remaining == 0 {
            return self.complete();
        }
        None
    }

    /// Fail the request in flight if its replies are overdue.
    pub fn expire(&mut self, now: Instant) -> Option<BusReply> {
        let flight = self.in_flight.as_mut()?;
        if now < flight.deadline {
            return None;
        }
        let message = format!(
            "The {} bus answered {} of {} status requests",
            self.bus,
            flight.expected - flight.remaining,
            flight.expected
        );
        warn!(bus = %self.bus, "{message}");
        flight.envelope.assign_error(message);
        self.assembler.clear();
        self.complete()
    }

    /// Retire the request in flight.  Writes take effect on the shared
    /// configuration only if nothing went wrong.
    fn complete(&mut self) -> Option<BusReply> {
        let InFlight { mut envelope, style, updates, .. } = self.in_flight.take()?;
        self.state = EngineState::Idle;
        if !envelope.has_error() {
            let mut travel = Duration::ZERO;
            for update in updates {
                let Some(motor) = self.registry.motor(update.joint) else {
                    continue;
                };
                let mut mc = write_motor(&motor);
                conversions::apply_value(&mut mc, update.property, update.value);
                if update.property == JointProperty::Angle {
                    travel = travel.max(mc.travel_time);
                }
            }
            envelope.control.travel_time = envelope.control.travel_time.max(travel);
        }
        Some(BusReply {
            bus: self.bus.clone(),
            style,
            envelope,
        })
    }

    /// Forget partial input and any request in flight.
    pub fn reset(&mut self) {
        if let Some(flight) = self.in_flight.take() {
            debug!(bus = %self.bus, request = %flight.envelope.id, "dropping request in flight on reset");
        }
        self.assembler.clear();
        self.state = EngineState::Idle;
    }
}

/// Record what one status reply says on the motor that sent it and on the
/// envelope.
fn decode_status(registry: &MotorRegistry, bus: &str, flight: &mut InFlight, status: &codec::StatusFrame) {
    let Some(motor) = registry.motor_by_id(bus, status.id) else {
        warn!(bus = %bus, id = status.id, "status from a motor that is not configured");
        return;
    };
    let mut mc = write_motor(&motor);
    let p = &status.params;
    match flight.decode {
        Decode::Acknowledge => {}
        Decode::Property(property) => {
            let Some(value) = conversions::value_from_params(property, &mc, p) else {
                flight.envelope.assign_error(format!("Motor {} sent a truncated reply", status.id));
                return;
            };
            conversions::apply_value(&mut mc, property, value);
            let text = conversions::text_for_value(property, value);
            if flight.style == ReplyStyle::Single {
                flight.envelope.text = Some(format!(
                    "The {} of my {} is {}",
                    property.spoken(),
                    mc.joint.spoken(),
                    text
                ));
            } else {
                info!(joint = %mc.joint, property = %property, value = %text, "motor property");
            }
        }
        Decode::Goals if p.len() >= 6 => {
            let angle = raw_to_degree(&mc, word(p[0], p[1]));
            let speed = raw_to_speed(&mc, word(p[2], p[3]));
            let torque = raw_to_torque(&mc, word(p[4], p[5]));
            flight.envelope.text = Some(format!(
                "Goal angle, speed and torque are : {angle:.0} degrees, {speed:.0} degrees per second, {torque:.1} newton-meters"
            ));
        }
        Decode::Limits if p.len() >= 10 => {
            let a = raw_to_degree(&mc, word(p[0], p[1]));
            let b = raw_to_degree(&mc, word(p[2], p[3]));
            let torque = raw_to_torque_limit(&mc, p[8], p[9]);
            flight.envelope.text = Some(format!(
                "min, max angle and torque limits are : {:.0}, {:.0} degrees and {torque:.1} newton-meters",
                a.min(b),
                a.max(b)
            ));
        }
        Decode::Goals | Decode::Limits => {
            flight.envelope.assign_error(format!("Motor {} sent a truncated reply", status.id));
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// BusEngine task
// ────────────────────────────────────────────────────────────────────────────

/// Sender side of an engine's request queue.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    bus: String,
    tx: mpsc::Sender<RequestEnvelope>,
}

impl EngineHandle {
    pub fn bus(&self) -> &str {
        &self.bus
    }

    pub async fn submit(&self, envelope: RequestEnvelope) -> Result<(), BertError> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| BertError::Channel(format!("bus engine '{}' has stopped", self.bus)))
    }
}

/// The task that owns one serial bus.
pub struct BusEngine {
    core: EngineCore,
    port: Box<dyn SerialPort>,
    bytes: ByteReceiver,
    requests: mpsc::Receiver<RequestEnvelope>,
    replies: mpsc::Sender<BusReply>,
    limiter: Option<DefaultDirectRateLimiter>,
    options: EngineOptions,
}

impl BusEngine {
    /// Build an engine for `port` and the handle used to feed it.  Replies
    /// are sent on `replies`.
    pub fn new(
        port: Box<dyn SerialPort>,
        bytes: ByteReceiver,
        registry: Arc<MotorRegistry>,
        replies: mpsc::Sender<BusReply>,
        options: EngineOptions,
    ) -> (Self, EngineHandle) {
        let bus = port.name().to_string();
        let (tx, requests) = mpsc::channel(64);
        let limiter = Quota::with_period(options.write_spacing).map(RateLimiter::direct);
        let engine = Self {
            core: EngineCore::new(bus.clone(), registry),
            port,
            bytes,
            requests,
            replies,
            limiter,
            options,
        };
        (engine, EngineHandle { bus, tx })
    }

    /// Run until the request queue closes.
    pub async fn run(mut self) {
        let bus = self.core.bus.clone();
        info!(bus = %bus, "bus engine started");
        let mut bytes_open = true;
        loop {
            let awaiting = self.core.state() == EngineState::AwaitingReply;
            let deadline = self.core.deadline().unwrap_or_else(Instant::now);
            tokio::select! {
                request = self.requests.recv(), if !awaiting => match request {
                    Some(envelope) => self.handle(envelope).await,
                    None => break,
                },
                chunk = self.bytes.recv(), if bytes_open => match chunk {
                    Some(chunk) => {
                        if let Some(reply) = self.core.on_bytes(&chunk) {
                            self.send(reply).await;
                        }
                    }
                    None => {
                        warn!(bus = %bus, "serial input closed");
                        bytes_open = false;
                    }
                },
                _ = tokio::time::sleep_until(deadline), if awaiting => {
                    if let Some(reply) = self.core.expire(Instant::now()) {
                        self.send(reply).await;
                    }
                }
            }
        }
        info!(bus = %bus, "bus engine stopped");
    }

    async fn handle(&mut self, envelope: RequestEnvelope) {
        if envelope.kind == RequestKind::Command(CommandKind::Reset) {
            self.core.reset();
        }
        let plan = self.core.plan(envelope);
        if plan.style == ReplyStyle::Trivial {
            let reply = BusReply {
                bus: self.core.bus.clone(),
                style: ReplyStyle::Trivial,
                envelope: plan.envelope,
            };
            self.send(reply).await;
            return;
        }

        let mut plan = plan;
        if !plan.envelope.has_error() {
            self.core.state = EngineState::Writing;
            for frame in std::mem::take(&mut plan.frames) {
                if let Some(limiter) = &self.limiter {
                    limiter.until_ready().await;
                }
                debug!(bus = %self.core.bus, out = %codec::dump(&frame), "write");
                if let Err(e) = self.port.write(&frame).await {
                    warn!(bus = %self.core.bus, error = %e, "serial write failed");
                    plan.envelope.assign_error(error_text(e));
                    break;
                }
            }
        }
        if plan.envelope.has_error() {
            plan.expected = 0;
            plan.updates.clear();
        }
        let deadline = Instant::now() + self.options.reply_timeout;
        if let Some(reply) = self.core.begin(plan, deadline) {
            self.send(reply).await;
        }
    }

    async fn send(&mut self, reply: BusReply) {
        if self.replies.send(reply).await.is_err() {
            warn!(bus = %self.core.bus, "aggregator has stopped, reply dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bert_types::{Limb, MotorKind};

    use crate::port::SimulatedPort;

    fn registry() -> Result<Arc<MotorRegistry>, BertError> {
        let mut registry = MotorRegistry::new();
        registry.insert(
            MotorConfiguration::new(Joint::LeftElbowY, Limb::LeftArm, "upper", 42, MotorKind::Mx28)
                .with_limits(-10.0, 160.0),
        )?;
        registry.insert(MotorConfiguration::new(
            Joint::LeftShoulderY,
            Limb::LeftArm,
            "upper",
            41,
            MotorKind::Mx28,
        ))?;
        registry.insert(MotorConfiguration::new(Joint::NeckY, Limb::Head, "upper", 36, MotorKind::Ax12))?;
        registry.insert(MotorConfiguration::new(Joint::LeftKneeY, Limb::LeftLeg, "lower", 12, MotorKind::Mx28))?;
        Ok(Arc::new(registry))
    }

    /// Two bulk-read status frames, for motors 41 and 42.
    fn two_statuses() -> Vec<u8> {
        let mut bytes = codec::status_frame(41, 0, &[0x00, 0x08]);
        bytes.extend(codec::status_frame(42, 0, &[0x00, 0x04]));
        bytes
    }

    fn list_angles(core: &mut EngineCore) {
        let env = RequestEnvelope::new(
            RequestKind::ListMotorProperty(JointProperty::Angle),
            Target::Limb(Limb::LeftArm),
        );
        let plan = core.plan(env);
        assert_eq!(plan.expected(), 2);
        assert!(core.begin(plan, Instant::now() + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn reassembly_is_independent_of_chunking() -> Result<(), BertError> {
        let mut stream = vec![0x00, 0x42, 0xFF];
        stream.extend(two_statuses());

        let mut whole = EngineCore::new("upper", registry()?);
        list_angles(&mut whole);
        let reference = whole.on_bytes(&stream).ok_or(BertError::Protocol("no reply".into()))?;
        let expected_angles: Vec<f64> = [Joint::LeftShoulderY, Joint::LeftElbowY]
            .iter()
            .filter_map(|j| whole.registry.motor(*j))
            .map(|m| read_motor(&m).position)
            .collect();

        for split in 1..stream.len() {
            for pieces in [2usize, 3, 7] {
                let registry = registry()?;
                let mut core = EngineCore::new("upper", Arc::clone(&registry));
                list_angles(&mut core);
                let mut result = None;
                let step = (split / pieces).max(1);
                let mut chunks: Vec<&[u8]> = stream[..split].chunks(step).collect();
                chunks.push(&stream[split..]);
                for chunk in chunks {
                    if let Some(reply) = core.on_bytes(chunk) {
                        result = Some(reply);
                    }
                }
                let reply = result.ok_or(BertError::Protocol(format!("no reply at split {split}")))?;
                assert_eq!(reply.envelope.error, reference.envelope.error);
                assert_eq!(reply.envelope.control.outstanding.get("upper"), Some(&0));
                let angles: Vec<f64> = [Joint::LeftShoulderY, Joint::LeftElbowY]
                    .iter()
                    .filter_map(|j| registry.motor(*j))
                    .map(|m| read_motor(&m).position)
                    .collect();
                assert_eq!(angles, expected_angles);
                assert_eq!(core.assembler.pending(), 0);
            }
        }
        Ok(())
    }

    #[test]
    fn bytes_beyond_the_frame_are_kept() {
        let mut assembler = FrameAssembler::new();
        let mut bytes = codec::status_frame(1, 0, &[0x10, 0x00]);
        bytes.extend_from_slice(&[0xFF, 0xFF, 0x02]);
        let frames = assembler.push(&bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(assembler.pending(), 3);
    }

    #[test]
    fn device_error_is_recorded_and_not_applied() -> Result<(), BertError> {
        let registry = registry()?;
        let mut core = EngineCore::new("upper", Arc::clone(&registry));
        let env = RequestEnvelope::new(
            RequestKind::SetMotorProperty { property: JointProperty::Angle, value: 90.0 },
            Target::Joint(Joint::LeftElbowY),
        );
        let plan = core.plan(env);
        assert_eq!(plan.style(), ReplyStyle::Single);
        assert!(core.begin(plan, Instant::now() + Duration::from_secs(1)).is_none());

        let reply = core
            .on_bytes(&codec::status_frame(42, 0x02, &[]))
            .ok_or(BertError::Protocol("no reply".into()))?;
        assert_eq!(reply.envelope.error.as_deref(), Some("Motor 42 encountered an overload error"));
        let elbow = registry.motor(Joint::LeftElbowY).ok_or(BertError::Config("missing".into()))?;
        assert_eq!(read_motor(&elbow).position, 0.0);
        Ok(())
    }

    #[test]
    fn request_for_another_bus_is_trivial() -> Result<(), BertError> {
        let core = EngineCore::new("upper", registry()?);
        let env = RequestEnvelope::new(
            RequestKind::GetMotorProperty(JointProperty::Temperature),
            Target::Joint(Joint::LeftKneeY),
        );
        let plan = core.plan(env);
        assert_eq!(plan.style(), ReplyStyle::Trivial);
        assert!(plan.frames().is_empty());
        Ok(())
    }

    #[test]
    fn overdue_replies_fail_the_request() -> Result<(), BertError> {
        let mut core = EngineCore::new("upper", registry()?);
        list_angles(&mut core);
        let _ = core.on_bytes(&codec::status_frame(41, 0, &[0x00, 0x08]));
        let reply = core
            .expire(Instant::now() + Duration::from_secs(2))
            .ok_or(BertError::Protocol("no reply".into()))?;
        assert_eq!(
            reply.envelope.error.as_deref(),
            Some("The upper bus answered 1 of 2 status requests")
        );
        assert_eq!(core.state(), EngineState::Idle);
        Ok(())
    }

    fn spawn_engine(
        registry: &Arc<MotorRegistry>,
        chunk: usize,
    ) -> (EngineHandle, mpsc::Receiver<BusReply>, crate::port::SimHandle) {
        let options = EngineOptions {
            write_spacing: Duration::from_millis(1),
            reply_timeout: Duration::from_millis(500),
        };
        spawn_engine_with(registry, chunk, options)
    }

    fn spawn_engine_with(
        registry: &Arc<MotorRegistry>,
        chunk: usize,
        options: EngineOptions,
    ) -> (EngineHandle, mpsc::Receiver<BusReply>, crate::port::SimHandle) {
        let motors: Vec<MotorConfiguration> = registry
            .motors_on_bus("upper")
            .iter()
            .map(|m| read_motor(m).clone())
            .collect();
        let (port, bytes) = SimulatedPort::new("upper", &motors);
        let port = port.with_chunk_size(chunk);
        let sim = port.handle();
        let (reply_tx, reply_rx) = mpsc::channel(16);
        let (engine, handle) = BusEngine::new(Box::new(port), bytes, Arc::clone(registry), reply_tx, options);
        tokio::spawn(engine.run());
        (handle, reply_rx, sim)
    }

    #[tokio::test]
    async fn written_angle_round_trips_through_the_device() -> Result<(), Box<dyn std::error::Error>> {
        let registry = registry()?;
        let (handle, mut replies, _sim) = spawn_engine(&registry, 3);

        let write = RequestEnvelope::new(
            RequestKind::SetMotorProperty { property: JointProperty::Angle, value: 45.0 },
            Target::Joint(Joint::LeftElbowY),
        );
        handle.submit(write).await?;
        let reply = tokio::time::timeout(Duration::from_secs(2), replies.recv())
            .await?
            .ok_or("engine stopped")?;
        assert_eq!(reply.style, ReplyStyle::Single);
        assert!(!reply.envelope.has_error());

        let read = RequestEnvelope::new(
            RequestKind::GetMotorProperty(JointProperty::Angle),
            Target::Joint(Joint::LeftElbowY),
        );
        handle.submit(read).await?;
        let reply = tokio::time::timeout(Duration::from_secs(2), replies.recv())
            .await?
            .ok_or("engine stopped")?;
        assert_eq!(reply.envelope.text.as_deref(), Some("The angle of my left elbow y is 45 degrees"));
        let elbow = registry.motor(Joint::LeftElbowY).ok_or("missing")?;
        assert!((read_motor(&elbow).position - 45.0).abs() < 0.5);
        Ok(())
    }

    #[tokio::test]
    async fn sync_writes_are_synthesized() -> Result<(), Box<dyn std::error::Error>> {
        let registry = registry()?;
        let (handle, mut replies, sim) = spawn_engine(&registry, usize::MAX);

        let relax = RequestEnvelope::new(
            RequestKind::SetLimbProperty { property: JointProperty::State, value: 0.0 },
            Target::Limb(Limb::LeftArm),
        );
        handle.submit(relax).await?;
        let reply = tokio::time::timeout(Duration::from_secs(2), replies.recv())
            .await?
            .ok_or("engine stopped")?;
        assert_eq!(reply.style, ReplyStyle::Synthesized);
        assert_eq!(sim.written().len(), 1);
        let shoulder = registry.motor(Joint::LeftShoulderY).ok_or("missing")?;
        assert!(!read_motor(&shoulder).torque_enabled);
        Ok(())
    }

    #[tokio::test]
    async fn frames_on_one_bus_keep_their_spacing() -> Result<(), Box<dyn std::error::Error>> {
        let registry = registry()?;
        let list = RequestEnvelope::new(RequestKind::ListMotorProperty(JointProperty::Angle), Target::All);
        let frames = EngineCore::new("upper", Arc::clone(&registry)).plan(list.clone()).frames().len();
        assert!(frames >= 2, "expected several frames, got {frames}");

        // The limiter runs on the wall clock, so this test does too.
        let spacing = Duration::from_millis(40);
        let options = EngineOptions { write_spacing: spacing, reply_timeout: Duration::from_secs(1) };
        let (handle, mut replies, sim) = spawn_engine_with(&registry, usize::MAX, options);

        handle.submit(list).await?;
        let reply = tokio::time::timeout(Duration::from_secs(2), replies.recv())
            .await?
            .ok_or("engine stopped")?;
        assert!(!reply.envelope.has_error(), "{:?}", reply.envelope.error);

        let times = sim.write_times();
        assert_eq!(times.len(), frames);
        for pair in times.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(gap + Duration::from_millis(2) >= spacing, "writes only {gap:?} apart");
        }
        Ok(())
    }
}
