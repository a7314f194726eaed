//! [`Sequencer`] – per-subsystem lanes that pace requests and hold each
//! downstream subsystem to one request in flight.
//!
//! Requests are preprocessed on the caller's side of the
//! [`SequencerHandle`]: compound requests are expanded into ordered
//! sub-requests and safety reads or writes are inserted.  Each resulting
//! batch is pushed onto its [`Lane`]'s [`DelayQueue`].  A lane releases its
//! next entry only once the entry is due *and* the subsystem has signalled
//! [`SequencerHandle::mark_ready`] for the previous one.  Ready signals name
//! the envelope they answer; one for anything but the lane's current
//! in-flight envelope is ignored.
//!
//! # Preprocessing
//!
//! | Request | Queued as |
//! |---|---|
//! | `FREEZE` | position list (sink), then the freeze after 1 s |
//! | position write, torque off | torque enable (sink), then the write |
//! | torque enable | the enable, then a position refresh (sink) after 250 ms, 500 ms for a limb |
//! | `EXECUTE_POSE` | one sub-request per limb (sink), then the original as a marker |
//! | `EXECUTE_ACTION` | one `EXECUTE_POSE` per step (sink), then the original as a marker |
//! | `RESET` | both lanes cleared, then the reset itself |

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bert_types::{
    BertError, CommandKind, JointProperty, Limb, MotorRegistry, RequestEnvelope, RequestKind, Source, Target,
    read_motor,
};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::PoseCatalog;
use crate::delay_queue::DelayQueue;

const FREEZE_DELAY: Duration = Duration::from_millis(1000);
const JOINT_REFRESH_DELAY: Duration = Duration::from_millis(250);
const LIMB_REFRESH_DELAY: Duration = Duration::from_millis(500);

// ────────────────────────────────────────────────────────────────────────────
// Lanes
// ────────────────────────────────────────────────────────────────────────────

/// A downstream subsystem that accepts one request at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lane {
    /// The motor buses, through the bus aggregator.
    Motor,
    /// The AI service.
    Internet,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::Motor, Lane::Internet];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Motor => "motor",
            Lane::Internet => "internet",
        }
    }

    /// The lane a request of `kind` travels on.
    pub fn for_kind(kind: &RequestKind) -> Lane {
        match kind {
            RequestKind::InternetQuery(_) => Lane::Internet,
            _ => Lane::Motor,
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An envelope a lane has released to the hub.
#[derive(Debug, Clone)]
pub struct Released {
    pub lane: Lane,
    pub envelope: RequestEnvelope,
}

impl Released {
    /// `true` for the envelope that closes an expanded pose or action.  It
    /// is answered by the hub and never sent to a bus.
    pub fn is_marker(&self) -> bool {
        match &self.envelope.kind {
            RequestKind::ExecuteAction(_) => true,
            RequestKind::ExecutePose { .. } => self.envelope.target == Target::None,
            _ => false,
        }
    }
}

enum LaneMessage {
    Push(Vec<RequestEnvelope>),
    Ready(Uuid),
    Reset,
}

// ────────────────────────────────────────────────────────────────────────────
// Preprocessing
// ────────────────────────────────────────────────────────────────────────────

fn torque_enabled(registry: &MotorRegistry, target: &Target) -> bool {
    match target {
        Target::Joint(joint) => registry.motor(*joint).is_none_or(|m| read_motor(&m).torque_enabled),
        Target::Limb(limb) => registry
            .motors_in_limb(*limb)
            .iter()
            .all(|m| read_motor(m).torque_enabled),
        _ => true,
    }
}

fn sink(envelope: RequestEnvelope) -> RequestEnvelope {
    envelope.with_source(Source::Sink)
}

/// Expand `envelope` into the ordered batch that is queued in its place.
pub fn preprocess(
    envelope: RequestEnvelope,
    registry: &MotorRegistry,
    catalog: &dyn PoseCatalog,
) -> Vec<RequestEnvelope> {
    match envelope.kind.clone() {
        RequestKind::Command(CommandKind::Freeze) => {
            let target = match envelope.target {
                Target::None => Target::All,
                ref other => other.clone(),
            };
            let read = sink(envelope.derive(RequestKind::ListMotorProperty(JointProperty::Angle), target));
            let delay = envelope.control.delay.max(FREEZE_DELAY);
            vec![read, envelope.with_delay(delay)]
        }
        RequestKind::SetMotorProperty { property: JointProperty::Angle, .. }
            if !torque_enabled(registry, &envelope.target) =>
        {
            let enable = sink(envelope.derive(
                RequestKind::SetMotorProperty { property: JointProperty::State, value: 1.0 },
                envelope.target.clone(),
            ));
            vec![enable, envelope]
        }
        RequestKind::SetLimbProperty { property: JointProperty::Angle, .. }
            if !torque_enabled(registry, &envelope.target) =>
        {
            let enable = sink(envelope.derive(
                RequestKind::SetLimbProperty { property: JointProperty::State, value: 1.0 },
                envelope.target.clone(),
            ));
            vec![enable, envelope]
        }
        RequestKind::SetMotorProperty { property: JointProperty::State, value } if value != 0.0 => {
            let refresh = sink(envelope.derive(
                RequestKind::GetMotorProperty(JointProperty::Angle),
                envelope.target.clone(),
            ))
            .with_delay(JOINT_REFRESH_DELAY);
            vec![envelope, refresh]
        }
        RequestKind::SetLimbProperty { property: JointProperty::State, value } if value != 0.0 => {
            let refresh = sink(envelope.derive(
                RequestKind::ListMotorProperty(JointProperty::Angle),
                envelope.target.clone(),
            ))
            .with_delay(LIMB_REFRESH_DELAY);
            vec![envelope, refresh]
        }
        RequestKind::ExecutePose { ref goals, .. } if goals.is_empty() && envelope.target == Target::None => {
            expand_pose(envelope, registry, catalog)
        }
        RequestKind::ExecuteAction(_) => expand_action(envelope, catalog)
            .into_iter()
            .flat_map(|step| match step.kind {
                RequestKind::ExecutePose { .. } if step.target == Target::None => {
                    expand_pose(step, registry, catalog)
                }
                _ => vec![step],
            })
            .collect(),
        _ => vec![envelope],
    }
}

/// One sub-request per limb carrying that limb's goals, followed by the
/// original as a marker with no goals and no target.
///
/// The first sub-request inherits the pose's delay; the rest follow it
/// without further delay.
pub fn expand_pose(
    mut envelope: RequestEnvelope,
    registry: &MotorRegistry,
    catalog: &dyn PoseCatalog,
) -> Vec<RequestEnvelope> {
    let RequestKind::ExecutePose { pose, index, .. } = envelope.kind.clone() else {
        return vec![envelope];
    };
    let Some(goals) = catalog.pose_goals(&pose, index) else {
        envelope.assign_error(format!("I don't know the pose {pose} {index}"));
        return vec![envelope];
    };

    let mut batch: Vec<RequestEnvelope> = Limb::ALL
        .into_iter()
        .map(|limb| {
            let limb_goals = goals
                .iter()
                .filter(|g| registry.motor(g.joint).is_some_and(|m| read_motor(&m).limb == limb))
                .cloned()
                .collect();
            sink(envelope.derive(
                RequestKind::ExecutePose { pose: pose.clone(), index, goals: limb_goals },
                Target::Limb(limb),
            ))
        })
        .collect();
    if let Some(first) = batch.first_mut() {
        first.control.delay = envelope.control.delay;
    }

    envelope.target = Target::None;
    envelope.control.delay = Duration::ZERO;
    if let RequestKind::ExecutePose { goals, .. } = &mut envelope.kind {
        goals.clear();
    }
    batch.push(envelope);
    batch
}

/// One `EXECUTE_POSE` per action step, redirected to the sink and stamped
/// with the step's delay, followed by the original as a marker.
pub fn expand_action(mut envelope: RequestEnvelope, catalog: &dyn PoseCatalog) -> Vec<RequestEnvelope> {
    let RequestKind::ExecuteAction(action) = envelope.kind.clone() else {
        return vec![envelope];
    };
    let Some(steps) = catalog.action_steps(&action) else {
        envelope.assign_error(format!("I don't know how to {action}"));
        return vec![envelope];
    };

    let lead = envelope.control.delay;
    let mut batch: Vec<RequestEnvelope> = steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let delay = if i == 0 { lead + step.delay() } else { step.delay() };
            sink(envelope.derive(
                RequestKind::ExecutePose { pose: step.pose.clone(), index: step.index, goals: Vec::new() },
                Target::None,
            ))
            .with_delay(delay)
        })
        .collect();
    envelope.control.delay = Duration::ZERO;
    batch.push(envelope);
    batch
}

// ────────────────────────────────────────────────────────────────────────────
// SequencerHandle
// ────────────────────────────────────────────────────────────────────────────

/// Cloneable front of the [`Sequencer`].
#[derive(Clone)]
pub struct SequencerHandle {
    motor: mpsc::UnboundedSender<LaneMessage>,
    internet: mpsc::UnboundedSender<LaneMessage>,
    registry: Arc<MotorRegistry>,
    catalog: Arc<dyn PoseCatalog>,
}

impl SequencerHandle {
    fn lane(&self, lane: Lane) -> &mpsc::UnboundedSender<LaneMessage> {
        match lane {
            Lane::Motor => &self.motor,
            Lane::Internet => &self.internet,
        }
    }

    fn send(&self, lane: Lane, message: LaneMessage) -> Result<(), BertError> {
        self.lane(lane)
            .send(message)
            .map_err(|_| BertError::Channel(format!("the {lane} lane has stopped")))
    }

    /// Preprocess `envelope` and queue the result on its lane.  A reset
    /// clears both lanes first.
    pub fn enqueue(&self, envelope: RequestEnvelope) -> Result<(), BertError> {
        let lane = Lane::for_kind(&envelope.kind);
        if matches!(envelope.kind, RequestKind::Command(CommandKind::Reset)) {
            self.reset()?;
        }
        let batch = preprocess(envelope, &self.registry, self.catalog.as_ref());
        debug!(lane = %lane, count = batch.len(), "queueing batch");
        self.send(lane, LaneMessage::Push(batch))
    }

    /// Report that the envelope `id` released on `lane` has been answered,
    /// allowing the lane to release its next entry.
    pub fn mark_ready(&self, lane: Lane, id: Uuid) -> Result<(), BertError> {
        self.send(lane, LaneMessage::Ready(id))
    }

    /// Drop everything queued on both lanes and mark them ready.  Answers to
    /// envelopes released before the reset no longer count as ready signals.
    pub fn reset(&self) -> Result<(), BertError> {
        for lane in Lane::ALL {
            self.send(lane, LaneMessage::Reset)?;
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sequencer
// ────────────────────────────────────────────────────────────────────────────

struct LaneTask {
    lane: Lane,
    queue: DelayQueue,
    in_flight: Option<Uuid>,
    inbox: mpsc::UnboundedReceiver<LaneMessage>,
    out: mpsc::Sender<Released>,
}

impl LaneTask {
    fn new(lane: Lane, inbox: mpsc::UnboundedReceiver<LaneMessage>, out: mpsc::Sender<Released>) -> Self {
        Self { lane, queue: DelayQueue::new(), in_flight: None, inbox, out }
    }

    async fn run(mut self) {
        loop {
            let due = if self.in_flight.is_none() { self.queue.next_release() } else { None };
            tokio::select! {
                message = self.inbox.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
                _ = sleep_until(due.unwrap_or_else(Instant::now)), if due.is_some() => {
                    let Some(envelope) = self.queue.pop_due(Instant::now()) else {
                        continue;
                    };
                    self.in_flight = Some(envelope.id);
                    debug!(lane = %self.lane, kind = envelope.kind.label(), id = %envelope.id, "released");
                    if self.out.send(Released { lane: self.lane, envelope }).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(lane = %self.lane, "lane stopped");
    }

    fn handle(&mut self, message: LaneMessage) {
        match message {
            LaneMessage::Push(batch) => self.queue.push_batch(batch, Instant::now()),
            LaneMessage::Ready(id) => match self.in_flight {
                Some(current) if current == id => self.in_flight = None,
                Some(current) => {
                    debug!(lane = %self.lane, %id, in_flight = %current, "stale ready signal ignored");
                }
                None => warn!(lane = %self.lane, %id, "ready signal with nothing in flight"),
            },
            LaneMessage::Reset => {
                info!(lane = %self.lane, dropped = self.queue.len(), "lane reset");
                self.queue.clear();
                self.in_flight = None;
            }
        }
    }
}

/// Owner of the lane tasks.  Construct with [`Sequencer::new`], spawn
/// [`Sequencer::run`], and talk to it through the returned handle.
pub struct Sequencer {
    lanes: Vec<LaneTask>,
}

impl Sequencer {
    pub fn new(
        registry: Arc<MotorRegistry>,
        catalog: Arc<dyn PoseCatalog>,
        out: mpsc::Sender<Released>,
    ) -> (Self, SequencerHandle) {
        let (motor_tx, motor_rx) = mpsc::unbounded_channel();
        let (internet_tx, internet_rx) = mpsc::unbounded_channel();
        let sequencer = Self {
            lanes: vec![
                LaneTask::new(Lane::Motor, motor_rx, out.clone()),
                LaneTask::new(Lane::Internet, internet_rx, out),
            ],
        };
        let handle = SequencerHandle { motor: motor_tx, internet: internet_tx, registry, catalog };
        (sequencer, handle)
    }

    /// Run every lane until its handle side is dropped or the hub stops
    /// receiving.
    pub async fn run(self) {
        let tasks: Vec<_> = self.lanes.into_iter().map(|lane| tokio::spawn(lane.run())).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "sequencer lane ended abnormally");
            }
        }
    }
}
