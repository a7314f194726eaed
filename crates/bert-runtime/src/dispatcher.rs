//! [`Hub`] – the single point where all request and reply traffic meets.
//!
//! The hub runs as one task multiplexing four sources:
//!
//! | Source | Handling |
//! |---|---|
//! | peripherals (the [`Submitter`] inbox) | classified, see below |
//! | the sequencer's released entries | markers answered here, the rest sent downstream |
//! | downstream replies (aggregator, internet worker) | lane marked ready, reply delivered |
//! | the cadence timer | cycle accounting and stalled-lane warnings |
//!
//! # Classification
//!
//! Every envelope entering from a peripheral is classified once:
//!
//! 1. An envelope that already carries an error goes straight back.
//! 2. The [`Validator`] rejects invalid requests; they never reach a bus.
//! 3. Local kinds (metrics, locations, halt, shutdown, sleep, wake,
//!    heartbeat, notification) are answered by the [`LocalResponder`].
//! 4. Configuration questions are answered from the [`MotorRegistry`].
//! 5. Everything else is queued on the sequencer: internet queries on the
//!    internet lane, motor kinds on the motor lane.
//!
//! Replies are never re-classified.  They go to the peripheral named by
//! their source; replies addressed to the sink are dropped.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn demo(wiring: bert_runtime::dispatcher::Wiring) {
//! let running = bert_runtime::dispatcher::launch(wiring);
//! let _ = running.hub.await;
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use bert_hal::{AggregatorHandle, BusAggregator, BusEngine, ByteReceiver, EngineOptions, SerialPort, static_answer};
use bert_kernel::{Lane, PoseCatalog, Released, Sequencer, SequencerHandle, Validator, Watchdog};
use bert_middleware::{ReplyBus, Submitter};
use bert_types::{BertError, CommandKind, JointProperty, MotorRegistry, RequestEnvelope, RequestKind, Source, Target};
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::internet::{InternetService, InternetWorker};
use crate::local::LocalResponder;
use crate::metrics::{CycleMetrics, DEFAULT_CADENCE};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Announced to every peripheral once the joints are initialised.
pub const READY_PHRASES: [&str; 4] = ["Bert is ready", "At your command", "I'm listening", "Speak your wishes"];

const STARTUP_LIST_DELAY: Duration = Duration::from_millis(1000);
const STARTUP_INITIALIZE_DELAY: Duration = Duration::from_millis(2000);
const DEFAULT_STALL_THRESHOLD: Duration = Duration::from_secs(10);

// ─────────────────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HubOptions {
    /// Period of the accounting pass.
    pub cadence: Duration,
    /// A lane busy for longer than this is reported as stalled.
    pub stall_threshold: Duration,
    /// Queue the startup sequence when the hub starts.
    pub startup: bool,
    /// Pose executed first during startup, if any.
    pub normal_speed_pose: Option<String>,
    pub engine: EngineOptions,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            cadence: DEFAULT_CADENCE,
            stall_threshold: DEFAULT_STALL_THRESHOLD,
            startup: true,
            normal_speed_pose: None,
            engine: EngineOptions::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hub
// ─────────────────────────────────────────────────────────────────────────────

pub struct Hub {
    options: HubOptions,
    validator: Validator,
    registry: Arc<MotorRegistry>,
    catalog: Arc<dyn PoseCatalog>,
    sequencer: SequencerHandle,
    aggregator: AggregatorHandle,
    internet: mpsc::Sender<RequestEnvelope>,
    bus: ReplyBus,
    local: LocalResponder,
    metrics: CycleMetrics,
    watchdog: Watchdog,
    inbox: mpsc::Receiver<RequestEnvelope>,
    released: mpsc::Receiver<Released>,
    replies: mpsc::Receiver<RequestEnvelope>,
    startup_id: Option<Uuid>,
    busy: Duration,
}

/// Everything [`Hub::new`] needs from the components around it.
pub struct HubParts {
    pub registry: Arc<MotorRegistry>,
    pub catalog: Arc<dyn PoseCatalog>,
    pub sequencer: SequencerHandle,
    pub aggregator: AggregatorHandle,
    pub internet: mpsc::Sender<RequestEnvelope>,
    pub bus: ReplyBus,
    pub local: LocalResponder,
    pub inbox: mpsc::Receiver<RequestEnvelope>,
    pub released: mpsc::Receiver<Released>,
    pub replies: mpsc::Receiver<RequestEnvelope>,
}

impl Hub {
    pub fn new(parts: HubParts, options: HubOptions) -> Self {
        Self {
            validator: Validator::standard(Arc::clone(&parts.registry), Arc::clone(&parts.catalog)),
            metrics: CycleMetrics::new(options.cadence),
            watchdog: Watchdog::new(options.stall_threshold),
            options,
            registry: parts.registry,
            catalog: parts.catalog,
            sequencer: parts.sequencer,
            aggregator: parts.aggregator,
            internet: parts.internet,
            bus: parts.bus,
            local: parts.local,
            inbox: parts.inbox,
            released: parts.released,
            replies: parts.replies,
            startup_id: None,
            busy: Duration::ZERO,
        }
    }

    /// Run until a shutdown request arrives or every peripheral has gone.
    pub async fn run(mut self) {
        info!(
            buses = self.registry.bus_count(),
            motors = self.registry.len(),
            cadence_ms = self.options.cadence.as_millis() as u64,
            "dispatch hub started"
        );
        if self.options.startup {
            self.startup();
        }

        let mut tick = tokio::time::interval(self.options.cadence);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                request = self.inbox.recv() => {
                    let Some(envelope) = request else { break };
                    let started = Instant::now();
                    let keep_running = self.submit(envelope).await;
                    self.busy += started.elapsed();
                    if !keep_running {
                        break;
                    }
                }
                Some(released) = self.released.recv() => {
                    let started = Instant::now();
                    self.release(released).await;
                    self.busy += started.elapsed();
                }
                Some(reply) = self.replies.recv() => {
                    let started = Instant::now();
                    self.reply(reply);
                    self.busy += started.elapsed();
                }
                _ = tick.tick() => {
                    let elapsed = last_tick.elapsed();
                    last_tick = Instant::now();
                    self.account(elapsed);
                }
            }
        }
        info!(cycles = self.metrics.cycle_count(), "dispatch hub stopped");
    }

    // ── Peripheral requests ──────────────────────────────────────────────────

    /// Classify one peripheral request.  Returns `false` on shutdown.
    async fn submit(&mut self, mut envelope: RequestEnvelope) -> bool {
        debug!(id = %envelope.id, kind = envelope.kind.label(), source = %envelope.source, "request");

        if envelope.has_error() || self.validator.screen(&mut envelope) {
            self.deliver(envelope);
            return true;
        }

        if LocalResponder::handles(&envelope.kind) {
            let shutdown = envelope.kind == RequestKind::Command(CommandKind::Shutdown);
            if envelope.kind == RequestKind::Command(CommandKind::Halt) {
                self.halt(&mut envelope);
            }
            self.local.answer(&mut envelope, &self.metrics);
            self.deliver(envelope);
            if shutdown {
                info!("shutdown requested");
            }
            return !shutdown;
        }

        if static_answer(&self.registry, &mut envelope) {
            self.deliver(envelope);
            return true;
        }

        if let Err(e) = self.sequencer.enqueue(envelope.clone()) {
            envelope.assign_error(e.to_string());
            self.deliver(envelope);
        }
        true
    }

    fn halt(&mut self, envelope: &mut RequestEnvelope) {
        info!("halt: dropping queued requests");
        if let Err(e) = self.sequencer.reset() {
            envelope.assign_error(e.to_string());
        }
        self.watchdog.clear();
    }

    // ── Released entries ─────────────────────────────────────────────────────

    async fn release(&mut self, released: Released) {
        if released.is_marker() {
            self.complete_marker(released);
            return;
        }
        let Released { lane, envelope } = released;
        let sent = match lane {
            Lane::Motor => self.aggregator.dispatch(envelope.clone()).await,
            Lane::Internet => self
                .internet
                .send(envelope.clone())
                .await
                .map_err(|_| BertError::Channel("internet worker has stopped".into())),
        };
        match sent {
            Ok(()) => self.watchdog.released(lane),
            Err(e) => {
                warn!(lane = %lane, id = %envelope.id, error = %e, "could not send request downstream");
                let mut failed = envelope;
                failed.assign_error(e.to_string());
                self.mark_ready(lane, failed.id);
                self.deliver(failed);
            }
        }
    }

    /// Answer the envelope that closes a pose or an action and queue the
    /// follow-on action, if there is one.
    fn complete_marker(&mut self, released: Released) {
        let Released { lane, mut envelope } = released;
        if !envelope.has_error() {
            match envelope.kind.clone() {
                RequestKind::ExecutePose { pose, .. } => {
                    envelope.text = Some(format!("I am in the {pose} pose"));
                }
                RequestKind::ExecuteAction(action) => {
                    envelope.text = Some(format!("I have completed the {action} action"));
                    if let Some(next) = self.catalog.follow_on(&action) {
                        debug!(action = %action, next = %next, "queueing follow-on action");
                        let follow = envelope.derive(RequestKind::ExecuteAction(next), Target::None);
                        if let Err(e) = self.sequencer.enqueue(follow) {
                            warn!(error = %e, "could not queue follow-on action");
                        }
                    }
                }
                _ => {}
            }
        }
        self.mark_ready(lane, envelope.id);
        self.deliver(envelope);
    }

    // ── Downstream replies ───────────────────────────────────────────────────

    fn reply(&mut self, envelope: RequestEnvelope) {
        let lane = Lane::for_kind(&envelope.kind);
        self.watchdog.ready(lane);
        self.mark_ready(lane, envelope.id);

        if self.startup_id == Some(envelope.id) {
            self.startup_id = None;
            self.announce_ready(&envelope);
        }
        self.deliver(envelope);
    }

    fn mark_ready(&self, lane: Lane, id: Uuid) {
        if let Err(e) = self.sequencer.mark_ready(lane, id) {
            warn!(lane = %lane, error = %e, "could not mark lane ready");
        }
    }

    // ── Delivery ─────────────────────────────────────────────────────────────

    /// Route a finished envelope to its source.
    fn deliver(&self, envelope: RequestEnvelope) {
        match envelope.source {
            Source::Sink => {
                if envelope.has_error() {
                    debug!(id = %envelope.id, kind = envelope.kind.label(), error = ?envelope.error, "suppressed reply");
                }
            }
            Source::Internal => {
                if envelope.has_error() {
                    warn!(kind = envelope.kind.label(), error = ?envelope.error, "internal request failed");
                } else {
                    info!(kind = envelope.kind.label(), reply = %envelope.reply_text(), "internal request finished");
                }
            }
            source if source.is_peripheral() => {
                let id = envelope.id;
                if let Err(e) = self.bus.deliver(envelope) {
                    debug!(id = %id, source = %source, error = %e, "reply not delivered");
                }
            }
            other => warn!(source = %other, kind = envelope.kind.label(), "reply has no peripheral to return to"),
        }
    }

    // ── Startup and accounting ───────────────────────────────────────────────

    /// Queue the startup sequence: the optional normal-speed pose, a
    /// position read of every joint, then joint initialisation.
    fn startup(&mut self) {
        let mut sequence = Vec::new();
        if let Some(pose) = self.options.normal_speed_pose.clone() {
            sequence.push(RequestEnvelope::new(
                RequestKind::ExecutePose { pose, index: 0, goals: Vec::new() },
                Target::None,
            ));
        }
        sequence.push(
            RequestEnvelope::new(RequestKind::ListMotorProperty(JointProperty::Angle), Target::All)
                .with_delay(STARTUP_LIST_DELAY),
        );
        let initialize =
            RequestEnvelope::new(RequestKind::InitializeJoints, Target::All).with_delay(STARTUP_INITIALIZE_DELAY);
        self.startup_id = Some(initialize.id);
        sequence.push(initialize);

        for envelope in sequence {
            if let Err(e) = self.sequencer.enqueue(envelope.with_source(Source::Internal)) {
                warn!(error = %e, "could not queue startup request");
            }
        }
    }

    fn announce_ready(&self, initialized: &RequestEnvelope) {
        if initialized.has_error() {
            warn!(error = ?initialized.error, "joint initialisation reported an error");
        }
        let phrase = READY_PHRASES.choose(&mut rand::thread_rng()).copied().unwrap_or(READY_PHRASES[0]);
        let mut announcement =
            RequestEnvelope::new(RequestKind::Notification(phrase.to_string()), Target::None).with_source(Source::Internal);
        announcement.text = Some(phrase.to_string());
        let reached = self.bus.announce(&announcement);
        info!(peripherals = reached, phrase, "startup complete");
    }

    fn account(&mut self, elapsed: Duration) {
        self.metrics.record(std::mem::take(&mut self.busy), elapsed);
        for (lane, busy) in self.watchdog.check_all() {
            warn!(lane = %lane, busy_ms = busy.as_millis() as u64, "lane has not reported ready");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wiring
// ─────────────────────────────────────────────────────────────────────────────

/// Inputs to [`launch`].
pub struct Wiring {
    pub registry: Arc<MotorRegistry>,
    pub catalog: Arc<dyn PoseCatalog>,
    /// One port per bus, each with the receiver of its arriving bytes.
    pub ports: Vec<(Box<dyn SerialPort>, ByteReceiver)>,
    pub internet: Arc<dyn InternetService>,
    pub local: LocalResponder,
    pub bus: ReplyBus,
    pub options: HubOptions,
}

/// Handles to a launched system.
pub struct Running {
    /// Where peripherals submit requests.
    pub submit: Submitter,
    pub bus: ReplyBus,
    /// Completes when the hub stops.
    pub hub: JoinHandle<()>,
}

/// Spawn the bus engines, the aggregator, the sequencer, the internet
/// worker and the hub.  Must be called inside a Tokio runtime.
pub fn launch(wiring: Wiring) -> Running {
    let Wiring { registry, catalog, ports, internet, local, bus, options } = wiring;

    let (bus_reply_tx, bus_reply_rx) = mpsc::channel(64);
    let mut engines = Vec::with_capacity(ports.len());
    for (port, bytes) in ports {
        let (engine, handle) =
            BusEngine::new(port, bytes, Arc::clone(&registry), bus_reply_tx.clone(), options.engine.clone());
        tokio::spawn(engine.run());
        engines.push(handle);
    }
    drop(bus_reply_tx);

    let (reply_tx, replies) = mpsc::channel(64);
    let (aggregator, aggregator_handle) = BusAggregator::new(Arc::clone(&registry), engines, bus_reply_rx, reply_tx.clone());
    tokio::spawn(aggregator.run());

    let (worker, internet_tx) = InternetWorker::new(internet, reply_tx);
    tokio::spawn(worker.run());

    let (released_tx, released) = mpsc::channel(16);
    let (sequencer, sequencer_handle) = Sequencer::new(Arc::clone(&registry), Arc::clone(&catalog), released_tx);
    tokio::spawn(sequencer.run());

    let (submit, inbox) = mpsc::channel(64);
    let parts = HubParts {
        registry,
        catalog,
        sequencer: sequencer_handle,
        aggregator: aggregator_handle,
        internet: internet_tx,
        bus: bus.clone(),
        local,
        inbox,
        released,
        replies,
    };
    let hub = tokio::spawn(Hub::new(parts, options).run());
    Running { submit, bus, hub }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bert_hal::{SimHandle, SimulatedPort};
    use bert_kernel::{ActionStep, StaticCatalog};
    use bert_middleware::ReplyReceiver;
    use bert_types::{Joint, JointGoal, Limb, MetricKind, MotorConfiguration, MotorKind, read_motor};
    use tokio::time::timeout;

    use super::*;
    use crate::internet::InternetError;

    struct Echo;

    #[async_trait]
    impl InternetService for Echo {
        async fn ask(&self, question: &str) -> Result<String, InternetError> {
            Ok(format!("You asked about {question}"))
        }
    }

    fn registry() -> Result<Arc<MotorRegistry>, BertError> {
        let mut registry = MotorRegistry::new();
        registry.insert(
            MotorConfiguration::new(Joint::LeftElbowY, Limb::LeftArm, "upper", 42, MotorKind::Mx28)
                .with_limits(-10.0, 160.0)
                .with_dynamic_defaults(),
        )?;
        registry.insert(
            MotorConfiguration::new(Joint::NeckY, Limb::Head, "upper", 36, MotorKind::Ax12).with_dynamic_defaults(),
        )?;
        registry.insert(
            MotorConfiguration::new(Joint::LeftKneeY, Limb::LeftLeg, "lower", 12, MotorKind::Mx28)
                .with_dynamic_defaults(),
        )?;
        Ok(Arc::new(registry))
    }

    fn catalog() -> StaticCatalog {
        let goal = |joint, angle| JointGoal { joint, angle, speed: None, torque: None };
        StaticCatalog::new()
            .with_pose("greet", 0, vec![goal(Joint::LeftElbowY, 90.0), goal(Joint::NeckY, 10.0)])
            .with_pose("greet", 1, vec![goal(Joint::LeftElbowY, 45.0)])
            .with_pose("rest", 0, vec![goal(Joint::LeftKneeY, 0.0)])
            .with_action("wave", vec![ActionStep::new("greet", 0, 0), ActionStep::new("greet", 1, 100)], Some("bow"))
            .with_action("bow", vec![ActionStep::new("rest", 0, 0)], None)
    }

    struct Harness {
        running: Running,
        terminal: ReplyReceiver,
        sims: Vec<SimHandle>,
    }

    impl Harness {
        fn start(startup: bool) -> Result<Self, Box<dyn std::error::Error>> {
            let registry = registry()?;
            let mut ports: Vec<(Box<dyn SerialPort>, ByteReceiver)> = Vec::new();
            let mut sims = Vec::new();
            for bus in registry.bus_names() {
                let motors: Vec<MotorConfiguration> =
                    registry.motors_on_bus(&bus).iter().map(|m| read_motor(m).clone()).collect();
                let (port, bytes) = SimulatedPort::new(bus, &motors);
                sims.push(port.handle());
                ports.push((Box::new(port.with_chunk_size(3)), bytes));
            }
            let bus = ReplyBus::default();
            let terminal = bus.subscribe(Source::Terminal)?;
            let options = HubOptions {
                cadence: Duration::from_millis(50),
                startup,
                engine: EngineOptions {
                    write_spacing: Duration::from_millis(1),
                    reply_timeout: Duration::from_millis(500),
                },
                ..HubOptions::default()
            };
            let running = launch(Wiring {
                registry,
                catalog: Arc::new(catalog()),
                ports,
                internet: Arc::new(Echo),
                local: LocalResponder::default(),
                bus,
                options,
            });
            Ok(Self { running, terminal, sims })
        }

        async fn ask(&mut self, kind: RequestKind, target: Target) -> Result<RequestEnvelope, Box<dyn std::error::Error>> {
            let request = RequestEnvelope::new(kind, target).with_source(Source::Terminal);
            self.running.submit.send(request.clone()).await?;
            let reply = self.next().await?;
            assert_eq!(reply.id, request.id);
            Ok(reply)
        }

        async fn next(&mut self) -> Result<RequestEnvelope, Box<dyn std::error::Error>> {
            Ok(timeout(Duration::from_secs(5), self.terminal.recv()).await??)
        }

        async fn quiet(&mut self) -> bool {
            timeout(Duration::from_millis(300), self.terminal.recv()).await.is_err()
        }

        fn frames_written(&self) -> usize {
            self.sims.iter().map(|s| s.written().len()).sum()
        }
    }

    #[tokio::test]
    async fn out_of_range_angle_is_rejected_without_bus_traffic() -> Result<(), Box<dyn std::error::Error>> {
        let mut harness = Harness::start(false)?;
        let reply = harness
            .ask(
                RequestKind::SetMotorProperty { property: JointProperty::Angle, value: 200.0 },
                Target::Joint(Joint::LeftElbowY),
            )
            .await?;
        assert_eq!(reply.error.as_deref(), Some("the maximum angle for LEFT_ELBOW_Y is 160 degrees"));
        assert_eq!(harness.frames_written(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn unwired_joint_never_reaches_a_bus() -> Result<(), Box<dyn std::error::Error>> {
        let mut harness = Harness::start(false)?;
        let reply = harness
            .ask(RequestKind::GetMotorProperty(JointProperty::Temperature), Target::Joint(Joint::AbsZ))
            .await?;
        assert_eq!(reply.error.as_deref(), Some("My abs z is not connected to any motor bus"));

        let reply = harness
            .ask(
                RequestKind::SetLimbProperty { property: JointProperty::Speed, value: 40.0 },
                Target::Limb(Limb::Torso),
            )
            .await?;
        assert_eq!(reply.error.as_deref(), Some("My torso is not connected to any motor bus"));
        assert_eq!(harness.frames_written(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn metrics_are_answered_locally() -> Result<(), Box<dyn std::error::Error>> {
        let mut harness = Harness::start(false)?;
        let reply = harness.ask(RequestKind::GetMetric(MetricKind::Name), Target::None).await?;
        assert_eq!(reply.text.as_deref(), Some("My name is Bert"));
        let reply = harness
            .ask(RequestKind::GetMotorProperty(JointProperty::MaximumAngle), Target::Joint(Joint::LeftElbowY))
            .await?;
        assert_eq!(reply.text.as_deref(), Some("The maximum angle of my left elbow y is 160 degrees"));
        assert_eq!(harness.frames_written(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn motor_read_travels_to_the_bus_and_back() -> Result<(), Box<dyn std::error::Error>> {
        let mut harness = Harness::start(false)?;
        let reply = harness
            .ask(RequestKind::GetMotorProperty(JointProperty::Temperature), Target::Joint(Joint::LeftKneeY))
            .await?;
        assert!(!reply.has_error(), "{:?}", reply.error);
        assert!(reply.text.as_deref().is_some_and(|t| t.contains("30 degrees centigrade")));
        assert!(harness.frames_written() > 0);

        // The lane was released again: a second request goes through too.
        let reply = harness
            .ask(RequestKind::ListMotorProperty(JointProperty::Temperature), Target::All)
            .await?;
        assert_eq!(reply.text.as_deref(), Some("The temperatures of all motors have been logged"));
        Ok(())
    }

    #[tokio::test]
    async fn internet_queries_use_the_internet_lane() -> Result<(), Box<dyn std::error::Error>> {
        let mut harness = Harness::start(false)?;
        let reply = harness.ask(RequestKind::InternetQuery("the moon".into()), Target::None).await?;
        assert_eq!(reply.text.as_deref(), Some("You asked about the moon"));
        assert_eq!(harness.frames_written(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn action_replies_once_and_chains_its_follow_on() -> Result<(), Box<dyn std::error::Error>> {
        let mut harness = Harness::start(false)?;
        let wave = harness.ask(RequestKind::ExecuteAction("wave".into()), Target::None).await?;
        assert!(!wave.has_error(), "{:?}", wave.error);
        assert_eq!(wave.text.as_deref(), Some("I have completed the wave action"));

        let bow = harness.next().await?;
        assert_eq!(bow.kind, RequestKind::ExecuteAction("bow".into()));
        assert_eq!(bow.source, Source::Terminal);
        assert_eq!(bow.text.as_deref(), Some("I have completed the bow action"));

        assert!(harness.quiet().await, "pose and limb replies must be suppressed");
        Ok(())
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let mut harness = Harness::start(false)?;
        let reply = harness.ask(RequestKind::ExecuteAction("juggle".into()), Target::None).await?;
        assert_eq!(reply.error.as_deref(), Some("I don't know how to juggle"));
        Ok(())
    }

    #[tokio::test]
    async fn startup_announces_readiness() -> Result<(), Box<dyn std::error::Error>> {
        let mut harness = Harness::start(true)?;
        let announcement = harness.next().await?;
        let text = announcement.text.unwrap_or_default();
        assert!(READY_PHRASES.contains(&text.as_str()), "unexpected announcement {text}");
        assert_eq!(announcement.source, Source::Terminal);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_stops_the_hub() -> Result<(), Box<dyn std::error::Error>> {
        let mut harness = Harness::start(false)?;
        let reply = harness.ask(RequestKind::Command(CommandKind::Shutdown), Target::None).await?;
        assert_eq!(reply.text.as_deref(), Some("Shutting down"));
        timeout(Duration::from_secs(2), &mut harness.running.hub).await??;
        Ok(())
    }
}
