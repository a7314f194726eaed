//! Terminal peripheral – the local console.
//!
//! Lines are read on a dedicated OS thread (rustyline blocks) and handed to
//! the async loop over a channel.  Replies addressed to
//! [`Source::Terminal`] are printed through rustyline's external printer so
//! they do not garble the line being typed.
//!
//! A line is either a raw JSON envelope (starting with `{`) or `verb args`:
//!
//! | Input | Request |
//! |---|---|
//! | `get <property> <joint>` | `GET_MOTOR_PROPERTY` |
//! | `list <property> [limb\|all]` | `LIST_MOTOR_PROPERTY` |
//! | `set <property> <joint\|limb> <value>` | `SET_MOTOR_PROPERTY` / `SET_LIMB_PROPERTY` |
//! | `limits <joint>`, `goals <joint>` | `GET_LIMITS`, `GET_GOALS` |
//! | `config`, `init` | `GET_CONFIGURATION`, `INITIALIZE_JOINTS` |
//! | `pose <name> [index]`, `do <action>` | `EXECUTE_POSE`, `EXECUTE_ACTION` |
//! | `metric <name>` | `GET_METRIC` |
//! | `where <joint>`, `locate <appendage>` | joint / appendage location |
//! | `ask <question>`, `say <text>`, `ping` | internet query, notification, heartbeat |
//! | `freeze`, `relax`, `reset`, `halt`, `sleep`, `wake`, `shutdown` `[target]` | `COMMAND` |

use std::path::PathBuf;

use bert_middleware::{ReplyBus, ReplyReceiver, Submitter};
use bert_types::{
    BertError, CommandKind, Joint, JointProperty, Limb, MetricKind, RequestEnvelope, RequestKind, Source, Target,
};
use colored::Colorize;
use rustyline::ExternalPrinter;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

const PROMPT: &str = "bert> ";

pub const HELP: &str = "\
get <property> <joint>              read one property
list <property> [limb|all]          read a property of many joints
set <property> <joint|limb> <value> write a property
limits <joint> | goals <joint>      read limits or goals
config | init                       log the motor table, initialize joints
pose <name> [index] | do <action>   move
metric <name>                       name, height, age, cadence, cycle count, ...
where <joint> | locate <appendage>  locations
ask <question> | say <text> | ping  internet, notification, heartbeat
freeze | relax | reset | halt | sleep | wake | shutdown [target]
{ ... }                             a raw JSON request
help | quit";

/// What one console line asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    Submit(RequestEnvelope),
    Help,
    Quit,
    Empty,
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Parse one console line.  Submitted envelopes always come from
/// [`Source::Terminal`].
pub fn parse_line(line: &str) -> Result<Line, BertError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Line::Empty);
    }
    if line.starts_with('{') {
        let mut envelope: RequestEnvelope =
            serde_json::from_str(line).map_err(|e| BertError::Parse(format!("bad request: {e}")))?;
        envelope.source = Source::Terminal;
        envelope.error = None;
        envelope.text = None;
        return Ok(Line::Submit(envelope));
    }

    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let args: Vec<&str> = rest.split_whitespace().collect();
    let verb = verb.to_ascii_lowercase();

    let (kind, target) = match verb.as_str() {
        "help" | "?" => return Ok(Line::Help),
        "quit" | "exit" => return Ok(Line::Quit),
        "get" => {
            let [property, joint] = args[..] else {
                return Err(usage("get <property> <joint>"));
            };
            (RequestKind::GetMotorProperty(property.parse()?), Target::Joint(joint.parse()?))
        }
        "list" => match args[..] {
            [property] => (RequestKind::ListMotorProperty(property.parse()?), Target::All),
            [property, target] => (RequestKind::ListMotorProperty(property.parse()?), parse_target(target)?),
            _ => return Err(usage("list <property> [limb|all]")),
        },
        "set" => {
            let [property, target, value] = args[..] else {
                return Err(usage("set <property> <joint|limb> <value>"));
            };
            let property: JointProperty = property.parse()?;
            let value = parse_value(value)?;
            match parse_target(target)? {
                Target::Joint(joint) => (RequestKind::SetMotorProperty { property, value }, Target::Joint(joint)),
                Target::Limb(limb) => (RequestKind::SetLimbProperty { property, value }, Target::Limb(limb)),
                _ => return Err(BertError::Parse(format!("'{target}' is not a joint or a limb"))),
            }
        }
        "limits" | "goals" => {
            let [joint] = args[..] else {
                return Err(usage(&format!("{verb} <joint>")));
            };
            let kind = if verb == "limits" { RequestKind::GetLimits } else { RequestKind::GetGoals };
            (kind, Target::Joint(joint.parse()?))
        }
        "config" => (RequestKind::GetConfiguration, Target::All),
        "init" => (RequestKind::InitializeJoints, Target::All),
        "pose" => {
            let (pose, index) = match args[..] {
                [pose] => (pose, 0),
                [pose, index] => (
                    pose,
                    index.parse::<u32>().map_err(|_| BertError::Parse(format!("'{index}' is not a pose index")))?,
                ),
                _ => return Err(usage("pose <name> [index]")),
            };
            (RequestKind::ExecutePose { pose: pose.to_string(), index, goals: Vec::new() }, Target::None)
        }
        "do" => {
            let [action] = args[..] else {
                return Err(usage("do <action>"));
            };
            (RequestKind::ExecuteAction(action.to_string()), Target::None)
        }
        "metric" => {
            if rest.is_empty() {
                return Err(usage("metric <name>"));
            }
            (RequestKind::GetMetric(rest.parse::<MetricKind>()?), Target::None)
        }
        "where" => {
            if rest.is_empty() {
                return Err(usage("where <joint>"));
            }
            (RequestKind::GetJointLocation, Target::Joint(rest.parse()?))
        }
        "locate" => (RequestKind::GetAppendageLocation(required(rest, "locate <appendage>")?), Target::None),
        "ask" => (RequestKind::InternetQuery(required(rest, "ask <question>")?), Target::None),
        "say" => (RequestKind::Notification(required(rest, "say <text>")?), Target::None),
        "ping" => (RequestKind::Heartbeat, Target::None),
        word => {
            let command: CommandKind = word
                .parse()
                .map_err(|_| BertError::Parse(format!("unknown command '{word}', try 'help'")))?;
            let target = match args[..] {
                [] => Target::All,
                [target] => parse_target(target)?,
                _ => return Err(usage(&format!("{word} [joint|limb|all]"))),
            };
            (RequestKind::Command(command), target)
        }
    };
    Ok(Line::Submit(RequestEnvelope::new(kind, target).with_source(Source::Terminal)))
}

/// A joint, a limb or `all`.
fn parse_target(word: &str) -> Result<Target, BertError> {
    if word.eq_ignore_ascii_case("all") {
        return Ok(Target::All);
    }
    if let Ok(joint) = word.parse::<Joint>() {
        return Ok(Target::Joint(joint));
    }
    word.parse::<Limb>()
        .map(Target::Limb)
        .map_err(|_| BertError::Parse(format!("unknown joint or limb '{word}'")))
}

fn parse_value(word: &str) -> Result<f64, BertError> {
    match word.to_ascii_lowercase().as_str() {
        "on" | "true" => Ok(1.0),
        "off" | "false" => Ok(0.0),
        _ => word.parse().map_err(|_| BertError::Parse(format!("'{word}' is not a number"))),
    }
}

fn required(rest: &str, form: &str) -> Result<String, BertError> {
    if rest.is_empty() { Err(usage(form)) } else { Ok(rest.to_string()) }
}

fn usage(form: &str) -> BertError {
    BertError::Parse(format!("usage: {form}"))
}

/// One reply as shown on the console.
pub fn render(reply: &RequestEnvelope) -> String {
    if reply.has_error() {
        format!("{} {}", "✗".red().bold(), reply.reply_text().red())
    } else {
        format!("{} {}", "●".green(), reply.reply_text())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Readline thread
// ─────────────────────────────────────────────────────────────────────────────

enum ReadlineEvent {
    Line(String),
    Eof,
}

type Printer = Box<dyn ExternalPrinter + Send>;

fn spawn_readline_thread(history: Option<PathBuf>) -> (mpsc::UnboundedReceiver<ReadlineEvent>, Option<Printer>) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (printer_tx, printer_rx) = std::sync::mpsc::sync_channel::<Option<Printer>>(1);

    let spawned = std::thread::Builder::new().name("bert-readline".into()).spawn(move || {
        let config = rustyline::Config::builder().auto_add_history(true).build();
        let mut rl = match rustyline::DefaultEditor::with_config(config) {
            Ok(editor) => editor,
            Err(e) => {
                error!("failed to create line editor: {e}");
                let _ = printer_tx.send(None);
                let _ = event_tx.send(ReadlineEvent::Eof);
                return;
            }
        };
        if let Some(path) = &history
            && let Err(e) = rl.load_history(path)
        {
            debug!("no console history loaded: {e}");
        }
        let printer = rl.create_external_printer().ok().map(|p| Box::new(p) as Printer);
        let _ = printer_tx.send(printer);

        loop {
            match rl.readline(PROMPT) {
                Ok(line) => {
                    if event_tx.send(ReadlineEvent::Line(line)).is_err() {
                        break;
                    }
                }
                Err(rustyline::error::ReadlineError::Interrupted) => continue,
                Err(rustyline::error::ReadlineError::Eof) => {
                    let _ = event_tx.send(ReadlineEvent::Eof);
                    break;
                }
                Err(e) => {
                    error!("console read error: {e}");
                    let _ = event_tx.send(ReadlineEvent::Eof);
                    break;
                }
            }
        }
        if let Some(path) = &history {
            let _ = rl.save_history(path);
        }
    });
    if let Err(e) = spawned {
        error!("failed to spawn console thread: {e}");
    }

    let printer = printer_rx.recv().ok().flatten();
    (event_rx, printer)
}

// ─────────────────────────────────────────────────────────────────────────────
// Terminal
// ─────────────────────────────────────────────────────────────────────────────

pub struct Terminal {
    submit: Submitter,
    replies: ReplyReceiver,
    history: Option<PathBuf>,
    printer: Option<Printer>,
}

impl Terminal {
    /// Subscribe to terminal replies.  Subscribe before the hub starts so
    /// the startup announcement is not missed.
    pub fn new(submit: Submitter, bus: &ReplyBus) -> Result<Self, BertError> {
        Ok(Self { submit, replies: bus.subscribe(Source::Terminal)?, history: None, printer: None })
    }

    /// Builder: load and save line history at `path`.
    pub fn with_history(mut self, path: PathBuf) -> Self {
        self.history = Some(path);
        self
    }

    /// Run until the user quits or the hub stops.  Quitting asks the hub to
    /// shut down.
    pub async fn run(mut self) {
        let (mut lines, printer) = spawn_readline_thread(self.history.take());
        self.printer = printer;

        loop {
            tokio::select! {
                event = lines.recv() => match event {
                    Some(ReadlineEvent::Line(line)) => match parse_line(&line) {
                        Ok(Line::Submit(envelope)) => {
                            if self.submit.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        Ok(Line::Help) => self.print(HELP.to_string()),
                        Ok(Line::Empty) => {}
                        Ok(Line::Quit) => {
                            request_shutdown(&self.submit).await;
                            break;
                        }
                        Err(e) => self.print(format!("{} {e}", "✗".red().bold())),
                    },
                    Some(ReadlineEvent::Eof) | None => {
                        request_shutdown(&self.submit).await;
                        break;
                    }
                },
                reply = self.replies.recv() => match reply {
                    Ok(reply) => self.print(render(&reply)),
                    Err(RecvError::Lagged(n)) => warn!(missed = n, "console fell behind on replies"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    fn print(&mut self, text: String) {
        if let Some(printer) = self.printer.as_mut()
            && printer.print(text.clone()).is_ok()
        {
            return;
        }
        println!("{text}");
    }
}

/// Ask the hub to shut down on behalf of the console.
async fn request_shutdown(submit: &Submitter) -> bool {
    let envelope =
        RequestEnvelope::new(RequestKind::Command(CommandKind::Shutdown), Target::All).with_source(Source::Terminal);
    match submit.send(envelope).await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "hub is gone, shutdown request dropped");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submitted(line: &str) -> Result<RequestEnvelope, Box<dyn std::error::Error>> {
        match parse_line(line)? {
            Line::Submit(envelope) => Ok(envelope),
            other => Err(format!("expected a request, got {other:?}").into()),
        }
    }

    #[test]
    fn property_reads_address_a_joint() -> Result<(), Box<dyn std::error::Error>> {
        let env = submitted("get temperature left_elbow_y")?;
        assert_eq!(env.kind, RequestKind::GetMotorProperty(JointProperty::Temperature));
        assert_eq!(env.target, Target::Joint(Joint::LeftElbowY));
        assert_eq!(env.source, Source::Terminal);

        let list = submitted("list angle")?;
        assert_eq!(list.kind, RequestKind::ListMotorProperty(JointProperty::Angle));
        assert_eq!(list.target, Target::All);
        assert_eq!(submitted("list angle left_arm")?.target, Target::Limb(Limb::LeftArm));
        Ok(())
    }

    #[test]
    fn set_picks_motor_or_limb_write() -> Result<(), Box<dyn std::error::Error>> {
        let joint = submitted("set angle neck_z 30")?;
        assert_eq!(joint.kind, RequestKind::SetMotorProperty { property: JointProperty::Angle, value: 30.0 });
        let limb = submitted("SET state right_arm off")?;
        assert_eq!(limb.kind, RequestKind::SetLimbProperty { property: JointProperty::State, value: 0.0 });
        assert_eq!(limb.target, Target::Limb(Limb::RightArm));
        assert!(parse_line("set angle all 10").is_err());
        assert!(parse_line("set angle neck_z fast").is_err());
        Ok(())
    }

    #[test]
    fn motion_and_questions() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(
            submitted("pose greet 1")?.kind,
            RequestKind::ExecutePose { pose: "greet".into(), index: 1, goals: Vec::new() }
        );
        assert_eq!(submitted("do wave")?.kind, RequestKind::ExecuteAction("wave".into()));
        assert_eq!(submitted("metric duty cycle")?.kind, RequestKind::GetMetric(MetricKind::DutyCycle));
        assert_eq!(submitted("where left knee y")?.target, Target::Joint(Joint::LeftKneeY));
        assert_eq!(
            submitted("ask how tall is Mount Everest?")?.kind,
            RequestKind::InternetQuery("how tall is Mount Everest?".into())
        );
        assert_eq!(submitted("ping")?.kind, RequestKind::Heartbeat);
        Ok(())
    }

    #[test]
    fn command_words_default_to_every_joint() -> Result<(), Box<dyn std::error::Error>> {
        let freeze = submitted("freeze")?;
        assert_eq!(freeze.kind, RequestKind::Command(CommandKind::Freeze));
        assert_eq!(freeze.target, Target::All);
        assert_eq!(submitted("relax left_leg")?.target, Target::Limb(Limb::LeftLeg));
        Ok(())
    }

    #[test]
    fn raw_json_is_rewritten_as_terminal_request() -> Result<(), Box<dyn std::error::Error>> {
        let env = submitted(
            r#"{"kind": {"type": "GET_LIMITS"}, "target": {"kind": "JOINT", "name": "NECK_Y"},
                "source": "NETWORK", "error": "stale"}"#,
        )?;
        assert_eq!(env.kind, RequestKind::GetLimits);
        assert_eq!(env.source, Source::Terminal);
        assert!(env.error.is_none());
        Ok(())
    }

    #[test]
    fn console_words_and_mistakes() {
        assert_eq!(parse_line("   ").ok(), Some(Line::Empty));
        assert_eq!(parse_line("help").ok(), Some(Line::Help));
        assert_eq!(parse_line("QUIT").ok(), Some(Line::Quit));
        assert!(matches!(parse_line("dance"), Err(BertError::Parse(_))));
        assert!(matches!(parse_line("get angle"), Err(BertError::Parse(_))));
        assert!(matches!(parse_line("get angle left_toe"), Err(BertError::Parse(_))));
        assert!(matches!(parse_line("ask"), Err(BertError::Parse(_))));
        assert!(matches!(parse_line("{not json"), Err(BertError::Parse(_))));
    }

    #[test]
    fn errors_are_rendered_instead_of_text() {
        colored::control::set_override(false);
        let mut reply = RequestEnvelope::new(RequestKind::Heartbeat, Target::None).with_source(Source::Terminal);
        reply.text = Some("Bert is alive".into());
        assert_eq!(render(&reply), "● Bert is alive");
        reply.assign_error("Motor 44 encountered overheating");
        assert_eq!(render(&reply), "✗ Motor 44 encountered overheating");
    }

    #[tokio::test]
    async fn quitting_submits_a_terminal_shutdown() -> Result<(), Box<dyn std::error::Error>> {
        let (submit, mut hub) = mpsc::channel(4);
        assert!(request_shutdown(&submit).await);
        let env = hub.recv().await.ok_or("no shutdown request")?;
        assert_eq!(env.kind, RequestKind::Command(CommandKind::Shutdown));
        assert_eq!(env.source, Source::Terminal);

        drop(hub);
        assert!(!request_shutdown(&submit).await);
        Ok(())
    }

    #[test]
    fn console_can_run_on_the_multi_thread_runtime() -> Result<(), Box<dyn std::error::Error>> {
        fn assert_send<T: Send>(_: &T) {}
        let (submit, _hub) = mpsc::channel(1);
        let bus = ReplyBus::default();
        let console = Terminal::new(submit, &bus)?;
        let running = console.run();
        assert_send(&running);
        Ok(())
    }
}
