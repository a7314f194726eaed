//! Requests the hub answers without any downstream subsystem.
//!
//! | Kind | Answer |
//! |---|---|
//! | `GET_METRIC` | robot profile or [`CycleMetrics`] |
//! | `GET_JOINT_LOCATION` | [`Kinematics::joint_location`] |
//! | `GET_APPENDAGE_LOCATION` | [`Kinematics::appendage_location`] |
//! | `COMMAND` (halt, shutdown, sleep, wake) | acknowledgement |
//! | `HEARTBEAT` | acknowledgement |
//! | `NOTIFICATION` | the message itself |
//!
//! Side effects of halt and shutdown belong to the hub; this module only
//! writes the reply text.

use bert_types::{CommandKind, Joint, MetricKind, RequestEnvelope, RequestKind};
use chrono::{NaiveDate, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::metrics::CycleMetrics;

const MITTENS: [&str; 4] = [
    "Mittens is my cat",
    "Mittens is asleep on the sofa",
    "Mittens says meow",
    "I have not seen Mittens today",
];

// ────────────────────────────────────────────────────────────────────────────
// Collaborators
// ────────────────────────────────────────────────────────────────────────────

/// Forward kinematics, consumed only to answer "where is X" questions.
/// Coordinates are centimetres in the robot's body frame.
pub trait Kinematics: Send + Sync {
    fn joint_location(&self, joint: Joint) -> Option<[f64; 3]>;
    fn appendage_location(&self, appendage: &str) -> Option<[f64; 3]>;
}

/// Used when no solver is installed: every location is unknown.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoKinematics;

impl Kinematics for NoKinematics {
    fn joint_location(&self, _joint: Joint) -> Option<[f64; 3]> {
        None
    }

    fn appendage_location(&self, _appendage: &str) -> Option<[f64; 3]> {
        None
    }
}

/// Facts the robot knows about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotProfile {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_height")]
    pub height_cm: u32,
    #[serde(default = "default_born")]
    pub born: NaiveDate,
}

fn default_name() -> String {
    "Bert".to_string()
}

fn default_height() -> u32 {
    60
}

fn default_born() -> NaiveDate {
    NaiveDate::from_ymd_opt(2016, 1, 1).unwrap_or(NaiveDate::MIN)
}

impl Default for RobotProfile {
    fn default() -> Self {
        Self { name: default_name(), height_cm: default_height(), born: default_born() }
    }
}

impl RobotProfile {
    /// Whole days since `born`, never negative.
    pub fn age_days(&self, today: NaiveDate) -> i64 {
        (today - self.born).num_days().max(0)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// LocalResponder
// ────────────────────────────────────────────────────────────────────────────

pub struct LocalResponder {
    profile: RobotProfile,
    kinematics: Box<dyn Kinematics>,
}

impl LocalResponder {
    pub fn new(profile: RobotProfile, kinematics: Box<dyn Kinematics>) -> Self {
        Self { profile, kinematics }
    }

    pub fn profile(&self) -> &RobotProfile {
        &self.profile
    }

    /// `true` for kinds this responder owns.
    pub fn handles(kind: &RequestKind) -> bool {
        matches!(
            kind,
            RequestKind::GetMetric(_)
                | RequestKind::GetJointLocation
                | RequestKind::GetAppendageLocation(_)
                | RequestKind::Heartbeat
                | RequestKind::Notification(_)
                | RequestKind::Command(
                    CommandKind::Halt | CommandKind::Shutdown | CommandKind::Sleep | CommandKind::Wake
                )
        )
    }

    /// Fill in the text (or error) of a local request.  Returns `false`,
    /// leaving the envelope untouched, when the kind is not local.
    pub fn answer(&self, envelope: &mut RequestEnvelope, metrics: &CycleMetrics) -> bool {
        let text = match &envelope.kind {
            RequestKind::GetMetric(metric) => self.metric(*metric, metrics),
            RequestKind::GetJointLocation => match envelope.joint() {
                None => Err("A joint is required for GET_JOINT_LOCATION".to_string()),
                Some(joint) => match self.kinematics.joint_location(joint) {
                    Some(at) => Ok(format!("My {} is at {}", joint.spoken(), coordinates(at))),
                    None => Err(format!("I do not know where my {} is", joint.spoken())),
                },
            },
            RequestKind::GetAppendageLocation(appendage) => match self.kinematics.appendage_location(appendage) {
                Some(at) => Ok(format!("My {} is at {}", appendage.to_lowercase(), coordinates(at))),
                None => Err(format!("I do not know where my {} is", appendage.to_lowercase())),
            },
            RequestKind::Command(CommandKind::Halt) => Ok("Stopping all motion".to_string()),
            RequestKind::Command(CommandKind::Shutdown) => Ok("Shutting down".to_string()),
            RequestKind::Command(CommandKind::Sleep) => Ok("Going to sleep".to_string()),
            RequestKind::Command(CommandKind::Wake) => Ok("I am awake".to_string()),
            RequestKind::Heartbeat => Ok(format!("{} is alive", self.profile.name)),
            RequestKind::Notification(message) => Ok(message.clone()),
            _ => return false,
        };
        match text {
            Ok(text) => envelope.text = Some(text),
            Err(error) => envelope.assign_error(error),
        }
        true
    }

    fn metric(&self, metric: MetricKind, metrics: &CycleMetrics) -> Result<String, String> {
        Ok(match metric {
            MetricKind::Name => format!("My name is {}", self.profile.name),
            MetricKind::Height => format!("I am {} centimeters tall", self.profile.height_cm),
            MetricKind::Cadence => format!("My cadence is {} milliseconds", metrics.cadence().as_millis()),
            MetricKind::CycleCount => format!("I have completed {} cycles", metrics.cycle_count()),
            MetricKind::CycleTime => {
                format!("My average cycle time is {:.0} milliseconds", metrics.cycle_time_ms())
            }
            MetricKind::DutyCycle => format!("My duty cycle is {:.0} percent", metrics.duty_cycle() * 100.0),
            MetricKind::Age => format!("I am {} days old", self.profile.age_days(Utc::now().date_naive())),
            MetricKind::Mittens => MITTENS
                .choose(&mut rand::thread_rng())
                .map(|phrase| phrase.to_string())
                .ok_or_else(|| "I have nothing to say about Mittens".to_string())?,
        })
    }
}

impl Default for LocalResponder {
    fn default() -> Self {
        Self::new(RobotProfile::default(), Box::new(NoKinematics))
    }
}

fn coordinates([x, y, z]: [f64; 3]) -> String {
    format!("{x:.1}, {y:.1}, {z:.1} centimeters")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bert_types::Target;

    use super::*;

    struct FixedKinematics;

    impl Kinematics for FixedKinematics {
        fn joint_location(&self, joint: Joint) -> Option<[f64; 3]> {
            (joint == Joint::LeftElbowY).then_some([10.0, 22.5, 41.0])
        }

        fn appendage_location(&self, appendage: &str) -> Option<[f64; 3]> {
            appendage.eq_ignore_ascii_case("left hand").then_some([12.0, 30.0, 35.0])
        }
    }

    fn ask(responder: &LocalResponder, kind: RequestKind, target: Target) -> RequestEnvelope {
        let mut envelope = RequestEnvelope::new(kind, target);
        assert!(responder.answer(&mut envelope, &CycleMetrics::default()));
        envelope
    }

    #[test]
    fn profile_metrics_use_configured_values() {
        let profile = RobotProfile { name: "Bert".into(), height_cm: 62, ..RobotProfile::default() };
        let responder = LocalResponder::new(profile, Box::new(NoKinematics));
        let name = ask(&responder, RequestKind::GetMetric(MetricKind::Name), Target::None);
        assert_eq!(name.text.as_deref(), Some("My name is Bert"));
        let height = ask(&responder, RequestKind::GetMetric(MetricKind::Height), Target::None);
        assert_eq!(height.text.as_deref(), Some("I am 62 centimeters tall"));
    }

    #[test]
    fn cycle_metrics_are_reported() {
        let responder = LocalResponder::default();
        let mut metrics = CycleMetrics::new(Duration::from_millis(500));
        metrics.record(Duration::from_millis(40), Duration::from_millis(500));

        let mut cadence = RequestEnvelope::new(RequestKind::GetMetric(MetricKind::Cadence), Target::None);
        responder.answer(&mut cadence, &metrics);
        assert_eq!(cadence.text.as_deref(), Some("My cadence is 500 milliseconds"));

        let mut duty = RequestEnvelope::new(RequestKind::GetMetric(MetricKind::DutyCycle), Target::None);
        responder.answer(&mut duty, &metrics);
        assert_eq!(duty.text.as_deref(), Some("My duty cycle is 8 percent"));

        let mut count = RequestEnvelope::new(RequestKind::GetMetric(MetricKind::CycleCount), Target::None);
        responder.answer(&mut count, &metrics);
        assert_eq!(count.text.as_deref(), Some("I have completed 1 cycles"));
    }

    #[test]
    fn age_counts_days_since_birth() -> Result<(), Box<dyn std::error::Error>> {
        let profile = RobotProfile { born: NaiveDate::from_ymd_opt(2020, 1, 1).ok_or("date")?, ..RobotProfile::default() };
        let today = NaiveDate::from_ymd_opt(2020, 1, 31).ok_or("date")?;
        assert_eq!(profile.age_days(today), 30);
        let before = NaiveDate::from_ymd_opt(2019, 12, 1).ok_or("date")?;
        assert_eq!(profile.age_days(before), 0);
        Ok(())
    }

    #[test]
    fn mittens_answers_with_a_known_phrase() {
        let responder = LocalResponder::default();
        let envelope = ask(&responder, RequestKind::GetMetric(MetricKind::Mittens), Target::None);
        let text = envelope.text.unwrap_or_default();
        assert!(MITTENS.contains(&text.as_str()), "unexpected phrase {text}");
    }

    #[test]
    fn locations_come_from_the_solver() {
        let responder = LocalResponder::new(RobotProfile::default(), Box::new(FixedKinematics));
        let elbow = ask(&responder, RequestKind::GetJointLocation, Target::Joint(Joint::LeftElbowY));
        assert_eq!(elbow.text.as_deref(), Some("My left elbow y is at 10.0, 22.5, 41.0 centimeters"));

        let hand = ask(&responder, RequestKind::GetAppendageLocation("LEFT HAND".into()), Target::None);
        assert_eq!(hand.text.as_deref(), Some("My left hand is at 12.0, 30.0, 35.0 centimeters"));

        let knee = ask(&responder, RequestKind::GetJointLocation, Target::Joint(Joint::RightKneeY));
        assert_eq!(knee.error.as_deref(), Some("I do not know where my right knee y is"));

        let missing = ask(&responder, RequestKind::GetJointLocation, Target::None);
        assert!(missing.has_error());
    }

    #[test]
    fn commands_and_notifications_are_acknowledged() {
        let responder = LocalResponder::default();
        let halt = ask(&responder, RequestKind::Command(CommandKind::Halt), Target::None);
        assert_eq!(halt.text.as_deref(), Some("Stopping all motion"));
        let note = ask(&responder, RequestKind::Notification("Battery low".into()), Target::None);
        assert_eq!(note.text.as_deref(), Some("Battery low"));
        let beat = ask(&responder, RequestKind::Heartbeat, Target::None);
        assert_eq!(beat.text.as_deref(), Some("Bert is alive"));
    }

    #[test]
    fn motor_kinds_are_not_local() {
        let responder = LocalResponder::default();
        let mut freeze = RequestEnvelope::new(RequestKind::Command(CommandKind::Freeze), Target::None);
        assert!(!LocalResponder::handles(&freeze.kind));
        assert!(!responder.answer(&mut freeze, &CycleMetrics::default()));
        assert!(freeze.text.is_none() && freeze.error.is_none());
    }
}
