//! [`RequestEnvelope`] – the value object that carries a request from a
//! peripheral through the hub, the sequencer and the motor buses, and carries
//! the reply back.
//!
//! An envelope is mutated in place as it crosses component boundaries: fields
//! are filled in, never cleared.  [`RequestEnvelope::assign_error`] keeps the
//! first error it is given so that a later success cannot hide an earlier
//! failure.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{CommandKind, Joint, JointProperty, Limb, MetricKind, Source};

// ────────────────────────────────────────────────────────────────────────────
// Request kinds
// ────────────────────────────────────────────────────────────────────────────

/// One joint's target inside a pose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointGoal {
    pub joint: Joint,
    /// Target angle in degrees.
    pub angle: f64,
    /// Goal speed in degrees per second; `None` keeps the current speed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Torque limit in newton-meters; `None` keeps the current limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub torque: Option<f64>,
}

/// What an envelope asks for.  Each variant carries exactly the values it
/// needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestKind {
    Command(CommandKind),
    /// Read one property of a single joint.
    GetMotorProperty(JointProperty),
    /// Read one property of every joint selected by the target.
    ListMotorProperty(JointProperty),
    SetMotorProperty {
        property: JointProperty,
        value: f64,
    },
    /// Write one property on every joint of a limb.
    SetLimbProperty {
        property: JointProperty,
        value: f64,
    },
    /// Read the angle limits and torque limit of a joint.
    GetLimits,
    /// Read the goal position, speed and torque of a joint.
    GetGoals,
    /// Log the motor configuration table.
    GetConfiguration,
    /// Drive every joint back inside its configured limits.
    InitializeJoints,
    ExecutePose {
        pose: String,
        #[serde(default)]
        index: u32,
        /// Filled in by the sequencer for each per-limb sub-request.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        goals: Vec<JointGoal>,
    },
    ExecuteAction(String),
    GetMetric(MetricKind),
    GetJointLocation,
    GetAppendageLocation(String),
    InternetQuery(String),
    Notification(String),
    Heartbeat,
}

impl RequestKind {
    /// Short upper-case label used in logs and routing errors.
    pub fn label(&self) -> &'static str {
        match self {
            RequestKind::Command(_) => "COMMAND",
            RequestKind::GetMotorProperty(_) => "GET_MOTOR_PROPERTY",
            RequestKind::ListMotorProperty(_) => "LIST_MOTOR_PROPERTY",
            RequestKind::SetMotorProperty { .. } => "SET_MOTOR_PROPERTY",
            RequestKind::SetLimbProperty { .. } => "SET_LIMB_PROPERTY",
            RequestKind::GetLimits => "GET_LIMITS",
            RequestKind::GetGoals => "GET_GOALS",
            RequestKind::GetConfiguration => "GET_CONFIGURATION",
            RequestKind::InitializeJoints => "INITIALIZE_JOINTS",
            RequestKind::ExecutePose { .. } => "EXECUTE_POSE",
            RequestKind::ExecuteAction(_) => "EXECUTE_ACTION",
            RequestKind::GetMetric(_) => "GET_METRIC",
            RequestKind::GetJointLocation => "GET_JOINT_LOCATION",
            RequestKind::GetAppendageLocation(_) => "GET_APPENDAGE_LOCATION",
            RequestKind::InternetQuery(_) => "INTERNET_QUERY",
            RequestKind::Notification(_) => "NOTIFICATION",
            RequestKind::Heartbeat => "HEARTBEAT",
        }
    }
}

/// The part of the robot a request addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "name", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Target {
    #[default]
    None,
    Joint(Joint),
    Limb(Limb),
    /// A single serial bus, by name.
    Bus(String),
    All,
}

// ────────────────────────────────────────────────────────────────────────────
// Execution bookkeeping
// ────────────────────────────────────────────────────────────────────────────

/// Per-send bookkeeping.  Never serialized: it only has meaning inside the
/// process that is currently moving the envelope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionControl {
    /// Minimum wait before the envelope may be released from a delay queue.
    pub delay: Duration,
    /// Absolute release time, set when the envelope is queued.
    pub scheduled_at: Option<Instant>,
    /// Status replies still expected, keyed by bus name.
    pub outstanding: HashMap<String, u32>,
    /// Longest motor travel time produced by this request.
    pub travel_time: Duration,
}

// ────────────────────────────────────────────────────────────────────────────
// RequestEnvelope
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub kind: RequestKind,
    #[serde(default)]
    pub target: Target,
    #[serde(default)]
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip)]
    pub control: ExecutionControl,
}

impl RequestEnvelope {
    pub fn new(kind: RequestKind, target: Target) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            target,
            source: Source::default(),
            error: None,
            text: None,
            control: ExecutionControl::default(),
        }
    }

    /// Builder: set the originating source.
    pub fn with_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    /// Builder: set the release delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.control.delay = delay;
        self
    }

    /// Create a sub-request with a fresh id that inherits this envelope's
    /// source.  Error, text and bookkeeping are not inherited.
    pub fn derive(&self, kind: RequestKind, target: Target) -> Self {
        Self::new(kind, target).with_source(self.source)
    }

    /// Record `message` as the error unless one is already present.
    pub fn assign_error(&mut self, message: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(message.into());
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }

    /// The joint this envelope addresses, if any.
    pub fn joint(&self) -> Option<Joint> {
        match self.target {
            Target::Joint(j) => Some(j),
            _ => None,
        }
    }

    /// The limb this envelope addresses, if any.
    pub fn limb(&self) -> Option<Limb> {
        match self.target {
            Target::Limb(l) => Some(l),
            _ => None,
        }
    }

    /// What a peripheral should show the user: the error if there is one,
    /// otherwise the text, otherwise a generic acknowledgement.
    pub fn reply_text(&self) -> String {
        if let Some(error) = self.error.as_deref().filter(|e| !e.is_empty()) {
            return error.to_string();
        }
        match self.text.as_deref() {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => "Done".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins() {
        let mut env = RequestEnvelope::new(RequestKind::Heartbeat, Target::None);
        assert!(!env.has_error());
        env.assign_error("Motor 3 encountered overheating");
        env.assign_error("later failure");
        assert_eq!(env.error.as_deref(), Some("Motor 3 encountered overheating"));
        assert!(env.has_error());
    }

    #[test]
    fn derived_envelope_gets_fresh_id_and_same_source() {
        let parent = RequestEnvelope::new(RequestKind::InitializeJoints, Target::All)
            .with_source(Source::Terminal);
        let child = parent.derive(
            RequestKind::ListMotorProperty(JointProperty::Angle),
            Target::Limb(Limb::Head),
        );
        assert_ne!(parent.id, child.id);
        assert_eq!(child.source, Source::Terminal);
        assert_eq!(child.limb(), Some(Limb::Head));
    }

    #[test]
    fn reply_text_prefers_error_then_text() {
        let mut env = RequestEnvelope::new(RequestKind::Heartbeat, Target::None);
        assert_eq!(env.reply_text(), "Done");
        env.text = Some("I am alive".into());
        assert_eq!(env.reply_text(), "I am alive");
        env.assign_error("broken");
        assert_eq!(env.reply_text(), "broken");
    }

    #[test]
    fn envelope_json_is_tagged_and_skips_bookkeeping() -> Result<(), Box<dyn std::error::Error>> {
        let env = RequestEnvelope::new(
            RequestKind::SetMotorProperty {
                property: JointProperty::Angle,
                value: 45.0,
            },
            Target::Joint(Joint::LeftElbowY),
        )
        .with_delay(Duration::from_millis(250));
        let json = serde_json::to_string(&env)?;
        assert!(json.contains("\"SET_MOTOR_PROPERTY\""));
        assert!(json.contains("\"LEFT_ELBOW_Y\""));
        assert!(!json.contains("delay"));

        let back: RequestEnvelope = serde_json::from_str(&json)?;
        assert_eq!(back.kind, env.kind);
        assert_eq!(back.control.delay, Duration::ZERO);
        Ok(())
    }

    #[test]
    fn minimal_json_fills_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let raw = r#"{"kind":{"type":"GET_METRIC","payload":"NAME"}}"#;
        let env: RequestEnvelope = serde_json::from_str(raw)?;
        assert_eq!(env.kind, RequestKind::GetMetric(MetricKind::Name));
        assert_eq!(env.target, Target::None);
        assert_eq!(env.source, Source::Network);
        Ok(())
    }
}
