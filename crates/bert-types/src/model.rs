//! Closed vocabularies shared by every crate: joints, limbs, properties,
//! commands, metrics, motor families and peripheral sources.
//!
//! Every enumeration parses through [`FromStr`] and reports unknown names as
//! [`BertError::Parse`] instead of falling back to a sentinel value.  Parsing
//! is case-insensitive and treats spaces and hyphens like underscores, so
//! `"left elbow y"`, `"LEFT-ELBOW-Y"` and `"LEFT_ELBOW_Y"` all name the same
//! joint.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::BertError;

/// Normalise a user-supplied name to `SCREAMING_SNAKE_CASE`.
fn normalise(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Joint
// ────────────────────────────────────────────────────────────────────────────

/// A single motorised axis of the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Joint {
    AbsX,
    AbsY,
    AbsZ,
    BustX,
    BustY,
    NeckY,
    NeckZ,
    LeftAnkleY,
    LeftElbowY,
    LeftHipX,
    LeftHipY,
    LeftHipZ,
    LeftKneeY,
    LeftShoulderX,
    LeftShoulderY,
    LeftShoulderZ,
    RightAnkleY,
    RightElbowY,
    RightHipX,
    RightHipY,
    RightHipZ,
    RightKneeY,
    RightShoulderX,
    RightShoulderY,
    RightShoulderZ,
}

impl Joint {
    /// Every joint, in declaration order.
    pub const ALL: [Joint; 25] = [
        Joint::AbsX,
        Joint::AbsY,
        Joint::AbsZ,
        Joint::BustX,
        Joint::BustY,
        Joint::NeckY,
        Joint::NeckZ,
        Joint::LeftAnkleY,
        Joint::LeftElbowY,
        Joint::LeftHipX,
        Joint::LeftHipY,
        Joint::LeftHipZ,
        Joint::LeftKneeY,
        Joint::LeftShoulderX,
        Joint::LeftShoulderY,
        Joint::LeftShoulderZ,
        Joint::RightAnkleY,
        Joint::RightElbowY,
        Joint::RightHipX,
        Joint::RightHipY,
        Joint::RightHipZ,
        Joint::RightKneeY,
        Joint::RightShoulderX,
        Joint::RightShoulderY,
        Joint::RightShoulderZ,
    ];

    /// Canonical upper-case name, e.g. `"LEFT_ELBOW_Y"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Joint::AbsX => "ABS_X",
            Joint::AbsY => "ABS_Y",
            Joint::AbsZ => "ABS_Z",
            Joint::BustX => "BUST_X",
            Joint::BustY => "BUST_Y",
            Joint::NeckY => "NECK_Y",
            Joint::NeckZ => "NECK_Z",
            Joint::LeftAnkleY => "LEFT_ANKLE_Y",
            Joint::LeftElbowY => "LEFT_ELBOW_Y",
            Joint::LeftHipX => "LEFT_HIP_X",
            Joint::LeftHipY => "LEFT_HIP_Y",
            Joint::LeftHipZ => "LEFT_HIP_Z",
            Joint::LeftKneeY => "LEFT_KNEE_Y",
            Joint::LeftShoulderX => "LEFT_SHOULDER_X",
            Joint::LeftShoulderY => "LEFT_SHOULDER_Y",
            Joint::LeftShoulderZ => "LEFT_SHOULDER_Z",
            Joint::RightAnkleY => "RIGHT_ANKLE_Y",
            Joint::RightElbowY => "RIGHT_ELBOW_Y",
            Joint::RightHipX => "RIGHT_HIP_X",
            Joint::RightHipY => "RIGHT_HIP_Y",
            Joint::RightHipZ => "RIGHT_HIP_Z",
            Joint::RightKneeY => "RIGHT_KNEE_Y",
            Joint::RightShoulderX => "RIGHT_SHOULDER_X",
            Joint::RightShoulderY => "RIGHT_SHOULDER_Y",
            Joint::RightShoulderZ => "RIGHT_SHOULDER_Z",
        }
    }

    /// Lower-case phrase suitable for spoken replies, e.g. `"left elbow y"`.
    pub fn spoken(&self) -> String {
        self.as_str().to_lowercase().replace('_', " ")
    }
}

impl fmt::Display for Joint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Joint {
    type Err = BertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = normalise(s);
        Joint::ALL
            .into_iter()
            .find(|j| j.as_str() == name)
            .ok_or_else(|| BertError::Parse(format!("unknown joint '{s}'")))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Limb
// ────────────────────────────────────────────────────────────────────────────

/// A named group of joints that move together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Limb {
    Head,
    LeftArm,
    RightArm,
    LeftLeg,
    RightLeg,
    Torso,
}

impl Limb {
    pub const ALL: [Limb; 6] = [
        Limb::Head,
        Limb::LeftArm,
        Limb::RightArm,
        Limb::LeftLeg,
        Limb::RightLeg,
        Limb::Torso,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Limb::Head => "HEAD",
            Limb::LeftArm => "LEFT_ARM",
            Limb::RightArm => "RIGHT_ARM",
            Limb::LeftLeg => "LEFT_LEG",
            Limb::RightLeg => "RIGHT_LEG",
            Limb::Torso => "TORSO",
        }
    }

    pub fn spoken(&self) -> String {
        self.as_str().to_lowercase().replace('_', " ")
    }
}

impl fmt::Display for Limb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Limb {
    type Err = BertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = normalise(s);
        Limb::ALL
            .into_iter()
            .find(|l| l.as_str() == name)
            .ok_or_else(|| BertError::Parse(format!("unknown limb '{s}'")))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// JointProperty
// ────────────────────────────────────────────────────────────────────────────

/// A readable or writable attribute of a joint.
///
/// The first group lives in the motor's control table and is read from or
/// written to the wire.  The static group (`Id`, `MotorType`, `Offset`,
/// `Orientation`) exists only in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JointProperty {
    Angle,
    MaximumAngle,
    MinimumAngle,
    Speed,
    MaximumSpeed,
    Torque,
    MaximumTorque,
    Load,
    State,
    Temperature,
    Voltage,
    Id,
    MotorType,
    Offset,
    Orientation,
}

impl JointProperty {
    pub const ALL: [JointProperty; 15] = [
        JointProperty::Angle,
        JointProperty::MaximumAngle,
        JointProperty::MinimumAngle,
        JointProperty::Speed,
        JointProperty::MaximumSpeed,
        JointProperty::Torque,
        JointProperty::MaximumTorque,
        JointProperty::Load,
        JointProperty::State,
        JointProperty::Temperature,
        JointProperty::Voltage,
        JointProperty::Id,
        JointProperty::MotorType,
        JointProperty::Offset,
        JointProperty::Orientation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JointProperty::Angle => "ANGLE",
            JointProperty::MaximumAngle => "MAXIMUMANGLE",
            JointProperty::MinimumAngle => "MINIMUMANGLE",
            JointProperty::Speed => "SPEED",
            JointProperty::MaximumSpeed => "MAXIMUMSPEED",
            JointProperty::Torque => "TORQUE",
            JointProperty::MaximumTorque => "MAXIMUMTORQUE",
            JointProperty::Load => "LOAD",
            JointProperty::State => "STATE",
            JointProperty::Temperature => "TEMPERATURE",
            JointProperty::Voltage => "VOLTAGE",
            JointProperty::Id => "ID",
            JointProperty::MotorType => "MOTORTYPE",
            JointProperty::Offset => "OFFSET",
            JointProperty::Orientation => "ORIENTATION",
        }
    }

    /// Phrase used in replies, e.g. `"maximum angle"`.
    pub fn spoken(&self) -> &'static str {
        match self {
            JointProperty::Angle => "angle",
            JointProperty::MaximumAngle => "maximum angle",
            JointProperty::MinimumAngle => "minimum angle",
            JointProperty::Speed => "speed",
            JointProperty::MaximumSpeed => "maximum speed",
            JointProperty::Torque => "torque",
            JointProperty::MaximumTorque => "maximum torque",
            JointProperty::Load => "load",
            JointProperty::State => "state",
            JointProperty::Temperature => "temperature",
            JointProperty::Voltage => "voltage",
            JointProperty::Id => "id",
            JointProperty::MotorType => "motor type",
            JointProperty::Offset => "offset",
            JointProperty::Orientation => "orientation",
        }
    }

    /// Properties fixed by configuration and never written to a motor.
    pub fn is_static(&self) -> bool {
        matches!(
            self,
            JointProperty::Id
                | JointProperty::MotorType
                | JointProperty::Offset
                | JointProperty::Orientation
        )
    }
}

impl fmt::Display for JointProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JointProperty {
    type Err = BertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "maximum angle" and "MAXIMUMANGLE" are both accepted.
        let name = normalise(s).replace('_', "");
        let name = match name.as_str() {
            "POSITION" => "ANGLE".to_string(),
            _ => name,
        };
        JointProperty::ALL
            .into_iter()
            .find(|p| p.as_str() == name)
            .ok_or_else(|| BertError::Parse(format!("unknown joint property '{s}'")))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Commands and metrics
// ────────────────────────────────────────────────────────────────────────────

/// Whole-robot commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    /// Hold every joint at its present position.
    Freeze,
    /// Release torque on every joint.
    Relax,
    /// Drop all queued and in-flight work.
    Reset,
    Halt,
    Shutdown,
    Sleep,
    Wake,
}

impl CommandKind {
    pub const ALL: [CommandKind; 7] = [
        CommandKind::Freeze,
        CommandKind::Relax,
        CommandKind::Reset,
        CommandKind::Halt,
        CommandKind::Shutdown,
        CommandKind::Sleep,
        CommandKind::Wake,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Freeze => "FREEZE",
            CommandKind::Relax => "RELAX",
            CommandKind::Reset => "RESET",
            CommandKind::Halt => "HALT",
            CommandKind::Shutdown => "SHUTDOWN",
            CommandKind::Sleep => "SLEEP",
            CommandKind::Wake => "WAKE",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = BertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = normalise(s);
        CommandKind::ALL
            .into_iter()
            .find(|c| c.as_str() == name)
            .ok_or_else(|| BertError::Parse(format!("unknown command '{s}'")))
    }
}

/// Diagnostic quantities answered by the hub without touching a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    Age,
    Cadence,
    CycleCount,
    CycleTime,
    DutyCycle,
    Height,
    Mittens,
    Name,
}

impl MetricKind {
    pub const ALL: [MetricKind; 8] = [
        MetricKind::Age,
        MetricKind::Cadence,
        MetricKind::CycleCount,
        MetricKind::CycleTime,
        MetricKind::DutyCycle,
        MetricKind::Height,
        MetricKind::Mittens,
        MetricKind::Name,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Age => "AGE",
            MetricKind::Cadence => "CADENCE",
            MetricKind::CycleCount => "CYCLECOUNT",
            MetricKind::CycleTime => "CYCLETIME",
            MetricKind::DutyCycle => "DUTYCYCLE",
            MetricKind::Height => "HEIGHT",
            MetricKind::Mittens => "MITTENS",
            MetricKind::Name => "NAME",
        }
    }
}

impl FromStr for MetricKind {
    type Err = BertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = normalise(s).replace('_', "");
        MetricKind::ALL
            .into_iter()
            .find(|m| m.as_str() == name)
            .ok_or_else(|| BertError::Parse(format!("unknown metric '{s}'")))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Motor family
// ────────────────────────────────────────────────────────────────────────────

/// Dynamixel servo families in use on the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MotorKind {
    #[serde(rename = "AX12")]
    Ax12,
    #[default]
    #[serde(rename = "MX28")]
    Mx28,
    #[serde(rename = "MX64")]
    Mx64,
}

impl MotorKind {
    /// Model name as spoken, e.g. `"A X 12"`.
    pub fn spoken(&self) -> &'static str {
        match self {
            MotorKind::Ax12 => "A X 12",
            MotorKind::Mx28 => "M X 28",
            MotorKind::Mx64 => "M X 64",
        }
    }
}

impl FromStr for MotorKind {
    type Err = BertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalise(s).replace('_', "").as_str() {
            "AX12" => Ok(MotorKind::Ax12),
            "MX28" => Ok(MotorKind::Mx28),
            "MX64" => Ok(MotorKind::Mx64),
            _ => Err(BertError::Parse(format!("unknown motor type '{s}'"))),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Source
// ────────────────────────────────────────────────────────────────────────────

/// The peripheral or subsystem an envelope originated from, and therefore
/// where its reply is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Source {
    /// The tablet app connected over the network.
    #[default]
    Network,
    /// The local console.
    Terminal,
    /// Null peripheral: replies addressed here are dropped.
    Sink,
    /// Requests the system issues to itself (startup, follow-on actions).
    Internal,
    Motor,
    Internet,
    Dispatcher,
}

impl Source {
    /// `true` for peripherals that can receive a delivered reply.
    pub fn is_peripheral(&self) -> bool {
        matches!(self, Source::Network | Source::Terminal)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Source::Network => "NETWORK",
            Source::Terminal => "TERMINAL",
            Source::Sink => "SINK",
            Source::Internal => "INTERNAL",
            Source::Motor => "MOTOR",
            Source::Internet => "INTERNET",
            Source::Dispatcher => "DISPATCHER",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joint_parses_spoken_and_canonical_forms() -> Result<(), BertError> {
        assert_eq!("left elbow y".parse::<Joint>()?, Joint::LeftElbowY);
        assert_eq!("LEFT_ELBOW_Y".parse::<Joint>()?, Joint::LeftElbowY);
        assert_eq!("right-hip-z".parse::<Joint>()?, Joint::RightHipZ);
        Ok(())
    }

    #[test]
    fn unknown_joint_is_a_parse_error() {
        let result = "left tail".parse::<Joint>();
        assert!(matches!(result, Err(BertError::Parse(_))));
    }

    #[test]
    fn every_joint_round_trips_through_its_name() {
        for joint in Joint::ALL {
            assert_eq!(joint.as_str().parse::<Joint>().ok(), Some(joint));
        }
    }

    #[test]
    fn property_accepts_spaced_names_and_position_alias() -> Result<(), BertError> {
        assert_eq!("maximum angle".parse::<JointProperty>()?, JointProperty::MaximumAngle);
        assert_eq!("position".parse::<JointProperty>()?, JointProperty::Angle);
        assert_eq!("motortype".parse::<JointProperty>()?, JointProperty::MotorType);
        Ok(())
    }

    #[test]
    fn static_properties_are_flagged() {
        assert!(JointProperty::Id.is_static());
        assert!(JointProperty::Orientation.is_static());
        assert!(!JointProperty::Angle.is_static());
    }

    #[test]
    fn motor_kind_serializes_with_model_names() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(serde_json::to_string(&MotorKind::Ax12)?, "\"AX12\"");
        assert_eq!("mx64".parse::<MotorKind>()?, MotorKind::Mx64);
        Ok(())
    }

    #[test]
    fn spoken_forms_are_lower_case() {
        assert_eq!(Joint::LeftElbowY.spoken(), "left elbow y");
        assert_eq!(Limb::RightLeg.spoken(), "right leg");
    }

    #[test]
    fn only_network_and_terminal_are_peripherals() {
        assert!(Source::Network.is_peripheral());
        assert!(Source::Terminal.is_peripheral());
        assert!(!Source::Sink.is_peripheral());
        assert!(!Source::Internal.is_peripheral());
    }
}
