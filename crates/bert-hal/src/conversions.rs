//! Conversions between engineering units and raw Dynamixel control-table
//! words.
//!
//! Positions are degrees, speeds degrees per second and torques
//! newton-meters.  Every conversion honours the motor's family (range,
//! resolution, rated velocity and torque), its mounting offset and its
//! direct/indirect orientation.
//!
//! | Family | Range | Resolution | Velocity | Torque |
//! |---|---|---|---|---|
//! | AX-12 | 300° | `0x3FF` | 684 °/s | 1.2 N·m |
//! | MX-28 | 360° | `0xFFF` | 700 °/s | 2.5 N·m |
//! | MX-64 | 360° | `0xFFF` | 700 °/s | 6.0 N·m |

use bert_types::{JointProperty, MotorConfiguration, MotorKind};
use tracing::warn;

/// Control-table addresses (protocol 1, AX and MX families alike).
pub mod address {
    pub const MINIMUM_ANGLE: u8 = 0x06;
    pub const MAXIMUM_ANGLE: u8 = 0x08;
    pub const TORQUE_ENABLE: u8 = 0x18;
    pub const GOAL_POSITION: u8 = 0x1E;
    pub const GOAL_SPEED: u8 = 0x20;
    pub const TORQUE_LIMIT: u8 = 0x22;
    pub const PRESENT_POSITION: u8 = 0x24;
    pub const PRESENT_SPEED: u8 = 0x26;
    pub const PRESENT_LOAD: u8 = 0x28;
    pub const PRESENT_VOLTAGE: u8 = 0x2A;
    pub const PRESENT_TEMPERATURE: u8 = 0x2B;
}

/// EEPROM block holding angle, temperature, voltage and torque limits.
pub const LIMIT_BLOCK_ADDRESS: u8 = address::MINIMUM_ANGLE;
pub const LIMIT_BLOCK_BYTES: u8 = 10;
/// RAM block holding goal position, goal speed and torque limit.
pub const GOAL_BLOCK_ADDRESS: u8 = address::GOAL_POSITION;
pub const GOAL_BLOCK_BYTES: u8 = 6;

const DIRECTION_BIT: u16 = 0x400;
const MAGNITUDE_MASK: u16 = 0x3FF;

// ────────────────────────────────────────────────────────────────────────────
// Family constants
// ────────────────────────────────────────────────────────────────────────────

/// Range of motion in degrees.
pub fn range(kind: MotorKind) -> f64 {
    match kind {
        MotorKind::Ax12 => 300.0,
        MotorKind::Mx28 | MotorKind::Mx64 => 360.0,
    }
}

/// Number of raw increments across [`range`].
pub fn resolution(kind: MotorKind) -> u16 {
    match kind {
        MotorKind::Ax12 => 0x3FF,
        MotorKind::Mx28 | MotorKind::Mx64 => 0xFFF,
    }
}

/// Rated no-load velocity in degrees per second.
pub fn rated_velocity(kind: MotorKind) -> f64 {
    match kind {
        MotorKind::Ax12 => 684.0,
        MotorKind::Mx28 | MotorKind::Mx64 => 700.0,
    }
}

/// Rated stall torque in newton-meters.
pub fn rated_torque(kind: MotorKind) -> f64 {
    match kind {
        MotorKind::Ax12 => 1.2,
        MotorKind::Mx28 => 2.5,
        MotorKind::Mx64 => 6.0,
    }
}

/// Little-endian word from a low and high byte.
pub fn word(lo: u8, hi: u8) -> u16 {
    u16::from(lo) | (u16::from(hi) << 8)
}

// ────────────────────────────────────────────────────────────────────────────
// Position
// ────────────────────────────────────────────────────────────────────────────

/// Clamp `degrees` into the motor's configured limits.
pub fn clamp_angle(mc: &MotorConfiguration, degrees: f64) -> f64 {
    if degrees > mc.max_angle {
        warn!(joint = %mc.joint, requested = degrees, max = mc.max_angle, "angle above limit, clamped");
        mc.max_angle
    } else if degrees < mc.min_angle {
        warn!(joint = %mc.joint, requested = degrees, min = mc.min_angle, "angle below limit, clamped");
        mc.min_angle
    } else {
        degrees
    }
}

/// Raw goal position for `degrees`, clamped to the motor's limits.
pub fn degree_to_raw(mc: &MotorConfiguration, degrees: f64) -> u16 {
    let r = range(mc.kind);
    let res = resolution(mc.kind);
    let mut value = clamp_angle(mc, degrees) - mc.offset;
    if !mc.direct {
        value = r - value;
    }
    ((value * f64::from(res) / r) as i64 & i64::from(res)) as u16
}

pub fn raw_to_degree(mc: &MotorConfiguration, raw: u16) -> f64 {
    let r = range(mc.kind);
    let res = resolution(mc.kind);
    let mut degrees = f64::from(raw & res) * r / f64::from(res);
    if !mc.direct {
        degrees = r - degrees;
    }
    degrees + mc.offset
}

// ────────────────────────────────────────────────────────────────────────────
// Speed, load and torque
// ────────────────────────────────────────────────────────────────────────────

/// Raw goal speed.  Negative speeds reverse the rotation sense; the sense is
/// carried in the `0x400` bit.
pub fn speed_to_raw(mc: &MotorConfiguration, dps: f64) -> u16 {
    let mut clockwise = mc.direct;
    if dps < 0.0 {
        clockwise = !clockwise;
    }
    let magnitude = (dps.abs() * 1023.0 / rated_velocity(mc.kind)) as u16;
    let mut raw = magnitude.min(MAGNITUDE_MASK);
    if !clockwise {
        raw |= DIRECTION_BIT;
    }
    raw
}

pub fn raw_to_speed(mc: &MotorConfiguration, raw: u16) -> f64 {
    let mut clockwise = mc.direct;
    if raw & DIRECTION_BIT != 0 {
        clockwise = !clockwise;
    }
    let speed = f64::from(raw & MAGNITUDE_MASK) * rated_velocity(mc.kind) / 1023.0;
    if clockwise { speed } else { -speed }
}

/// Raw torque limit.  The limit register has no direction bit.
pub fn torque_to_raw(mc: &MotorConfiguration, newton_meters: f64) -> u16 {
    let raw = (newton_meters.abs() * 1023.0 / rated_torque(mc.kind)) as u16;
    raw.min(MAGNITUDE_MASK)
}

pub fn raw_to_torque(mc: &MotorConfiguration, raw: u16) -> f64 {
    f64::from(raw & MAGNITUDE_MASK) * rated_torque(mc.kind) / 1023.0
}

/// Present load, signed by direction of effort.
pub fn raw_to_load(mc: &MotorConfiguration, raw: u16) -> f64 {
    let mut clockwise = mc.direct;
    if raw & DIRECTION_BIT != 0 {
        clockwise = !clockwise;
    }
    let load = f64::from(raw & MAGNITUDE_MASK) * rated_torque(mc.kind) / 1023.0;
    if clockwise { -load } else { load }
}

/// Maximum torque as stored in EEPROM.  A high byte of `0xFF` is what the
/// factory image holds and means "rated torque".
pub fn raw_to_torque_limit(mc: &MotorConfiguration, lo: u8, hi: u8) -> f64 {
    if hi == 0xFF {
        return rated_torque(mc.kind);
    }
    raw_to_torque(mc, word(lo, hi))
}

// ────────────────────────────────────────────────────────────────────────────
// Property tables
// ────────────────────────────────────────────────────────────────────────────

/// Address to read the present value of `property`, if it lives on the
/// motor at all.
pub fn present_address(property: JointProperty) -> Option<u8> {
    match property {
        JointProperty::Angle => Some(address::PRESENT_POSITION),
        JointProperty::MaximumAngle => Some(address::MAXIMUM_ANGLE),
        JointProperty::MinimumAngle => Some(address::MINIMUM_ANGLE),
        JointProperty::Speed => Some(address::PRESENT_SPEED),
        JointProperty::Torque => Some(address::TORQUE_LIMIT),
        JointProperty::Load => Some(address::PRESENT_LOAD),
        JointProperty::State => Some(address::TORQUE_ENABLE),
        JointProperty::Temperature => Some(address::PRESENT_TEMPERATURE),
        JointProperty::Voltage => Some(address::PRESENT_VOLTAGE),
        _ => None,
    }
}

/// Address to write a goal for `property`.  Only position, speed, torque
/// limit and torque enable are writable.
pub fn goal_address(property: JointProperty) -> Option<u8> {
    match property {
        JointProperty::Angle => Some(address::GOAL_POSITION),
        JointProperty::Speed => Some(address::GOAL_SPEED),
        JointProperty::Torque => Some(address::TORQUE_LIMIT),
        JointProperty::State => Some(address::TORQUE_ENABLE),
        _ => None,
    }
}

/// Width of `property` in the control table.
pub fn data_bytes(property: JointProperty) -> u8 {
    match property {
        JointProperty::State | JointProperty::Temperature | JointProperty::Voltage => 1,
        _ => 2,
    }
}

/// Raw word to write for `value`, or `None` if the property is not writable.
pub fn raw_for_value(property: JointProperty, mc: &MotorConfiguration, value: f64) -> Option<u16> {
    match property {
        JointProperty::Angle => Some(degree_to_raw(mc, value)),
        JointProperty::Speed => Some(speed_to_raw(mc, value)),
        JointProperty::Torque => Some(torque_to_raw(mc, value)),
        JointProperty::State => Some(u16::from(value != 0.0)),
        _ => None,
    }
}

/// Decode the parameter bytes of a status reply for `property`.
pub fn value_from_params(property: JointProperty, mc: &MotorConfiguration, params: &[u8]) -> Option<f64> {
    let lo = *params.first()?;
    let hi = params.get(1).copied().unwrap_or(0);
    let value = match property {
        JointProperty::Angle | JointProperty::MaximumAngle | JointProperty::MinimumAngle => {
            raw_to_degree(mc, word(lo, hi))
        }
        JointProperty::Speed => raw_to_speed(mc, word(lo, hi)),
        JointProperty::Torque => raw_to_torque(mc, word(lo, hi)),
        JointProperty::Load => raw_to_load(mc, word(lo, hi)),
        JointProperty::State => {
            if lo == 0 {
                0.0
            } else {
                1.0
            }
        }
        JointProperty::Temperature => f64::from(lo),
        JointProperty::Voltage => f64::from(lo) / 10.0,
        _ => return None,
    };
    Some(value)
}

/// Human-readable value with units.
pub fn text_for_value(property: JointProperty, value: f64) -> String {
    match property {
        JointProperty::Angle | JointProperty::MaximumAngle | JointProperty::MinimumAngle => {
            format!("{value:.0} degrees")
        }
        JointProperty::Speed | JointProperty::MaximumSpeed => format!("{value:.0} degrees per second"),
        JointProperty::Temperature => format!("{value:.0} degrees centigrade"),
        JointProperty::Torque | JointProperty::MaximumTorque | JointProperty::Load => {
            format!("{value:.1} newton-meters")
        }
        JointProperty::State => {
            if value == 0.0 {
                "torque-disabled".to_string()
            } else {
                "torque-enabled".to_string()
            }
        }
        JointProperty::Voltage => format!("{value:.1} volts"),
        _ => format!("{value:.0}"),
    }
}

/// Record a decoded or written value on the configuration.  Angle limits
/// read back from EEPROM are informational and leave the configured limits
/// alone.
pub fn apply_value(mc: &mut MotorConfiguration, property: JointProperty, value: f64) {
    match property {
        JointProperty::Angle => mc.set_position(value),
        JointProperty::Speed => mc.speed = value,
        JointProperty::Torque => mc.torque = value,
        JointProperty::Load => mc.load = value,
        JointProperty::State => mc.torque_enabled = value != 0.0,
        JointProperty::Temperature => mc.temperature = value,
        JointProperty::Voltage => mc.voltage = value,
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bert_types::{Joint, Limb};

    fn ax12() -> MotorConfiguration {
        MotorConfiguration::new(Joint::NeckY, Limb::Head, "upper", 36, MotorKind::Ax12)
            .with_limits(0.0, 300.0)
    }

    fn mx28_indirect() -> MotorConfiguration {
        let mut mc = MotorConfiguration::new(Joint::LeftHipY, Limb::LeftLeg, "lower", 13, MotorKind::Mx28)
            .with_limits(-100.0, 100.0);
        mc.direct = false;
        mc.offset = -90.0;
        mc
    }

    #[test]
    fn ax12_position_round_trips_within_one_increment() {
        let mc = ax12();
        let raw = degree_to_raw(&mc, 150.0);
        assert_eq!(raw, 511);
        assert!((raw_to_degree(&mc, raw) - 150.0).abs() < 0.5);
    }

    #[test]
    fn indirect_motor_with_offset_round_trips() {
        let mc = mx28_indirect();
        let raw = degree_to_raw(&mc, 0.0);
        assert_eq!(raw, 3071);
        assert!(raw_to_degree(&mc, raw).abs() < 0.1);
    }

    #[test]
    fn positions_are_clamped_to_limits() {
        let mc = mx28_indirect();
        assert_eq!(degree_to_raw(&mc, 500.0), degree_to_raw(&mc, 100.0));
        assert_eq!(degree_to_raw(&mc, -500.0), degree_to_raw(&mc, -100.0));
    }

    #[test]
    fn speed_direction_is_carried_in_bit_ten() {
        let mc = MotorConfiguration::new(Joint::LeftElbowY, Limb::LeftArm, "upper", 42, MotorKind::Mx28);
        let forward = speed_to_raw(&mc, 350.0);
        let reverse = speed_to_raw(&mc, -350.0);
        assert_eq!(forward, 511);
        assert_eq!(reverse, 511 | 0x400);
        assert!((raw_to_speed(&mc, forward) - 349.66).abs() < 0.01);
        assert!((raw_to_speed(&mc, reverse) + 349.66).abs() < 0.01);
    }

    #[test]
    fn torque_limit_is_capped_and_unsigned() {
        let mc = MotorConfiguration::new(Joint::LeftElbowY, Limb::LeftArm, "upper", 42, MotorKind::Mx28);
        assert_eq!(torque_to_raw(&mc, 10.0), 0x3FF);
        assert_eq!(torque_to_raw(&mc, -1.25), torque_to_raw(&mc, 1.25));
        assert!((raw_to_torque_limit(&mc, 0xA0, 0xFF) - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn single_byte_properties_decode() {
        let mc = ax12();
        assert_eq!(value_from_params(JointProperty::Voltage, &mc, &[121]), Some(12.1));
        assert_eq!(value_from_params(JointProperty::Temperature, &mc, &[41]), Some(41.0));
        assert_eq!(value_from_params(JointProperty::State, &mc, &[0]), Some(0.0));
        assert_eq!(value_from_params(JointProperty::Id, &mc, &[1, 2]), None);
    }

    #[test]
    fn text_carries_units() {
        assert_eq!(text_for_value(JointProperty::Angle, 44.6), "45 degrees");
        assert_eq!(text_for_value(JointProperty::Voltage, 12.1), "12.1 volts");
        assert_eq!(text_for_value(JointProperty::State, 1.0), "torque-enabled");
        assert_eq!(text_for_value(JointProperty::Speed, 100.0), "100 degrees per second");
    }

    #[test]
    fn only_goal_properties_are_writable() {
        let mc = ax12();
        assert!(raw_for_value(JointProperty::Temperature, &mc, 20.0).is_none());
        assert_eq!(raw_for_value(JointProperty::State, &mc, 1.0), Some(1));
        assert_eq!(goal_address(JointProperty::Torque), Some(address::TORQUE_LIMIT));
        assert_eq!(data_bytes(JointProperty::State), 1);
    }
}
