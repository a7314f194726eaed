//! Wire codec for Dynamixel protocol 1.
//!
//! A frame is `FF FF id len instr params… checksum`, where `len` counts the
//! instruction (or error) byte, the parameters and the checksum, and the
//! checksum is the inverted low byte of the sum of every byte from `id` to
//! the last parameter.
//!
//! Builders here are pure: they read motor configurations but never modify
//! them.  The bus engine decides when a write has taken effect and applies
//! the values itself.

use bert_types::{BertError, JointGoal, JointProperty, MotorConfiguration, MotorKind};
use tracing::{debug, warn};

use crate::conversions::{self, GOAL_BLOCK_ADDRESS, GOAL_BLOCK_BYTES, LIMIT_BLOCK_ADDRESS, LIMIT_BLOCK_BYTES};

pub const HEADER: u8 = 0xFF;
pub const BROADCAST_ID: u8 = 0xFE;
/// Size of a status reply carrying a two-byte value.
pub const STATUS_FRAME_LEN: usize = 8;

pub mod instruction {
    pub const PING: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE: u8 = 0x03;
    pub const SYNC_WRITE: u8 = 0x83;
    pub const BULK_READ: u8 = 0x92;
}

/// Hip joints that tend to read as wildly out of range after power-up are
/// pulled to these angles by [`initialize_positions`].
const HIP_X_LIMIT: f64 = 190.0;
const HIP_Z_LIMIT: f64 = -8.0;

// ────────────────────────────────────────────────────────────────────────────
// Framing primitives
// ────────────────────────────────────────────────────────────────────────────

/// Checksum over `frame[2..len-1]`.
pub fn checksum(frame: &[u8]) -> u8 {
    let end = frame.len().saturating_sub(1);
    let sum = frame
        .get(2..end)
        .unwrap_or_default()
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b));
    !sum
}

/// Assemble a frame from its id, instruction and parameters.
fn frame(id: u8, instr: u8, params: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(params.len() + 6);
    bytes.extend_from_slice(&[HEADER, HEADER, id, (params.len() + 2) as u8, instr]);
    bytes.extend_from_slice(params);
    bytes.push(0);
    let sum = checksum(&bytes);
    if let Some(last) = bytes.last_mut() {
        *last = sum;
    }
    bytes
}

fn push_word(params: &mut Vec<u8>, value: u16, width: u8) {
    params.push((value & 0xFF) as u8);
    if width == 2 {
        params.push((value >> 8) as u8);
    }
}

pub fn ping_frame(id: u8) -> Vec<u8> {
    frame(id, instruction::PING, &[])
}

pub fn read_frame(id: u8, address: u8, count: u8) -> Vec<u8> {
    frame(id, instruction::READ, &[address, count])
}

pub fn write_frame(id: u8, address: u8, data: &[u8]) -> Vec<u8> {
    let mut params = Vec::with_capacity(data.len() + 1);
    params.push(address);
    params.extend_from_slice(data);
    frame(id, instruction::WRITE, &params)
}

/// Broadcast write of one `width`-byte value per motor.  Devices do not
/// answer a sync write.
pub fn sync_write_frame(address: u8, width: u8, entries: &[(u8, u16)]) -> Vec<u8> {
    let mut params = Vec::with_capacity(2 + entries.len() * (usize::from(width) + 1));
    params.push(address);
    params.push(width);
    for (id, value) in entries {
        params.push(*id);
        push_word(&mut params, *value, width);
    }
    frame(BROADCAST_ID, instruction::SYNC_WRITE, &params)
}

/// Broadcast read; every listed `(id, address, count)` answers with its own
/// status frame.
pub fn bulk_read_frame(entries: &[(u8, u8, u8)]) -> Vec<u8> {
    let mut params = Vec::with_capacity(1 + entries.len() * 3);
    params.push(0);
    for (id, address, count) in entries {
        params.extend_from_slice(&[*count, *id, *address]);
    }
    frame(BROADCAST_ID, instruction::BULK_READ, &params)
}

// ────────────────────────────────────────────────────────────────────────────
// Request builders
// ────────────────────────────────────────────────────────────────────────────

/// READ of the present value of `property`.
pub fn get_property(mc: &MotorConfiguration, property: JointProperty) -> Result<Vec<u8>, BertError> {
    let address = conversions::present_address(property).ok_or_else(|| {
        BertError::Validation(format!("the {} of a motor cannot be read", property.spoken()))
    })?;
    Ok(read_frame(mc.id, address, conversions::data_bytes(property)))
}

/// WRITE of a goal for one motor; returns the frame and the raw value sent.
pub fn set_property(
    mc: &MotorConfiguration,
    property: JointProperty,
    value: f64,
) -> Result<(Vec<u8>, u16), BertError> {
    let unwritable = || BertError::Validation(format!("I cannot change a motor {}", property.spoken()));
    let address = conversions::goal_address(property).ok_or_else(unwritable)?;
    let raw = conversions::raw_for_value(property, mc, value).ok_or_else(unwritable)?;
    let width = conversions::data_bytes(property);
    let mut data = Vec::with_capacity(2);
    push_word(&mut data, raw, width);
    Ok((write_frame(mc.id, address, &data), raw))
}

/// Frames that read `property` from every motor in `motors`.
///
/// AX-12 motors do not implement BULK_READ, so each gets its own READ; the
/// rest share one bulk read.
pub fn list_property(motors: &[MotorConfiguration], property: JointProperty) -> Result<Vec<Vec<u8>>, BertError> {
    let address = conversions::present_address(property).ok_or_else(|| {
        BertError::Validation(format!("the {} of a motor cannot be read", property.spoken()))
    })?;
    let width = conversions::data_bytes(property);
    let mut frames = Vec::new();
    let mut bulk = Vec::new();
    for mc in motors {
        if mc.kind == MotorKind::Ax12 {
            frames.push(read_frame(mc.id, address, width));
        } else {
            bulk.push((mc.id, address, width));
        }
    }
    if !bulk.is_empty() {
        frames.push(bulk_read_frame(&bulk));
    }
    Ok(frames)
}

/// One sync write setting `property` to `value` on every motor.  Returns
/// `None` when `motors` is empty.
pub fn sync_set_property(
    motors: &[MotorConfiguration],
    property: JointProperty,
    value: f64,
) -> Result<Option<Vec<u8>>, BertError> {
    let address = conversions::goal_address(property).ok_or_else(|| {
        BertError::Validation(format!("I cannot change {} for all joints in the limb", property.spoken()))
    })?;
    let entries: Vec<(u8, u16)> = motors
        .iter()
        .filter_map(|mc| conversions::raw_for_value(property, mc, value).map(|raw| (mc.id, raw)))
        .collect();
    if entries.is_empty() {
        return Ok(None);
    }
    Ok(Some(sync_write_frame(address, conversions::data_bytes(property), &entries)))
}

/// Sync write of explicit goal positions, e.g. to hold motors where they are.
pub fn sync_positions(positions: &[(&MotorConfiguration, f64)]) -> Option<Vec<u8>> {
    if positions.is_empty() {
        return None;
    }
    let entries: Vec<(u8, u16)> = positions
        .iter()
        .map(|(mc, angle)| (mc.id, conversions::degree_to_raw(mc, *angle)))
        .collect();
    Some(sync_write_frame(conversions::address::GOAL_POSITION, 2, &entries))
}

/// Drive every motor whose last known position lies outside its limits back
/// to the nearest limit.
///
/// A position of exactly zero means "never read" and is left alone.  The
/// hip X and Z joints have tighter working limits than their configured
/// travel.  Returns the frame, if any motor needs moving, together with the
/// `(joint index in motors, new angle)` pairs it sets.
pub fn initialize_positions(motors: &[MotorConfiguration]) -> (Option<Vec<u8>>, Vec<(usize, f64)>) {
    let mut moves = Vec::new();
    for (index, mc) in motors.iter().enumerate() {
        let position = mc.position;
        if position == 0.0 {
            continue;
        }
        let mut target = if position > mc.max_angle {
            mc.max_angle
        } else if position < mc.min_angle {
            mc.min_angle
        } else {
            position
        };
        let name = mc.joint.as_str();
        if name.ends_with("HIP_X") && target > HIP_X_LIMIT {
            target = HIP_X_LIMIT;
        } else if name.ends_with("HIP_Z") && target < HIP_Z_LIMIT {
            target = HIP_Z_LIMIT;
        }
        if target != position {
            debug!(joint = %mc.joint, from = position, to = target, "initializing out-of-range joint");
            moves.push((index, target));
        }
    }
    if moves.is_empty() {
        return (None, moves);
    }
    let entries: Vec<(u8, u16)> = moves
        .iter()
        .map(|(index, angle)| {
            let mc = &motors[*index];
            (mc.id, conversions::degree_to_raw(mc, *angle))
        })
        .collect();
    (
        Some(sync_write_frame(conversions::address::GOAL_POSITION, 2, &entries)),
        moves,
    )
}

/// Frames for a pose: torque limits first, then speeds, then positions.
/// Motors already at the requested value are skipped, and a stage with
/// nothing to change produces no frame.
pub fn set_pose(motors: &[MotorConfiguration], goals: &[JointGoal]) -> Vec<Vec<u8>> {
    let mut torques = Vec::new();
    let mut speeds = Vec::new();
    let mut angles = Vec::new();
    for goal in goals {
        let Some(mc) = motors.iter().find(|m| m.joint == goal.joint) else {
            continue;
        };
        if let Some(torque) = goal.torque
            && torque != mc.torque
        {
            torques.push((mc.id, conversions::torque_to_raw(mc, torque)));
        }
        if let Some(speed) = goal.speed
            && speed != mc.speed
        {
            speeds.push((mc.id, conversions::speed_to_raw(mc, speed)));
        }
        if goal.angle != mc.position {
            angles.push((mc.id, conversions::degree_to_raw(mc, goal.angle)));
        }
    }
    [
        (conversions::address::TORQUE_LIMIT, torques),
        (conversions::address::GOAL_SPEED, speeds),
        (conversions::address::GOAL_POSITION, angles),
    ]
    .into_iter()
    .filter(|(_, entries)| !entries.is_empty())
    .map(|(address, entries)| sync_write_frame(address, 2, &entries))
    .collect()
}

/// READ of the goal block: position, speed and torque limit.
pub fn get_goals(id: u8) -> Vec<u8> {
    read_frame(id, GOAL_BLOCK_ADDRESS, GOAL_BLOCK_BYTES)
}

/// READ of the EEPROM limit block.
pub fn get_limits(id: u8) -> Vec<u8> {
    read_frame(id, LIMIT_BLOCK_ADDRESS, LIMIT_BLOCK_BYTES)
}

// ────────────────────────────────────────────────────────────────────────────
// Decoding
// ────────────────────────────────────────────────────────────────────────────

/// Offset of the first legal frame start in `bytes`, if any.
///
/// A legal start is two `0xFF` bytes not followed by a third (no device
/// uses id `0xFF`).  A pair at the very end of the buffer counts, since the
/// id has not arrived yet.
pub fn legal_start(bytes: &[u8]) -> Option<usize> {
    (0..bytes.len().saturating_sub(1)).find(|&i| {
        bytes[i] == HEADER && bytes[i + 1] == HEADER && bytes.get(i + 2).is_none_or(|b| *b != HEADER)
    })
}

/// Total length declared by the frame at the start of `bytes`, once the
/// length byte has arrived.
pub fn message_length(bytes: &[u8]) -> Option<usize> {
    bytes.get(3).map(|len| usize::from(*len) + 4)
}

/// A decoded status reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusFrame {
    pub id: u8,
    /// Device error bits; zero when the device is happy.
    pub error: u8,
    pub params: Vec<u8>,
}

impl StatusFrame {
    pub fn is_error(&self) -> bool {
        self.error != 0
    }

    /// Text for a non-zero error byte, e.g. `"Motor 12 encountered overheating"`.
    pub fn error_message(&self) -> Option<String> {
        self.is_error()
            .then(|| format!("Motor {} encountered {}", self.id, describe_error(self.error)))
    }
}

/// Validate and split one complete frame.
pub fn parse_status(bytes: &[u8]) -> Result<StatusFrame, BertError> {
    if bytes.len() < 6 || bytes[0] != HEADER || bytes[1] != HEADER {
        return Err(BertError::Protocol(format!("malformed status frame {}", dump(bytes))));
    }
    let declared = usize::from(bytes[3]) + 4;
    if declared != bytes.len() {
        return Err(BertError::Protocol(format!(
            "status frame declares {declared} bytes but holds {}",
            bytes.len()
        )));
    }
    let expected = checksum(bytes);
    let actual = bytes[bytes.len() - 1];
    if expected != actual {
        warn!(frame = %dump(bytes), "checksum mismatch");
        return Err(BertError::Protocol(format!(
            "Motor {} sent a frame with an incorrect checksum",
            bytes[2]
        )));
    }
    Ok(StatusFrame {
        id: bytes[2],
        error: bytes[4],
        params: bytes[5..bytes.len() - 1].to_vec(),
    })
}

/// Description of the lowest set error bit.
pub fn describe_error(error: u8) -> &'static str {
    const BITS: [(u8, &str); 7] = [
        (0x01, "an instruction error"),
        (0x02, "an overload error"),
        (0x04, "an incorrect checksum"),
        (0x08, "a range error"),
        (0x10, "overheating"),
        (0x20, "a position outside angle limits"),
        (0x40, "an input voltage outside the acceptable range"),
    ];
    BITS.iter()
        .find(|(bit, _)| error & bit != 0)
        .map(|(_, text)| *text)
        .unwrap_or("Unrecognized error")
}

/// Hex dump for logs, e.g. `"FF FF 01 02 00 FC (6)"`.
pub fn dump(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "empty frame".to_string();
    }
    let hex: Vec<String> = bytes.iter().map(|b| format!("{b:02X}")).collect();
    format!("{} ({})", hex.join(" "), bytes.len())
}

/// Status reply as a device would send it.  Used by the simulated port.
pub fn status_frame(id: u8, error: u8, params: &[u8]) -> Vec<u8> {
    frame(id, error, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bert_types::{Joint, Limb};

    fn mx(joint: Joint, id: u8) -> MotorConfiguration {
        MotorConfiguration::new(joint, Limb::LeftLeg, "lower", id, MotorKind::Mx28).with_limits(-180.0, 180.0)
    }

    #[test]
    fn read_frame_matches_manual_example() {
        // Read present temperature of motor 1 (protocol 1 manual).
        assert_eq!(read_frame(1, 0x2B, 1), vec![0xFF, 0xFF, 0x01, 0x04, 0x02, 0x2B, 0x01, 0xCC]);
    }

    #[test]
    fn sync_write_layout() {
        let bytes = sync_write_frame(0x1E, 2, &[(1, 0x010), (2, 0x220)]);
        assert_eq!(bytes.len(), 3 * 2 + 8);
        assert_eq!(bytes[2], BROADCAST_ID);
        assert_eq!(usize::from(bytes[3]), bytes.len() - 4);
        assert_eq!(bytes[4], instruction::SYNC_WRITE);
        assert_eq!(&bytes[5..13], &[0x1E, 2, 1, 0x10, 0x00, 2, 0x20, 0x02]);
        assert_eq!(bytes[bytes.len() - 1], checksum(&bytes));
    }

    #[test]
    fn ax12_motors_are_read_individually() -> Result<(), BertError> {
        let ax = MotorConfiguration::new(Joint::NeckY, Limb::Head, "upper", 36, MotorKind::Ax12);
        let motors = vec![ax, mx(Joint::BustY, 31), mx(Joint::BustX, 32)];
        let frames = list_property(&motors, JointProperty::Angle)?;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][4], instruction::READ);
        assert_eq!(frames[0][2], 36);
        assert_eq!(frames[1][4], instruction::BULK_READ);
        assert_eq!(&frames[1][6..12], &[2, 31, 0x24, 2, 32, 0x24]);
        Ok(())
    }

    #[test]
    fn unwritable_property_is_rejected() {
        let mc = mx(Joint::LeftKneeY, 12);
        let err = set_property(&mc, JointProperty::Temperature, 30.0);
        assert!(matches!(err, Err(BertError::Validation(msg)) if msg == "I cannot change a motor temperature"));
    }

    #[test]
    fn initialize_ignores_unread_and_clamps_outliers() {
        let mut knee = mx(Joint::LeftKneeY, 12).with_limits(0.0, 120.0);
        knee.position = 150.0;
        let mut unread = mx(Joint::LeftAnkleY, 11).with_limits(10.0, 90.0);
        unread.position = 0.0;
        let mut hip = mx(Joint::RightHipX, 21).with_limits(150.0, 250.0);
        hip.position = 200.0;
        let mut fine = mx(Joint::LeftHipY, 13);
        fine.position = 20.0;

        let (frame, moves) = initialize_positions(&[knee, unread, hip, fine]);
        assert_eq!(moves, vec![(0, 120.0), (2, HIP_X_LIMIT)]);
        let frame = frame.unwrap_or_default();
        assert_eq!(frame.len(), 3 * 2 + 8);
    }

    #[test]
    fn pose_skips_unchanged_stages() {
        let mut knee = mx(Joint::LeftKneeY, 12);
        knee.position = 30.0;
        knee.speed = 100.0;
        let goals = vec![
            JointGoal { joint: Joint::LeftKneeY, angle: 45.0, speed: Some(100.0), torque: None },
            JointGoal { joint: Joint::RightKneeY, angle: 10.0, speed: None, torque: None },
        ];
        let frames = set_pose(&[knee], &goals);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][5], conversions::address::GOAL_POSITION);
    }

    #[test]
    fn status_parsing_and_error_text() -> Result<(), BertError> {
        let ok = status_frame(7, 0, &[0x00, 0x02]);
        let parsed = parse_status(&ok)?;
        assert_eq!(parsed.params, vec![0x00, 0x02]);
        assert!(parsed.error_message().is_none());

        let hot = parse_status(&status_frame(12, 0x10, &[]))?;
        assert_eq!(hot.error_message().as_deref(), Some("Motor 12 encountered overheating"));

        let mut corrupt = ok.clone();
        corrupt[5] ^= 0x01;
        assert!(matches!(parse_status(&corrupt), Err(BertError::Protocol(_))));
        Ok(())
    }

    #[test]
    fn legal_start_skips_garbage_and_triple_header() {
        assert_eq!(legal_start(&[0x00, 0x13, 0xFF, 0xFF, 0x01]), Some(2));
        assert_eq!(legal_start(&[0xFF, 0xFF, 0xFF, 0x01]), Some(1));
        assert_eq!(legal_start(&[0x00, 0xFF]), None);
        assert_eq!(message_length(&[0xFF, 0xFF, 0x01, 0x04]), Some(8));
    }
}
