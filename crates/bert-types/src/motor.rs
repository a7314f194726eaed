//! Motor configuration and the registry that owns it.
//!
//! A [`MotorRegistry`] is built once at startup and shared (behind an `Arc`)
//! with every component that needs motor state.  Each configuration lives in
//! a [`SharedMotor`] so the bus engine that owns a joint can update it in
//! place while every other component reads the same instance.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::BertError;
use crate::model::{Joint, Limb, MotorKind};

fn default_min_angle() -> f64 {
    -90.0
}
fn default_max_angle() -> f64 {
    90.0
}
fn default_max_speed() -> f64 {
    600.0
}
fn default_max_torque() -> f64 {
    1.9
}
fn default_true() -> bool {
    true
}

// ────────────────────────────────────────────────────────────────────────────
// MotorConfiguration
// ────────────────────────────────────────────────────────────────────────────

/// Static and dynamic attributes of one joint's servo.
///
/// The static half is deserialized from configuration; the dynamic half
/// (position, speed, torque, temperature, voltage, torque-enable, travel
/// time) is refreshed as status replies arrive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorConfiguration {
    pub joint: Joint,
    pub limb: Limb,
    /// Name of the serial bus this motor is wired to.
    pub bus: String,
    /// Device id on the bus.
    pub id: u8,
    #[serde(default, rename = "type")]
    pub kind: MotorKind,
    /// `true` when increasing raw values move the joint in the positive
    /// direction.
    #[serde(default = "default_true")]
    pub direct: bool,
    /// Degrees added by the mechanical mounting.
    #[serde(default)]
    pub offset: f64,
    #[serde(default = "default_min_angle")]
    pub min_angle: f64,
    #[serde(default = "default_max_angle")]
    pub max_angle: f64,
    /// Degrees per second.
    #[serde(default = "default_max_speed")]
    pub max_speed: f64,
    /// Newton-meters.
    #[serde(default = "default_max_torque")]
    pub max_torque: f64,

    #[serde(skip)]
    pub position: f64,
    #[serde(skip)]
    pub speed: f64,
    #[serde(skip)]
    pub torque: f64,
    #[serde(skip)]
    pub load: f64,
    #[serde(skip)]
    pub temperature: f64,
    #[serde(skip)]
    pub voltage: f64,
    #[serde(skip)]
    pub torque_enabled: bool,
    /// Time the last position change is expected to take.
    #[serde(skip)]
    pub travel_time: Duration,
}

impl MotorConfiguration {
    pub fn new(joint: Joint, limb: Limb, bus: impl Into<String>, id: u8, kind: MotorKind) -> Self {
        Self {
            joint,
            limb,
            bus: bus.into(),
            id,
            kind,
            direct: true,
            offset: 0.0,
            min_angle: default_min_angle(),
            max_angle: default_max_angle(),
            max_speed: default_max_speed(),
            max_torque: default_max_torque(),
            position: 0.0,
            speed: 0.0,
            torque: 0.0,
            load: 0.0,
            temperature: 0.0,
            voltage: 0.0,
            torque_enabled: false,
            travel_time: Duration::ZERO,
        }
        .with_dynamic_defaults()
    }

    /// Reset the dynamic attributes to their power-on assumptions.  Call after
    /// deserializing, since serde leaves skipped fields zeroed.
    pub fn with_dynamic_defaults(mut self) -> Self {
        self.speed = 684.0;
        self.temperature = 20.0;
        self.torque = self.max_torque;
        self.torque_enabled = true;
        self
    }

    /// Builder: set the angle limits.
    pub fn with_limits(mut self, min_angle: f64, max_angle: f64) -> Self {
        self.min_angle = min_angle;
        self.max_angle = max_angle;
        self
    }

    /// Record a new position and derive the travel time from the current
    /// speed.  A zero speed leaves the previous travel time in place.
    pub fn set_position(&mut self, angle: f64) {
        let delta = (angle - self.position).abs();
        if self.speed > 0.0 {
            self.travel_time = Duration::from_secs_f64(delta / self.speed);
        }
        self.position = angle;
    }

    /// Validate the static limits; used when the registry is built.
    pub fn validate(&self) -> Result<(), BertError> {
        if self.min_angle > self.max_angle {
            return Err(BertError::Config(format!(
                "{}: minimum angle {} exceeds maximum angle {}",
                self.joint, self.min_angle, self.max_angle
            )));
        }
        if self.max_speed <= 0.0 || self.max_torque <= 0.0 {
            return Err(BertError::Config(format!(
                "{}: maximum speed and torque must be positive",
                self.joint
            )));
        }
        Ok(())
    }
}

/// A motor configuration shared between the registry and the bus engine
/// that owns it.
pub type SharedMotor = Arc<RwLock<MotorConfiguration>>;

/// Read-lock a shared motor, recovering the data if a writer panicked.
pub fn read_motor(motor: &SharedMotor) -> RwLockReadGuard<'_, MotorConfiguration> {
    motor.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write-lock a shared motor, recovering the data if a writer panicked.
pub fn write_motor(motor: &SharedMotor) -> RwLockWriteGuard<'_, MotorConfiguration> {
    motor.write().unwrap_or_else(PoisonError::into_inner)
}

// ────────────────────────────────────────────────────────────────────────────
// MotorRegistry
// ────────────────────────────────────────────────────────────────────────────

/// Owner of every [`MotorConfiguration`], indexed by joint and by
/// `(bus, id)`.
///
/// # Example
///
/// ```
/// use bert_types::{Joint, Limb, MotorConfiguration, MotorKind, MotorRegistry};
///
/// let mut registry = MotorRegistry::new();
/// registry
///     .insert(MotorConfiguration::new(Joint::NeckY, Limb::Head, "upper", 36, MotorKind::Ax12))
///     .unwrap();
///
/// assert_eq!(registry.bus_names(), vec!["upper".to_string()]);
/// assert!(registry.motor_by_id("upper", 36).is_some());
/// ```
#[derive(Debug, Default)]
pub struct MotorRegistry {
    by_joint: HashMap<Joint, SharedMotor>,
    by_id: HashMap<(String, u8), SharedMotor>,
    buses: BTreeMap<String, Vec<Joint>>,
}

impl MotorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a bus that may have no motors yet.
    pub fn add_bus(&mut self, name: impl Into<String>) {
        self.buses.entry(name.into()).or_default();
    }

    /// Register a motor.  Fails when the joint or the `(bus, id)` pair is
    /// already taken, or when the configuration is inconsistent.
    pub fn insert(&mut self, config: MotorConfiguration) -> Result<SharedMotor, BertError> {
        config.validate()?;
        if self.by_joint.contains_key(&config.joint) {
            return Err(BertError::Config(format!("{} is configured twice", config.joint)));
        }
        let key = (config.bus.clone(), config.id);
        if self.by_id.contains_key(&key) {
            return Err(BertError::Config(format!(
                "motor id {} is used twice on bus {}",
                config.id, config.bus
            )));
        }
        let joint = config.joint;
        let bus = config.bus.clone();
        let shared = Arc::new(RwLock::new(config));
        self.by_joint.insert(joint, Arc::clone(&shared));
        self.by_id.insert(key, Arc::clone(&shared));
        self.buses.entry(bus).or_default().push(joint);
        Ok(shared)
    }

    pub fn motor(&self, joint: Joint) -> Option<SharedMotor> {
        self.by_joint.get(&joint).cloned()
    }

    pub fn motor_by_id(&self, bus: &str, id: u8) -> Option<SharedMotor> {
        self.by_id.get(&(bus.to_string(), id)).cloned()
    }

    /// Bus names in sorted order.
    pub fn bus_names(&self) -> Vec<String> {
        self.buses.keys().cloned().collect()
    }

    pub fn bus_count(&self) -> usize {
        self.buses.len()
    }

    /// The bus a joint is wired to.
    pub fn bus_for(&self, joint: Joint) -> Option<String> {
        self.motor(joint).map(|m| read_motor(&m).bus.clone())
    }

    /// Motors on `bus`, ordered by id.
    pub fn motors_on_bus(&self, bus: &str) -> Vec<SharedMotor> {
        let mut motors: Vec<SharedMotor> = self
            .buses
            .get(bus)
            .into_iter()
            .flatten()
            .filter_map(|j| self.motor(*j))
            .collect();
        motors.sort_by_key(|m| read_motor(m).id);
        motors
    }

    /// Motors belonging to `limb`, across all buses.
    pub fn motors_in_limb(&self, limb: Limb) -> Vec<SharedMotor> {
        self.all()
            .into_iter()
            .filter(|m| read_motor(m).limb == limb)
            .collect()
    }

    /// Every motor, ordered by joint.
    pub fn all(&self) -> Vec<SharedMotor> {
        let mut joints: Vec<Joint> = self.by_joint.keys().copied().collect();
        joints.sort();
        joints.into_iter().filter_map(|j| self.motor(j)).collect()
    }

    pub fn len(&self) -> usize {
        self.by_joint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_joint.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elbow() -> MotorConfiguration {
        MotorConfiguration::new(Joint::LeftElbowY, Limb::LeftArm, "upper", 42, MotorKind::Mx28)
            .with_limits(-10.0, 160.0)
    }

    #[test]
    fn set_position_computes_travel_time_from_speed() {
        let mut mc = elbow();
        mc.speed = 100.0;
        mc.set_position(50.0);
        assert_eq!(mc.travel_time, Duration::from_millis(500));
        assert_eq!(mc.position, 50.0);
    }

    #[test]
    fn zero_speed_keeps_previous_travel_time() {
        let mut mc = elbow();
        mc.speed = 0.0;
        mc.travel_time = Duration::from_millis(7);
        mc.set_position(90.0);
        assert_eq!(mc.travel_time, Duration::from_millis(7));
    }

    #[test]
    fn registry_indexes_by_joint_and_id_with_shared_instances() -> Result<(), BertError> {
        let mut registry = MotorRegistry::new();
        registry.insert(elbow())?;

        let by_joint = registry.motor(Joint::LeftElbowY).ok_or(BertError::Config("missing".into()))?;
        write_motor(&by_joint).set_position(12.0);

        let by_id = registry.motor_by_id("upper", 42).ok_or(BertError::Config("missing".into()))?;
        assert_eq!(read_motor(&by_id).position, 12.0);
        Ok(())
    }

    #[test]
    fn duplicate_joint_or_id_is_rejected() -> Result<(), BertError> {
        let mut registry = MotorRegistry::new();
        registry.insert(elbow())?;
        assert!(registry.insert(elbow()).is_err());

        let clash = MotorConfiguration::new(Joint::NeckY, Limb::Head, "upper", 42, MotorKind::Ax12);
        assert!(registry.insert(clash).is_err());
        Ok(())
    }

    #[test]
    fn inverted_limits_are_rejected() {
        let bad = elbow().with_limits(100.0, 0.0);
        assert!(matches!(bad.validate(), Err(BertError::Config(_))));
    }

    #[test]
    fn bus_and_limb_queries() -> Result<(), BertError> {
        let mut registry = MotorRegistry::new();
        registry.add_bus("lower");
        registry.insert(elbow())?;
        registry.insert(MotorConfiguration::new(
            Joint::LeftShoulderY,
            Limb::LeftArm,
            "upper",
            41,
            MotorKind::Mx28,
        ))?;

        assert_eq!(registry.bus_count(), 2);
        assert!(registry.motors_on_bus("lower").is_empty());
        let ids: Vec<u8> = registry
            .motors_on_bus("upper")
            .iter()
            .map(|m| read_motor(m).id)
            .collect();
        assert_eq!(ids, vec![41, 42]);
        assert_eq!(registry.motors_in_limb(Limb::LeftArm).len(), 2);
        assert_eq!(registry.bus_for(Joint::LeftElbowY).as_deref(), Some("upper"));
        Ok(())
    }
}
