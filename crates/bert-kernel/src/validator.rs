//! [`Validator`] – eager checks the hub runs before a request is queued.
//!
//! Every registered [`Rule`] is evaluated in order; the first violation
//! becomes the envelope's error and the request never reaches a bus.
//!
//! Built-in rules:
//! - [`TargetRule`] – joint and limb requests must name a joint or limb
//!   that is wired to a motor bus.
//! - [`AngleLimitRule`] – position writes must stay inside the configured
//!   angle limits of every joint they address.
//! - [`SpeedCapRule`] – speed and torque writes must not exceed the motor's
//!   configured maximum.
//! - [`CatalogRule`] – poses and actions must exist in the catalog.

use std::sync::Arc;

use bert_types::{
    BertError, JointProperty, MotorConfiguration, MotorRegistry, RequestEnvelope, RequestKind, Target,
    read_motor,
};

use crate::catalog::PoseCatalog;

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single check a request must pass before it is queued.
pub trait Rule: Send + Sync {
    fn name(&self) -> &str;

    /// Return `Ok(())` when `envelope` passes, or
    /// [`BertError::Validation`] carrying the reply text when it does not.
    fn check(&self, envelope: &RequestEnvelope) -> Result<(), BertError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Validator
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct Validator {
    rules: Vec<Box<dyn Rule>>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The rule set the hub uses: target, angle limits, speed caps and
    /// catalog checks.
    pub fn standard(registry: Arc<MotorRegistry>, catalog: Arc<dyn PoseCatalog>) -> Self {
        let mut validator = Self::new();
        validator.add_rule(Box::new(TargetRule { registry: registry.clone() }));
        validator.add_rule(Box::new(AngleLimitRule { registry: registry.clone() }));
        validator.add_rule(Box::new(SpeedCapRule { registry }));
        validator.add_rule(Box::new(CatalogRule { catalog }));
        validator
    }

    /// Register a new [`Rule`].  Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    /// Returns the first violation, or `Ok(())` when every rule passes.
    pub fn verify(&self, envelope: &RequestEnvelope) -> Result<(), BertError> {
        for rule in &self.rules {
            rule.check(envelope)?;
        }
        Ok(())
    }

    /// Run [`verify`](Self::verify) and record a violation on the envelope.
    /// Returns `true` when the envelope was rejected.
    pub fn screen(&self, envelope: &mut RequestEnvelope) -> bool {
        match self.verify(envelope) {
            Ok(()) => false,
            Err(BertError::Validation(message)) => {
                envelope.assign_error(message);
                true
            }
            Err(other) => {
                envelope.assign_error(other.to_string());
                true
            }
        }
    }
}

fn invalid(message: String) -> Result<(), BertError> {
    Err(BertError::Validation(message))
}

/// The motors a write addresses: the joint's motor or every motor in the
/// limb.
fn addressed(registry: &MotorRegistry, target: &Target) -> Vec<MotorConfiguration> {
    match target {
        Target::Joint(joint) => registry.motor(*joint).map(|m| read_motor(&m).clone()).into_iter().collect(),
        Target::Limb(limb) => registry
            .motors_in_limb(*limb)
            .iter()
            .map(|m| read_motor(m).clone())
            .collect(),
        _ => Vec::new(),
    }
}

fn written_value(kind: &RequestKind) -> Option<(JointProperty, f64)> {
    match kind {
        RequestKind::SetMotorProperty { property, value } | RequestKind::SetLimbProperty { property, value } => {
            Some((*property, *value))
        }
        _ => None,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Rejects joint and limb requests without a target, and targets no motor
/// bus serves.
pub struct TargetRule {
    pub registry: Arc<MotorRegistry>,
}

impl Rule for TargetRule {
    fn name(&self) -> &str {
        "target"
    }

    fn check(&self, envelope: &RequestEnvelope) -> Result<(), BertError> {
        let label = envelope.kind.label();
        match (&envelope.kind, &envelope.target) {
            (
                RequestKind::GetMotorProperty(_)
                | RequestKind::SetMotorProperty { .. }
                | RequestKind::GetGoals
                | RequestKind::GetLimits,
                Target::Joint(joint),
            ) => match self.registry.motor(*joint) {
                Some(_) => Ok(()),
                None => invalid(format!("My {} is not connected to any motor bus", joint.spoken())),
            },
            (
                RequestKind::GetMotorProperty(_)
                | RequestKind::SetMotorProperty { .. }
                | RequestKind::GetGoals
                | RequestKind::GetLimits,
                _,
            ) => invalid(format!("A joint is required for {label}")),
            (RequestKind::SetLimbProperty { .. } | RequestKind::ListMotorProperty(_), Target::Limb(limb))
                if self.registry.motors_in_limb(*limb).is_empty() =>
            {
                invalid(format!("My {} is not connected to any motor bus", limb.spoken()))
            }
            (RequestKind::SetLimbProperty { .. }, Target::Limb(_)) => Ok(()),
            (RequestKind::SetLimbProperty { .. }, _) => invalid(format!("A limb is required for {label}")),
            _ => Ok(()),
        }
    }
}

/// Rejects position writes outside `[min_angle, max_angle]`.
pub struct AngleLimitRule {
    pub registry: Arc<MotorRegistry>,
}

impl Rule for AngleLimitRule {
    fn name(&self) -> &str {
        "angle_limit"
    }

    fn check(&self, envelope: &RequestEnvelope) -> Result<(), BertError> {
        let Some((JointProperty::Angle, angle)) = written_value(&envelope.kind) else {
            return Ok(());
        };
        for mc in addressed(&self.registry, &envelope.target) {
            if angle > mc.max_angle {
                return invalid(format!("the maximum angle for {} is {:.0} degrees", mc.joint, mc.max_angle));
            }
            if angle < mc.min_angle {
                return invalid(format!("the minimum angle for {} is {:.0} degrees", mc.joint, mc.min_angle));
            }
        }
        Ok(())
    }
}

/// Rejects speed and torque writes above the motor's configured maximum,
/// and negative values for either.
pub struct SpeedCapRule {
    pub registry: Arc<MotorRegistry>,
}

impl Rule for SpeedCapRule {
    fn name(&self) -> &str {
        "speed_cap"
    }

    fn check(&self, envelope: &RequestEnvelope) -> Result<(), BertError> {
        let Some((property, value)) = written_value(&envelope.kind) else {
            return Ok(());
        };
        if !matches!(property, JointProperty::Speed | JointProperty::Torque) {
            return Ok(());
        }
        if value < 0.0 {
            return invalid(format!("the {} cannot be negative", property.spoken()));
        }
        for mc in addressed(&self.registry, &envelope.target) {
            match property {
                JointProperty::Speed if value > mc.max_speed => {
                    return invalid(format!(
                        "the maximum speed for {} is {:.0} degrees per second",
                        mc.joint, mc.max_speed
                    ));
                }
                JointProperty::Torque if value > mc.max_torque => {
                    return invalid(format!(
                        "the maximum torque for {} is {:.1} newton-meters",
                        mc.joint, mc.max_torque
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Rejects poses and actions the catalog does not know.
pub struct CatalogRule {
    pub catalog: Arc<dyn PoseCatalog>,
}

impl Rule for CatalogRule {
    fn name(&self) -> &str {
        "catalog"
    }

    fn check(&self, envelope: &RequestEnvelope) -> Result<(), BertError> {
        match &envelope.kind {
            // Per-limb sub-requests already carry their goals.
            RequestKind::ExecutePose { pose, index, goals } if goals.is_empty() => {
                match self.catalog.pose_goals(pose, *index) {
                    Some(_) => Ok(()),
                    None => invalid(format!("I don't know the pose {pose} {index}")),
                }
            }
            RequestKind::ExecuteAction(action) => match self.catalog.action_steps(action) {
                Some(_) => Ok(()),
                None => invalid(format!("I don't know how to {action}")),
            },
            _ => Ok(()),
        }
    }
}
