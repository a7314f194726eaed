//! Pose and action lookups used when expanding compound requests.
//!
//! A *pose* is a named, indexed set of [`JointGoal`]s.  An *action* is an
//! ordered list of poses, each with the delay to wait before it, and may name
//! a follow-on action to run when it completes.

use std::time::Duration;

use bert_types::JointGoal;
use serde::{Deserialize, Serialize};

/// The collaborator the sequencer and hub consult for poses and actions.
pub trait PoseCatalog: Send + Sync {
    /// Goals of pose `name` at `index`, or `None` when unknown.
    fn pose_goals(&self, name: &str, index: u32) -> Option<Vec<JointGoal>>;

    /// Ordered steps of action `name`, or `None` when unknown.
    fn action_steps(&self, name: &str) -> Option<Vec<ActionStep>>;

    /// The action to queue automatically once `name` completes.
    fn follow_on(&self, name: &str) -> Option<String>;
}

/// One step of an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    pub pose: String,
    #[serde(default)]
    pub index: u32,
    /// Wait before this step, in milliseconds.
    #[serde(default)]
    pub delay_ms: u64,
}

impl ActionStep {
    pub fn new(pose: impl Into<String>, index: u32, delay_ms: u64) -> Self {
        Self { pose: pose.into(), index, delay_ms }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseDefinition {
    pub name: String,
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub goals: Vec<JointGoal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<ActionStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_on: Option<String>,
}

/// A [`PoseCatalog`] held in memory, usually loaded from the `[[poses]]`
/// and `[[actions]]` tables of the configuration file.  Names match
/// case-insensitively.
///
/// # Example
///
/// ```
/// use bert_kernel::catalog::{ActionStep, PoseCatalog, StaticCatalog};
///
/// let catalog = StaticCatalog::new()
///     .with_action("wave", vec![ActionStep::new("greet", 0, 0)], None);
///
/// assert_eq!(catalog.action_steps("Wave").map(|s| s.len()), Some(1));
/// assert!(catalog.follow_on("wave").is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticCatalog {
    #[serde(default)]
    pub poses: Vec<PoseDefinition>,
    #[serde(default)]
    pub actions: Vec<ActionDefinition>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add (or replace) pose `name` at `index`.
    pub fn with_pose(mut self, name: impl Into<String>, index: u32, goals: Vec<JointGoal>) -> Self {
        let name = name.into();
        self.poses.retain(|p| !(same_name(&p.name, &name) && p.index == index));
        self.poses.push(PoseDefinition { name, index, goals });
        self
    }

    /// Builder: add (or replace) action `name`.
    pub fn with_action(mut self, name: impl Into<String>, steps: Vec<ActionStep>, follow_on: Option<&str>) -> Self {
        let name = name.into();
        self.actions.retain(|a| !same_name(&a.name, &name));
        self.actions.push(ActionDefinition {
            name,
            steps,
            follow_on: follow_on.map(str::to_string),
        });
        self
    }

    fn action(&self, name: &str) -> Option<&ActionDefinition> {
        self.actions.iter().find(|a| same_name(&a.name, name))
    }
}

fn same_name(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

impl PoseCatalog for StaticCatalog {
    fn pose_goals(&self, name: &str, index: u32) -> Option<Vec<JointGoal>> {
        self.poses
            .iter()
            .find(|p| same_name(&p.name, name) && p.index == index)
            .map(|p| p.goals.clone())
    }

    fn action_steps(&self, name: &str) -> Option<Vec<ActionStep>> {
        self.action(name).map(|a| a.steps.clone())
    }

    fn follow_on(&self, name: &str) -> Option<String> {
        self.action(name).and_then(|a| a.follow_on.clone())
    }
}
