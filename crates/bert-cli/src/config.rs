//! Configuration – reads `~/.bert/config.toml`.
//!
//! A missing file means "use the built-in defaults", which describe the
//! two-bus robot (`upper` and `lower`).  A file that exists but cannot be
//! read or parsed is a fatal error.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bert_kernel::StaticCatalog;
use bert_kernel::catalog::{ActionDefinition, PoseDefinition};
use bert_runtime::RobotProfile;
use bert_types::{BertError, Joint, Limb, MotorConfiguration, MotorKind, MotorRegistry};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

/// One serial bus and the device node it is wired to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    pub name: String,
    pub device: PathBuf,
}

/// The OpenAI-compatible endpoint used for internet queries.
#[derive(Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default = "default_ai_url")]
    pub url: String,
    #[serde(default = "default_ai_model")]
    pub model: String,
    /// Stored as plain text; restrict permissions on the config file.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self { url: default_ai_url(), model: default_ai_model(), api_key: String::new() }
    }
}

impl Drop for AiConfig {
    fn drop(&mut self) {
        self.api_key.zeroize();
    }
}

impl std::fmt::Debug for AiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiConfig")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("api_key", if self.api_key.is_empty() { &"<not set>" } else { &"<redacted>" })
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket port of the network peripheral.
    #[serde(default = "default_network_port")]
    pub network_port: u16,
    /// Requests per second accepted from one network connection.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    /// Period of the hub's accounting pass.
    #[serde(default = "default_cadence_ms")]
    pub cadence_ms: u64,
    /// Run against simulated buses instead of serial devices.
    #[serde(default)]
    pub simulate: bool,
    /// Pose executed first during startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normal_speed_pose: Option<String>,
    #[serde(default)]
    pub robot: RobotProfile,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default = "default_buses")]
    pub buses: Vec<BusConfig>,
    #[serde(default = "default_motors")]
    pub motors: Vec<MotorConfiguration>,
    #[serde(default)]
    pub poses: Vec<PoseDefinition>,
    #[serde(default)]
    pub actions: Vec<ActionDefinition>,
}

fn default_network_port() -> u16 {
    bert_middleware::network::DEFAULT_PORT
}
fn default_rate_limit() -> u32 {
    bert_middleware::network::DEFAULT_RATE_LIMIT
}
fn default_cadence_ms() -> u64 {
    1000
}
fn default_ai_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_ai_model() -> String {
    "llama3".to_string()
}

fn default_buses() -> Vec<BusConfig> {
    vec![
        BusConfig { name: "lower".into(), device: PathBuf::from("/dev/ttyUSB1") },
        BusConfig { name: "upper".into(), device: PathBuf::from("/dev/ttyUSB0") },
    ]
}

/// The motor table of the stock robot.
fn default_motors() -> Vec<MotorConfiguration> {
    use Joint::*;
    use MotorKind::*;
    let motor = |joint, limb, bus, id, kind, min, max| MotorConfiguration::new(joint, limb, bus, id, kind).with_limits(min, max);
    vec![
        motor(NeckZ, Limb::Head, "upper", 36, Ax12, -90.0, 90.0),
        motor(NeckY, Limb::Head, "upper", 37, Ax12, -40.0, 20.0),
        motor(AbsY, Limb::Torso, "upper", 31, Mx64, -50.0, 12.0),
        motor(AbsX, Limb::Torso, "upper", 32, Mx64, -45.0, 45.0),
        motor(AbsZ, Limb::Torso, "upper", 33, Mx28, -90.0, 90.0),
        motor(BustY, Limb::Torso, "upper", 34, Mx28, -67.0, 27.0),
        motor(BustX, Limb::Torso, "upper", 35, Mx28, -40.0, 40.0),
        motor(LeftShoulderY, Limb::LeftArm, "upper", 41, Mx28, -120.0, 155.0),
        motor(LeftShoulderX, Limb::LeftArm, "upper", 42, Mx28, -105.0, 110.0),
        motor(LeftShoulderZ, Limb::LeftArm, "upper", 43, Mx28, -105.0, 105.0),
        motor(LeftElbowY, Limb::LeftArm, "upper", 44, Mx28, -10.0, 160.0),
        motor(RightShoulderY, Limb::RightArm, "upper", 51, Mx28, -155.0, 120.0),
        motor(RightShoulderX, Limb::RightArm, "upper", 52, Mx28, -110.0, 105.0),
        motor(RightShoulderZ, Limb::RightArm, "upper", 53, Mx28, -105.0, 105.0),
        motor(RightElbowY, Limb::RightArm, "upper", 54, Mx28, -160.0, 10.0),
        motor(LeftHipX, Limb::LeftLeg, "lower", 11, Mx28, -30.0, 28.5),
        motor(LeftHipZ, Limb::LeftLeg, "lower", 12, Mx28, -25.0, 90.0),
        motor(LeftHipY, Limb::LeftLeg, "lower", 13, Mx64, -104.0, 84.0),
        motor(LeftKneeY, Limb::LeftLeg, "lower", 14, Mx28, -3.5, 134.0),
        motor(LeftAnkleY, Limb::LeftLeg, "lower", 15, Mx28, -45.0, 45.0),
        motor(RightHipX, Limb::RightLeg, "lower", 21, Mx28, -28.5, 30.0),
        motor(RightHipZ, Limb::RightLeg, "lower", 22, Mx28, -90.0, 25.0),
        motor(RightHipY, Limb::RightLeg, "lower", 23, Mx64, -85.0, 105.0),
        motor(RightKneeY, Limb::RightLeg, "lower", 24, Mx28, -134.0, 3.5),
        motor(RightAnkleY, Limb::RightLeg, "lower", 25, Mx28, -45.0, 45.0),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network_port: default_network_port(),
            rate_limit: default_rate_limit(),
            cadence_ms: default_cadence_ms(),
            simulate: false,
            normal_speed_pose: None,
            robot: RobotProfile::default(),
            ai: AiConfig::default(),
            buses: default_buses(),
            motors: default_motors(),
            poses: Vec::new(),
            actions: Vec::new(),
        }
    }
}

impl Config {
    pub fn cadence(&self) -> Duration {
        Duration::from_millis(self.cadence_ms.max(1))
    }

    /// Build the motor registry.  Every motor's bus must be declared in
    /// `[[buses]]`.
    pub fn registry(&self) -> Result<MotorRegistry, BertError> {
        let mut registry = MotorRegistry::new();
        for bus in &self.buses {
            registry.add_bus(bus.name.clone());
        }
        for motor in &self.motors {
            if !self.buses.iter().any(|b| b.name == motor.bus) {
                return Err(BertError::Config(format!(
                    "{} is wired to undeclared bus '{}'",
                    motor.joint, motor.bus
                )));
            }
            registry.insert(motor.clone().with_dynamic_defaults())?;
        }
        Ok(registry)
    }

    pub fn catalog(&self) -> StaticCatalog {
        StaticCatalog { poses: self.poses.clone(), actions: self.actions.clone() }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Paths
// ─────────────────────────────────────────────────────────────────────────────

/// `BERT_CONFIG` if set, otherwise `~/.bert/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("BERT_CONFIG") {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".bert").join("config.toml")
}

// ─────────────────────────────────────────────────────────────────────────────
// Load / save
// ─────────────────────────────────────────────────────────────────────────────

/// Load the config from `path` and apply environment overrides.  A missing
/// file yields the defaults.
pub fn load_from(path: &Path) -> Result<Config, BertError> {
    let mut cfg = if path.exists() {
        let raw = fs::read_to_string(path)
            .map_err(|e| BertError::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| BertError::Config(format!("failed to parse {}: {e}", path.display())))?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Apply `BERT_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `BERT_ROBOT_NAME` | `robot.name` |
/// | `BERT_NETWORK_PORT` | `network_port` |
/// | `BERT_AI_URL` | `ai.url` |
/// | `BERT_AI_MODEL` | `ai.model` |
/// | `BERT_AI_API_KEY` | `ai.api_key` |
/// | `BERT_CADENCE_MS` | `cadence_ms` |
/// | `BERT_SIMULATE` | `simulate` (`1`, `true` or `yes`) |
///
/// Unparsable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("BERT_ROBOT_NAME") {
        cfg.robot.name = v;
    }
    if let Ok(v) = std::env::var("BERT_NETWORK_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.network_port = port;
    }
    if let Ok(v) = std::env::var("BERT_AI_URL") {
        cfg.ai.url = v;
    }
    if let Ok(v) = std::env::var("BERT_AI_MODEL") {
        cfg.ai.model = v;
    }
    if let Ok(v) = std::env::var("BERT_AI_API_KEY") {
        cfg.ai.api_key = v;
    }
    if let Ok(v) = std::env::var("BERT_CADENCE_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.cadence_ms = ms;
    }
    if let Ok(v) = std::env::var("BERT_SIMULATE") {
        cfg.simulate = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
    }
}

/// Write `cfg` to `path`, creating the parent directory.  On Unix the file
/// is readable by its owner only.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), BertError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| BertError::Config(format!("failed to create {}: {e}", parent.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| BertError::Config(format!("failed to restrict {}: {e}", parent.display())))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| BertError::Config(format!("failed to serialize config: {e}")))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| BertError::Config(format!("failed to write {}: {e}", path.display())))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| BertError::Config(format!("failed to write {}: {e}", path.display())))?;
    Ok(())
}
