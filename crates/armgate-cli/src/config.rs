//! Configuration Vault – reads/writes `~/.armgate/config.toml`.
//!
//! Every field has a serde default, so a partial file (or one written by an
//! older release) still loads.  `ARMGATE_*` environment variables override
//! the file after it is parsed.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use armgate_hal::{DriverKind, DriverOptions};
use armgate_kernel::{DEFAULT_SUPERVISOR_PIN, ManagerConfig, RegistryConfig, SupervisorSecret};
use armgate_middleware::{BusConfig, DEFAULT_QUEUE_CAPACITY};
use armgate_runtime::{BackgroundConfig, ControlPlaneConfig, PumpConfig};
use armgate_types::{ArmError, SafetyLimits};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

/// Persisted operator configuration stored in `~/.armgate/config.toml`.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// HTTP / WebSocket port of the cockpit server.
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// `sim` or `ur`.
    #[serde(default)]
    pub driver: DriverKind,

    #[serde(default = "default_robot_host")]
    pub robot_host: String,

    /// Secondary interface port on the controller.
    #[serde(default = "default_robot_port")]
    pub robot_port: u16,

    /// Dashboard server port, used to release protective stops.
    #[serde(default = "default_dashboard_port")]
    pub dashboard_port: u16,

    #[serde(default = "default_robot_timeout_secs")]
    pub robot_timeout_secs: f64,

    /// Connect to the robot as soon as the server is up.
    #[serde(default)]
    pub auto_connect: bool,

    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    #[serde(default = "default_session_sweep_secs")]
    pub session_sweep_secs: u64,

    #[serde(default = "default_speed_max")]
    pub speed_max: f64,

    #[serde(default = "default_z_min")]
    pub z_min: f64,

    #[serde(default = "default_z_max")]
    pub z_max: f64,

    #[serde(default = "default_telemetry_rate_hz")]
    pub telemetry_rate_hz: f64,

    /// Gap after which telemetry counts as stale while a motion executes.
    #[serde(default = "default_telemetry_stale_secs")]
    pub telemetry_stale_secs: f64,

    /// Frames buffered per observer before the oldest is dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// PIN for supervisor escalation, e-stop release and limit changes.
    /// Stored as plain text; the file is owner-only on Unix.
    #[serde(default = "default_supervisor_pin")]
    pub supervisor_pin: String,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("server_port", &self.server_port)
            .field("driver", &self.driver)
            .field("robot_host", &self.robot_host)
            .field("robot_port", &self.robot_port)
            .field("dashboard_port", &self.dashboard_port)
            .field("robot_timeout_secs", &self.robot_timeout_secs)
            .field("auto_connect", &self.auto_connect)
            .field("session_timeout_secs", &self.session_timeout_secs)
            .field("max_sessions", &self.max_sessions)
            .field("session_sweep_secs", &self.session_sweep_secs)
            .field("speed_max", &self.speed_max)
            .field("z_min", &self.z_min)
            .field("z_max", &self.z_max)
            .field("telemetry_rate_hz", &self.telemetry_rate_hz)
            .field("telemetry_stale_secs", &self.telemetry_stale_secs)
            .field("queue_capacity", &self.queue_capacity)
            .field("ping_interval_secs", &self.ping_interval_secs)
            .field(
                "supervisor_pin",
                if self.supervisor_pin.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .finish()
    }
}

fn default_server_port() -> u16 {
    8000
}
fn default_robot_host() -> String {
    armgate_runtime::control_plane::DEFAULT_ROBOT_HOST.to_string()
}
fn default_robot_port() -> u16 {
    armgate_runtime::control_plane::DEFAULT_ROBOT_PORT
}
fn default_dashboard_port() -> u16 {
    29999
}
fn default_robot_timeout_secs() -> f64 {
    5.0
}
fn default_session_timeout_secs() -> u64 {
    3600
}
fn default_max_sessions() -> usize {
    10
}
fn default_session_sweep_secs() -> u64 {
    60
}
fn default_speed_max() -> f64 {
    0.5
}
fn default_z_min() -> f64 {
    -0.1
}
fn default_z_max() -> f64 {
    0.5
}
fn default_telemetry_rate_hz() -> f64 {
    10.0
}
fn default_telemetry_stale_secs() -> f64 {
    1.5
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_ping_interval_secs() -> u64 {
    20
}
fn default_supervisor_pin() -> String {
    DEFAULT_SUPERVISOR_PIN.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: default_server_port(),
            driver: DriverKind::default(),
            robot_host: default_robot_host(),
            robot_port: default_robot_port(),
            dashboard_port: default_dashboard_port(),
            robot_timeout_secs: default_robot_timeout_secs(),
            auto_connect: false,
            session_timeout_secs: default_session_timeout_secs(),
            max_sessions: default_max_sessions(),
            session_sweep_secs: default_session_sweep_secs(),
            speed_max: default_speed_max(),
            z_min: default_z_min(),
            z_max: default_z_max(),
            telemetry_rate_hz: default_telemetry_rate_hz(),
            telemetry_stale_secs: default_telemetry_stale_secs(),
            queue_capacity: default_queue_capacity(),
            ping_interval_secs: default_ping_interval_secs(),
            supervisor_pin: default_supervisor_pin(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Component configs
// ─────────────────────────────────────────────────────────────────────────────

/// `secs` as a [`Duration`], or `fallback` when negative or not finite.
fn secs_or(secs: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(fallback)
}

impl Config {
    pub fn limits(&self) -> SafetyLimits {
        SafetyLimits {
            max_speed: self.speed_max,
            z_min: self.z_min,
            z_max: self.z_max,
            ..SafetyLimits::default()
        }
    }

    pub fn supervisor_secret(&self) -> SupervisorSecret {
        SupervisorSecret::new(self.supervisor_pin.clone())
    }

    pub fn driver_options(&self) -> DriverOptions {
        let defaults = DriverOptions::default();
        DriverOptions {
            dashboard_port: self.dashboard_port,
            timeout: secs_or(self.robot_timeout_secs, defaults.timeout),
            ..defaults
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        let defaults = ManagerConfig::default();
        ManagerConfig {
            limits: self.limits(),
            stale_after: secs_or(self.telemetry_stale_secs, defaults.stale_after),
            supervisor: self.supervisor_secret(),
            ..defaults
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        let secs = i64::try_from(self.session_timeout_secs).unwrap_or(i64::MAX);
        RegistryConfig {
            timeout: TimeDelta::try_seconds(secs).unwrap_or(TimeDelta::MAX),
            max_sessions: self.max_sessions.max(1),
            supervisor: self.supervisor_secret(),
            ..RegistryConfig::default()
        }
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            queue_capacity: self.queue_capacity.max(1),
        }
    }

    pub fn background_config(&self) -> BackgroundConfig {
        BackgroundConfig {
            pump: PumpConfig {
                rate_hz: self.telemetry_rate_hz,
            },
            sweep_interval: Duration::from_secs(self.session_sweep_secs.max(1)),
            ping_interval: Duration::from_secs(self.ping_interval_secs.max(1)),
        }
    }

    pub fn control_plane_config(&self) -> ControlPlaneConfig {
        ControlPlaneConfig {
            robot_host: self.robot_host.clone(),
            robot_port: self.robot_port,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Disk I/O
// ─────────────────────────────────────────────────────────────────────────────

/// Return the path to `~/.armgate/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".armgate").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, ArmError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ArmError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        ArmError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let mut cfg: Config = toml::from_str(&raw)
        .map_err(|e| ArmError::Config(format!("failed to parse config: {e}")))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `ARMGATE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ARMGATE_SERVER_PORT` | `server_port` |
/// | `ARMGATE_DRIVER` | `driver` |
/// | `ARMGATE_ROBOT_HOST` | `robot_host` |
/// | `ARMGATE_ROBOT_PORT` | `robot_port` |
/// | `ARMGATE_SESSION_TIMEOUT` | `session_timeout_secs` |
/// | `ARMGATE_MAX_SESSIONS` | `max_sessions` |
/// | `ARMGATE_TELEMETRY_RATE` | `telemetry_rate_hz` |
/// | `ARMGATE_SUPERVISOR_PIN` | `supervisor_pin` |
///
/// Values that fail to parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

pub(crate) fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(
        lookup: &impl Fn(&str) -> Option<String>,
        key: &str,
    ) -> Option<T> {
        lookup(key).and_then(|v| v.trim().parse().ok())
    }

    if let Some(port) = parsed(&lookup, "ARMGATE_SERVER_PORT") {
        cfg.server_port = port;
    }
    if let Some(driver) = parsed(&lookup, "ARMGATE_DRIVER") {
        cfg.driver = driver;
    }
    if let Some(host) = lookup("ARMGATE_ROBOT_HOST")
        && !host.trim().is_empty()
    {
        cfg.robot_host = host.trim().to_string();
    }
    if let Some(port) = parsed(&lookup, "ARMGATE_ROBOT_PORT") {
        cfg.robot_port = port;
    }
    if let Some(secs) = parsed(&lookup, "ARMGATE_SESSION_TIMEOUT") {
        cfg.session_timeout_secs = secs;
    }
    if let Some(n) = parsed(&lookup, "ARMGATE_MAX_SESSIONS") {
        cfg.max_sessions = n;
    }
    if let Some(rate) = parsed::<f64>(&lookup, "ARMGATE_TELEMETRY_RATE")
        && rate.is_finite()
        && rate > 0.0
    {
        cfg.telemetry_rate_hz = rate;
    }
    if let Some(pin) = lookup("ARMGATE_SUPERVISOR_PIN")
        && !pin.is_empty()
    {
        cfg.supervisor_pin = pin;
    }
}

/// Save the config to disk, creating `~/.armgate/` if necessary.
pub fn save(cfg: &Config) -> Result<(), ArmError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ArmError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            ArmError::Config(format!("failed to create config directory: {e}"))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                ArmError::Config(format!("failed to set config directory permissions: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| ArmError::Config(format!("failed to serialize config: {e}")))?;
    let write_err =
        |e: std::io::Error| ArmError::Config(format!("failed to write config at {}: {e}", path.display()));

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
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn debug_redacts_supervisor_pin() {
        let cfg = Config {
            supervisor_pin: "8675309".to_string(),
            ..Config::default()
        };
        let debug_str = format!("{cfg:?}");
        assert!(!debug_str.contains("8675309"));
        assert!(debug_str.contains("<redacted>"));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() -> Result<(), Box<dyn std::error::Error>> {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir()?;
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&Config::default(), &path)?;

        let file_mode = fs::metadata(&path)?.permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let parent = path.parent().ok_or("config path has no parent")?;
        let dir_mode = fs::metadata(parent)?.permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        Ok(())
    }

    #[test]
    fn roundtrip_custom_config() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = config_path_for_home(&dir.path().to_string_lossy());
        let cfg = Config {
            driver: DriverKind::Physical,
            robot_host: "10.0.0.7".to_string(),
            z_max: 0.4,
            ..Config::default()
        };
        save_to(&cfg, &path)?;

        let loaded = load_from(&path)?.ok_or("config missing")?;
        assert_eq!(loaded.driver, DriverKind::Physical);
        assert_eq!(loaded.robot_host, "10.0.0.7");
        assert_eq!(loaded.z_max, 0.4);
        assert_eq!(loaded.server_port, 8000);
        Ok(())
    }

    #[test]
    fn partial_file_fills_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        fs::write(&path, "driver = \"ur\"\nmax_sessions = 3\n")?;

        let loaded = load_from(&path)?.ok_or("config missing")?;
        assert_eq!(loaded.driver, DriverKind::Physical);
        assert_eq!(loaded.max_sessions, 3);
        assert_eq!(loaded.robot_port, 30002);
        assert_eq!(loaded.telemetry_rate_hz, 10.0);
        assert_eq!(loaded.supervisor_pin, "1234");
        Ok(())
    }

    #[test]
    fn malformed_file_is_a_config_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        fs::write(&path, "server_port = \"eight thousand\"")?;
        assert!(matches!(load_from(&path), Err(ArmError::Config(_))));
        Ok(())
    }

    #[test]
    fn config_path_points_to_armgate_dir() {
        let p = config_path_for_home("/home/operator");
        assert!(p.to_string_lossy().contains(".armgate"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path)?.is_none());
        Ok(())
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut cfg = Config::default();
        apply_overrides(
            &mut cfg,
            env(&[
                ("ARMGATE_SERVER_PORT", "9000"),
                ("ARMGATE_DRIVER", "ur"),
                ("ARMGATE_ROBOT_HOST", "cell-3.local"),
                ("ARMGATE_ROBOT_PORT", "30003"),
                ("ARMGATE_SESSION_TIMEOUT", "600"),
                ("ARMGATE_MAX_SESSIONS", "4"),
                ("ARMGATE_TELEMETRY_RATE", "25"),
                ("ARMGATE_SUPERVISOR_PIN", "4321"),
            ]),
        );
        assert_eq!(cfg.server_port, 9000);
        assert_eq!(cfg.driver, DriverKind::Physical);
        assert_eq!(cfg.robot_host, "cell-3.local");
        assert_eq!(cfg.robot_port, 30003);
        assert_eq!(cfg.session_timeout_secs, 600);
        assert_eq!(cfg.max_sessions, 4);
        assert_eq!(cfg.telemetry_rate_hz, 25.0);
        assert_eq!(cfg.supervisor_pin, "4321");
    }

    #[test]
    fn unparsable_overrides_are_ignored() {
        let mut cfg = Config::default();
        apply_overrides(
            &mut cfg,
            env(&[
                ("ARMGATE_SERVER_PORT", "not-a-port"),
                ("ARMGATE_DRIVER", "kuka"),
                ("ARMGATE_TELEMETRY_RATE", "-5"),
                ("ARMGATE_SUPERVISOR_PIN", ""),
            ]),
        );
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn component_configs_follow_the_file() {
        let cfg = Config {
            session_timeout_secs: 600,
            max_sessions: 0,
            telemetry_stale_secs: -1.0,
            robot_timeout_secs: 2.5,
            speed_max: 0.25,
            supervisor_pin: "0000".to_string(),
            ..Config::default()
        };

        let registry = cfg.registry_config();
        assert_eq!(registry.timeout, TimeDelta::seconds(600));
        assert_eq!(registry.max_sessions, 1);
        assert!(registry.supervisor.matches("0000"));

        let manager = cfg.manager_config();
        assert_eq!(manager.limits.max_speed, 0.25);
        assert_eq!(manager.stale_after, ManagerConfig::default().stale_after);
        assert!(manager.supervisor.matches("0000"));
        assert!(!manager.supervisor.matches("1234"));

        assert_eq!(cfg.driver_options().timeout, Duration::from_millis(2500));
        assert_eq!(cfg.driver_options().dashboard_port, 29999);
        assert_eq!(cfg.background_config().pump.period(), Duration::from_millis(100));
        assert_eq!(cfg.bus_config().queue_capacity, 100);
    }
}
