//! `armgate-types` – shared vocabulary of the ArmGate control plane.
//!
//! Every other crate speaks in these types: robot lifecycle state, safety
//! limits, telemetry snapshots, sessions, and the wire [`Envelope`] that is
//! fanned out to observers.  The crate has no async or I/O dependencies.
//!
//! # Modules
//!
//! - [`envelope`] – the `{type, timestamp, data}` broadcast envelope and the
//!   four observer [`Topic`]s.
//! - [`clock`] – injectable wall clock ([`SystemClock`], [`ManualClock`]) so
//!   session expiry can be tested without sleeping.

pub mod clock;
pub mod envelope;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use clock::{Clock, ManualClock, SystemClock};
pub use envelope::{Envelope, EnvelopeKind, JobStatus, Severity, Topic};

/// Opaque session token handed to clients.
pub type SessionId = Uuid;

/// Identifier of a live observer connection on the telemetry bus.
pub type ConnectionId = Uuid;

/// Standard chess start position, used until the board tracker reports.
pub const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

// ────────────────────────────────────────────────────────────────────────────
// Robot lifecycle
// ────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of the arm.  Exactly one value is authoritative at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RobotState {
    #[default]
    Idle,
    Connecting,
    Ready,
    Executing,
    Paused,
    Fault,
    Estop,
}

impl fmt::Display for RobotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RobotState::Idle => "IDLE",
            RobotState::Connecting => "CONNECTING",
            RobotState::Ready => "READY",
            RobotState::Executing => "EXECUTING",
            RobotState::Paused => "PAUSED",
            RobotState::Fault => "FAULT",
            RobotState::Estop => "ESTOP",
        };
        f.write_str(s)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Kinematics
// ────────────────────────────────────────────────────────────────────────────

/// Tool-centre-point pose: position in metres, rotation vector in radians.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TcpPose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub rx: f64,
    pub ry: f64,
    pub rz: f64,
}

impl TcpPose {
    pub const fn new(x: f64, y: f64, z: f64, rx: f64, ry: f64, rz: f64) -> Self {
        Self { x, y, z, rx, ry, rz }
    }

    /// Cartesian position `[x, y, z]`.
    pub fn position(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    /// Value of a single axis.
    pub fn axis(&self, axis: TcpAxis) -> f64 {
        match axis {
            TcpAxis::X => self.x,
            TcpAxis::Y => self.y,
            TcpAxis::Z => self.z,
            TcpAxis::Rx => self.rx,
            TcpAxis::Ry => self.ry,
            TcpAxis::Rz => self.rz,
        }
    }

    /// Copy of this pose with `delta` added to `axis`.
    pub fn offset(mut self, axis: TcpAxis, delta: f64) -> Self {
        match axis {
            TcpAxis::X => self.x += delta,
            TcpAxis::Y => self.y += delta,
            TcpAxis::Z => self.z += delta,
            TcpAxis::Rx => self.rx += delta,
            TcpAxis::Ry => self.ry += delta,
            TcpAxis::Rz => self.rz += delta,
        }
        self
    }
}

/// Cartesian jog axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TcpAxis {
    X,
    Y,
    Z,
    Rx,
    Ry,
    Rz,
}

impl TcpAxis {
    pub fn as_str(&self) -> &'static str {
        match self {
            TcpAxis::X => "x",
            TcpAxis::Y => "y",
            TcpAxis::Z => "z",
            TcpAxis::Rx => "rx",
            TcpAxis::Ry => "ry",
            TcpAxis::Rz => "rz",
        }
    }

    /// `true` for the three translational axes.
    pub fn is_linear(&self) -> bool {
        matches!(self, TcpAxis::X | TcpAxis::Y | TcpAxis::Z)
    }
}

impl FromStr for TcpAxis {
    type Err = ArmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x" => Ok(TcpAxis::X),
            "y" => Ok(TcpAxis::Y),
            "z" => Ok(TcpAxis::Z),
            "rx" => Ok(TcpAxis::Rx),
            "ry" => Ok(TcpAxis::Ry),
            "rz" => Ok(TcpAxis::Rz),
            other => Err(ArmError::SafetyRejected(format!("invalid TCP axis: {other}"))),
        }
    }
}

/// Reference frame for Cartesian jogs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frame {
    #[default]
    Base,
    Tool,
}

/// Number of joints on the arm.
pub const JOINT_COUNT: usize = 6;

/// Which space a jog is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum JogMode {
    Tcp {
        axis: TcpAxis,
        #[serde(default)]
        frame: Frame,
    },
    Joint {
        joint: usize,
    },
}

/// An incremental manual movement request.
///
/// ```
/// use armgate_types::{JogCommand, TcpAxis};
///
/// let jog = JogCommand::tcp(TcpAxis::Z, 0.01, 0.1);
/// let json = serde_json::to_value(&jog).unwrap();
/// assert_eq!(json["mode"], "tcp");
/// assert_eq!(json["axis"], "z");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JogCommand {
    #[serde(flatten)]
    pub mode: JogMode,
    pub delta: f64,
    pub speed: f64,
}

impl JogCommand {
    pub fn tcp(axis: TcpAxis, delta: f64, speed: f64) -> Self {
        Self {
            mode: JogMode::Tcp {
                axis,
                frame: Frame::Base,
            },
            delta,
            speed,
        }
    }

    pub fn joint(joint: usize, delta: f64, speed: f64) -> Self {
        Self {
            mode: JogMode::Joint { joint },
            delta,
            speed,
        }
    }
}

/// Digital I/O bank state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoMap {
    #[serde(rename = "di")]
    pub inputs: Vec<bool>,
    #[serde(rename = "do")]
    pub outputs: Vec<bool>,
}

impl Default for IoMap {
    fn default() -> Self {
        Self {
            inputs: vec![false; 8],
            outputs: vec![false; 8],
        }
    }
}

/// One point-in-time read from the motion driver.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DriverSample {
    pub pose: TcpPose,
    pub joints: [f64; JOINT_COUNT],
    pub speed: f64,
    pub io: IoMap,
}

// ────────────────────────────────────────────────────────────────────────────
// Safety limits
// ────────────────────────────────────────────────────────────────────────────

/// Axis-aligned box the TCP must never enter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepoutVolume {
    pub name: String,
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl KeepoutVolume {
    /// `true` when `point` lies inside the box (boundaries inclusive).
    pub fn contains(&self, point: [f64; 3]) -> bool {
        (0..3).all(|i| point[i] >= self.min[i] && point[i] <= self.max[i])
    }
}

/// Motion envelope enforced on every command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Maximum commanded jog speed (m/s for TCP, rad/s for joints).
    #[serde(alias = "speed_max")]
    pub max_speed: f64,
    pub z_min: f64,
    pub z_max: f64,
    #[serde(default)]
    pub keepout: Vec<KeepoutVolume>,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_speed: 0.5,
            z_min: -0.1,
            z_max: 0.5,
            keepout: Vec::new(),
        }
    }
}

impl SafetyLimits {
    /// Reject limits that no motion could ever satisfy.
    pub fn validate(&self) -> Result<(), ArmError> {
        if !self.max_speed.is_finite() || self.max_speed <= 0.0 {
            return Err(ArmError::SafetyRejected(format!(
                "max_speed must be positive, got {}",
                self.max_speed
            )));
        }
        if !self.z_min.is_finite() || !self.z_max.is_finite() || self.z_min > self.z_max {
            return Err(ArmError::SafetyRejected(format!(
                "z band [{}, {}] is empty",
                self.z_min, self.z_max
            )));
        }
        for volume in &self.keepout {
            if (0..3).any(|i| volume.min[i] > volume.max[i]) {
                return Err(ArmError::SafetyRejected(format!(
                    "keep-out volume '{}' has min > max",
                    volume.name
                )));
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Telemetry snapshot
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EstopStatus {
    /// Latched emergency stop.
    pub hw: bool,
    pub sw: bool,
}

/// Progress of the job currently driving the arm, if any.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProgramStatus {
    pub name: Option<String>,
    pub step: u32,
    pub progress: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardState {
    pub fen: String,
    pub turn: String,
    pub move_no: u32,
}

impl Default for BoardState {
    fn default() -> Self {
        Self {
            fen: START_FEN.to_string(),
            turn: "w".to_string(),
            move_no: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub active: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineStatus {
    pub running: bool,
    pub eval: Option<f64>,
    pub bestmove: Option<String>,
    pub depth: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkStatus {
    /// `false` when the snapshot was built from cached values.
    pub link_up: bool,
    pub rtt_ms: f64,
    /// Epoch seconds at which the snapshot was taken.
    pub server_time: f64,
}

/// Aggregate robot status published once per pump tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub state: RobotState,
    pub program: ProgramStatus,
    pub joints: [f64; JOINT_COUNT],
    #[serde(rename = "tcp_pose")]
    pub pose: TcpPose,
    #[serde(rename = "tcp_speed")]
    pub speed: f64,
    #[serde(rename = "iomap")]
    pub io: IoMap,
    pub estop: EstopStatus,
    pub limits: SafetyLimits,
    pub board: BoardState,
    pub queue: QueueStatus,
    pub engine: EngineStatus,
    #[serde(rename = "net")]
    pub network: NetworkStatus,
    pub errors: Vec<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Sessions
// ────────────────────────────────────────────────────────────────────────────

/// Privileges granted to a supervisor session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    TeachPoints,
    ClearEstop,
    UpdateLimits,
}

impl Permission {
    /// The full set handed out on successful supervisor authentication.
    pub const SUPERVISOR: [Permission; 3] = [
        Permission::TeachPoints,
        Permission::ClearEstop,
        Permission::UpdateLimits,
    ];
}

/// A client session.  Owned by the session registry; everyone else holds a
/// [`SessionId`] or a cloned snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub client_id: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_supervisor: bool,
    pub permissions: Vec<Permission>,
}

impl Session {
    /// Expired once `now` reaches `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Supervisors implicitly hold every permission.
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.is_supervisor || self.permissions.contains(&permission)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Closed classification of every failure the control plane reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connectivity,
    SafetyRejection,
    Authorization,
    Staleness,
    Delivery,
    Internal,
}

/// Global error type for the control plane.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArmError {
    #[error("Connectivity: {0}")]
    Connectivity(String),

    #[error("Safety rejected: {0}")]
    SafetyRejected(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Session not found or expired: {0}")]
    SessionNotFound(String),

    #[error("Telemetry stale: {0}")]
    Staleness(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("Driver fault during {operation}: {details}")]
    DriverFault { operation: String, details: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ArmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArmError::Connectivity(_) | ArmError::DriverFault { .. } => ErrorKind::Connectivity,
            ArmError::SafetyRejected(_) | ArmError::Interrupted(_) => ErrorKind::SafetyRejection,
            ArmError::Unauthorized(_) | ArmError::SessionNotFound(_) => ErrorKind::Authorization,
            ArmError::Staleness(_) => ErrorKind::Staleness,
            ArmError::Delivery(_) => ErrorKind::Delivery,
            ArmError::Config(_) | ArmError::Serialization(_) => ErrorKind::Internal,
        }
    }
}

impl From<serde_json::Error> for ArmError {
    fn from(e: serde_json::Error) -> Self {
        ArmError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn robot_state_serializes_uppercase() {
        let json = serde_json::to_string(&RobotState::Estop).unwrap();
        assert_eq!(json, "\"ESTOP\"");
        assert_eq!(RobotState::default(), RobotState::Idle);
        assert_eq!(RobotState::Executing.to_string(), "EXECUTING");
    }

    #[test]
    fn pose_offset_only_touches_one_axis() {
        let pose = TcpPose::new(0.3, 0.0, 0.3, 0.0, 0.0, 0.0);
        let moved = pose.offset(TcpAxis::Z, -0.05);
        assert!((moved.z - 0.25).abs() < 1e-9);
        assert_eq!(moved.x, pose.x);
        assert_eq!(moved.axis(TcpAxis::Rz), 0.0);
    }

    #[test]
    fn axis_parses_case_insensitive() {
        assert_eq!("RX".parse::<TcpAxis>().unwrap(), TcpAxis::Rx);
        assert!(matches!(
            "w".parse::<TcpAxis>(),
            Err(ArmError::SafetyRejected(_))
        ));
    }

    #[test]
    fn jog_command_deserializes_joint_mode() {
        let jog: JogCommand =
            serde_json::from_str(r#"{"mode":"joint","joint":2,"delta":0.1,"speed":0.2}"#).unwrap();
        assert_eq!(jog, JogCommand::joint(2, 0.1, 0.2));
    }

    #[test]
    fn jog_command_tcp_frame_defaults_to_base() {
        let jog: JogCommand =
            serde_json::from_str(r#"{"mode":"tcp","axis":"x","delta":0.01,"speed":0.1}"#).unwrap();
        assert!(matches!(
            jog.mode,
            JogMode::Tcp {
                axis: TcpAxis::X,
                frame: Frame::Base
            }
        ));
    }

    #[test]
    fn keepout_contains_is_inclusive() {
        let vol = KeepoutVolume {
            name: "fixture".into(),
            min: [0.0, 0.0, 0.0],
            max: [0.1, 0.1, 0.1],
        };
        assert!(vol.contains([0.1, 0.05, 0.0]));
        assert!(!vol.contains([0.11, 0.05, 0.0]));
    }

    #[test]
    fn limits_accept_speed_max_alias() {
        let limits: SafetyLimits =
            serde_json::from_str(r#"{"speed_max":0.3,"z_min":0.0,"z_max":0.4}"#).unwrap();
        assert!((limits.max_speed - 0.3).abs() < f64::EPSILON);
        assert!(limits.keepout.is_empty());
    }

    #[test]
    fn limits_validate_rejects_inverted_z_band() {
        let limits = SafetyLimits {
            z_min: 0.6,
            z_max: 0.5,
            ..SafetyLimits::default()
        };
        assert!(matches!(limits.validate(), Err(ArmError::SafetyRejected(_))));
        assert!(SafetyLimits::default().validate().is_ok());
    }

    #[test]
    fn limits_validate_rejects_non_positive_speed() {
        let limits = SafetyLimits {
            max_speed: 0.0,
            ..SafetyLimits::default()
        };
        assert!(limits.validate().is_err());
        let limits = SafetyLimits {
            max_speed: f64::NAN,
            ..SafetyLimits::default()
        };
        assert!(limits.validate().is_err());
    }

    #[test]
    fn io_map_uses_di_do_keys() {
        let json = serde_json::to_value(IoMap::default()).unwrap();
        assert_eq!(json["di"].as_array().map(Vec::len), Some(8));
        assert_eq!(json["do"].as_array().map(Vec::len), Some(8));
    }

    #[test]
    fn supervisor_session_holds_every_permission() {
        let now = Utc::now();
        let mut session = Session {
            id: Uuid::new_v4(),
            client_id: None,
            user_agent: None,
            created_at: now,
            last_activity: now,
            expires_at: now,
            is_supervisor: false,
            permissions: vec![],
        };
        assert!(!session.has_permission(Permission::ClearEstop));
        assert!(session.is_expired_at(now));
        session.is_supervisor = true;
        assert!(session.has_permission(Permission::UpdateLimits));
    }

    #[test]
    fn arm_error_kind_is_closed() {
        assert_eq!(
            ArmError::Unauthorized("pin".into()).kind(),
            ErrorKind::Authorization
        );
        assert_eq!(
            ArmError::DriverFault {
                operation: "home".into(),
                details: "timeout".into()
            }
            .kind(),
            ErrorKind::Connectivity
        );
        assert!(ArmError::SafetyRejected("speed".into())
            .to_string()
            .contains("Safety rejected"));
    }
}
