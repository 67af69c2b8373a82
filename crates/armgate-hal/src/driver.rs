//! The [`MotionDriver`] capability trait.
//!
//! A driver executes atomic motion primitives and reports point-in-time
//! telemetry.  Methods take `&self` so that [`MotionDriver::stop`] and
//! [`MotionDriver::emergency_stop`] can run while another task is awaiting a
//! long move on the same driver; implementations keep their state behind
//! interior locks and never hold one across an `.await`.
//!
//! Long-running primitives observe a shared [`HaltSignal`].  Tripping it from
//! `stop`/`emergency_stop` makes the in-flight primitive return
//! [`DriverError::Interrupted`] at its next step.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use armgate_types::{ArmError, DriverSample, Frame, TcpAxis};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sim::SimDriver;
use crate::urscript::UrScriptDriver;

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Every way a motion primitive can fail.  Drivers never panic past this
/// boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("driver is not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("command rejected: {0}")]
    Rejected(String),

    #[error("motion interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl DriverError {
    /// Lift into the control-plane taxonomy, tagging the failed primitive.
    pub fn into_arm_error(self, operation: &str) -> ArmError {
        match self {
            DriverError::NotConnected => {
                ArmError::Connectivity(format!("{operation}: robot not connected"))
            }
            DriverError::ConnectFailed(details) | DriverError::Io(details) => {
                ArmError::Connectivity(format!("{operation}: {details}"))
            }
            DriverError::Timeout(after) => {
                ArmError::Connectivity(format!("{operation}: timed out after {after:?}"))
            }
            DriverError::Interrupted => ArmError::Interrupted(format!("{operation} halted")),
            DriverError::Rejected(details) => ArmError::DriverFault {
                operation: operation.to_string(),
                details,
            },
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Capability trait
// ────────────────────────────────────────────────────────────────────────────

/// Narrow capability interface the state machine drives.
///
/// Implementations must behave identically from the caller's point of view;
/// the caller never branches on which one it holds.
#[async_trait]
pub trait MotionDriver: Send + Sync {
    /// Short implementation name for logs.
    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    async fn connect(&self, host: &str, port: u16) -> Result<(), DriverError>;

    async fn disconnect(&self) -> Result<(), DriverError>;

    /// Move to the home configuration.  Resolves when the move completes.
    async fn home(&self) -> Result<(), DriverError>;

    /// Relative Cartesian move along one axis.
    async fn jog_tcp(
        &self,
        axis: TcpAxis,
        delta: f64,
        speed: f64,
        frame: Frame,
    ) -> Result<(), DriverError>;

    /// Relative move of a single joint (0-based index).
    async fn jog_joint(&self, joint: usize, delta: f64, speed: f64) -> Result<(), DriverError>;

    /// Graceful halt.  Interrupts any in-flight primitive.
    async fn stop(&self) -> Result<(), DriverError>;

    /// Hard halt.  Interrupts any in-flight primitive and refuses further
    /// motion until [`clear_estop`][Self::clear_estop] succeeds.
    async fn emergency_stop(&self) -> Result<(), DriverError>;

    async fn clear_estop(&self) -> Result<(), DriverError>;

    /// Vertical move to absolute height `z`, keeping x/y and orientation.
    async fn move_to_safe_z(&self, z: f64) -> Result<(), DriverError>;

    /// Point-in-time pose, joints, speed and I/O.
    async fn sample(&self) -> Result<DriverSample, DriverError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Halt signal
// ────────────────────────────────────────────────────────────────────────────

/// Cooperative interrupt shared between halting calls and running motions.
///
/// A motion records the current epoch with [`arm`][Self::arm]; any
/// [`trip`][Self::trip] afterwards is visible through
/// [`tripped_since`][Self::tripped_since].
#[derive(Debug, Default)]
pub struct HaltSignal {
    epoch: AtomicU64,
}

impl HaltSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn trip(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn tripped_since(&self, armed: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != armed
    }
}

/// Longest single motion a driver will accept.
pub const MAX_MOTION: Duration = Duration::from_secs(600);

/// Convert an estimated travel time into a wait, rejecting values that are
/// negative, non-finite or longer than [`MAX_MOTION`].
pub fn motion_duration(secs: f64) -> Result<Duration, DriverError> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(DriverError::Rejected(format!("motion time {secs} s is not executable")));
    }
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) if duration <= MAX_MOTION => Ok(duration),
        _ => Err(DriverError::Rejected(format!(
            "motion time {secs} s exceeds the {} s limit",
            MAX_MOTION.as_secs()
        ))),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Selection
// ────────────────────────────────────────────────────────────────────────────

/// Which driver implementation to bind at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DriverKind {
    #[default]
    #[serde(rename = "sim", alias = "simulated")]
    Simulated,
    #[serde(rename = "ur", alias = "physical")]
    Physical,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::Simulated => f.write_str("sim"),
            DriverKind::Physical => f.write_str("ur"),
        }
    }
}

impl FromStr for DriverKind {
    type Err = ArmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sim" | "simulated" | "mock" => Ok(DriverKind::Simulated),
            "ur" | "physical" | "ur10" => Ok(DriverKind::Physical),
            other => Err(ArmError::Config(format!("unknown driver kind: {other}"))),
        }
    }
}

/// Knobs shared by both driver implementations.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Multiplier applied to simulated motion durations (`0.0` = instant).
    pub time_scale: f64,
    /// Dashboard server port used to release protective stops.
    pub dashboard_port: u16,
    /// Network timeout for connect and per-command writes.
    pub timeout: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            time_scale: 1.0,
            dashboard_port: 29999,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Build the driver named by `kind`.
pub fn build_driver(kind: DriverKind, options: &DriverOptions) -> Arc<dyn MotionDriver> {
    match kind {
        DriverKind::Simulated => Arc::new(SimDriver::new(options.time_scale)),
        DriverKind::Physical => Arc::new(UrScriptDriver::new(options.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halt_signal_detects_trip_after_arm() {
        let signal = HaltSignal::new();
        let armed = signal.arm();
        assert!(!signal.tripped_since(armed));
        signal.trip();
        assert!(signal.tripped_since(armed));
        // A fresh arm ignores earlier trips.
        assert!(!signal.tripped_since(signal.arm()));
    }

    #[test]
    fn motion_duration_rejects_unexecutable_times() {
        assert_eq!(motion_duration(0.0), Ok(Duration::ZERO));
        assert_eq!(motion_duration(1.5), Ok(Duration::from_millis(1500)));
        for secs in [f64::NAN, f64::INFINITY, -1.0, 1e300 / 0.5, 601.0] {
            assert!(
                matches!(motion_duration(secs), Err(DriverError::Rejected(_))),
                "{secs} should be rejected"
            );
        }
    }

    #[test]
    fn driver_kind_parses_aliases() {
        assert_eq!("mock".parse::<DriverKind>().unwrap(), DriverKind::Simulated);
        assert_eq!("UR".parse::<DriverKind>().unwrap(), DriverKind::Physical);
        assert!("kuka".parse::<DriverKind>().is_err());
        assert_eq!(DriverKind::Physical.to_string(), "ur");
    }

    #[test]
    fn driver_error_maps_into_closed_taxonomy() {
        use armgate_types::ErrorKind;

        assert_eq!(
            DriverError::NotConnected.into_arm_error("home").kind(),
            ErrorKind::Connectivity
        );
        assert!(matches!(
            DriverError::Interrupted.into_arm_error("jog"),
            ArmError::Interrupted(_)
        ));
        assert!(matches!(
            DriverError::Rejected("joint 9".into()).into_arm_error("jog"),
            ArmError::DriverFault { ref operation, .. } if operation == "jog"
        ));
    }

    #[tokio::test]
    async fn build_driver_binds_requested_kind() {
        let options = DriverOptions::default();
        assert_eq!(build_driver(DriverKind::Simulated, &options).name(), "sim");
        let physical = build_driver(DriverKind::Physical, &options);
        assert_eq!(physical.name(), "urscript");
        assert!(!physical.is_connected());
        assert_eq!(physical.sample().await, Err(DriverError::NotConnected));
    }
}
