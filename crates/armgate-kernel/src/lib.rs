//! `armgate-kernel` – Safety & Session Core
//!
//! The part of ArmGate that decides whether something may happen.  It does
//! not transport anything; it enforces rules and owns authoritative state.
//!
//! # Modules
//!
//! - [`robot_manager`] – [`RobotManager`]: the robot lifecycle state machine.
//!   Serializes motion commands, holds the e-stop latch, and converts every
//!   driver failure into a state transition plus a retained reason.
//! - [`safety_gate`] – [`SafetyGate`]: a rule engine that validates each
//!   motion intent (speed cap, Z band, keep-out volumes) before it reaches
//!   the driver.
//! - [`session_registry`] – [`SessionRegistry`]: client sessions with
//!   expiry, creation-order eviction, supervisor escalation and a bounded
//!   audit trail.
//! - [`staleness`] – [`StalenessWatchdog`]: age of the last good telemetry
//!   read, used for the auto-pause.
//! - [`ring_log`] – [`RingLog`]: fixed-capacity drop-oldest buffer behind
//!   every rolling log.
//! - [`credential`] – [`SupervisorSecret`]: the zeroize-on-drop supervisor
//!   PIN.

pub mod credential;
pub mod ring_log;
pub mod robot_manager;
pub mod safety_gate;
pub mod session_registry;
pub mod staleness;

pub use credential::{DEFAULT_SUPERVISOR_PIN, SupervisorSecret};
pub use ring_log::RingLog;
pub use robot_manager::{ManagerConfig, RobotManager};
pub use safety_gate::{
    JogDeltaRule, KeepoutRule, MAX_JOG_DELTA, MotionIntent, Rule, SafetyGate, SpeedCapRule,
    ZBandRule,
};
pub use session_registry::{RegistryConfig, SessionEvent, SessionEventKind, SessionRegistry};
pub use staleness::StalenessWatchdog;
