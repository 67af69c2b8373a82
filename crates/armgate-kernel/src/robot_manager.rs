//! [`RobotManager`] – robot lifecycle state machine and safety interlock.
//!
//! Every robot-affecting operation goes through here.  The manager owns the
//! single authoritative [`RobotState`], the active [`SafetyLimits`], the
//! emergency-stop latch and a bounded log of the most recent failure reasons.
//!
//! # Locking
//!
//! Two locks, never nested across an `.await`:
//!
//! - a `std::sync::Mutex` over all shared state, held only for short
//!   synchronous sections;
//! - an async command lock so that at most one motion-affecting operation is
//!   in flight.  [`RobotManager::stop`] and [`RobotManager::emergency_stop`]
//!   skip the command lock: they trip the driver's halt signal, which makes
//!   the in-flight primitive return early.
//!
//! # Failure semantics
//!
//! Driver failures never escape as panics.  They become a `Fault` transition
//! (or no transition, for rejected preconditions), a retained reason in the
//! error log, and an `Err` returned to the caller.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use armgate_hal::{DriverError, MotionDriver};
use armgate_types::envelope::epoch_seconds;
use armgate_types::{
    ArmError, BoardState, DriverSample, EngineStatus, EstopStatus, IoMap, JOINT_COUNT, JogCommand,
    JogMode, NetworkStatus, ProgramStatus, QueueStatus, RobotState, SafetyLimits, TcpPose,
    TelemetrySnapshot,
};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::credential::SupervisorSecret;
use crate::ring_log::RingLog;
use crate::safety_gate::{MotionIntent, SafetyGate};
use crate::staleness::{DEFAULT_STALE_AFTER, StalenessWatchdog};

/// Number of failure reasons retained for telemetry.
pub const DEFAULT_ERROR_CAPACITY: usize = 10;

/// Safe-Z target as a fraction of `z_max`.
pub const SAFE_Z_FRACTION: f64 = 0.8;

const STALE_REASON: &str = "Telemetry stale - auto-paused";

/// Construction parameters for [`RobotManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub limits: SafetyLimits,
    /// Gap after which telemetry counts as stale while executing.
    pub stale_after: Duration,
    pub error_capacity: usize,
    pub supervisor: SupervisorSecret,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            limits: SafetyLimits::default(),
            stale_after: DEFAULT_STALE_AFTER,
            error_capacity: DEFAULT_ERROR_CAPACITY,
            supervisor: SupervisorSecret::default(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Shared state
// ────────────────────────────────────────────────────────────────────────────

struct Shared {
    state: RobotState,
    limits: SafetyLimits,
    estop_latched: bool,
    errors: RingLog<String>,
    pose: TcpPose,
    joints: [f64; JOINT_COUNT],
    speed: f64,
    io: IoMap,
    program: ProgramStatus,
    board: BoardState,
    engine: EngineStatus,
    active_job: Option<String>,
    staleness: StalenessWatchdog,
    rtt_ms: f64,
}

impl Shared {
    /// While the latch is set the only reachable state is `Estop`.
    fn set_state(&mut self, next: RobotState) {
        if self.estop_latched && next != RobotState::Estop {
            debug!(requested = %next, "transition suppressed by e-stop latch");
            return;
        }
        if self.state != next {
            debug!(from = %self.state, to = %next, "robot state transition");
            self.state = next;
        }
    }

    fn record_error(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(reason = %reason, "robot error recorded");
        self.errors.push(reason);
    }

    fn apply(&mut self, sample: DriverSample) {
        self.pose = sample.pose;
        self.joints = sample.joints;
        self.speed = sample.speed;
        self.io = sample.io;
        self.staleness.record();
    }

    fn ready_for_movement(&self, connected: bool) -> Result<(), ArmError> {
        if !connected {
            return Err(ArmError::Connectivity("Robot not connected".into()));
        }
        if self.estop_latched {
            return Err(ArmError::SafetyRejected("E-stop is latched".into()));
        }
        if !matches!(self.state, RobotState::Ready | RobotState::Paused) {
            return Err(ArmError::SafetyRejected(format!(
                "Robot not ready for movement (state: {})",
                self.state
            )));
        }
        Ok(())
    }

    fn snapshot(&self, link_up: bool, pending: usize) -> TelemetrySnapshot {
        TelemetrySnapshot {
            state: self.state,
            program: self.program.clone(),
            joints: self.joints,
            pose: self.pose,
            speed: self.speed,
            io: self.io.clone(),
            estop: EstopStatus {
                hw: self.estop_latched,
                sw: false,
            },
            limits: self.limits.clone(),
            board: self.board.clone(),
            queue: QueueStatus {
                pending,
                active: self.active_job.clone(),
            },
            engine: self.engine.clone(),
            network: NetworkStatus {
                link_up,
                rtt_ms: self.rtt_ms,
                server_time: epoch_seconds(Utc::now()),
            },
            errors: self.errors.to_vec(),
        }
    }
}

/// Human-readable reason stored in the error log.
fn reason(err: &ArmError) -> String {
    match err {
        ArmError::Connectivity(m)
        | ArmError::SafetyRejected(m)
        | ArmError::Unauthorized(m)
        | ArmError::SessionNotFound(m)
        | ArmError::Staleness(m)
        | ArmError::Delivery(m)
        | ArmError::Interrupted(m)
        | ArmError::Config(m)
        | ArmError::Serialization(m) => m.clone(),
        other => other.to_string(),
    }
}

/// Decrements the waiting counter when a caller stops waiting for its turn,
/// including when the waiting future is dropped.
struct Waiting<'a>(&'a AtomicUsize);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// RobotManager
// ────────────────────────────────────────────────────────────────────────────

/// Robot state machine and safety gate.
///
/// Construct one per process and share it behind an `Arc`.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use armgate_hal::SimDriver;
/// use armgate_kernel::{ManagerConfig, RobotManager};
/// use armgate_types::RobotState;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let manager = RobotManager::new(Arc::new(SimDriver::new(0.0)), ManagerConfig::default());
/// manager.connect("127.0.0.1", 30002).await.unwrap();
/// manager.home().await.unwrap();
/// assert_eq!(manager.state(), RobotState::Ready);
/// # });
/// ```
pub struct RobotManager {
    driver: Arc<dyn MotionDriver>,
    gate: SafetyGate,
    command_lock: tokio::sync::Mutex<()>,
    waiting: AtomicUsize,
    shared: Mutex<Shared>,
    supervisor: SupervisorSecret,
}

impl RobotManager {
    pub fn new(driver: Arc<dyn MotionDriver>, config: ManagerConfig) -> Self {
        Self::with_gate(driver, SafetyGate::standard(), config)
    }

    /// Use a custom rule set instead of [`SafetyGate::standard`].
    pub fn with_gate(driver: Arc<dyn MotionDriver>, gate: SafetyGate, config: ManagerConfig) -> Self {
        let shared = Shared {
            state: RobotState::Idle,
            limits: config.limits,
            estop_latched: false,
            errors: RingLog::new(config.error_capacity),
            pose: TcpPose::default(),
            joints: [0.0; JOINT_COUNT],
            speed: 0.0,
            io: IoMap::default(),
            program: ProgramStatus::default(),
            board: BoardState::default(),
            engine: EngineStatus::default(),
            active_job: None,
            staleness: StalenessWatchdog::new(config.stale_after),
            rtt_ms: 0.0,
        };
        Self {
            driver,
            gate,
            command_lock: tokio::sync::Mutex::new(()),
            waiting: AtomicUsize::new(0),
            shared: Mutex::new(shared),
            supervisor: config.supervisor,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the command lock.  Callers queued here show up as
    /// `queue.pending` in snapshots.
    async fn acquire_turn(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting = Waiting(&self.waiting);
        self.command_lock.lock().await
    }

    /// Record `err` in the error log and hand it back.
    fn reject(&self, err: ArmError) -> ArmError {
        self.lock().record_error(reason(&err));
        err
    }

    // ── lifecycle ────────────────────────────────────────────────────────

    /// `* → Connecting → Idle`, or `→ Fault` when the driver cannot connect.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), ArmError> {
        let _turn = self.acquire_turn().await;
        {
            let mut shared = self.lock();
            shared.errors.clear();
            shared.set_state(RobotState::Connecting);
        }

        let outcome = self.driver.connect(host, port).await;
        let mut shared = self.lock();
        match outcome {
            Ok(()) => {
                shared.staleness.record();
                shared.set_state(RobotState::Idle);
                info!(host, port, driver = self.driver.name(), "robot connected");
                Ok(())
            }
            Err(e) => {
                let err = e.into_arm_error("connect");
                shared.set_state(RobotState::Fault);
                shared.record_error(format!("Failed to connect to robot: {}", reason(&err)));
                Err(err)
            }
        }
    }

    pub async fn disconnect(&self) -> Result<(), ArmError> {
        match self.driver.disconnect().await {
            Ok(()) => {
                let mut shared = self.lock();
                shared.staleness.reset();
                shared.set_state(RobotState::Idle);
                info!("robot disconnected");
                Ok(())
            }
            Err(e) => Err(self.reject(e.into_arm_error("disconnect"))),
        }
    }

    // ── motion ───────────────────────────────────────────────────────────

    pub async fn home(&self) -> Result<(), ArmError> {
        let _turn = self.acquire_turn().await;
        if !self.driver.is_connected() {
            return Err(self.reject(ArmError::Connectivity("Robot not connected".into())));
        }
        if self.is_estop_latched() {
            return Err(self.reject(ArmError::SafetyRejected(
                "Cannot home while E-stop is latched".into(),
            )));
        }
        self.execute("home", self.driver.home()).await
    }

    /// Incremental TCP or joint move.  Safety rules run before any state
    /// change or driver call.
    pub async fn jog(&self, command: JogCommand) -> Result<(), ArmError> {
        let _turn = self.acquire_turn().await;
        let from = self.lock().pose;
        self.admit(MotionIntent::Jog { command, from })?;

        match command.mode {
            JogMode::Tcp { axis, frame } => {
                let motion = self
                    .driver
                    .jog_tcp(axis, command.delta, command.speed, frame);
                self.execute("jog", motion).await
            }
            JogMode::Joint { joint } => {
                let motion = self.driver.jog_joint(joint, command.delta, command.speed);
                self.execute("jog", motion).await
            }
        }
    }

    /// Vertical retreat to `SAFE_Z_FRACTION × z_max`.
    pub async fn move_to_safe_z(&self) -> Result<(), ArmError> {
        let _turn = self.acquire_turn().await;
        let (target_z, from) = {
            let shared = self.lock();
            (shared.limits.z_max * SAFE_Z_FRACTION, shared.pose)
        };
        self.admit(MotionIntent::SafeZ { target_z, from })?;
        info!(target_z, "moving to safe Z");
        self.execute("safe_z", self.driver.move_to_safe_z(target_z))
            .await
    }

    /// Readiness and rule check for a motion.  Rejections are recorded and
    /// leave the state untouched.
    fn admit(&self, intent: MotionIntent) -> Result<(), ArmError> {
        let connected = self.driver.is_connected();
        let verdict = {
            let shared = self.lock();
            shared
                .ready_for_movement(connected)
                .and_then(|()| self.gate.verify(&intent, &shared.limits))
        };
        verdict.map_err(|err| {
            warn!(reason = %reason(&err), "motion rejected");
            self.reject(err)
        })
    }

    /// `→ Executing`, run the primitive, then `→ Ready` or `→ Fault`.  An
    /// interrupted primitive leaves the state to whoever interrupted it.
    async fn execute<F>(&self, operation: &str, motion: F) -> Result<(), ArmError>
    where
        F: Future<Output = Result<(), DriverError>>,
    {
        {
            let mut shared = self.lock();
            shared.set_state(RobotState::Executing);
            shared.program = ProgramStatus {
                name: Some(operation.to_string()),
                step: 1,
                progress: 0.0,
            };
            shared.active_job = Some(operation.to_string());
        }

        let outcome = motion.await;

        let result = {
            let mut shared = self.lock();
            shared.program = ProgramStatus::default();
            shared.active_job = None;
            match outcome {
                Ok(()) => {
                    shared.set_state(RobotState::Ready);
                    info!(operation, "motion complete");
                    Ok(())
                }
                Err(DriverError::Interrupted) => {
                    info!(operation, "motion interrupted");
                    Err(DriverError::Interrupted.into_arm_error(operation))
                }
                Err(e) => {
                    let err = e.into_arm_error(operation);
                    shared.set_state(RobotState::Fault);
                    shared.record_error(format!("{operation} failed: {}", reason(&err)));
                    Err(err)
                }
            }
        };

        self.refresh().await;
        result
    }

    /// Best-effort pose refresh after a motion.
    async fn refresh(&self) {
        if !self.driver.is_connected() {
            return;
        }
        if let Ok(sample) = self.driver.sample().await {
            self.lock().apply(sample);
        }
    }

    // ── halting ──────────────────────────────────────────────────────────

    /// Graceful halt: `→ Ready` if still connected, else `→ Idle`.
    pub async fn stop(&self) -> Result<(), ArmError> {
        match self.driver.stop().await {
            Ok(()) => {
                let next = if self.driver.is_connected() {
                    RobotState::Ready
                } else {
                    RobotState::Idle
                };
                self.lock().set_state(next);
                info!("robot stopped");
                Ok(())
            }
            Err(e) => Err(self.reject(e.into_arm_error("stop"))),
        }
    }

    /// Latch and force `Estop`, then ask the driver for a hard stop.  The
    /// latch holds even if the driver fails to acknowledge.
    pub async fn emergency_stop(&self) -> Result<(), ArmError> {
        let previous = {
            let mut shared = self.lock();
            let previous = shared.state;
            shared.estop_latched = true;
            shared.set_state(RobotState::Estop);
            previous
        };
        warn!(target: "armgate::security", from = %previous, "emergency stop latched");

        match self.driver.emergency_stop().await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.reject(e.into_arm_error("emergency_stop"))),
        }
    }

    /// Release the latch with the supervisor credential.  `→ Idle` on success.
    pub async fn clear_estop(&self, credential: &str) -> Result<(), ArmError> {
        let _turn = self.acquire_turn().await;
        if !self.supervisor.matches(credential) {
            warn!(target: "armgate::security", "e-stop clear refused: bad supervisor PIN");
            return Err(self.reject(ArmError::Unauthorized("Invalid supervisor PIN".into())));
        }
        if !self.is_estop_latched() {
            return Err(self.reject(ArmError::SafetyRejected("E-stop is not latched".into())));
        }

        match self.driver.clear_estop().await {
            Ok(()) => {
                let mut shared = self.lock();
                shared.estop_latched = false;
                shared.set_state(RobotState::Idle);
                info!(target: "armgate::security", "e-stop cleared");
                Ok(())
            }
            Err(e) => {
                let err = e.into_arm_error("clear_estop");
                self.lock()
                    .record_error(format!("Failed to clear E-stop: {}", reason(&err)));
                Err(err)
            }
        }
    }

    // ── limits ───────────────────────────────────────────────────────────

    /// Replace the limits wholesale.  Structurally impossible limits
    /// (non-positive speed, `z_min > z_max`, inverted keep-out boxes) are
    /// rejected.
    pub fn update_safety_limits(
        &self,
        limits: SafetyLimits,
        credential: &str,
    ) -> Result<(), ArmError> {
        if !self.supervisor.matches(credential) {
            warn!(target: "armgate::security", "limits update refused: bad supervisor PIN");
            return Err(self.reject(ArmError::Unauthorized("Invalid supervisor PIN".into())));
        }
        limits.validate().map_err(|err| self.reject(err))?;

        info!(
            max_speed = limits.max_speed,
            z_min = limits.z_min,
            z_max = limits.z_max,
            keepout = limits.keepout.len(),
            "safety limits updated"
        );
        self.lock().limits = limits;
        Ok(())
    }

    // ── telemetry ────────────────────────────────────────────────────────

    /// Read the driver (when connected) and build a snapshot.
    ///
    /// Also evaluates staleness: if the last good read is older than the
    /// threshold while executing, the state moves to `Paused`.  A failed
    /// read returns `Err` after that evaluation.
    pub async fn sample(&self) -> Result<TelemetrySnapshot, ArmError> {
        let connected = self.driver.is_connected();
        let read = if connected {
            let started = Instant::now();
            let outcome = self.driver.sample().await;
            Some((outcome, started.elapsed()))
        } else {
            None
        };

        let pending = self.waiting.load(Ordering::SeqCst);
        let mut shared = self.lock();
        let mut failure = None;
        if let Some((outcome, elapsed)) = read {
            match outcome {
                Ok(sample) => {
                    shared.apply(sample);
                    shared.rtt_ms = elapsed.as_secs_f64() * 1000.0;
                }
                Err(e) => failure = Some(e.into_arm_error("sample")),
            }
        }

        if shared.state == RobotState::Executing && shared.staleness.is_stale() {
            warn!(
                age_ms = shared.staleness.age().map(|a| a.as_millis() as u64).unwrap_or_default(),
                "telemetry stale while executing; pausing"
            );
            shared.set_state(RobotState::Paused);
            shared.record_error(STALE_REASON);
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(shared.snapshot(connected, pending)),
        }
    }

    /// Last-known values, flagged as not coming from a live link.
    pub fn fallback_snapshot(&self) -> TelemetrySnapshot {
        let pending = self.waiting.load(Ordering::SeqCst);
        self.lock().snapshot(false, pending)
    }

    // ── accessors ────────────────────────────────────────────────────────

    pub fn state(&self) -> RobotState {
        self.lock().state
    }

    pub fn limits(&self) -> SafetyLimits {
        self.lock().limits.clone()
    }

    /// Retained failure reasons, oldest first.
    pub fn errors(&self) -> Vec<String> {
        self.lock().errors.to_vec()
    }

    pub fn clear_errors(&self) {
        self.lock().errors.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.driver.is_connected()
    }

    pub fn is_estop_latched(&self) -> bool {
        self.lock().estop_latched
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    pub fn set_board_state(&self, board: BoardState) {
        self.lock().board = board;
    }

    pub fn set_engine_status(&self, engine: EngineStatus) {
        self.lock().engine = engine;
    }
}
