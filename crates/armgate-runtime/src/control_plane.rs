//! [`ControlPlane`] – the authorization boundary every command crosses.
//!
//! Transports (the cockpit WebSocket server, the operator console) never
//! call the [`RobotManager`] directly.  They hand a [`SessionId`] and a
//! request to the control plane, which:
//!
//! 1. resolves the session (missing or expired → `Unauthorized`, logged to
//!    the `armgate::security` target),
//! 2. checks supervisor permissions for privileged operations,
//! 3. invokes the manager without holding any registry or bus lock,
//! 4. announces the outcome on the [`TelemetryBus`] as an alert or job update.
//!
//! Observers therefore learn about state changes from the bus, while the
//! caller gets the plain `Result`.

use std::sync::Arc;
use std::time::Instant;

use armgate_kernel::{RobotManager, SessionEvent, SessionEventKind, SessionRegistry};
use armgate_middleware::{BusStats, ConnectionInfo, TelemetryBus};
use armgate_types::{
    ArmError, BoardState, EngineStatus, JobStatus, JogCommand, Permission, RobotState,
    SafetyLimits, Session, SessionId, Severity, TelemetrySnapshot,
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

/// Default robot controller address when a connect request names none.
pub const DEFAULT_ROBOT_HOST: &str = "192.168.1.100";
pub const DEFAULT_ROBOT_PORT: u16 = 30002;

/// Job id under which homing progress is reported.
pub const HOME_JOB: &str = "home";

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub robot_host: String,
    pub robot_port: u16,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            robot_host: DEFAULT_ROBOT_HOST.to_string(),
            robot_port: DEFAULT_ROBOT_PORT,
        }
    }
}

/// Liveness document served on `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub robot_connected: bool,
    pub robot_state: RobotState,
    pub driver: String,
    pub estop_latched: bool,
    pub active_sessions: usize,
    pub websocket_connections: usize,
    pub uptime_secs: f64,
    pub timestamp: DateTime<Utc>,
}

/// Supervisor view of the observer connections.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionsReport {
    pub stats: BusStats,
    pub connections: Vec<ConnectionInfo>,
}

pub struct ControlPlane {
    manager: Arc<RobotManager>,
    sessions: Arc<SessionRegistry>,
    bus: TelemetryBus,
    config: ControlPlaneConfig,
    started: Instant,
}

impl ControlPlane {
    pub fn new(
        manager: Arc<RobotManager>,
        sessions: Arc<SessionRegistry>,
        bus: TelemetryBus,
        config: ControlPlaneConfig,
    ) -> Self {
        Self {
            manager,
            sessions,
            bus,
            config,
            started: Instant::now(),
        }
    }

    pub fn manager(&self) -> &Arc<RobotManager> {
        &self.manager
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn bus(&self) -> &TelemetryBus {
        &self.bus
    }

    // ── authorization ────────────────────────────────────────────────────

    /// Resolve `id` to a live session and log `op` against it.
    fn authorize(&self, id: SessionId, op: &str) -> Result<Session, ArmError> {
        let Some(session) = self.sessions.get_session(id) else {
            warn!(target: "armgate::security", session_id = %id, op, "command refused: invalid or expired session");
            return Err(ArmError::Unauthorized("Invalid or expired session".into()));
        };
        self.sessions
            .record_event(id, SessionEventKind::CommandIssued, op);
        Ok(session)
    }

    /// Like [`authorize`](Self::authorize), additionally requiring supervisor
    /// rights (and `permission`, when given).
    fn authorize_supervisor(
        &self,
        id: SessionId,
        op: &str,
        permission: Option<Permission>,
    ) -> Result<Session, ArmError> {
        let session = self.authorize(id, op)?;
        let allowed = session.is_supervisor
            && permission.is_none_or(|p| session.has_permission(p));
        if !allowed {
            warn!(target: "armgate::security", session_id = %id, op, "command refused: supervisor access required");
            return Err(ArmError::Unauthorized("Supervisor access required".into()));
        }
        Ok(session)
    }

    // ── announcements ────────────────────────────────────────────────────

    fn alert(&self, alert_type: &str, message: &str, severity: Severity) {
        match self.bus.publish_alert(alert_type, message, severity, json!({})) {
            Ok(n) => debug!(alert_type, observers = n, "alert published"),
            Err(e) => warn!(alert_type, error = %e, "failed to publish alert"),
        }
    }

    fn job(&self, job_id: &str, status: JobStatus, progress: f64, data: Value) {
        if let Err(e) = self.bus.publish_job(job_id, status, progress, data) {
            warn!(job_id, error = %e, "failed to publish job update");
        }
    }

    // ── sessions ─────────────────────────────────────────────────────────

    pub fn start_session(&self, client_id: Option<String>, user_agent: Option<String>) -> Session {
        self.sessions.create_session(client_id, user_agent)
    }

    /// Push the caller's expiry forward by `extra` (default: the configured
    /// session timeout).  Never shortens it.
    pub fn extend_session(
        &self,
        id: SessionId,
        extra: Option<TimeDelta>,
    ) -> Result<Session, ArmError> {
        self.authorize(id, "session.extend")?;
        self.sessions.extend(id, extra)
    }

    pub fn end_session(&self, id: SessionId) -> bool {
        self.sessions.remove_session(id)
    }

    pub fn authenticate_supervisor(&self, id: SessionId, pin: &str) -> Result<Session, ArmError> {
        self.authorize(id, "session.supervisor")?;
        self.sessions.authenticate_supervisor(id, pin)
    }

    pub fn revoke_supervisor(&self, id: SessionId) -> Result<(), ArmError> {
        self.authorize(id, "session.revoke")?;
        self.sessions.revoke_supervisor(id)
    }

    // ── robot lifecycle ──────────────────────────────────────────────────

    /// Connect to `host:port`, defaulting to the configured controller.
    pub async fn connect(
        &self,
        id: SessionId,
        host: Option<String>,
        port: Option<u16>,
    ) -> Result<(), ArmError> {
        self.authorize(id, "robot.connect")?;
        let host = host.unwrap_or_else(|| self.config.robot_host.clone());
        let port = port.unwrap_or(self.config.robot_port);
        self.manager.connect(&host, port).await?;
        self.alert("robot_connected", "Robot connected successfully", Severity::Success);
        Ok(())
    }

    pub async fn disconnect(&self, id: SessionId) -> Result<(), ArmError> {
        self.authorize(id, "robot.disconnect")?;
        self.manager.disconnect().await?;
        self.alert("robot_disconnected", "Robot disconnected", Severity::Info);
        Ok(())
    }

    pub async fn home(&self, id: SessionId) -> Result<(), ArmError> {
        self.authorize(id, "robot.home")?;
        self.job(HOME_JOB, JobStatus::Started, 0.0, json!({}));
        match self.manager.home().await {
            Ok(()) => {
                self.job(HOME_JOB, JobStatus::Completed, 100.0, json!({}));
                self.alert("robot_homed", "Robot homed successfully", Severity::Success);
                Ok(())
            }
            Err(e) => {
                self.job(
                    HOME_JOB,
                    JobStatus::Failed,
                    0.0,
                    json!({ "error": e.to_string() }),
                );
                Err(e)
            }
        }
    }

    pub async fn jog(&self, id: SessionId, command: JogCommand) -> Result<(), ArmError> {
        self.authorize(id, "robot.jog")?;
        self.manager.jog(command).await
    }

    pub async fn move_to_safe_z(&self, id: SessionId) -> Result<(), ArmError> {
        self.authorize(id, "robot.safe_z")?;
        self.manager.move_to_safe_z().await
    }

    // ── halting ──────────────────────────────────────────────────────────

    pub async fn stop(&self, id: SessionId) -> Result<(), ArmError> {
        self.authorize(id, "robot.stop")?;
        self.manager.stop().await?;
        self.alert("robot_stopped", "Robot stopped", Severity::Warning);
        Ok(())
    }

    /// The latch is set before the driver is asked to stop, so the alert
    /// goes out even when the driver fails to acknowledge.
    pub async fn emergency_stop(&self, id: SessionId) -> Result<(), ArmError> {
        self.authorize(id, "robot.estop")?;
        let outcome = self.manager.emergency_stop().await;
        self.alert("emergency_stop", "EMERGENCY STOP ACTIVATED", Severity::Critical);
        outcome
    }

    pub async fn clear_estop(&self, id: SessionId, pin: &str) -> Result<(), ArmError> {
        self.authorize_supervisor(id, "robot.clear_estop", Some(Permission::ClearEstop))?;
        self.manager.clear_estop(pin).await?;
        self.alert("estop_cleared", "Emergency stop cleared", Severity::Success);
        Ok(())
    }

    // ── configuration ────────────────────────────────────────────────────

    pub fn update_limits(
        &self,
        id: SessionId,
        limits: SafetyLimits,
        pin: &str,
    ) -> Result<(), ArmError> {
        self.authorize_supervisor(id, "config.limits", Some(Permission::UpdateLimits))?;
        self.manager.update_safety_limits(limits, pin)?;
        self.alert("limits_updated", "Safety limits updated", Severity::Info);
        Ok(())
    }

    // ── queries ──────────────────────────────────────────────────────────

    /// A fresh snapshot, or the last-known values when the read fails.
    pub async fn telemetry(&self, id: SessionId) -> Result<TelemetrySnapshot, ArmError> {
        self.authorize(id, "system.telemetry")?;
        match self.manager.sample().await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                warn!(error = %e, "telemetry read failed; serving last known values");
                Ok(self.manager.fallback_snapshot())
            }
        }
    }

    pub fn connections(&self, id: SessionId) -> Result<ConnectionsReport, ArmError> {
        self.authorize_supervisor(id, "system.connections", None)?;
        Ok(ConnectionsReport {
            stats: self.bus.stats(),
            connections: self.bus.connections(),
        })
    }

    /// Events of `target` (or of every session when `None`), newest first.
    pub fn session_logs(
        &self,
        id: SessionId,
        target: Option<SessionId>,
        limit: usize,
    ) -> Result<Vec<SessionEvent>, ArmError> {
        self.authorize(id, "system.logs")?;
        Ok(match target {
            Some(target) => self.sessions.session_logs(target, limit),
            None => self.sessions.all_logs(limit),
        })
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "healthy",
            service: "armgate",
            version: env!("CARGO_PKG_VERSION"),
            robot_connected: self.manager.is_connected(),
            robot_state: self.manager.state(),
            driver: self.manager.driver_name().to_string(),
            estop_latched: self.manager.is_estop_latched(),
            active_sessions: self.sessions.active_count(),
            websocket_connections: self.bus.connection_count(),
            uptime_secs: self.started.elapsed().as_secs_f64(),
            timestamp: Utc::now(),
        }
    }

    // ── external collaborators ───────────────────────────────────────────

    /// Relay a result from the external position evaluator to `analysis`
    /// observers.
    pub fn publish_analysis(&self, analysis_type: &str, result: Value) -> Result<usize, ArmError> {
        self.bus.publish_analysis(analysis_type, result)
    }

    /// Record the evaluator's status in telemetry and announce it.
    pub fn report_engine(&self, status: EngineStatus) -> Result<usize, ArmError> {
        let result = serde_json::to_value(&status)?;
        self.manager.set_engine_status(status);
        self.bus.publish_analysis("engine_status", result)
    }

    pub fn report_board(&self, board: BoardState) {
        self.manager.set_board_state(board);
    }
}
