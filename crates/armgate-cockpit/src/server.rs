//! [`CockpitServer`] – HTTP + WebSocket front door of the control plane.
//!
//! Listens on `0.0.0.0:8000` (configurable via [`CockpitServer::with_port`]).
//!
//! * `GET /ws/{telemetry,alerts,job,analysis}` with `Upgrade: websocket` →
//!   the connection joins that topic on the bus.  Text frames sent by the
//!   client are parsed as [`Command`]s and answered with a `reply` envelope
//!   on the same connection.
//! * `GET /health` → JSON [`HealthReport`](armgate_runtime::HealthReport).
//! * `GET /ping` → `{"message":"pong"}`.
//! * Anything else → 404.

use std::net::SocketAddr;
use std::sync::Arc;

use armgate_middleware::WsSink;
use armgate_runtime::{ControlPlane, ShutdownSignal};
use armgate_types::{ArmError, ConnectionId, Envelope, JogCommand, SafetyLimits, SessionId, Topic};
use chrono::TimeDelta;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Default TCP port for the observer server.
pub const DEFAULT_PORT: u16 = 8000;

/// Default page size for `system.logs`.
const DEFAULT_LOG_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// CockpitServer
// ---------------------------------------------------------------------------

/// Serves observer WebSockets and the health endpoint for one
/// [`ControlPlane`].
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use armgate_cockpit::CockpitServer;
/// use armgate_runtime::{BackgroundTasks, ControlPlane};
///
/// async fn serve(plane: Arc<ControlPlane>, tasks: &BackgroundTasks) {
///     CockpitServer::new(plane)
///         .with_port(8000)
///         .run(tasks.signal())
///         .await
///         .expect("cockpit server failed");
/// }
/// ```
pub struct CockpitServer {
    plane: Arc<ControlPlane>,
    port: u16,
}

impl CockpitServer {
    pub fn new(plane: Arc<ControlPlane>) -> Self {
        Self {
            plane,
            port: DEFAULT_PORT,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind the configured port and serve until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::Config`] if the TCP listener cannot bind.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<(), ArmError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ArmError::Config(format!("bind error on {addr}: {e}")))?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: ShutdownSignal,
    ) -> Result<(), ArmError> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "observer server listening");
        }

        loop {
            tokio::select! {
                _ = shutdown.requested() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let plane = Arc::clone(&self.plane);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, plane).await {
                                warn!(peer = %peer, error = %e, "client error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept error"),
                },
            }
        }
        info!("observer server stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    Stream(Topic),
    Health,
    Ping,
    NotFound,
}

/// Decide what to do with a request from its head (request line + headers).
pub(crate) fn route(head: &str) -> Route {
    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let (Some("GET"), Some(path)) = (request_line.next(), request_line.next()) else {
        return Route::NotFound;
    };
    let path = path.split('?').next().unwrap_or_default();

    let is_ws_upgrade = head.lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    });

    match path.strip_prefix("/ws/") {
        Some(topic) if is_ws_upgrade => topic.parse().map_or(Route::NotFound, Route::Stream),
        Some(_) => Route::NotFound,
        None => match path {
            "/health" => Route::Health,
            "/ping" => Route::Ping,
            _ => Route::NotFound,
        },
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    plane: Arc<ControlPlane>,
) -> Result<(), ArmError> {
    // `peek` leaves the bytes in place for the WebSocket handshake.
    let mut buf = [0u8; 2048];
    let n = stream
        .peek(&mut buf)
        .await
        .map_err(|e| ArmError::Delivery(format!("peek error from {peer}: {e}")))?;
    let head = String::from_utf8_lossy(&buf[..n]);

    match route(&head) {
        Route::Stream(topic) => handle_ws(stream, peer, topic, plane).await,
        Route::Health => {
            let body = serde_json::to_string(&plane.health())?;
            write_http(stream, "200 OK", &body).await
        }
        Route::Ping => write_http(stream, "200 OK", r#"{"message":"pong"}"#).await,
        Route::NotFound => write_http(stream, "404 Not Found", r#"{"detail":"Not Found"}"#).await,
    }
}

async fn write_http(mut stream: TcpStream, status: &str, body: &str) -> Result<(), ArmError> {
    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len(),
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(|e| ArmError::Delivery(format!("HTTP write error: {e}")))
}

// ---------------------------------------------------------------------------
// WebSocket: one bus connection per socket
// ---------------------------------------------------------------------------

async fn handle_ws(
    stream: TcpStream,
    peer: SocketAddr,
    topic: Topic,
    plane: Arc<ControlPlane>,
) -> Result<(), ArmError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| ArmError::Delivery(format!("WS handshake from {peer}: {e}")))?;
    let (ws_tx, mut ws_rx) = ws_stream.split();

    let bus = plane.bus().clone();
    let id = bus.subscribe(topic, Box::new(WsSink::new(ws_tx)), peer.to_string());

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                // Commands run concurrently so an e-stop is never queued
                // behind a long motion on the same socket.
                let plane = Arc::clone(&plane);
                let text = text.to_string();
                tokio::spawn(async move { answer(&plane, id, &text).await });
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(peer = %peer, error = %e, "read error");
                break;
            }
        }
    }

    bus.unsubscribe(id);
    Ok(())
}

async fn answer(plane: &ControlPlane, id: ConnectionId, text: &str) {
    let reply = match serde_json::from_str::<Command>(text) {
        Ok(command) => {
            let op = command.op();
            let outcome = dispatch(plane, command).await;
            Envelope::reply(op, outcome.as_ref().map(Value::clone))
        }
        Err(e) => Envelope::reply("invalid", Err(&ArmError::Serialization(e.to_string()))),
    };
    if let Err(e) = plane.bus().send_to(id, &reply) {
        debug!(connection_id = %id, error = %e, "reply dropped");
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// A client request, `{"op": "...", ...}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op")]
pub enum Command {
    #[serde(rename = "session.start")]
    SessionStart {
        client_id: Option<String>,
        user_agent: Option<String>,
    },
    #[serde(rename = "session.extend")]
    SessionExtend {
        session_id: SessionId,
        additional_secs: Option<i64>,
    },
    #[serde(rename = "session.supervisor")]
    SessionSupervisor { session_id: SessionId, pin: String },
    #[serde(rename = "session.revoke")]
    SessionRevoke { session_id: SessionId },
    #[serde(rename = "robot.connect")]
    RobotConnect {
        session_id: SessionId,
        hostname: Option<String>,
        port: Option<u16>,
    },
    #[serde(rename = "robot.disconnect")]
    RobotDisconnect { session_id: SessionId },
    #[serde(rename = "robot.home")]
    RobotHome { session_id: SessionId },
    #[serde(rename = "robot.jog")]
    RobotJog { session_id: SessionId, jog: JogCommand },
    #[serde(rename = "robot.stop")]
    RobotStop { session_id: SessionId },
    #[serde(rename = "robot.estop")]
    RobotEstop { session_id: SessionId },
    #[serde(rename = "robot.clear_estop")]
    RobotClearEstop { session_id: SessionId, pin: String },
    #[serde(rename = "robot.safe_z")]
    RobotSafeZ { session_id: SessionId },
    #[serde(rename = "config.limits")]
    ConfigLimits {
        session_id: SessionId,
        limits: SafetyLimits,
        pin: String,
    },
    #[serde(rename = "system.telemetry")]
    SystemTelemetry { session_id: SessionId },
    #[serde(rename = "system.connections")]
    SystemConnections { session_id: SessionId },
    #[serde(rename = "system.logs")]
    SystemLogs {
        session_id: SessionId,
        target: Option<SessionId>,
        limit: Option<usize>,
    },
}

impl Command {
    pub fn op(&self) -> &'static str {
        match self {
            Command::SessionStart { .. } => "session.start",
            Command::SessionExtend { .. } => "session.extend",
            Command::SessionSupervisor { .. } => "session.supervisor",
            Command::SessionRevoke { .. } => "session.revoke",
            Command::RobotConnect { .. } => "robot.connect",
            Command::RobotDisconnect { .. } => "robot.disconnect",
            Command::RobotHome { .. } => "robot.home",
            Command::RobotJog { .. } => "robot.jog",
            Command::RobotStop { .. } => "robot.stop",
            Command::RobotEstop { .. } => "robot.estop",
            Command::RobotClearEstop { .. } => "robot.clear_estop",
            Command::RobotSafeZ { .. } => "robot.safe_z",
            Command::ConfigLimits { .. } => "config.limits",
            Command::SystemTelemetry { .. } => "system.telemetry",
            Command::SystemConnections { .. } => "system.connections",
            Command::SystemLogs { .. } => "system.logs",
        }
    }
}

fn status(value: &str) -> Value {
    json!({ "status": value })
}

/// Run `command` against the control plane and shape the result for the
/// reply envelope.
pub async fn dispatch(plane: &ControlPlane, command: Command) -> Result<Value, ArmError> {
    match command {
        Command::SessionStart {
            client_id,
            user_agent,
        } => {
            let session = plane.start_session(client_id, user_agent);
            Ok(json!({ "session_id": session.id, "expires_at": session.expires_at }))
        }
        Command::SessionExtend {
            session_id,
            additional_secs,
        } => {
            let extra = additional_secs
                .map(|secs| {
                    TimeDelta::try_seconds(secs).ok_or_else(|| {
                        ArmError::Serialization(format!("additional_secs {secs} out of range"))
                    })
                })
                .transpose()?;
            let session = plane.extend_session(session_id, extra)?;
            Ok(json!({ "status": "extended", "expires_at": session.expires_at }))
        }
        Command::SessionSupervisor { session_id, pin } => {
            plane.authenticate_supervisor(session_id, &pin)?;
            Ok(json!({ "status": "authenticated", "is_supervisor": true }))
        }
        Command::SessionRevoke { session_id } => {
            plane.revoke_supervisor(session_id)?;
            Ok(status("revoked"))
        }
        Command::RobotConnect {
            session_id,
            hostname,
            port,
        } => {
            plane.connect(session_id, hostname, port).await?;
            Ok(status("connected"))
        }
        Command::RobotDisconnect { session_id } => {
            plane.disconnect(session_id).await?;
            Ok(status("disconnected"))
        }
        Command::RobotHome { session_id } => {
            plane.home(session_id).await?;
            Ok(status("homed"))
        }
        Command::RobotJog { session_id, jog } => {
            plane.jog(session_id, jog).await?;
            Ok(status("jogged"))
        }
        Command::RobotStop { session_id } => {
            plane.stop(session_id).await?;
            Ok(status("stopped"))
        }
        Command::RobotEstop { session_id } => {
            plane.emergency_stop(session_id).await?;
            Ok(status("emergency_stopped"))
        }
        Command::RobotClearEstop { session_id, pin } => {
            plane.clear_estop(session_id, &pin).await?;
            Ok(status("estop_cleared"))
        }
        Command::RobotSafeZ { session_id } => {
            plane.move_to_safe_z(session_id).await?;
            Ok(status("moved_to_safe_z"))
        }
        Command::ConfigLimits {
            session_id,
            limits,
            pin,
        } => {
            plane.update_limits(session_id, limits, &pin)?;
            Ok(status("limits_updated"))
        }
        Command::SystemTelemetry { session_id } => {
            Ok(serde_json::to_value(plane.telemetry(session_id).await?)?)
        }
        Command::SystemConnections { session_id } => {
            Ok(serde_json::to_value(plane.connections(session_id)?)?)
        }
        Command::SystemLogs {
            session_id,
            target,
            limit,
        } => {
            let limit = limit.unwrap_or(DEFAULT_LOG_LIMIT);
            let logs = plane.session_logs(session_id, target, limit)?;
            Ok(json!({ "total": logs.len(), "limit": limit, "logs": logs }))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use armgate_hal::SimDriver;
    use armgate_kernel::{ManagerConfig, RegistryConfig, RobotManager, SessionRegistry};
    use armgate_middleware::TelemetryBus;
    use armgate_runtime::{BackgroundTasks, ControlPlaneConfig};
    use armgate_types::RobotState;
    use futures_util::SinkExt;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn make_plane() -> Arc<ControlPlane> {
        Arc::new(ControlPlane::new(
            Arc::new(RobotManager::new(
                Arc::new(SimDriver::new(0.0)),
                ManagerConfig::default(),
            )),
            Arc::new(SessionRegistry::new(RegistryConfig::default())),
            TelemetryBus::default(),
            ControlPlaneConfig::default(),
        ))
    }

    // ── CockpitServer constructor ─────────────────────────────────────────────

    #[test]
    fn default_port_is_8000() {
        let server = CockpitServer::new(make_plane());
        assert_eq!(server.port(), DEFAULT_PORT);
        assert_eq!(server.with_port(9999).port(), 9999);
    }

    // ── Routing ──────────────────────────────────────────────────────────────

    #[test]
    fn websocket_paths_map_to_topics() {
        let head = "GET /ws/alerts HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\r\n";
        assert_eq!(route(head), Route::Stream(Topic::Alerts));
        let head = "GET /ws/job?token=1 HTTP/1.1\r\nupgrade: WebSocket\r\n\r\n";
        assert_eq!(route(head), Route::Stream(Topic::Job));
    }

    #[test]
    fn unknown_topic_or_missing_upgrade_is_not_found() {
        assert_eq!(
            route("GET /ws/video HTTP/1.1\r\nUpgrade: websocket\r\n\r\n"),
            Route::NotFound
        );
        assert_eq!(route("GET /ws/telemetry HTTP/1.1\r\n\r\n"), Route::NotFound);
        assert_eq!(route("POST /health HTTP/1.1\r\n\r\n"), Route::NotFound);
        assert_eq!(route(""), Route::NotFound);
    }

    #[test]
    fn plain_endpoints() {
        assert_eq!(route("GET /health HTTP/1.1\r\n\r\n"), Route::Health);
        assert_eq!(route("GET /ping HTTP/1.1\r\n\r\n"), Route::Ping);
        assert_eq!(route("GET / HTTP/1.1\r\n\r\n"), Route::NotFound);
    }

    // ── Command parsing & dispatch ───────────────────────────────────────────

    #[test]
    fn jog_command_parses() {
        let text = r#"{"op":"robot.jog","session_id":"67e55044-10b1-426f-9247-bb680e5fe0c8",
                       "jog":{"mode":"tcp","axis":"z","delta":0.01,"speed":0.1}}"#;
        let command: Command = serde_json::from_str(text).unwrap();
        assert_eq!(command.op(), "robot.jog");
        assert!(matches!(command, Command::RobotJog { .. }));
    }

    #[test]
    fn unknown_op_is_rejected() {
        assert!(serde_json::from_str::<Command>(r#"{"op":"robot.dance"}"#).is_err());
    }

    #[tokio::test]
    async fn dispatch_runs_a_session_through_the_plane() -> Result<(), Box<dyn std::error::Error>> {
        let plane = make_plane();
        let started = dispatch(
            &plane,
            Command::SessionStart {
                client_id: Some("ui".into()),
                user_agent: None,
            },
        )
        .await?;
        let session_id: SessionId = serde_json::from_value(started["session_id"].clone())?;

        let connected = dispatch(
            &plane,
            Command::RobotConnect {
                session_id,
                hostname: None,
                port: None,
            },
        )
        .await?;
        assert_eq!(connected["status"], "connected");

        dispatch(&plane, Command::RobotHome { session_id }).await?;
        assert_eq!(plane.manager().state(), RobotState::Ready);

        let denied = dispatch(&plane, Command::SystemConnections { session_id }).await;
        assert!(matches!(denied, Err(ArmError::Unauthorized(_))));

        let logs = dispatch(
            &plane,
            Command::SystemLogs {
                session_id,
                target: None,
                limit: Some(3),
            },
        )
        .await?;
        assert_eq!(logs["total"], 3);
        Ok(())
    }

    #[tokio::test]
    async fn out_of_range_extension_is_refused() -> Result<(), Box<dyn std::error::Error>> {
        let plane = make_plane();
        let session = plane.start_session(None, None);

        for secs in [i64::MAX, i64::MIN] {
            let refused = dispatch(
                &plane,
                Command::SessionExtend {
                    session_id: session.id,
                    additional_secs: Some(secs),
                },
            )
            .await;
            assert!(matches!(refused, Err(ArmError::Serialization(_))));
        }
        let current = plane.sessions().get_session(session.id).ok_or("session gone")?;
        assert_eq!(current.expires_at, session.expires_at);

        let extended = dispatch(
            &plane,
            Command::SessionExtend {
                session_id: session.id,
                additional_secs: Some(7200),
            },
        )
        .await?;
        assert_eq!(extended["status"], "extended");
        Ok(())
    }

    // ── Live socket ──────────────────────────────────────────────────────────

    async fn start(plane: Arc<ControlPlane>) -> (SocketAddr, BackgroundTasks) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut tasks = BackgroundTasks::new();
        let server = CockpitServer::new(plane);
        let signal = tasks.signal();
        tasks.spawn("cockpit", async move {
            let _ = server.serve(listener, signal).await;
        });
        (addr, tasks)
    }

    #[tokio::test]
    async fn health_endpoint_serves_json() -> Result<(), Box<dyn std::error::Error>> {
        let (addr, tasks) = start(make_plane()).await;

        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n").await?;
        let mut response = String::new();
        stream.read_to_string(&mut response).await?;

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        let body = response.split("\r\n\r\n").nth(1).unwrap_or_default();
        let health: Value = serde_json::from_str(body)?;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["robot_connected"], false);

        tasks.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn websocket_observer_gets_connection_then_reply() -> Result<(), Box<dyn std::error::Error>> {
        let (addr, tasks) = start(make_plane()).await;

        let url = format!("ws://{addr}/ws/alerts");
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await?;

        let next_json = |msg: Option<Result<Message, _>>| -> Value {
            match msg {
                Some(Ok(Message::Text(text))) => serde_json::from_str(text.as_str()).unwrap(),
                other => panic!("unexpected frame: {other:?}"),
            }
        };

        let hello = next_json(tokio::time::timeout(Duration::from_secs(2), ws.next()).await?);
        assert_eq!(hello["type"], "connection");
        assert_eq!(hello["data"]["stream"], "alerts");

        ws.send(Message::Text(r#"{"op":"session.start","client_id":"test"}"#.into()))
            .await?;
        let reply = next_json(tokio::time::timeout(Duration::from_secs(2), ws.next()).await?);
        assert_eq!(reply["type"], "reply");
        assert_eq!(reply["data"]["op"], "session.start");
        assert_eq!(reply["data"]["ok"], true);
        assert!(reply["data"]["result"]["session_id"].is_string());

        ws.send(Message::Text("not a command".into())).await?;
        let invalid = next_json(tokio::time::timeout(Duration::from_secs(2), ws.next()).await?);
        assert_eq!(invalid["data"]["ok"], false);

        ws.close(None).await?;
        tasks.shutdown().await;
        Ok(())
    }
}
