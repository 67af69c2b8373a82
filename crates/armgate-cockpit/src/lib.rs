//! `armgate-cockpit` – The Observer Server
//!
//! Boots a lightweight HTTP + WebSocket server (default port `8000`) that:
//!
//! 1. **Streams** one bus topic per WebSocket: `/ws/telemetry`,
//!    `/ws/alerts`, `/ws/job` or `/ws/analysis`.  The socket's write half
//!    becomes the connection's sink on the
//!    [`TelemetryBus`](armgate_middleware::TelemetryBus).
//!
//! 2. **Accepts** JSON commands on the same socket (`{"op": "robot.home",
//!    "session_id": ...}`), runs them through the
//!    [`ControlPlane`](armgate_runtime::ControlPlane) and answers with a
//!    `reply` envelope addressed to that connection only.
//!
//! 3. **Reports** liveness on `GET /health`.

pub mod server;

pub use server::{CockpitServer, Command, DEFAULT_PORT, dispatch};
