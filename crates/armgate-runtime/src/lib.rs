//! `armgate-runtime` – The Control Loop
//!
//! Wires the safety core, the driver and the observer bus into a running
//! service: the command boundary transports talk to, and the loops that
//! keep telemetry flowing and sessions tidy.
//!
//! # Modules
//!
//! - [`control_plane`] – [`ControlPlane`]: resolves sessions, checks
//!   supervisor rights, invokes the [`RobotManager`] and announces outcomes
//!   as alerts and job updates.
//! - [`pump`] – [`TelemetryPump`]: samples the robot at a fixed rate and
//!   publishes snapshots, falling back to last-known values on read errors.
//! - [`background`] – [`BackgroundTasks`]: the pump, the session sweeper
//!   and the liveness pinger under one shutdown signal.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: the global
//!   `tracing` subscriber with optional OTLP span export.

pub mod background;
pub mod control_plane;
pub mod pump;
pub mod telemetry;

pub use background::{BackgroundConfig, BackgroundTasks, ShutdownSignal};
pub use control_plane::{ConnectionsReport, ControlPlane, ControlPlaneConfig, HealthReport};
pub use pump::{PumpConfig, TelemetryPump};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};

// Re-exported so transports can hold the manager without a direct
// dependency on armgate-kernel.
pub use armgate_kernel::RobotManager;
