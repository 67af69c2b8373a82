//! Long-running service loops and their shutdown.
//!
//! Three loops run for the life of the process:
//!
//! | Loop | Period | Work |
//! |---|---|---|
//! | telemetry pump | `1 / telemetry_rate_hz` | sample the robot, publish on `telemetry` |
//! | session sweeper | `session_sweep_secs` | drop sessions past their expiry |
//! | pinger | `ping_interval_secs` | `ping` envelope to every connection |
//!
//! Each loop watches a shared [`ShutdownSignal`]; [`BackgroundTasks::shutdown`]
//! raises it and joins every handle.

use std::sync::Arc;
use std::time::Duration;

use armgate_kernel::{RobotManager, SessionRegistry};
use armgate_middleware::TelemetryBus;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::pump::{PumpConfig, TelemetryPump};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);

// ────────────────────────────────────────────────────────────────────────────
// Shutdown signal
// ────────────────────────────────────────────────────────────────────────────

/// Receiving end of the process-wide shutdown flag.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_shutdown_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested (or the sender is gone).
    pub async fn requested(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Loops
// ────────────────────────────────────────────────────────────────────────────

fn delayed_interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Remove expired sessions every `period`, whether or not anyone looks
/// them up.
pub async fn run_session_sweeper(
    sessions: Arc<SessionRegistry>,
    period: Duration,
    mut shutdown: ShutdownSignal,
) {
    let mut interval = delayed_interval(period);
    loop {
        tokio::select! {
            _ = shutdown.requested() => break,
            _ = interval.tick() => {
                let removed = sessions.sweep_expired();
                debug!(removed, "session sweep finished");
            }
        }
    }
    debug!("session sweeper stopped");
}

/// Keep idle observer sockets alive.
pub async fn run_pinger(bus: TelemetryBus, period: Duration, mut shutdown: ShutdownSignal) {
    let mut interval = delayed_interval(period);
    loop {
        tokio::select! {
            _ = shutdown.requested() => break,
            _ = interval.tick() => match bus.ping_all() {
                Ok(n) => debug!(connections = n, "liveness ping sent"),
                Err(e) => warn!(error = %e, "liveness ping failed"),
            },
        }
    }
    debug!("pinger stopped");
}

// ────────────────────────────────────────────────────────────────────────────
// BackgroundTasks
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BackgroundConfig {
    pub pump: PumpConfig,
    pub sweep_interval: Duration,
    pub ping_interval: Duration,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            pump: PumpConfig::default(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

/// Owns every background handle plus the shutdown flag they watch.
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Spawn the pump, sweeper and pinger.
    pub fn start(
        manager: Arc<RobotManager>,
        sessions: Arc<SessionRegistry>,
        bus: TelemetryBus,
        config: BackgroundConfig,
    ) -> Self {
        let mut tasks = Self::new();
        let pump = TelemetryPump::new(manager, bus.clone(), config.pump);
        tasks.spawn("telemetry_pump", pump.run(tasks.signal()));
        tasks.spawn(
            "session_sweeper",
            run_session_sweeper(sessions, config.sweep_interval, tasks.signal()),
        );
        tasks.spawn("pinger", run_pinger(bus, config.ping_interval, tasks.signal()));
        tasks
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.shutdown.subscribe(),
        }
    }

    /// Track an extra loop (the cockpit server, for one) under the same
    /// shutdown.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "background task spawned");
        self.handles.push((name, tokio::spawn(task)));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Raise the shutdown flag without waiting.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Raise the shutdown flag and wait for every task to finish.
    pub async fn shutdown(self) {
        self.request_shutdown();
        for (name, handle) in self.handles {
            match handle.await {
                Ok(()) => debug!(task = name, "background task joined"),
                Err(e) => warn!(task = name, error = %e, "background task ended abnormally"),
            }
        }
        info!("background tasks stopped");
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armgate_hal::SimDriver;
    use armgate_kernel::{ManagerConfig, RegistryConfig};
    use armgate_middleware::ChannelSink;
    use armgate_types::{ManualClock, Topic};
    use chrono::{TimeDelta, TimeZone, Utc};

    #[tokio::test]
    async fn signal_resolves_after_request() {
        let tasks = BackgroundTasks::new();
        let mut signal = tasks.signal();
        assert!(!signal.is_shutdown_requested());
        tasks.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), signal.requested())
            .await
            .unwrap();
        assert!(signal.is_shutdown_requested());
    }

    #[tokio::test]
    async fn sweeper_removes_abandoned_sessions() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let sessions = Arc::new(SessionRegistry::with_clock(
            RegistryConfig {
                timeout: TimeDelta::seconds(30),
                ..RegistryConfig::default()
            },
            clock.clone(),
        ));
        sessions.create_session(None, None);
        clock.advance(TimeDelta::seconds(31));

        let mut tasks = BackgroundTasks::new();
        tasks.spawn(
            "sweeper",
            run_session_sweeper(sessions.clone(), Duration::from_millis(20), tasks.signal()),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sessions.active_sessions().is_empty());
        assert_eq!(sessions.all_logs(1)[0].event, armgate_kernel::SessionEventKind::SessionExpired);
        tasks.shutdown().await;
    }

    #[tokio::test]
    async fn pinger_reaches_connections() {
        let bus = TelemetryBus::default();
        let (sink, mut rx) = ChannelSink::new();
        bus.subscribe(Topic::Alerts, Box::new(sink), "test");
        rx.recv().await;

        let mut tasks = BackgroundTasks::new();
        tasks.spawn("pinger", run_pinger(bus, Duration::from_millis(20), tasks.signal()));
        let ping = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap_or_default();
        assert!(ping.contains("\"ping\""));
        tasks.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_joins_all_loops() {
        let manager = Arc::new(RobotManager::new(
            Arc::new(SimDriver::new(0.0)),
            ManagerConfig::default(),
        ));
        let sessions = Arc::new(SessionRegistry::new(RegistryConfig::default()));
        let tasks = BackgroundTasks::start(
            manager,
            sessions,
            TelemetryBus::default(),
            BackgroundConfig::default(),
        );
        assert_eq!(tasks.len(), 3);
        tokio::time::timeout(Duration::from_secs(2), tasks.shutdown())
            .await
            .unwrap();
    }
}
