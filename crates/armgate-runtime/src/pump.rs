//! [`TelemetryPump`] – periodic robot snapshots onto the `telemetry` topic.
//!
//! The pump never takes the manager's command lock, so snapshots keep
//! flowing while a long motion executes.  A failed read does not stop it:
//! the last-known values go out instead, flagged with `net.link_up = false`.

use std::sync::Arc;
use std::time::Duration;

use armgate_kernel::RobotManager;
use armgate_middleware::TelemetryBus;
use armgate_types::ArmError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::background::ShutdownSignal;

pub const DEFAULT_RATE_HZ: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Snapshots per second.
    pub rate_hz: f64,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            rate_hz: DEFAULT_RATE_HZ,
        }
    }
}

impl PumpConfig {
    /// Tick period; falls back to the default rate for non-positive or
    /// non-finite values.
    pub fn period(&self) -> Duration {
        let rate = if self.rate_hz.is_finite() && self.rate_hz > 0.0 {
            self.rate_hz
        } else {
            DEFAULT_RATE_HZ
        };
        Duration::from_secs_f64(1.0 / rate)
    }
}

pub struct TelemetryPump {
    manager: Arc<RobotManager>,
    bus: TelemetryBus,
    period: Duration,
    consecutive_failures: u64,
}

impl TelemetryPump {
    pub fn new(manager: Arc<RobotManager>, bus: TelemetryBus, config: PumpConfig) -> Self {
        Self {
            manager,
            bus,
            period: config.period(),
            consecutive_failures: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Sample once and publish.  Returns the number of observers reached.
    pub async fn tick(&mut self) -> Result<usize, ArmError> {
        let snapshot = match self.manager.sample().await {
            Ok(snapshot) => {
                if self.consecutive_failures > 0 {
                    info!(failures = self.consecutive_failures, "telemetry reads recovered");
                    self.consecutive_failures = 0;
                }
                snapshot
            }
            Err(e) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures == 1 {
                    warn!(error = %e, "telemetry read failed; publishing last known values");
                } else {
                    debug!(error = %e, failures = self.consecutive_failures, "telemetry read failed");
                }
                self.manager.fallback_snapshot()
            }
        };
        self.bus.publish_telemetry(&snapshot)
    }

    /// Tick at the configured rate until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_ms = self.period.as_millis() as u64, "telemetry pump started");

        loop {
            tokio::select! {
                _ = shutdown.requested() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "failed to publish telemetry");
                    }
                }
            }
        }
        info!("telemetry pump stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armgate_hal::SimDriver;
    use armgate_kernel::ManagerConfig;
    use armgate_middleware::ChannelSink;
    use armgate_types::Topic;
    use serde_json::Value;

    #[test]
    fn period_follows_rate() {
        assert_eq!(PumpConfig { rate_hz: 10.0 }.period(), Duration::from_millis(100));
        assert_eq!(PumpConfig { rate_hz: 0.0 }.period(), Duration::from_millis(100));
        assert_eq!(PumpConfig { rate_hz: 50.0 }.period(), Duration::from_millis(20));
    }

    #[tokio::test]
    async fn read_failure_publishes_fallback() -> Result<(), Box<dyn std::error::Error>> {
        let sim = Arc::new(SimDriver::new(0.0));
        let manager = Arc::new(RobotManager::new(sim.clone(), ManagerConfig::default()));
        manager.connect("sim", 30002).await?;

        let bus = TelemetryBus::default();
        let (sink, mut rx) = ChannelSink::new();
        bus.subscribe(Topic::Telemetry, Box::new(sink), "test");
        rx.recv().await;

        let mut pump = TelemetryPump::new(manager, bus, PumpConfig::default());
        assert_eq!(pump.tick().await?, 1);
        let live: Value = serde_json::from_str(&rx.recv().await.unwrap_or_default())?;
        assert_eq!(live["data"]["net"]["link_up"], true);

        sim.set_link_down(true);
        assert_eq!(pump.tick().await?, 1);
        let fallback: Value = serde_json::from_str(&rx.recv().await.unwrap_or_default())?;
        assert_eq!(fallback["type"], "telemetry");
        assert_eq!(fallback["data"]["net"]["link_up"], false);
        assert_eq!(fallback["data"]["state"], "IDLE");
        Ok(())
    }
}
