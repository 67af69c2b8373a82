//! [`UrScriptDriver`] – physical UR-series arm over TCP.
//!
//! Motion primitives are sent as single URScript lines to the controller's
//! primary interface (default port 30002).  The controller executes them
//! asynchronously, so the driver waits out the estimated move duration while
//! watching its [`HaltSignal`]; `stop`/`emergency_stop` send `stopl`/`stopj`
//! and trip the signal.  Protective stops are released through the dashboard
//! server (default port 29999).
//!
//! The driver keeps the last commanded pose and joints and reports those from
//! [`sample`][MotionDriver::sample]; parsing the controller's binary state
//! stream is left to a dedicated realtime client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use armgate_types::{DriverSample, Frame, JOINT_COUNT, TcpAxis, TcpPose};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::driver::{DriverError, DriverOptions, HaltSignal, MotionDriver, motion_duration};
use crate::sim::{HOME_JOINTS, HOME_POSE};

const JOINT_ACCEL: f64 = 1.4;
const JOINT_SPEED: f64 = 1.05;
const TOOL_ACCEL: f64 = 0.5;
const SAFE_Z_SPEED: f64 = 0.2;
const STOP_DECEL_LINEAR: f64 = 2.0;
const STOP_DECEL_JOINT: f64 = 4.0;
const WAIT_STEP: Duration = Duration::from_millis(20);

/// Driver for a UR controller reachable over the network.
pub struct UrScriptDriver {
    options: DriverOptions,
    link: tokio::sync::Mutex<Option<TcpStream>>,
    host: Mutex<Option<String>>,
    commanded: Mutex<DriverSample>,
    connected: AtomicBool,
    halt: HaltSignal,
}

impl UrScriptDriver {
    pub fn new(options: DriverOptions) -> Self {
        Self {
            options,
            link: tokio::sync::Mutex::new(None),
            host: Mutex::new(None),
            commanded: Mutex::new(DriverSample {
                pose: HOME_POSE,
                joints: HOME_JOINTS,
                ..DriverSample::default()
            }),
            connected: AtomicBool::new(false),
            halt: HaltSignal::new(),
        }
    }

    fn commanded(&self) -> std::sync::MutexGuard<'_, DriverSample> {
        self.commanded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write one URScript line to the primary interface.
    async fn send(&self, script: &str) -> Result<(), DriverError> {
        let mut link = self.link.lock().await;
        let Some(stream) = link.as_mut() else {
            return Err(DriverError::NotConnected);
        };
        debug!(script, "urscript >>");
        let line = format!("{script}\n");
        let write = tokio::time::timeout(self.options.timeout, stream.write_all(line.as_bytes()));
        match write.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                *link = None;
                self.connected.store(false, Ordering::SeqCst);
                Err(DriverError::Io(e.to_string()))
            }
            Err(_) => Err(DriverError::Timeout(self.options.timeout)),
        }
    }

    /// Send a motion and wait for its estimated duration unless halted.
    async fn run_motion(&self, script: String, secs: f64) -> Result<(), DriverError> {
        let travel = motion_duration(secs)?;
        let armed = self.halt.arm();
        self.send(&script).await?;
        let deadline = tokio::time::Instant::now() + travel;
        while tokio::time::Instant::now() < deadline {
            if self.halt.tripped_since(armed) {
                return Err(DriverError::Interrupted);
            }
            tokio::time::sleep(WAIT_STEP.min(deadline.saturating_duration_since(tokio::time::Instant::now())))
                .await;
        }
        if self.halt.tripped_since(armed) {
            return Err(DriverError::Interrupted);
        }
        Ok(())
    }

    /// Send one command to the dashboard server and return its reply line.
    async fn dashboard(&self, command: &str) -> Result<String, DriverError> {
        let host = self
            .host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(DriverError::NotConnected)?;
        let timeout = self.options.timeout;
        let exchange = async {
            let stream = TcpStream::connect((host.as_str(), self.options.dashboard_port))
                .await
                .map_err(|e| DriverError::ConnectFailed(format!("dashboard: {e}")))?;
            let mut reader = BufReader::new(stream);
            let mut greeting = String::new();
            reader
                .read_line(&mut greeting)
                .await
                .map_err(|e| DriverError::Io(e.to_string()))?;
            reader
                .get_mut()
                .write_all(format!("{command}\n").as_bytes())
                .await
                .map_err(|e| DriverError::Io(e.to_string()))?;
            let mut reply = String::new();
            reader
                .read_line(&mut reply)
                .await
                .map_err(|e| DriverError::Io(e.to_string()))?;
            Ok::<_, DriverError>(reply.trim().to_string())
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| DriverError::Timeout(timeout))?
    }
}

fn pose_literal(p: &TcpPose) -> String {
    format!(
        "p[{:.5}, {:.5}, {:.5}, {:.5}, {:.5}, {:.5}]",
        p.x, p.y, p.z, p.rx, p.ry, p.rz
    )
}

fn joints_literal(q: &[f64; JOINT_COUNT]) -> String {
    let parts: Vec<String> = q.iter().map(|v| format!("{v:.5}")).collect();
    format!("[{}]", parts.join(", "))
}

/// `movel` for a relative Cartesian jog in the requested frame.
fn jog_script(axis: TcpAxis, delta: f64, speed: f64, frame: Frame) -> String {
    let offset = pose_literal(&TcpPose::default().offset(axis, delta));
    let target = match frame {
        Frame::Base => format!("pose_add(get_actual_tcp_pose(), {offset})"),
        Frame::Tool => format!("pose_trans(get_actual_tcp_pose(), {offset})"),
    };
    format!("movel({target}, a={TOOL_ACCEL}, v={speed})")
}

fn require_speed(speed: f64) -> Result<(), DriverError> {
    if speed.is_finite() && speed > 0.0 {
        Ok(())
    } else {
        Err(DriverError::Rejected(format!("speed must be positive, got {speed}")))
    }
}

#[async_trait]
impl MotionDriver for UrScriptDriver {
    fn name(&self) -> &str {
        "urscript"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self, host: &str, port: u16) -> Result<(), DriverError> {
        let timeout = self.options.timeout;
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| DriverError::Timeout(timeout))?
            .map_err(|e| DriverError::ConnectFailed(format!("{host}:{port}: {e}")))?;
        *self.link.lock().await = Some(stream);
        *self.host.lock().unwrap_or_else(PoisonError::into_inner) = Some(host.to_string());
        self.connected.store(true, Ordering::SeqCst);
        info!(host, port, "connected to UR primary interface");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        self.halt.trip();
        if let Some(mut stream) = self.link.lock().await.take() {
            let _ = stream.shutdown().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn home(&self) -> Result<(), DriverError> {
        let current = self.commanded().joints;
        let travel = current
            .iter()
            .zip(HOME_JOINTS)
            .map(|(a, b)| (b - a).abs())
            .fold(0.0, f64::max);
        let script = format!(
            "movej({}, a={JOINT_ACCEL}, v={JOINT_SPEED})",
            joints_literal(&HOME_JOINTS)
        );
        self.run_motion(script, travel / JOINT_SPEED).await?;
        let mut commanded = self.commanded();
        commanded.pose = HOME_POSE;
        commanded.joints = HOME_JOINTS;
        Ok(())
    }

    async fn jog_tcp(
        &self,
        axis: TcpAxis,
        delta: f64,
        speed: f64,
        frame: Frame,
    ) -> Result<(), DriverError> {
        require_speed(speed)?;
        self.run_motion(jog_script(axis, delta, speed, frame), delta.abs() / speed)
            .await?;
        let mut commanded = self.commanded();
        commanded.pose = commanded.pose.offset(axis, delta);
        Ok(())
    }

    async fn jog_joint(&self, joint: usize, delta: f64, speed: f64) -> Result<(), DriverError> {
        if joint >= JOINT_COUNT {
            return Err(DriverError::Rejected(format!("invalid joint number: {joint}")));
        }
        require_speed(speed)?;
        let mut target = self.commanded().joints;
        target[joint] += delta;
        let script = format!(
            "movej({}, a={JOINT_ACCEL}, v={speed})",
            joints_literal(&target)
        );
        self.run_motion(script, delta.abs() / speed).await?;
        self.commanded().joints = target;
        Ok(())
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.halt.trip();
        self.send(&format!("stopl({STOP_DECEL_LINEAR})")).await
    }

    async fn emergency_stop(&self) -> Result<(), DriverError> {
        self.halt.trip();
        warn!("sending hard stop to UR controller");
        self.send(&format!("stopj({STOP_DECEL_JOINT})")).await
    }

    async fn clear_estop(&self) -> Result<(), DriverError> {
        let reply = self.dashboard("unlock protective stop").await?;
        if reply.to_ascii_lowercase().starts_with("protective stop releasing") {
            let _ = self.dashboard("close safety popup").await;
            info!("protective stop released");
            Ok(())
        } else {
            Err(DriverError::Rejected(reply))
        }
    }

    async fn move_to_safe_z(&self, z: f64) -> Result<(), DriverError> {
        let current = self.commanded().pose;
        let target = TcpPose { z, ..current };
        let script = format!(
            "movel({}, a={TOOL_ACCEL}, v={SAFE_Z_SPEED})",
            pose_literal(&target)
        );
        self.run_motion(script, (z - current.z).abs() / SAFE_Z_SPEED)
            .await?;
        self.commanded().pose = target;
        Ok(())
    }

    async fn sample(&self) -> Result<DriverSample, DriverError> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        Ok(self.commanded().clone())
    }
}
