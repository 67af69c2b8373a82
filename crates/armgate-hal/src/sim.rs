//! [`SimDriver`] – in-process arm for tests and hardware-free operation.
//!
//! Motions are simulated with cosine easing in at least ten steps; each step
//! checks the [`HaltSignal`] so `stop`/`emergency_stop` interrupt a move
//! mid-flight.  Durations follow the commanded speed (`|delta| / speed`),
//! vertical safe-Z moves run at 0.2 m/s, and homing takes three seconds, all
//! multiplied by a configurable time scale.
//!
//! # Example
//!
//! ```rust
//! use armgate_hal::{MotionDriver, SimDriver};
//! use armgate_types::TcpAxis;
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! rt.block_on(async {
//!     let sim = SimDriver::new(0.0);
//!     sim.connect("sim", 0).await.unwrap();
//!     sim.jog_tcp(TcpAxis::Z, -0.05, 0.1, Default::default()).await.unwrap();
//!     let sample = sim.sample().await.unwrap();
//!     assert!((sample.pose.z - 0.25).abs() < 1e-9);
//! });
//! ```

use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use armgate_types::{DriverSample, Frame, IoMap, JOINT_COUNT, TcpAxis, TcpPose};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::driver::{DriverError, HaltSignal, MotionDriver, motion_duration};

/// Home pose of the simulated arm.
pub const HOME_POSE: TcpPose = TcpPose::new(0.3, 0.0, 0.3, 0.0, 0.0, 0.0);
/// Home joint configuration in radians.
pub const HOME_JOINTS: [f64; JOINT_COUNT] = [0.0, -1.57, 1.57, -1.57, -1.57, 0.0];

const HOME_SECS: f64 = 3.0;
const SAFE_Z_SPEED: f64 = 0.2;
const CONNECT_SECS: f64 = 0.5;
const CLEAR_ESTOP_SECS: f64 = 0.5;
const MIN_STEPS: u32 = 10;
const STEP_HZ: f64 = 50.0;

struct SimState {
    connected: bool,
    pose: TcpPose,
    joints: [f64; JOINT_COUNT],
    speed: f64,
    io: IoMap,
}

/// Simulated UR-class arm.
pub struct SimDriver {
    state: Mutex<SimState>,
    halt: HaltSignal,
    estopped: AtomicBool,
    link_down: AtomicBool,
    time_scale: f64,
}

impl SimDriver {
    /// `time_scale` multiplies every simulated duration; `0.0` makes motion
    /// instantaneous.
    pub fn new(time_scale: f64) -> Self {
        Self {
            state: Mutex::new(SimState {
                connected: false,
                pose: HOME_POSE,
                joints: HOME_JOINTS,
                speed: 0.0,
                io: IoMap::default(),
            }),
            halt: HaltSignal::new(),
            estopped: AtomicBool::new(false),
            link_down: AtomicBool::new(false),
            time_scale: time_scale.max(0.0),
        }
    }

    /// Simulate a broken link: `connect` and `sample` fail while set.
    pub fn set_link_down(&self, down: bool) {
        self.link_down.store(down, Ordering::SeqCst);
    }

    /// Drive a digital output (for I/O visibility in telemetry).
    pub fn set_output(&self, index: usize, value: bool) -> Result<(), DriverError> {
        let mut state = self.lock();
        match state.io.outputs.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(DriverError::Rejected(format!("no digital output {index}"))),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_movable(&self) -> Result<(), DriverError> {
        if !self.lock().connected {
            return Err(DriverError::NotConnected);
        }
        if self.estopped.load(Ordering::SeqCst) {
            return Err(DriverError::Rejected("protective stop active".into()));
        }
        Ok(())
    }

    async fn pause(&self, secs: f64) {
        if let Ok(scaled) = Duration::try_from_secs_f64(secs * self.time_scale)
            && !scaled.is_zero()
        {
            tokio::time::sleep(scaled).await;
        }
    }

    /// Ease from the current pose/joints to the targets over `secs`.
    async fn simulate_motion(
        &self,
        target_pose: Option<TcpPose>,
        target_joints: Option<[f64; JOINT_COUNT]>,
        secs: f64,
    ) -> Result<(), DriverError> {
        motion_duration(secs)?;
        let armed = self.halt.arm();
        let (start_pose, start_joints) = {
            let state = self.lock();
            (state.pose, state.joints)
        };
        let end_pose = target_pose.unwrap_or(start_pose);
        let end_joints = target_joints.unwrap_or(start_joints);

        let distance = start_pose
            .position()
            .iter()
            .zip(end_pose.position())
            .map(|(a, b)| (b - a).powi(2))
            .sum::<f64>()
            .sqrt();
        let cruise = if secs > 0.0 { distance / secs } else { 0.0 };

        let steps = MIN_STEPS.max((secs * STEP_HZ).ceil() as u32);
        let step_secs = secs / f64::from(steps);

        for step in 1..=steps {
            self.pause(step_secs).await;
            if self.halt.tripped_since(armed) {
                self.lock().speed = 0.0;
                return Err(DriverError::Interrupted);
            }
            let t = f64::from(step) / f64::from(steps);
            let s = (1.0 - (PI * t).cos()) / 2.0;
            let mut state = self.lock();
            state.pose = lerp_pose(start_pose, end_pose, s);
            for (i, joint) in state.joints.iter_mut().enumerate() {
                *joint = start_joints[i] + (end_joints[i] - start_joints[i]) * s;
            }
            state.speed = cruise;
        }

        let mut state = self.lock();
        state.pose = end_pose;
        state.joints = end_joints;
        state.speed = 0.0;
        Ok(())
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new(1.0)
    }
}

fn lerp_pose(a: TcpPose, b: TcpPose, s: f64) -> TcpPose {
    TcpPose::new(
        a.x + (b.x - a.x) * s,
        a.y + (b.y - a.y) * s,
        a.z + (b.z - a.z) * s,
        a.rx + (b.rx - a.rx) * s,
        a.ry + (b.ry - a.ry) * s,
        a.rz + (b.rz - a.rz) * s,
    )
}

fn travel_secs(delta: f64, speed: f64) -> Result<f64, DriverError> {
    if !speed.is_finite() || speed <= 0.0 {
        return Err(DriverError::Rejected(format!("speed must be positive, got {speed}")));
    }
    let secs = delta.abs() / speed;
    motion_duration(secs)?;
    Ok(secs)
}

#[async_trait]
impl MotionDriver for SimDriver {
    fn name(&self) -> &str {
        "sim"
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn connect(&self, host: &str, port: u16) -> Result<(), DriverError> {
        self.pause(CONNECT_SECS).await;
        if self.link_down.load(Ordering::SeqCst) {
            return Err(DriverError::ConnectFailed(format!("{host}:{port} unreachable")));
        }
        self.lock().connected = true;
        info!(host, port, "sim arm connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        self.halt.trip();
        let mut state = self.lock();
        state.connected = false;
        state.speed = 0.0;
        Ok(())
    }

    async fn home(&self) -> Result<(), DriverError> {
        self.ensure_movable()?;
        self.simulate_motion(Some(HOME_POSE), Some(HOME_JOINTS), HOME_SECS)
            .await
    }

    async fn jog_tcp(
        &self,
        axis: TcpAxis,
        delta: f64,
        speed: f64,
        _frame: Frame,
    ) -> Result<(), DriverError> {
        // No orientation model: tool-frame jogs move along base axes.
        self.ensure_movable()?;
        let secs = travel_secs(delta, speed)?;
        let target = self.lock().pose.offset(axis, delta);
        self.simulate_motion(Some(target), None, secs).await
    }

    async fn jog_joint(&self, joint: usize, delta: f64, speed: f64) -> Result<(), DriverError> {
        if joint >= JOINT_COUNT {
            return Err(DriverError::Rejected(format!("invalid joint number: {joint}")));
        }
        self.ensure_movable()?;
        let secs = travel_secs(delta, speed)?;
        let mut target = self.lock().joints;
        target[joint] += delta;
        self.simulate_motion(None, Some(target), secs).await
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.halt.trip();
        self.lock().speed = 0.0;
        Ok(())
    }

    async fn emergency_stop(&self) -> Result<(), DriverError> {
        self.estopped.store(true, Ordering::SeqCst);
        self.halt.trip();
        self.lock().speed = 0.0;
        warn!("sim emergency stop engaged");
        Ok(())
    }

    async fn clear_estop(&self) -> Result<(), DriverError> {
        self.pause(CLEAR_ESTOP_SECS).await;
        self.estopped.store(false, Ordering::SeqCst);
        info!("sim emergency stop released");
        Ok(())
    }

    async fn move_to_safe_z(&self, z: f64) -> Result<(), DriverError> {
        self.ensure_movable()?;
        let current = self.lock().pose;
        let target = TcpPose { z, ..current };
        let secs = (z - current.z).abs() / SAFE_Z_SPEED;
        self.simulate_motion(Some(target), None, secs).await
    }

    async fn sample(&self) -> Result<DriverSample, DriverError> {
        if self.link_down.load(Ordering::SeqCst) {
            return Err(DriverError::Io("telemetry link down".into()));
        }
        let state = self.lock();
        if !state.connected {
            return Err(DriverError::NotConnected);
        }
        Ok(DriverSample {
            pose: state.pose,
            joints: state.joints,
            speed: state.speed,
            io: state.io.clone(),
        })
    }
}
