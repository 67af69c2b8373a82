//! `armgate-hal` – Motion Driver Abstraction
//!
//! The control plane never speaks to an arm directly.  It holds an
//! `Arc<dyn MotionDriver>` chosen once at startup and calls atomic motion
//! primitives through it.
//!
//! # Modules
//!
//! - [`driver`] – the [`MotionDriver`] capability trait, the closed
//!   [`DriverError`] set, and [`build_driver`] for picking an implementation
//!   from configuration.
//! - [`sim`] – [`SimDriver`]: an in-process arm with eased motion, used in
//!   tests and when no hardware is attached.
//! - [`urscript`] – [`UrScriptDriver`]: drives a UR-series controller by
//!   streaming URScript over its primary interface and releasing protective
//!   stops through the dashboard server.

pub mod driver;
pub mod sim;
pub mod urscript;

pub use driver::{
    DriverError, DriverKind, DriverOptions, HaltSignal, MAX_MOTION, MotionDriver, build_driver,
    motion_duration,
};
pub use sim::SimDriver;
pub use urscript::UrScriptDriver;
