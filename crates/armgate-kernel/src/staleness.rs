//! [`StalenessWatchdog`] – tracks how old the last good telemetry read is.
//!
//! The robot manager calls [`StalenessWatchdog::record`] after every
//! successful driver read.  When the last read is older than the threshold
//! while a motion is executing, the manager stops assuming the motion is
//! progressing normally and pauses.

use std::time::{Duration, Instant};

/// Default gap after which telemetry is considered stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_millis(1500);

/// Single-source heartbeat monitor.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use armgate_kernel::StalenessWatchdog;
///
/// let mut wd = StalenessWatchdog::new(Duration::from_secs(1));
/// assert!(!wd.is_stale());
/// wd.record();
/// assert!(!wd.is_stale());
/// ```
#[derive(Debug, Clone)]
pub struct StalenessWatchdog {
    last_ok: Option<Instant>,
    threshold: Duration,
}

impl StalenessWatchdog {
    pub fn new(threshold: Duration) -> Self {
        Self {
            last_ok: None,
            threshold,
        }
    }

    /// Mark a successful read now.
    pub fn record(&mut self) {
        self.last_ok = Some(Instant::now());
    }

    /// Forget the last read, e.g. after a disconnect.
    pub fn reset(&mut self) {
        self.last_ok = None;
    }

    /// Time since the last successful read, if there was one.
    pub fn age(&self) -> Option<Duration> {
        self.last_ok.map(|at| at.elapsed())
    }

    /// `true` once a recorded read is older than the threshold.  A watchdog
    /// that never saw a read is not stale.
    pub fn is_stale(&self) -> bool {
        self.age().is_some_and(|age| age > self.threshold)
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }
}

impl Default for StalenessWatchdog {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER)
    }
}
