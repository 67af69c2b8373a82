//! [`SafetyGate`] – motion interlock / rule engine.
//!
//! Before any motion reaches the driver, the robot manager passes a
//! [`MotionIntent`] through [`SafetyGate::verify`] together with the current
//! [`SafetyLimits`].  Rules are evaluated in order; the first violation
//! returns [`ArmError::SafetyRejected`] and the motion is **not** executed.
//!
//! Built-in rules:
//! - [`JogDeltaRule`] – a jog increment must be finite and no larger than
//!   [`MAX_JOG_DELTA`].
//! - [`SpeedCapRule`] – commanded jog speed must not exceed `max_speed`.
//! - [`ZBandRule`] – the projected TCP height must stay in `[z_min, z_max]`.
//! - [`KeepoutRule`] – the projected TCP position must stay outside every
//!   keep-out volume.
//!
//! Joint-space jogs have no forward kinematics here, so only the delta and
//! speed rules apply to them.

use armgate_types::{ArmError, JogCommand, JogMode, SafetyLimits, TcpPose};

/// Largest single jog increment, in metres or radians.
pub const MAX_JOG_DELTA: f64 = 1.0;

/// A motion about to be handed to the driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionIntent {
    /// Incremental jog starting from `from`.
    Jog { command: JogCommand, from: TcpPose },
    /// Vertical retreat to `target_z` starting from `from`.
    SafeZ { target_z: f64, from: TcpPose },
}

impl MotionIntent {
    /// Commanded speed, if the intent carries one.
    pub fn speed(&self) -> Option<f64> {
        match self {
            MotionIntent::Jog { command, .. } => Some(command.speed),
            MotionIntent::SafeZ { .. } => None,
        }
    }

    /// Where the TCP ends up, when it can be computed without kinematics.
    pub fn projected_pose(&self) -> Option<TcpPose> {
        match *self {
            MotionIntent::Jog { command, from } => match command.mode {
                JogMode::Tcp { axis, .. } => Some(from.offset(axis, command.delta)),
                JogMode::Joint { .. } => None,
            },
            MotionIntent::SafeZ { target_z, from } => Some(TcpPose { z: target_z, ..from }),
        }
    }

    /// `true` when the intent changes TCP height.
    fn moves_z(&self) -> bool {
        match self {
            MotionIntent::Jog { command, .. } => matches!(
                command.mode,
                JogMode::Tcp {
                    axis: armgate_types::TcpAxis::Z,
                    ..
                }
            ),
            MotionIntent::SafeZ { .. } => true,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single motion invariant.
pub trait Rule: Send + Sync {
    /// Human-readable name used in rejection messages.
    fn name(&self) -> &str;

    fn check(&self, intent: &MotionIntent, limits: &SafetyLimits) -> Result<(), ArmError>;
}

// ────────────────────────────────────────────────────────────────────────────
// SafetyGate
// ────────────────────────────────────────────────────────────────────────────

/// Ordered set of [`Rule`]s.
///
/// # Example
///
/// ```
/// use armgate_kernel::safety_gate::{MotionIntent, SafetyGate};
/// use armgate_types::{JogCommand, SafetyLimits, TcpAxis, TcpPose};
///
/// let gate = SafetyGate::standard();
/// let limits = SafetyLimits::default();
/// let from = TcpPose::new(0.3, 0.0, 0.3, 0.0, 0.0, 0.0);
///
/// let slow = MotionIntent::Jog { command: JogCommand::tcp(TcpAxis::X, 0.01, 0.1), from };
/// assert!(gate.verify(&slow, &limits).is_ok());
///
/// let fast = MotionIntent::Jog { command: JogCommand::tcp(TcpAxis::X, 0.01, 2.0), from };
/// assert!(gate.verify(&fast, &limits).is_err());
/// ```
#[derive(Default)]
pub struct SafetyGate {
    rules: Vec<Box<dyn Rule>>,
}

impl SafetyGate {
    /// Gate with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate with the jog-delta, speed, Z-band and keep-out rules, in that
    /// order.
    pub fn standard() -> Self {
        let mut gate = Self::new();
        gate.add_rule(Box::new(JogDeltaRule));
        gate.add_rule(Box::new(SpeedCapRule));
        gate.add_rule(Box::new(ZBandRule));
        gate.add_rule(Box::new(KeepoutRule));
        gate
    }

    /// Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// First violation wins.
    pub fn verify(&self, intent: &MotionIntent, limits: &SafetyLimits) -> Result<(), ArmError> {
        for rule in &self.rules {
            rule.check(intent, limits)?;
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Rejects jog increments that are non-finite or larger than
/// [`MAX_JOG_DELTA`].
pub struct JogDeltaRule;

impl Rule for JogDeltaRule {
    fn name(&self) -> &str {
        "jog_delta"
    }

    fn check(&self, intent: &MotionIntent, _limits: &SafetyLimits) -> Result<(), ArmError> {
        let MotionIntent::Jog { command, .. } = intent else {
            return Ok(());
        };
        let delta = command.delta;
        if !delta.is_finite() {
            return Err(ArmError::SafetyRejected(format!("Delta {delta} is not finite")));
        }
        if delta.abs() > MAX_JOG_DELTA {
            return Err(ArmError::SafetyRejected(format!(
                "Delta {delta} exceeds jog increment limit {MAX_JOG_DELTA}"
            )));
        }
        Ok(())
    }
}

/// Rejects jogs faster than `limits.max_speed` (or with a non-positive speed).
pub struct SpeedCapRule;

impl Rule for SpeedCapRule {
    fn name(&self) -> &str {
        "speed_cap"
    }

    fn check(&self, intent: &MotionIntent, limits: &SafetyLimits) -> Result<(), ArmError> {
        let Some(speed) = intent.speed() else {
            return Ok(());
        };
        if !speed.is_finite() || speed <= 0.0 {
            return Err(ArmError::SafetyRejected(format!(
                "Speed {speed} must be positive"
            )));
        }
        if speed > limits.max_speed {
            return Err(ArmError::SafetyRejected(format!(
                "Speed {speed} exceeds limit {}",
                limits.max_speed
            )));
        }
        Ok(())
    }
}

/// Rejects Z motions whose target height leaves `[z_min, z_max]`.
pub struct ZBandRule;

impl Rule for ZBandRule {
    fn name(&self) -> &str {
        "z_band"
    }

    fn check(&self, intent: &MotionIntent, limits: &SafetyLimits) -> Result<(), ArmError> {
        if !intent.moves_z() {
            return Ok(());
        }
        if let Some(target) = intent.projected_pose()
            && (target.z < limits.z_min || target.z > limits.z_max)
        {
            return Err(ArmError::SafetyRejected(format!(
                "Target z {:.4} outside [{}, {}]",
                target.z, limits.z_min, limits.z_max
            )));
        }
        Ok(())
    }
}

/// Rejects motions whose target TCP position lies inside a keep-out volume.
pub struct KeepoutRule;

impl Rule for KeepoutRule {
    fn name(&self) -> &str {
        "keepout"
    }

    fn check(&self, intent: &MotionIntent, limits: &SafetyLimits) -> Result<(), ArmError> {
        let Some(target) = intent.projected_pose() else {
            return Ok(());
        };
        let point = target.position();
        if let Some(volume) = limits.keepout.iter().find(|v| v.contains(point)) {
            return Err(ArmError::SafetyRejected(format!(
                "Target [{:.4}, {:.4}, {:.4}] enters keep-out volume '{}'",
                point[0], point[1], point[2], volume.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armgate_types::{KeepoutVolume, TcpAxis};

    // ------------------------------------------------------------------ helpers
    const HOME: TcpPose = TcpPose::new(0.3, 0.0, 0.3, 0.0, 0.0, 0.0);

    fn jog(axis: TcpAxis, delta: f64, speed: f64) -> MotionIntent {
        MotionIntent::Jog {
            command: JogCommand::tcp(axis, delta, speed),
            from: HOME,
        }
    }

    fn limits_with_keepout() -> SafetyLimits {
        SafetyLimits {
            keepout: vec![KeepoutVolume {
                name: "camera_mast".into(),
                min: [0.35, -0.05, 0.0],
                max: [0.45, 0.05, 0.6],
            }],
            ..SafetyLimits::default()
        }
    }

    // ------------------------------------------------------------------ JogDeltaRule

    #[test]
    fn oversized_delta_rejected() {
        let gate = SafetyGate::standard();
        let err = gate
            .verify(&jog(TcpAxis::X, 1e300, 0.5), &SafetyLimits::default())
            .unwrap_err();
        assert!(matches!(err, ArmError::SafetyRejected(_)));
        assert!(err.to_string().contains("increment limit"));
    }

    #[test]
    fn non_finite_delta_rejected() {
        let gate = SafetyGate::standard();
        for delta in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                gate.verify(&jog(TcpAxis::Y, delta, 0.1), &SafetyLimits::default()),
                Err(ArmError::SafetyRejected(_))
            ));
        }
        let joint = MotionIntent::Jog {
            command: JogCommand::joint(1, f64::NAN, 0.1),
            from: HOME,
        };
        assert!(gate.verify(&joint, &SafetyLimits::default()).is_err());
    }

    #[test]
    fn delta_at_limit_passes() {
        let gate = SafetyGate::standard();
        let intent = MotionIntent::Jog {
            command: JogCommand::joint(0, -MAX_JOG_DELTA, 0.1),
            from: HOME,
        };
        assert!(gate.verify(&intent, &SafetyLimits::default()).is_ok());
    }

    // ------------------------------------------------------------------ SpeedCapRule

    #[test]
    fn speed_at_cap_passes() {
        let gate = SafetyGate::standard();
        assert!(gate.verify(&jog(TcpAxis::X, 0.01, 0.5), &SafetyLimits::default()).is_ok());
    }

    #[test]
    fn speed_over_cap_rejected() {
        let gate = SafetyGate::standard();
        let err = gate
            .verify(&jog(TcpAxis::X, 0.01, 0.51), &SafetyLimits::default())
            .unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
    }

    #[test]
    fn speed_cap_applies_to_joint_jogs() {
        let gate = SafetyGate::standard();
        let intent = MotionIntent::Jog {
            command: JogCommand::joint(3, 0.2, 0.9),
            from: HOME,
        };
        assert!(matches!(
            gate.verify(&intent, &SafetyLimits::default()),
            Err(ArmError::SafetyRejected(_))
        ));
    }

    #[test]
    fn negative_speed_rejected() {
        let gate = SafetyGate::standard();
        assert!(gate.verify(&jog(TcpAxis::Y, 0.01, -0.1), &SafetyLimits::default()).is_err());
    }

    // ------------------------------------------------------------------ ZBandRule

    #[test]
    fn z_jog_above_band_rejected() {
        let gate = SafetyGate::standard();
        // 0.3 + 0.25 = 0.55 > z_max 0.5
        let err = gate
            .verify(&jog(TcpAxis::Z, 0.25, 0.1), &SafetyLimits::default())
            .unwrap_err();
        assert!(err.to_string().contains("outside"));
    }

    #[test]
    fn z_jog_at_band_edge_passes() {
        let gate = SafetyGate::standard();
        assert!(gate.verify(&jog(TcpAxis::Z, 0.2, 0.1), &SafetyLimits::default()).is_ok());
    }

    #[test]
    fn z_band_ignores_horizontal_jogs() {
        let limits = SafetyLimits {
            z_min: 0.4,
            ..SafetyLimits::default()
        };
        // The arm sits below z_min already; moving sideways is still allowed.
        assert!(SafetyGate::standard().verify(&jog(TcpAxis::Y, 0.05, 0.1), &limits).is_ok());
    }

    #[test]
    fn safe_z_target_checked_against_band() {
        let gate = SafetyGate::standard();
        let limits = SafetyLimits::default();
        let ok = MotionIntent::SafeZ { target_z: 0.4, from: HOME };
        assert!(gate.verify(&ok, &limits).is_ok());
        let too_high = MotionIntent::SafeZ { target_z: 0.7, from: HOME };
        assert!(gate.verify(&too_high, &limits).is_err());
    }

    // ------------------------------------------------------------------ KeepoutRule

    #[test]
    fn jog_into_keepout_rejected() {
        let gate = SafetyGate::standard();
        let err = gate
            .verify(&jog(TcpAxis::X, 0.1, 0.1), &limits_with_keepout())
            .unwrap_err();
        assert!(err.to_string().contains("camera_mast"));
    }

    #[test]
    fn jog_clear_of_keepout_passes() {
        let gate = SafetyGate::standard();
        assert!(gate.verify(&jog(TcpAxis::X, -0.1, 0.1), &limits_with_keepout()).is_ok());
    }

    // ------------------------------------------------------------------ gate

    #[test]
    fn empty_gate_always_passes() {
        let gate = SafetyGate::new();
        assert!(gate.verify(&jog(TcpAxis::Z, 9.0, 99.0), &SafetyLimits::default()).is_ok());
    }

    #[test]
    fn speed_rule_fires_before_keepout() {
        let gate = SafetyGate::standard();
        let err = gate
            .verify(&jog(TcpAxis::X, 0.1, 5.0), &limits_with_keepout())
            .unwrap_err();
        assert!(err.to_string().contains("Speed"));
        assert_eq!(gate.rule_names(), vec!["jog_delta", "speed_cap", "z_band", "keepout"]);
    }
}
