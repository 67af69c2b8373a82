//! [`SupervisorSecret`] – the PIN guarding privileged operations.
//!
//! The secret is wiped from memory on drop and never printed by `Debug`.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// PIN used when none is configured.
pub const DEFAULT_SUPERVISOR_PIN: &str = "1234";

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SupervisorSecret(String);

impl SupervisorSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Compare without short-circuiting on the first differing byte.
    pub fn matches(&self, candidate: &str) -> bool {
        let expected = self.0.as_bytes();
        let given = candidate.as_bytes();
        let mut diff = expected.len() ^ given.len();
        for (i, byte) in given.iter().enumerate() {
            let other = expected.get(i).copied().unwrap_or(0);
            diff |= usize::from(byte ^ other);
        }
        diff == 0
    }
}

impl Default for SupervisorSecret {
    fn default() -> Self {
        Self::new(DEFAULT_SUPERVISOR_PIN)
    }
}

impl fmt::Debug for SupervisorSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SupervisorSecret(<redacted>)")
    }
}
