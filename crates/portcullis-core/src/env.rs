//! Environment abstraction for deterministic testing.
//!
//! The `Environment` trait decouples session logic from the system clock.
//! Everything in this crate that cares about time (DH parameter age, the
//! handshake deadline, entropy retry backoff) asks the environment instead
//! of calling `std::time::Instant::now()` or `std::thread::sleep()`.
//!
//! The environment is implemented twice:
//!
//! 1. [`SystemEnv`] (here): real monotonic clock, real sleeping
//! 2. `SimEnv` (portcullis-harness): virtual clock where `sleep()` advances
//!    time instantly
//!
//! # Invariants
//!
//! - Monotonicity: `env.now()` must never go backwards
//! - Isolation: implementations must not share global state

use std::{fmt, time::Duration};

/// Abstract environment providing time.
///
/// # Type Parameters
///
/// - `Instant`: Represents a point in time. In simulation, this is a virtual
///   instant. In production, this is `std::time::Instant`.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Type representing a point in time.
    ///
    /// Must support:
    /// - `Copy` - Lightweight to pass around
    /// - `Ord` - Can be compared (for deadlines)
    /// - `Sub<Output = Duration>` - Can compute elapsed time
    type Instant: Copy + Ord + Send + Sync + fmt::Debug + std::ops::Sub<Output = Duration>;

    /// Returns the current time.
    ///
    /// # Invariants
    ///
    /// - Monotonicity: subsequent calls must return times >= previous calls.
    fn now(&self) -> Self::Instant;

    /// Blocks the calling thread for `duration`.
    ///
    /// Only retry/backoff paths call this. Simulation implementations advance
    /// their virtual clock and return immediately.
    fn sleep(&self, duration: Duration);
}

/// Production environment: `std::time::Instant` and `std::thread::sleep`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_env_is_monotonic() {
        let env = SystemEnv;
        let start = env.now();
        env.sleep(Duration::from_millis(1));
        assert!(env.now() - start >= Duration::from_millis(1));
    }
}
