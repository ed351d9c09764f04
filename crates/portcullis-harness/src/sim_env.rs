//! Virtual-clock Environment implementation for deterministic testing.

use std::{
    ops::Sub,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use portcullis_core::env::Environment;

/// Point on the virtual timeline, measured from simulation start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimInstant(Duration);

impl SimInstant {
    /// Time since simulation start.
    pub fn since_start(self) -> Duration {
        self.0
    }
}

impl Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

#[derive(Debug, Default)]
struct Clock {
    now: Mutex<Duration>,
    sleeps: AtomicU64,
}

/// Simulation environment with a manually driven clock.
///
/// This implementation provides:
///
/// - **Virtual Time**: `now()` only moves when a test calls [`SimEnv::advance`]
///   or code under test calls `sleep()`.
/// - **Instant Sleep**: `sleep()` advances the clock and returns at once, so
///   retry backoff costs no wall time.
///
/// Clones share one clock.
#[derive(Debug, Clone, Default)]
pub struct SimEnv {
    clock: Arc<Clock>,
}

impl SimEnv {
    /// Clock at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        *self.clock.now.lock() += duration;
    }

    /// Time since simulation start.
    pub fn elapsed(&self) -> Duration {
        *self.clock.now.lock()
    }

    /// Number of `sleep()` calls made so far.
    pub fn sleep_count(&self) -> u64 {
        self.clock.sleeps.load(Ordering::Relaxed)
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        SimInstant(*self.clock.now.lock())
    }

    fn sleep(&self, duration: Duration) {
        self.clock.sleeps.fetch_add(1, Ordering::Relaxed);
        self.advance(duration);
    }
}
