//! Background DH parameter regeneration.
//!
//! [`DhRotation`] owns a named thread that wakes every `check_interval`,
//! asks the store whether rotation is due, and regenerates if so. A failed
//! regeneration is logged by the store and retried on the next wake-up,
//! because the parameter age is only reset on success.

use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::{credentials::CredentialStore, entropy::RandomSource, env::Environment};

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Handle to the rotation thread. Stops the thread when dropped.
pub struct DhRotation {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl DhRotation {
    /// Starts the worker.
    ///
    /// `check_interval` is wall-clock polling cadence; whether a rotation is
    /// due is decided by the store's environment clock.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn spawn<E, R>(
        store: Arc<CredentialStore<E>>,
        mut random: R,
        check_interval: Duration,
    ) -> io::Result<Self>
    where
        E: Environment,
        R: RandomSource + 'static,
    {
        let signal = Arc::new(StopSignal::default());
        let worker_signal = Arc::clone(&signal);

        let handle = thread::Builder::new().name("dh-rotation".to_string()).spawn(move || {
            debug!(?check_interval, "DH rotation worker started");
            loop {
                {
                    let mut stopped = worker_signal.stopped.lock();
                    if !*stopped {
                        worker_signal.wake.wait_for(&mut stopped, check_interval);
                    }
                    if *stopped {
                        break;
                    }
                }
                if store.rotation_due() {
                    // Failure is logged by the store; the next wake-up retries.
                    let _ = store.regenerate_dh_parameters(&mut random);
                }
            }
            debug!("DH rotation worker stopped");
        })?;

        Ok(Self { signal, handle: Some(handle) })
    }

    /// Stops the worker and waits for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DhRotation {
    fn drop(&mut self) {
        self.shutdown();
    }
}
