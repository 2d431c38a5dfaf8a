//! Pause gate
//!
//! A process-wide switch consulted by every outward action (discovery, RPC
//! calls, helper runs) before it starts. Leader election flips it, and so
//! can an operator. Each change is mirrored into the `paused` gauge.

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

use crate::metrics::{Observer, PAUSED};
use crate::types::{ProvisionerError, Result};

pub struct PauseGate {
    paused: Mutex<bool>,
    observer: Arc<dyn Observer>,
}

impl PauseGate {
    /// Create an unpaused gate
    pub fn new(observer: Arc<dyn Observer>) -> Self {
        observer.set_gauge(PAUSED, 0.0);
        Self {
            paused: Mutex::new(false),
            observer,
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        // a poisoned flag is still a valid bool
        self.paused.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, guard: &mut MutexGuard<'_, bool>, value: bool) {
        **guard = value;
        self.observer
            .set_gauge(PAUSED, if value { 1.0 } else { 0.0 });
    }

    pub fn pause(&self) {
        let mut guard = self.lock();
        self.set(&mut guard, true);
    }

    pub fn resume(&self) {
        let mut guard = self.lock();
        self.set(&mut guard, false);
    }

    /// Invert the gate, returning the new state
    pub fn flip(&self) -> bool {
        let mut guard = self.lock();
        let next = !*guard;
        self.set(&mut guard, next);
        next
    }

    pub fn paused(&self) -> bool {
        *self.lock()
    }

    /// Fail with a [`ProvisionerError::Paused`] naming `what` when paused
    pub fn check(&self, what: &str) -> Result<()> {
        if self.paused() {
            warn!(action = %what, "Refusing to act while paused");
            return Err(ProvisionerError::Paused(what.to_string()));
        }
        Ok(())
    }
}
