#![allow(dead_code)]
pub mod period;
pub mod scheduler;

use std::sync::atomic::{AtomicBool, Ordering};

pub use period::PeriodState;
pub use scheduler::{SyncEngine, SyncOptions};

/// Shared override flags. Force-mode and spike-mode set these; the
/// scheduler suppresses uploads while either is active so an override
/// tariff is never clobbered mid-flight.
#[derive(Debug, Default)]
pub struct OverrideFlags {
    force_mode: AtomicBool,
    spike_mode: AtomicBool,
}

impl OverrideFlags {
    pub fn set_force_mode(&self, active: bool) {
        self.force_mode.store(active, Ordering::SeqCst);
    }

    pub fn set_spike_mode(&self, active: bool) {
        self.spike_mode.store(active, Ordering::SeqCst);
    }

    pub fn force_mode_active(&self) -> bool {
        self.force_mode.load(Ordering::SeqCst)
    }

    pub fn spike_mode_active(&self) -> bool {
        self.spike_mode.load(Ordering::SeqCst)
    }

    pub fn any_active(&self) -> bool {
        self.force_mode_active() || self.spike_mode_active()
    }
}
