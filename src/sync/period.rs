#![allow(dead_code)]
//! Per-period scheduler state. A period is identified by its UTC start
//! floored to 5 minutes; all fields reset when the boundary crosses.

use chrono::{DateTime, Utc};

use crate::clock;
use crate::domain::PricePoint;

#[derive(Debug, Clone)]
pub struct PeriodState {
    pub period_start: DateTime<Utc>,
    pub stage1_done: bool,
    pub websocket_received: bool,
    /// (import, export) cents the transformer used for the current slot
    /// on the last upload.
    pub last_synced: Option<(f64, f64)>,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Forecast series cached across stages of the same period so the
    /// later stages do not re-poll for data that cannot have changed.
    pub cached_forecast: Option<(DateTime<Utc>, Vec<PricePoint>)>,
}

impl PeriodState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            period_start: clock::period_start(now),
            stage1_done: false,
            websocket_received: false,
            last_synced: None,
            last_sync_at: None,
            cached_forecast: None,
        }
    }

    /// Reset state at the first call after a boundary crossing. Returns
    /// true when a rollover happened.
    pub fn roll_if_needed(&mut self, now: DateTime<Utc>) -> bool {
        let current = clock::period_start(now);
        if current == self.period_start {
            return false;
        }
        *self = Self::new(now);
        true
    }

    pub fn record_upload(&mut self, synced: (f64, f64), at: DateTime<Utc>) {
        self.last_synced = Some(synced);
        self.last_sync_at = Some(at);
    }
}
