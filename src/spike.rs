#![allow(dead_code)]
//! Wholesale price spike response.
//!
//! A two-state machine polled once a minute: on a reading at or above
//! the configured threshold it snapshots the battery state, flips to
//! autonomous and uploads a maximum-export tariff; when the price falls
//! back it restores what it saved. The sync scheduler is suppressed for
//! the whole excursion.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::battery::SiteFacade;
use crate::clock::{self, SLOTS_PER_DAY};
use crate::domain::tariff::MAX_RATE_DOLLARS;
use crate::domain::{OperationMode, TariffDocument, TariffMetadata};
use crate::events::{Event, EventBus};
use crate::prices::{PriceSource, SourceError};
use crate::sync::OverrideFlags;

/// Buy rate uploaded for the whole day while in a spike; high enough
/// that the battery never imports into one.
const SPIKE_BUY_DOLLARS: f64 = 1.0;

/// Multiplier applied to the observed wholesale price for the sell side.
const SPIKE_SELL_MULTIPLIER: f64 = 3.0;

/// How long the firmware gets to apply a restored tariff before the
/// operation mode is put back.
const RESTORE_SETTLE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SpikeOptions {
    pub region: String,
    /// Threshold in cents/kWh (a $300/MWh trigger is 30 c/kWh).
    pub threshold_cents: f64,
    pub poll_interval: Duration,
    /// Half-hour slots the boosted sell rate covers, starting at the
    /// current slot.
    pub window_slots: usize,
    pub timezone: Tz,
    pub metadata: TariffMetadata,
}

#[derive(Debug, Clone, Default)]
pub struct SpikeState {
    pub in_spike: bool,
    pub spike_started_at: Option<DateTime<Utc>>,
    pub last_observed_cents: Option<f64>,
    pub saved_tariff: Option<TariffDocument>,
    pub saved_operation_mode: Option<OperationMode>,
    pub snapshot_complete: bool,
}

pub struct SpikeManager {
    options: SpikeOptions,
    source: Arc<dyn PriceSource>,
    facade: Arc<SiteFacade>,
    overrides: Arc<OverrideFlags>,
    events: EventBus,
    state: Mutex<SpikeState>,
}

impl SpikeManager {
    pub fn new(
        options: SpikeOptions,
        source: Arc<dyn PriceSource>,
        facade: Arc<SiteFacade>,
        overrides: Arc<OverrideFlags>,
        events: EventBus,
    ) -> Self {
        Self {
            options,
            source,
            facade,
            overrides,
            events,
            state: Mutex::new(SpikeState::default()),
        }
    }

    pub fn spawn(manager: Arc<Self>) {
        info!(region = %manager.options.region, "spike manager started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.options.poll_interval);
            loop {
                ticker.tick().await;
                manager.poll().await;
            }
        });
    }

    pub async fn poll(&self) {
        let cents = match self.source.current().await {
            Ok(snapshot) => snapshot
                .import
                .wholesale_cents
                .unwrap_or(snapshot.import.per_kwh_cents),
            Err(SourceError::MissingData) => {
                debug!("no wholesale reading available");
                return;
            }
            Err(e) => {
                warn!(error = %e, "wholesale poll failed");
                return;
            }
        };
        self.observe(cents).await;
    }

    /// Feed one wholesale observation through the state machine.
    pub async fn observe(&self, wholesale_cents: f64) {
        let mut state = self.state.lock().await;
        state.last_observed_cents = Some(wholesale_cents);
        if !state.in_spike && wholesale_cents >= self.options.threshold_cents {
            self.enter_spike(&mut state, wholesale_cents).await;
        } else if state.in_spike && wholesale_cents < self.options.threshold_cents {
            self.exit_spike(&mut state).await;
        }
    }

    pub async fn state(&self) -> SpikeState {
        self.state.lock().await.clone()
    }

    async fn enter_spike(&self, state: &mut SpikeState, wholesale_cents: f64) {
        info!(
            wholesale_cents,
            threshold_cents = self.options.threshold_cents,
            region = %self.options.region,
            "wholesale spike detected"
        );

        // Best-effort snapshot; an unreadable tariff does not stop the
        // response, it only degrades the restore.
        let mut snapshot_complete = true;
        let saved_tariff = match self.facade.get_tariff().await {
            Ok(Some(tariff)) => Some(tariff),
            Ok(None) => {
                warn!("battery does not expose its tariff - snapshot incomplete");
                snapshot_complete = false;
                None
            }
            Err(e) => {
                warn!(error = %e, "tariff snapshot failed - proceeding anyway");
                snapshot_complete = false;
                None
            }
        };
        let saved_operation_mode = match self.facade.get_site_info().await {
            Ok(info) => Some(info.operation_mode),
            Err(e) => {
                warn!(error = %e, "operation mode snapshot failed");
                snapshot_complete = false;
                None
            }
        };

        if let Err(e) = self.facade.set_operation_mode(OperationMode::Autonomous).await {
            error!(error = %e, "failed to switch to autonomous for spike");
        }

        let doc = self.spike_tariff(wholesale_cents, saved_tariff.as_ref());
        if let Err(e) = self.facade.upload_tariff(&doc).await {
            error!(error = %e, "spike tariff upload failed - staying out of spike mode");
            return;
        }

        state.in_spike = true;
        state.spike_started_at = Some(Utc::now());
        state.saved_tariff = saved_tariff;
        state.saved_operation_mode = saved_operation_mode;
        state.snapshot_complete = snapshot_complete;
        self.overrides.set_spike_mode(true);
        self.events.emit(Event::UserNotification {
            title: "Price spike response active".to_string(),
            message: format!(
                "Wholesale hit {:.0}c/kWh in {} - exporting at maximum",
                wholesale_cents, self.options.region
            ),
        });
    }

    async fn exit_spike(&self, state: &mut SpikeState) {
        info!("wholesale back under threshold - restoring saved state");

        // Some firmware only accepts a tariff restore cleanly from
        // self-consumption.
        if let Err(e) = self
            .facade
            .set_operation_mode(OperationMode::SelfConsumption)
            .await
        {
            warn!(error = %e, "pre-restore mode switch failed");
        }

        match &state.saved_tariff {
            Some(tariff) => {
                if let Err(e) = self.facade.upload_tariff(tariff).await {
                    error!(error = %e, "saved tariff restore failed");
                    self.notify_manual_restore();
                }
            }
            None => self.notify_manual_restore(),
        }

        tokio::time::sleep(RESTORE_SETTLE).await;

        let restore_mode = state
            .saved_operation_mode
            .unwrap_or(OperationMode::SelfConsumption);
        if let Err(e) = self.facade.set_operation_mode(restore_mode).await {
            error!(error = %e, "failed to restore operation mode after spike");
            self.events.emit(Event::UserNotification {
                title: "Spike restore incomplete".to_string(),
                message: "Operation mode could not be restored - check the battery app".to_string(),
            });
        }

        *state = SpikeState {
            last_observed_cents: state.last_observed_cents,
            ..SpikeState::default()
        };
        self.overrides.set_spike_mode(false);
    }

    fn notify_manual_restore(&self) {
        warn!("spike snapshot was incomplete - user intervention may be needed");
        self.events.emit(Event::UserNotification {
            title: "Spike ended - tariff not restored".to_string(),
            message: "The pre-spike tariff could not be read; re-sync or reconfigure manually"
                .to_string(),
        });
    }

    /// Maximum-export tariff: sell at three times the observed wholesale
    /// price for the next few slots, saved rates elsewhere, and a
    /// uniformly discouraging buy rate. Every slot keeps full-day TOU
    /// coverage, so there is nothing for the firmware to misread.
    fn spike_tariff(&self, wholesale_cents: f64, saved: Option<&TariffDocument>) -> TariffDocument {
        let mut doc = saved.cloned().unwrap_or_else(|| {
            TariffDocument::uniform(self.options.metadata.clone(), SPIKE_BUY_DOLLARS, 0.08)
        });
        let sell_dollars = (wholesale_cents * SPIKE_SELL_MULTIPLIER / 100.0)
            .clamp(0.0, MAX_RATE_DOLLARS);

        for rate in doc.buy_rates.values_mut() {
            *rate = SPIKE_BUY_DOLLARS;
        }
        let start_slot = clock::slot_index_in_tz(Utc::now(), self.options.timezone);
        for i in 0..self.options.window_slots.min(SLOTS_PER_DAY) {
            let label = clock::slot_label(start_slot + i);
            doc.sell_rates.insert(label, sell_dollars);
        }
        doc
    }
}
