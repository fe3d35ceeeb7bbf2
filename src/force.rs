#![allow(dead_code)]
//! User-initiated force charge / force discharge.
//!
//! Activation snapshots the battery state, pushes an override tariff and
//! arms a cancellable one-shot timer; deactivation (timer expiry or an
//! explicit restore) unwinds everything. The snapshot is persisted so a
//! process restart inside the window re-arms the remaining time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::battery::SiteFacade;
use crate::clock::{self, SLOTS_PER_DAY};
use crate::domain::{OperationMode, TariffDocument, TariffMetadata};
use crate::events::{Event, EventBus};
use crate::store::{keys, StateStore};
use crate::sync::{OverrideFlags, SyncEngine};

/// Sell rate inside a discharge window.
const DISCHARGE_SELL_DOLLARS: f64 = 20.0;

/// Some firmware silently reverts the operation mode within roughly ten
/// minutes of a tariff write; reversions inside this window are
/// re-toggled. Workaround only, no contractual guarantee.
const REVERSION_WATCH: chrono::Duration = chrono::Duration::minutes(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForceMode {
    Charge,
    Discharge,
}

impl std::fmt::Display for ForceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForceMode::Charge => write!(f, "charge"),
            ForceMode::Discharge => write!(f, "discharge"),
        }
    }
}

/// What goes into the state store on activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceModeState {
    pub mode: ForceMode,
    pub expires_at: DateTime<Utc>,
    pub saved_tariff: Option<TariffDocument>,
    pub saved_operation_mode: OperationMode,
    pub saved_backup_reserve: f64,
}

struct ActiveForce {
    persisted: ForceModeState,
    cancel: CancellationToken,
    activated_at: DateTime<Utc>,
}

pub struct ForceModeManager {
    facade: Arc<SiteFacade>,
    store: Arc<StateStore>,
    overrides: Arc<OverrideFlags>,
    events: EventBus,
    engine: Arc<SyncEngine>,
    /// Dynamic-price providers get a fresh sync on restore; a saved
    /// tariff would be stale by then.
    dynamic_provider: bool,
    timezone: Tz,
    metadata: TariffMetadata,
    active: Mutex<Option<ActiveForce>>,
}

impl ForceModeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        facade: Arc<SiteFacade>,
        store: Arc<StateStore>,
        overrides: Arc<OverrideFlags>,
        events: EventBus,
        engine: Arc<SyncEngine>,
        dynamic_provider: bool,
        timezone: Tz,
        metadata: TariffMetadata,
    ) -> Self {
        Self {
            facade,
            store,
            overrides,
            events,
            engine,
            dynamic_provider,
            timezone,
            metadata,
            active: Mutex::new(None),
        }
    }

    pub async fn force_charge(self: &Arc<Self>, duration: Duration) -> anyhow::Result<()> {
        self.activate(ForceMode::Charge, duration).await
    }

    pub async fn force_discharge(self: &Arc<Self>, duration: Duration) -> anyhow::Result<()> {
        self.activate(ForceMode::Discharge, duration).await
    }

    pub async fn restore_normal(self: &Arc<Self>) -> anyhow::Result<()> {
        self.deactivate("user restore").await
    }

    pub async fn current_state(&self) -> Option<ForceModeState> {
        self.active.lock().await.as_ref().map(|a| a.persisted.clone())
    }

    /// Re-arm or clear persisted state after a process restart.
    pub async fn restore_on_startup(self: &Arc<Self>) {
        let Some(persisted) = self.store.get::<ForceModeState>(keys::FORCE_MODE_STATE).await
        else {
            return;
        };
        let now = Utc::now();
        if persisted.expires_at > now {
            let remaining = (persisted.expires_at - now)
                .to_std()
                .unwrap_or(Duration::from_secs(1));
            info!(
                mode = %persisted.mode,
                remaining_secs = remaining.as_secs(),
                "re-arming force mode from persisted state"
            );
            let cancel = CancellationToken::new();
            self.spawn_expiry(cancel.clone(), remaining);
            self.overrides.set_force_mode(true);
            *self.active.lock().await = Some(ActiveForce {
                persisted,
                cancel,
                activated_at: now,
            });
        } else {
            info!("persisted force mode already expired - clearing and re-syncing");
            if let Err(e) = self.store.remove(keys::FORCE_MODE_STATE).await {
                warn!(error = %e, "could not clear expired force state");
            }
            self.engine.sync_now().await;
        }
    }

    async fn activate(self: &Arc<Self>, mode: ForceMode, duration: Duration) -> anyhow::Result<()> {
        let mut active = self.active.lock().await;

        // An already-active mode is overwritten: cancel its timer, keep
        // its snapshot. Re-snapshotting would capture override state.
        let snapshot = match active.take() {
            Some(existing) => {
                info!(previous = %existing.persisted.mode, next = %mode, "force mode overwritten");
                existing.cancel.cancel();
                (
                    existing.persisted.saved_tariff,
                    existing.persisted.saved_operation_mode,
                    existing.persisted.saved_backup_reserve,
                )
            }
            None => {
                let saved_tariff = match self.facade.get_tariff().await {
                    Ok(tariff) => tariff,
                    Err(e) => {
                        warn!(error = %e, "tariff snapshot failed - restore will re-sync");
                        None
                    }
                };
                let info = self.facade.get_site_info().await?;
                (saved_tariff, info.operation_mode, info.backup_reserve_percent)
            }
        };
        let (saved_tariff, saved_operation_mode, saved_backup_reserve) = snapshot;

        let reserve = match mode {
            ForceMode::Charge => 100.0,
            ForceMode::Discharge => 0.0,
        };
        self.facade.set_backup_reserve(reserve).await?;
        self.facade.set_operation_mode(OperationMode::Autonomous).await?;

        let expires_at = Utc::now() + chrono::Duration::from_std(duration)?;
        let doc = self.force_tariff(mode, expires_at, saved_tariff.as_ref());
        self.facade.upload_tariff(&doc).await?;

        let persisted = ForceModeState {
            mode,
            expires_at,
            saved_tariff,
            saved_operation_mode,
            saved_backup_reserve,
        };
        self.store.put(keys::FORCE_MODE_STATE, &persisted).await?;
        self.overrides.set_force_mode(true);

        let cancel = CancellationToken::new();
        self.spawn_expiry(cancel.clone(), duration);
        *active = Some(ActiveForce {
            persisted,
            cancel,
            activated_at: Utc::now(),
        });

        info!(%mode, %expires_at, "force mode active");
        self.emit_state(mode, true, Some(expires_at));
        Ok(())
    }

    async fn deactivate(self: &Arc<Self>, reason: &str) -> anyhow::Result<()> {
        let mut active = self.active.lock().await;
        let Some(current) = active.take() else {
            // Nothing running; make sure no stale persistence survives.
            self.store.remove(keys::FORCE_MODE_STATE).await.ok();
            self.overrides.set_force_mode(false);
            return Ok(());
        };
        current.cancel.cancel();
        let state = current.persisted;
        info!(mode = %state.mode, reason, "force mode ending");

        // Halt the override effect before anything else.
        if let Err(e) = self
            .facade
            .set_operation_mode(OperationMode::SelfConsumption)
            .await
        {
            error!(error = %e, "failed to leave autonomous mode after force mode");
            self.events.emit(Event::UserNotification {
                title: "Battery restore failed".to_string(),
                message: "Could not switch the battery out of autonomous mode - check the app"
                    .to_string(),
            });
        }

        // Restore the tariff. Dynamic providers get a fresh sync since
        // the snapshot is minutes-to-hours stale by now.
        self.overrides.set_force_mode(false);
        if self.dynamic_provider {
            self.engine.sync_now().await;
        } else if let Some(tariff) = &state.saved_tariff {
            if let Err(e) = self.facade.upload_tariff(tariff).await {
                error!(error = %e, "saved tariff restore failed");
            }
        }

        if let Err(e) = self.facade.set_operation_mode(state.saved_operation_mode).await {
            error!(error = %e, "failed to restore operation mode");
            self.events.emit(Event::UserNotification {
                title: "Battery restore incomplete".to_string(),
                message: "Operation mode could not be restored after force mode".to_string(),
            });
        }

        self.restore_reserve(&state).await;

        if let Err(e) = self.store.remove(keys::FORCE_MODE_STATE).await {
            warn!(error = %e, "could not clear persisted force state");
        }
        self.emit_state(state.mode, false, None);
        Ok(())
    }

    /// Restoring the reserve after a discharge must not trigger a grid
    /// import: if the battery drained below the saved reserve, leave it
    /// at zero and tell the user.
    async fn restore_reserve(&self, state: &ForceModeState) {
        if state.mode == ForceMode::Discharge {
            match self.facade.get_live_status().await {
                Ok(live) if live.battery_soc < state.saved_backup_reserve => {
                    warn!(
                        soc = live.battery_soc,
                        reserve = state.saved_backup_reserve,
                        "SoC below saved reserve - leaving reserve at 0"
                    );
                    self.events.emit(Event::UserNotification {
                        title: "Backup reserve left at 0%".to_string(),
                        message: format!(
                            "Battery is at {:.0}% which is below your saved {:.0}% reserve; \
                             restoring it now would import from the grid",
                            live.battery_soc, state.saved_backup_reserve
                        ),
                    });
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "live status unavailable - restoring reserve anyway");
                }
            }
        }
        if let Err(e) = self
            .facade
            .set_backup_reserve(state.saved_backup_reserve)
            .await
        {
            error!(error = %e, "failed to restore backup reserve");
        }
    }

    fn spawn_expiry(self: &Arc<Self>, cancel: CancellationToken, duration: Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(duration) => {
                    if let Err(e) = manager.deactivate("deadline expired").await {
                        error!(error = %e, "force mode expiry handling failed");
                    }
                }
            }
        });
    }

    /// Watchdog hook: some firmware silently drops back out of
    /// autonomous mode shortly after a tariff write. Call periodically.
    pub async fn check_mode_reversion(&self) {
        let active = self.active.lock().await;
        let Some(current) = active.as_ref() else { return };
        if Utc::now() - current.activated_at > REVERSION_WATCH {
            return;
        }
        match self.facade.get_site_info().await {
            Ok(info) if info.operation_mode != OperationMode::Autonomous => {
                warn!("operation mode reverted during force mode - re-asserting autonomous");
                if let Err(e) = self.facade.set_operation_mode(OperationMode::Autonomous).await {
                    error!(error = %e, "re-assert failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "reversion check failed"),
        }
    }

    pub fn spawn_reversion_watch(manager: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                manager.check_mode_reversion().await;
            }
        });
    }

    /// Override tariff. Discharge: $20/kWh sell inside the window.
    /// Charge: free import and worthless export inside the window.
    /// Everything outside the window keeps the saved rates.
    fn force_tariff(
        &self,
        mode: ForceMode,
        expires_at: DateTime<Utc>,
        saved: Option<&TariffDocument>,
    ) -> TariffDocument {
        let mut doc = saved.cloned().unwrap_or_else(|| {
            TariffDocument::uniform(self.metadata.clone(), 0.30, 0.08)
        });
        let now = Utc::now();
        let start_slot = clock::slot_index_in_tz(now, self.timezone);
        let end_slot = clock::slot_index_in_tz(expires_at, self.timezone);
        // A window of a full day or more covers every slot; the modular
        // distance alone would collapse it to one.
        let span = if (expires_at - now).num_minutes() >= 23 * 60 + 30 {
            SLOTS_PER_DAY
        } else {
            (end_slot + SLOTS_PER_DAY - start_slot) % SLOTS_PER_DAY + 1
        };
        for i in 0..span.min(SLOTS_PER_DAY) {
            let label = clock::slot_label(start_slot + i);
            match mode {
                ForceMode::Discharge => {
                    doc.sell_rates.insert(label, DISCHARGE_SELL_DOLLARS);
                }
                ForceMode::Charge => {
                    doc.buy_rates.insert(label.clone(), 0.0);
                    doc.sell_rates.insert(label, 0.0);
                }
            }
        }
        doc
    }

    fn emit_state(&self, mode: ForceMode, active: bool, expires_at: Option<DateTime<Utc>>) {
        let event = match mode {
            ForceMode::Charge => Event::ForceChargeState { active, expires_at },
            ForceMode::Discharge => Event::ForceDischargeState { active, expires_at },
        };
        self.events.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::MockBatteryController;
    use crate::domain::{LiveStatus, PricePoint, PriceSnapshot, SiteInfo};
    use crate::prices::{PriceSource, SourceError};
    use crate::sync::scheduler::{SyncOptions, PRICE_CHANGE_THRESHOLD_CENTS};
    use crate::tariff::ModifierConfig;
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;

    struct NullSource;

    #[async_trait]
    impl PriceSource for NullSource {
        async fn current(&self) -> Result<PriceSnapshot, SourceError> {
            Err(SourceError::MissingData)
        }
        async fn forecast(&self, _horizon: i64) -> Result<Vec<PricePoint>, SourceError> {
            Err(SourceError::MissingData)
        }
        fn is_dynamic(&self) -> bool {
            false
        }
    }

    fn metadata() -> TariffMetadata {
        TariffMetadata {
            name: "Force".to_string(),
            utility: "Acme Energy".to_string(),
            code: "FORCE".to_string(),
            currency: "AUD".to_string(),
            daily_charge: 0.0,
            demand_charges: vec![],
        }
    }

    fn saved_doc() -> TariffDocument {
        TariffDocument::uniform(metadata(), 0.25, 0.08)
    }

    struct Calls {
        uploads: Vec<TariffDocument>,
        reserves: Vec<f64>,
        modes: Vec<OperationMode>,
    }

    struct Harness {
        manager: Arc<ForceModeManager>,
        store: Arc<StateStore>,
        overrides: Arc<OverrideFlags>,
        calls: Arc<PlMutex<Calls>>,
        _dir: tempfile::TempDir,
    }

    async fn harness(soc: f64) -> Harness {
        let calls = Arc::new(PlMutex::new(Calls {
            uploads: Vec::new(),
            reserves: Vec::new(),
            modes: Vec::new(),
        }));
        let mut mock = MockBatteryController::new();
        let sink = calls.clone();
        mock.expect_upload_tariff().returning(move |doc| {
            sink.lock().uploads.push(doc.clone());
            Ok(())
        });
        mock.expect_get_tariff().returning(|| Ok(Some(saved_doc())));
        mock.expect_get_site_info().returning(|| {
            Ok(SiteInfo {
                operation_mode: OperationMode::SelfConsumption,
                backup_reserve_percent: 20.0,
                export_rule: None,
                timezone: "UTC".to_string(),
            })
        });
        let sink = calls.clone();
        mock.expect_set_backup_reserve().returning(move |pct| {
            sink.lock().reserves.push(pct);
            Ok(())
        });
        let sink = calls.clone();
        mock.expect_set_operation_mode().returning(move |mode| {
            sink.lock().modes.push(mode);
            Ok(())
        });
        mock.expect_get_live_status().returning(move || {
            Ok(LiveStatus {
                battery_soc: soc,
                grid_power_w: 0.0,
                solar_power_w: 0.0,
                battery_power_w: 0.0,
                load_power_w: 500.0,
                captured_at: Utc::now(),
            })
        });

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("state.json")).await);
        let overrides = Arc::new(OverrideFlags::default());
        let facade = Arc::new(SiteFacade::new(Arc::new(mock)));
        let engine = Arc::new(SyncEngine::new(
            SyncOptions {
                auto_sync: true,
                settled_only: false,
                price_change_threshold_cents: PRICE_CHANGE_THRESHOLD_CENTS,
                forecast_horizon_minutes: 24 * 60,
                timezone: chrono_tz::UTC,
                metadata: metadata(),
                modifiers: ModifierConfig::default(),
                source_is_wholesale: false,
                demand_window: None,
                force_tariff_refresh: false,
            },
            Arc::new(NullSource),
            facade.clone(),
            overrides.clone(),
            EventBus::new(),
        ));
        let manager = Arc::new(ForceModeManager::new(
            facade,
            store.clone(),
            overrides.clone(),
            EventBus::new(),
            engine,
            false,
            chrono_tz::UTC,
            metadata(),
        ));
        Harness { manager, store, overrides, calls, _dir: dir }
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_discharge_activation_and_restore() {
        let h = harness(50.0).await;
        h.manager
            .force_discharge(Duration::from_secs(30 * 60))
            .await
            .unwrap();

        assert!(h.overrides.force_mode_active());
        assert!(h.store.contains(keys::FORCE_MODE_STATE).await);
        {
            let calls = h.calls.lock();
            assert_eq!(calls.reserves, vec![0.0]);
            assert_eq!(calls.modes, vec![OperationMode::Autonomous]);
            let doc = &calls.uploads[0];
            let now_slot = clock::slot_index_in_tz(Utc::now(), chrono_tz::UTC);
            assert_eq!(
                doc.sell_rate(&clock::slot_label(now_slot)),
                Some(DISCHARGE_SELL_DOLLARS)
            );
            assert_eq!(
                doc.sell_rate(&clock::slot_label(now_slot + 1)),
                Some(DISCHARGE_SELL_DOLLARS)
            );
            // Two slots past the window the saved sell rate survives
            assert_eq!(doc.sell_rate(&clock::slot_label(now_slot + 3)), Some(0.08));
            // Buy side untouched for a discharge
            assert_eq!(doc.buy_rate(&clock::slot_label(now_slot)), Some(0.25));
            doc.validate().unwrap();
        }

        h.manager.restore_normal().await.unwrap();
        assert!(!h.overrides.force_mode_active());
        assert!(!h.store.contains(keys::FORCE_MODE_STATE).await);
        let calls = h.calls.lock();
        // restore: self_consumption first, then the saved mode
        assert_eq!(
            calls.modes,
            vec![
                OperationMode::Autonomous,
                OperationMode::SelfConsumption,
                OperationMode::SelfConsumption
            ]
        );
        // reserve back to the saved 20%
        assert_eq!(calls.reserves, vec![0.0, 20.0]);
        // saved tariff re-uploaded
        assert_eq!(calls.uploads[1], saved_doc());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_charge_sets_full_reserve_and_free_buy() {
        let h = harness(50.0).await;
        h.manager
            .force_charge(Duration::from_secs(60 * 60))
            .await
            .unwrap();

        let calls = h.calls.lock();
        assert_eq!(calls.reserves, vec![100.0]);
        let doc = &calls.uploads[0];
        let now_slot = clock::slot_index_in_tz(Utc::now(), chrono_tz::UTC);
        assert_eq!(doc.buy_rate(&clock::slot_label(now_slot)), Some(0.0));
        assert_eq!(doc.sell_rate(&clock::slot_label(now_slot)), Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_keeps_original_snapshot() {
        let h = harness(50.0).await;
        h.manager.force_charge(Duration::from_secs(3600)).await.unwrap();
        h.manager.force_discharge(Duration::from_secs(3600)).await.unwrap();

        let state = h.manager.current_state().await.unwrap();
        assert_eq!(state.mode, ForceMode::Discharge);
        // Snapshot still reflects the pre-force state, not the override
        assert_eq!(state.saved_backup_reserve, 20.0);
        assert_eq!(state.saved_operation_mode, OperationMode::SelfConsumption);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_fires_restore() {
        let h = harness(50.0).await;
        h.manager.force_discharge(Duration::from_secs(2)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        // give the expiry task time to unwind everything
        for _ in 0..100 {
            if !h.store.contains(keys::FORCE_MODE_STATE).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!h.overrides.force_mode_active());
        assert!(!h.store.contains(keys::FORCE_MODE_STATE).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discharge_restore_below_reserve_leaves_zero() {
        let h = harness(10.0).await;
        h.manager.force_discharge(Duration::from_secs(3600)).await.unwrap();
        h.manager.restore_normal().await.unwrap();

        let calls = h.calls.lock();
        // only the activation write; the 20% restore was withheld
        assert_eq!(calls.reserves, vec![0.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_rearms_unexpired_state() {
        let h = harness(50.0).await;
        let persisted = ForceModeState {
            mode: ForceMode::Discharge,
            expires_at: Utc::now() + chrono::Duration::minutes(10),
            saved_tariff: Some(saved_doc()),
            saved_operation_mode: OperationMode::SelfConsumption,
            saved_backup_reserve: 20.0,
        };
        h.store.put(keys::FORCE_MODE_STATE, &persisted).await.unwrap();

        h.manager.restore_on_startup().await;
        assert!(h.overrides.force_mode_active());
        assert!(h.manager.current_state().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_clears_expired_state() {
        let h = harness(50.0).await;
        let persisted = ForceModeState {
            mode: ForceMode::Charge,
            expires_at: Utc::now() - chrono::Duration::minutes(10),
            saved_tariff: None,
            saved_operation_mode: OperationMode::SelfConsumption,
            saved_backup_reserve: 20.0,
        };
        h.store.put(keys::FORCE_MODE_STATE, &persisted).await.unwrap();

        h.manager.restore_on_startup().await;
        assert!(!h.overrides.force_mode_active());
        assert!(!h.store.contains(keys::FORCE_MODE_STATE).await);
        assert!(h.manager.current_state().await.is_none());
    }
}
