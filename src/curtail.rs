#![allow(dead_code)]
//! Solar curtailment controller.
//!
//! Every five minutes (offset :01, plus on every streamed price update)
//! it weighs live plant telemetry against the current export price and
//! commands two independent levers: the battery's export rule and the
//! AC-coupled inverter's output. While the inverter is curtailed in
//! load-following mode the power target is recomputed on a 30 s cadence.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::battery::SiteFacade;
use crate::domain::{ExportRule, LiveStatus};
use crate::events::{Event, EventBus};
use crate::inverter::{CurtailMode, InverterController, InverterState};
use crate::store::{keys, StateStore};

/// Minimum earnings (cents/kWh) before the battery rule is restored.
const MIN_EARNINGS_CENTS: f64 = 1.0;

/// SoC above which a charging battery no longer excuses negative-price
/// export.
const CHARGE_HEADROOM_SOC: f64 = 90.0;

/// Reissue the load-following limit when it moves by more than this.
const LIMIT_DELTA_W: f64 = 50.0;

#[derive(Debug, Clone)]
pub struct CurtailOptions {
    /// Below this SoC the inverter is never curtailed.
    pub restore_soc: f64,
    /// Brands that silently drop an unrefreshed limit get it re-issued
    /// at this interval even when unchanged.
    pub reassert_interval: Duration,
}

impl Default for CurtailOptions {
    fn default() -> Self {
        Self {
            restore_soc: 30.0,
            reassert_interval: Duration::from_secs(45),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Runtime {
    cached_rule: Option<ExportRule>,
    manual_override: Option<ExportRule>,
    inverter_state: Option<InverterState>,
    inverter_mode: Option<CurtailMode>,
    last_issued_limit_w: Option<f64>,
    last_issue_at: Option<DateTime<Utc>>,
}

pub struct CurtailmentController {
    options: CurtailOptions,
    facade: Arc<SiteFacade>,
    inverter: Option<Arc<dyn InverterController>>,
    store: Arc<StateStore>,
    events: EventBus,
    state: Mutex<Runtime>,
}

/// DC-coupled predicate: curtail when the battery is full and the plant
/// exports, or when nothing is charging and export runs at a loss. A
/// battery actively absorbing solar with no export means leave it alone.
pub fn should_curtail_dc(live: &LiveStatus, export_earnings_cents: f64) -> bool {
    if live.is_battery_full() && live.is_exporting() {
        return true;
    }
    if !live.is_battery_charging() && live.is_exporting() && export_earnings_cents < 0.0 {
        return true;
    }
    false
}

/// AC-coupled predicate, richer than the battery one.
pub fn should_curtail_ac(
    live: &LiveStatus,
    import_cents: f64,
    export_earnings_cents: f64,
    restore_soc: f64,
) -> bool {
    // Negative import price: soak up everything the grid will pay us to
    // take, which means no homegrown generation.
    if import_cents < 0.0 {
        return true;
    }
    if !live.is_exporting() {
        return false;
    }
    if live.battery_soc < restore_soc {
        return false;
    }
    if export_earnings_cents < 0.0 {
        // A charging battery with headroom may keep filling; the brief
        // negative-price export is acceptable.
        if live.is_battery_charging() && live.battery_soc < CHARGE_HEADROOM_SOC {
            return false;
        }
        if live.is_battery_full() || !live.is_battery_charging() {
            return true;
        }
    }
    false
}

/// Inverter output while curtailed in load-following mode.
pub fn load_following_limit_w(live: &LiveStatus) -> f64 {
    live.load_power_w + live.battery_charge_rate_w()
}

impl CurtailmentController {
    pub fn new(
        options: CurtailOptions,
        facade: Arc<SiteFacade>,
        inverter: Option<Arc<dyn InverterController>>,
        store: Arc<StateStore>,
        events: EventBus,
    ) -> Self {
        Self {
            options,
            facade,
            inverter,
            store,
            events,
            state: Mutex::new(Runtime::default()),
        }
    }

    /// Pull persisted state so a restart resumes with knowledge of what
    /// was last commanded.
    pub async fn load_persisted(&self) {
        let mut state = self.state.lock().await;
        state.cached_rule = self.store.get::<ExportRule>(keys::CACHED_EXPORT_RULE).await;
        state.manual_override = self
            .store
            .get::<ExportRule>(keys::MANUAL_EXPORT_OVERRIDE)
            .await;
        state.inverter_state = self
            .store
            .get::<InverterState>(keys::INVERTER_LAST_STATE)
            .await;
        state.last_issued_limit_w = self.store.get::<f64>(keys::INVERTER_POWER_LIMIT_W).await;
        debug!(
            cached_rule = ?state.cached_rule,
            inverter_state = ?state.inverter_state,
            "curtailment state loaded"
        );
    }

    /// One full evaluation: battery export rule plus inverter.
    pub async fn evaluate(&self, import_cents: f64, export_earnings_cents: f64) {
        let live = match self.facade.get_live_status().await {
            Ok(live) => live,
            Err(e) => {
                warn!(error = %e, "live status unavailable - curtailment skipped");
                return;
            }
        };
        let mut state = self.state.lock().await;
        self.evaluate_battery_rule(&mut state, &live, export_earnings_cents).await;
        self.evaluate_inverter(&mut state, &live, import_cents, export_earnings_cents)
            .await;
    }

    async fn evaluate_battery_rule(
        &self,
        state: &mut Runtime,
        live: &LiveStatus,
        export_earnings_cents: f64,
    ) {
        if should_curtail_dc(live, export_earnings_cents) {
            if state.cached_rule != Some(ExportRule::Never)
                || self.facade.export_rule_needs_write(ExportRule::Never, state.cached_rule)
            {
                info!(
                    soc = live.battery_soc,
                    earnings = export_earnings_cents,
                    "curtailing battery export"
                );
                self.write_rule(state, ExportRule::Never).await;
            }
            return;
        }

        if export_earnings_cents >= MIN_EARNINGS_CENTS
            && state.cached_rule == Some(ExportRule::Never)
        {
            let target = state.manual_override.unwrap_or(ExportRule::BatteryOk);
            info!(earnings = export_earnings_cents, rule = %target, "restoring battery export");
            self.write_rule(state, target).await;
        }
    }

    async fn write_rule(&self, state: &mut Runtime, rule: ExportRule) {
        match self.facade.set_export_rule(rule).await {
            Ok(verified) => {
                state.cached_rule = Some(rule);
                if let Err(e) = self.store.put(keys::CACHED_EXPORT_RULE, &rule).await {
                    warn!(error = %e, "could not persist export rule cache");
                }
                if !verified {
                    debug!(%rule, "export rule write is unverified");
                }
                self.emit_update(state);
            }
            Err(e) => error!(error = %e, %rule, "export rule write failed"),
        }
    }

    async fn evaluate_inverter(
        &self,
        state: &mut Runtime,
        live: &LiveStatus,
        import_cents: f64,
        export_earnings_cents: f64,
    ) {
        let Some(inverter) = self.inverter.clone() else { return };
        let wants_curtail = should_curtail_ac(
            live,
            import_cents,
            export_earnings_cents,
            self.options.restore_soc,
        );

        match (state.inverter_state.unwrap_or(InverterState::Normal), wants_curtail) {
            (InverterState::Normal, true) => {
                // A battery that can still absorb keeps the panels alive
                // at load-following output; otherwise shut production off.
                let mode = if live.is_battery_charging() && !live.is_battery_full() {
                    CurtailMode::LoadFollowing
                } else {
                    CurtailMode::Shutdown
                };
                self.apply_curtail(state, &inverter, mode, live).await;
            }
            (InverterState::Curtailed, false) => {
                self.apply_restore(state, &inverter).await;
            }
            (InverterState::Curtailed, true) => {
                if state.inverter_mode == Some(CurtailMode::LoadFollowing) {
                    self.refresh_limit(state, &inverter, live).await;
                }
            }
            (InverterState::Normal, false) => {}
        }
    }

    /// Manual service entry: curtail regardless of the predicate.
    pub async fn curtail_inverter(&self, mode: CurtailMode) -> anyhow::Result<()> {
        let Some(inverter) = self.inverter.clone() else {
            anyhow::bail!("no inverter controller configured");
        };
        let live = self.facade.get_live_status().await?;
        let mut state = self.state.lock().await;
        self.apply_curtail(&mut state, &inverter, mode, &live).await;
        Ok(())
    }

    /// Manual service entry: resume normal production.
    pub async fn restore_inverter(&self) -> anyhow::Result<()> {
        let Some(inverter) = self.inverter.clone() else {
            anyhow::bail!("no inverter controller configured");
        };
        let mut state = self.state.lock().await;
        self.apply_restore(&mut state, &inverter).await;
        Ok(())
    }

    /// User-chosen export rule; suppresses automatic restore to
    /// `battery_ok`. `None` clears the override.
    pub async fn set_manual_override(&self, rule: Option<ExportRule>) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.manual_override = rule;
        match rule {
            Some(rule) => self.store.put(keys::MANUAL_EXPORT_OVERRIDE, &rule).await?,
            None => self.store.remove(keys::MANUAL_EXPORT_OVERRIDE).await?,
        }
        Ok(())
    }

    pub async fn cached_rule(&self) -> Option<ExportRule> {
        self.state.lock().await.cached_rule
    }

    pub async fn inverter_status(&self) -> (Option<InverterState>, Option<f64>) {
        let state = self.state.lock().await;
        (state.inverter_state, state.last_issued_limit_w)
    }

    /// 30-second cadence while curtailed in load-following mode.
    pub async fn refresh_load_following(&self) {
        let (curtailed, mode) = {
            let state = self.state.lock().await;
            (state.inverter_state == Some(InverterState::Curtailed), state.inverter_mode)
        };
        if !curtailed || mode != Some(CurtailMode::LoadFollowing) {
            return;
        }
        let Some(inverter) = self.inverter.clone() else { return };
        let live = match self.facade.get_live_status().await {
            Ok(live) => live,
            Err(e) => {
                warn!(error = %e, "live status unavailable - keeping last limit");
                return;
            }
        };
        let mut state = self.state.lock().await;
        self.refresh_limit(&mut state, &inverter, &live).await;
    }

    async fn apply_curtail(
        &self,
        state: &mut Runtime,
        inverter: &Arc<dyn InverterController>,
        mode: CurtailMode,
        live: &LiveStatus,
    ) {
        let result = match mode {
            CurtailMode::Shutdown => {
                info!("curtailing inverter: shutdown");
                inverter.shutdown().await.map(|_| None)
            }
            CurtailMode::LoadFollowing => {
                let limit = load_following_limit_w(live);
                info!(limit_w = limit, "curtailing inverter: load-following");
                inverter.set_power_limit(limit).await.map(|_| Some(limit))
            }
        };
        match result {
            Ok(limit) => {
                state.inverter_state = Some(InverterState::Curtailed);
                state.inverter_mode = Some(mode);
                state.last_issued_limit_w = limit;
                state.last_issue_at = Some(Utc::now());
                self.persist_inverter(state).await;
                self.emit_update(state);
            }
            Err(e) => error!(error = %e, "inverter curtail command failed"),
        }
    }

    async fn apply_restore(&self, state: &mut Runtime, inverter: &Arc<dyn InverterController>) {
        match inverter.restore().await {
            Ok(()) => {
                info!("inverter restored to normal production");
                state.inverter_state = Some(InverterState::Normal);
                state.inverter_mode = None;
                state.last_issued_limit_w = None;
                state.last_issue_at = None;
                self.persist_inverter(state).await;
                self.emit_update(state);
            }
            Err(e) => error!(error = %e, "inverter restore failed"),
        }
    }

    async fn refresh_limit(
        &self,
        state: &mut Runtime,
        inverter: &Arc<dyn InverterController>,
        live: &LiveStatus,
    ) {
        let target = load_following_limit_w(live);
        let moved_enough = state
            .last_issued_limit_w
            .map(|last| (target - last).abs() > LIMIT_DELTA_W)
            .unwrap_or(true);
        let reassert_due = inverter.requires_periodic_reassertion()
            && state
                .last_issue_at
                .map(|at| Utc::now() - at >= chrono::Duration::from_std(self.options.reassert_interval).unwrap_or_else(|_| chrono::Duration::seconds(45)))
                .unwrap_or(true);
        if !moved_enough && !reassert_due {
            return;
        }
        match inverter.set_power_limit(target).await {
            Ok(()) => {
                debug!(limit_w = target, "load-following limit issued");
                state.last_issued_limit_w = Some(target);
                state.last_issue_at = Some(Utc::now());
                if let Err(e) = self.store.put(keys::INVERTER_POWER_LIMIT_W, &target).await {
                    warn!(error = %e, "could not persist inverter limit");
                }
            }
            Err(e) => error!(error = %e, "load-following limit write failed"),
        }
    }

    async fn persist_inverter(&self, state: &Runtime) {
        if let Some(inverter_state) = state.inverter_state {
            if let Err(e) = self.store.put(keys::INVERTER_LAST_STATE, &inverter_state).await {
                warn!(error = %e, "could not persist inverter state");
            }
        }
        match state.last_issued_limit_w {
            Some(limit) => {
                if let Err(e) = self.store.put(keys::INVERTER_POWER_LIMIT_W, &limit).await {
                    warn!(error = %e, "could not persist inverter limit");
                }
            }
            None => {
                self.store.remove(keys::INVERTER_POWER_LIMIT_W).await.ok();
            }
        }
    }

    fn emit_update(&self, state: &Runtime) {
        self.events.emit(Event::CurtailmentUpdated {
            export_rule: state.cached_rule.unwrap_or(ExportRule::BatteryOk),
            inverter_curtailed: state.inverter_state == Some(InverterState::Curtailed),
            power_limit_w: state.last_issued_limit_w,
        });
    }
}

/// Spawn the periodic evaluator (5 minutes, offset :01) and the 30 s
/// load-following refresh loop.
pub fn spawn(
    controller: Arc<CurtailmentController>,
    prices: impl Fn() -> Option<(f64, f64)> + Send + Sync + 'static,
) {
    let refresh = controller.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            refresh.refresh_load_following().await;
        }
    });

    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let target = crate::clock::next_boundary(now) + chrono::Duration::seconds(1);
            let wait = (target - now).num_milliseconds().max(0) as u64;
            tokio::time::sleep(Duration::from_millis(wait)).await;
            match prices() {
                Some((import_cents, export_earnings_cents)) => {
                    controller.evaluate(import_cents, export_earnings_cents).await;
                }
                None => debug!("no current price - curtailment evaluation skipped"),
            }
        }
    });
}
