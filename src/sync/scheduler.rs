#![allow(dead_code)]
//! The four-stage sync state machine.
//!
//! Each 5-minute market interval gets at most four shots at an upload:
//! stage 1 (interval start, forecast only), stage 2 (stream push), stage
//! 3 (REST fallback at :35 when the stream stayed silent) and stage 4
//! (final REST poll at :60). Stages are short tasks that read state,
//! decide and exit; there is no long-lived coroutine to cancel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use super::{OverrideFlags, PeriodState};
use crate::battery::SiteFacade;
use crate::clock;
use crate::domain::{
    OperationMode, PriceChannel, PricePoint, PriceSnapshot, TariffMetadata,
};
use crate::events::{Event, EventBus};
use crate::prices::{stream::PriceStreamClient, PriceSource, SourceError};
use crate::tariff::{self, ModifierConfig, TransformInput};

/// Stage offsets into the interval, seconds.
const STAGE1_OFFSET: u64 = 0;
const STAGE3_OFFSET: u64 = 35;
const STAGE4_OFFSET: u64 = 60;

/// Below this per-channel delta an upload is suppressed.
pub const PRICE_CHANGE_THRESHOLD_CENTS: f64 = 0.5;

/// REST-vs-stream disagreement worth telling the operator about.
const DISCREPANCY_ALERT_CENTS: f64 = 5.0;
const DISCREPANCY_ALERT_COOLDOWN: chrono::Duration = chrono::Duration::minutes(30);

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub auto_sync: bool,
    /// Only settled prices drive uploads; stages 1 and 2 are skipped.
    pub settled_only: bool,
    pub price_change_threshold_cents: f64,
    pub forecast_horizon_minutes: i64,
    pub timezone: Tz,
    pub metadata: TariffMetadata,
    pub modifiers: ModifierConfig,
    pub source_is_wholesale: bool,
    /// `HH:MM` window during which grid charging is re-asserted off
    /// after every upload (some firmware silently re-enables it).
    pub demand_window: Option<(String, String)>,
    /// Briefly toggle the operation mode after upload so the battery
    /// re-reads the tariff.
    pub force_tariff_refresh: bool,
}

pub struct SyncEngine {
    options: SyncOptions,
    source: Arc<dyn PriceSource>,
    facade: Arc<SiteFacade>,
    overrides: Arc<OverrideFlags>,
    events: EventBus,
    state: Mutex<PeriodState>,
    last_discrepancy_alert: Mutex<Option<DateTime<Utc>>>,
}

impl SyncEngine {
    pub fn new(
        options: SyncOptions,
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
            state: Mutex::new(PeriodState::new(Utc::now())),
            last_discrepancy_alert: Mutex::new(None),
        }
    }

    /// Spawn the three timer loops, the stream subscription pump and the
    /// stream liveness probe.
    pub fn spawn(engine: Arc<SyncEngine>, stream: Arc<PriceStreamClient>) {
        for (offset, stage) in [(STAGE1_OFFSET, 1u8), (STAGE3_OFFSET, 3), (STAGE4_OFFSET, 4)] {
            let engine = engine.clone();
            tokio::spawn(async move {
                loop {
                    sleep_until_offset(offset).await;
                    match stage {
                        1 => engine.run_stage1().await,
                        3 => engine.run_stage3().await,
                        _ => engine.run_stage4().await,
                    }
                }
            });
        }

        // Stream pushes hop onto the event loop through a channel; the
        // subscriber callback itself must stay cheap.
        let (tx, mut rx) = mpsc::unbounded_channel::<PriceSnapshot>();
        stream.subscribe(Arc::new(move |snapshot| {
            let _ = tx.send(snapshot);
        }));
        {
            let engine = engine.clone();
            tokio::spawn(async move {
                while let Some(snapshot) = rx.recv().await {
                    engine.on_stream_price(snapshot).await;
                }
            });
        }

        tokio::spawn(async move {
            let mut probe = tokio::time::interval(Duration::from_secs(60));
            loop {
                probe.tick().await;
                stream.ensure_running();
            }
        });
        info!("sync scheduler started");
    }

    /// Stage 1: forecast-only transform and upload at interval start.
    pub async fn run_stage1(&self) {
        let mut state = self.state.lock().await;
        state.roll_if_needed(Utc::now());
        if state.stage1_done {
            debug!("stage 1 already done this period");
            return;
        }
        if self.options.settled_only {
            debug!("settled-only mode - stage 1 skipped");
            return;
        }
        if !self.should_sync() {
            return;
        }
        if self.sync_with(&mut state, None, "stage1").await {
            state.stage1_done = true;
        }
    }

    /// Stage 2: a streamed price arrived.
    pub async fn on_stream_price(&self, snapshot: PriceSnapshot) {
        let mut state = self.state.lock().await;
        state.roll_if_needed(Utc::now());
        state.websocket_received = true;

        if self.options.settled_only {
            debug!("settled-only mode - stage 2 skipped");
            return;
        }
        if !self.should_sync() {
            return;
        }
        if let Some(last) = state.last_synced {
            if !snapshot.differs_from(last, self.options.price_change_threshold_cents) {
                debug!(
                    import = snapshot.import.per_kwh_cents,
                    export = snapshot.export.per_kwh_cents,
                    "stage 2 suppressed - price unchanged"
                );
                return;
            }
        }
        if self.sync_with(&mut state, Some(&snapshot), "stage2").await {
            state.stage1_done = true;
        }
    }

    /// Stage 3: REST fallback when the stream stayed silent.
    pub async fn run_stage3(&self) {
        {
            let state = self.state.lock().await;
            if state.websocket_received && clock::period_start(Utc::now()) == state.period_start {
                debug!("stage 3 skipped - stream already delivered");
                return;
            }
        }
        self.rest_poll_stage("stage3").await;
    }

    /// Stage 4: final REST poll for the period.
    pub async fn run_stage4(&self) {
        self.rest_poll_stage("stage4").await;
    }

    /// Out-of-band full sync (service call and force-mode restore path).
    pub async fn sync_now(&self) -> bool {
        let mut state = self.state.lock().await;
        state.roll_if_needed(Utc::now());
        if !self.options.auto_sync || !self.source.is_dynamic() {
            return false;
        }
        let current = match self.source.current().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(error = %e, "sync_now proceeding without current interval");
                None
            }
        };
        let synced = self.sync_with(&mut state, current.as_ref(), "manual").await;
        if synced {
            state.stage1_done = true;
        }
        synced
    }

    async fn rest_poll_stage(&self, stage: &'static str) {
        let mut state = self.state.lock().await;
        state.roll_if_needed(Utc::now());
        if !self.should_sync() {
            return;
        }
        let snapshot = match self.source.current().await {
            Ok(snapshot) => snapshot,
            Err(SourceError::MissingData) => {
                debug!(stage, "no current price available");
                return;
            }
            Err(e) => {
                warn!(stage, error = %e, "current price poll failed");
                return;
            }
        };
        if state.websocket_received {
            self.check_discrepancy(&snapshot, state.last_synced).await;
        }
        if let Some(last) = state.last_synced {
            if !snapshot.differs_from(last, self.options.price_change_threshold_cents) {
                debug!(stage, "suppressed - price unchanged since last upload");
                return;
            }
        }
        if self.sync_with(&mut state, Some(&snapshot), stage).await {
            state.stage1_done = true;
        }
    }

    fn should_sync(&self) -> bool {
        if !self.options.auto_sync {
            debug!("auto sync disabled");
            return false;
        }
        if !self.source.is_dynamic() {
            debug!("static rate-card provider - nothing to sync");
            return false;
        }
        if self.overrides.force_mode_active() {
            debug!("force mode active - sync suppressed");
            return false;
        }
        if self.overrides.spike_mode_active() {
            debug!("spike mode active - sync suppressed");
            return false;
        }
        true
    }

    /// Transform and upload. Returns true on a successful upload; every
    /// failure is contained here so stages never poison each other.
    async fn sync_with(
        &self,
        state: &mut PeriodState,
        current: Option<&PriceSnapshot>,
        stage: &'static str,
    ) -> bool {
        let forecast = match self.forecast_for(state).await {
            Ok(points) => points,
            Err(SourceError::MissingData) => {
                warn!(stage, "forecast empty - stage skipped");
                return false;
            }
            Err(e) => {
                warn!(stage, error = %e, "forecast fetch failed");
                return false;
            }
        };

        let input = TransformInput {
            forecast: &forecast,
            current_interval: current,
            timezone: self.options.timezone,
            modifiers: &self.options.modifiers,
            metadata: self.options.metadata.clone(),
            source_is_wholesale: self.options.source_is_wholesale,
        };
        let doc = match tariff::build(input) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(stage, error = %e, "tariff construction failed");
                return false;
            }
        };

        match self.facade.upload_tariff(&doc).await {
            Ok(()) => {
                let now = Utc::now();
                let synced = match current {
                    Some(snapshot) => snapshot.cents_pair(),
                    None => current_slot_prices(&forecast, now).unwrap_or_else(|| {
                        let label = clock::slot_label(clock::slot_index_in_tz(
                            now,
                            self.options.timezone,
                        ));
                        (
                            doc.buy_rate(&label).unwrap_or(0.0) * 100.0,
                            -(doc.sell_rate(&label).unwrap_or(0.0) * 100.0),
                        )
                    }),
                };
                state.record_upload(synced, now);
                info!(stage, import = synced.0, export = synced.1, "tariff uploaded");
                self.events.emit(Event::TariffUpdated {
                    buy_cents: synced.0,
                    sell_cents: synced.1,
                    stage,
                });
                self.post_upload_actions().await;
                true
            }
            Err(e) => {
                error!(stage, error = %e, "tariff upload failed");
                false
            }
        }
    }

    async fn forecast_for(&self, state: &mut PeriodState) -> Result<Vec<PricePoint>, SourceError> {
        if let Some((fetched_at, points)) = &state.cached_forecast {
            if (Utc::now() - *fetched_at).num_seconds() < 240 {
                return Ok(points.clone());
            }
        }
        let mut points = self
            .source
            .forecast(self.options.forecast_horizon_minutes)
            .await?;
        if self.options.settled_only {
            match self.source.settled().await {
                Ok(settled) => points.extend(settled),
                Err(e) => warn!(error = %e, "settled price fetch failed"),
            }
        }
        state.cached_forecast = Some((Utc::now(), points.clone()));
        Ok(points)
    }

    /// Firmware quirk handling after a successful upload.
    async fn post_upload_actions(&self) {
        if let Some((start, end)) = &self.options.demand_window {
            if let (Some(s), Some(e)) = (clock::parse_slot(start), clock::parse_slot(end)) {
                let slot = clock::slot_index_in_tz(Utc::now(), self.options.timezone);
                if clock::slot_in_window(slot, s, e) {
                    if let Err(err) = self.facade.set_grid_charging(false).await {
                        warn!(error = %err, "failed to re-assert grid charging policy");
                    }
                }
            }
        }

        if self.options.force_tariff_refresh {
            if let Err(e) = self.toggle_operation_mode().await {
                warn!(error = %e, "tariff refresh toggle failed");
            }
        }
    }

    /// Self-consumption -> autonomous -> back, with read-back
    /// verification, so the firmware re-reads the tariff. Only fires
    /// when the pre-toggle state is self-consumption.
    async fn toggle_operation_mode(&self) -> anyhow::Result<()> {
        let info = self.facade.get_site_info().await?;
        if info.operation_mode != OperationMode::SelfConsumption {
            return Ok(());
        }
        let mut toggled = false;
        for attempt in 1..=3u32 {
            self.facade.set_operation_mode(OperationMode::Autonomous).await?;
            match self.facade.get_site_info().await {
                Ok(read_back) if read_back.operation_mode == OperationMode::Autonomous => {
                    toggled = true;
                    break;
                }
                Ok(_) => warn!(attempt, "mode toggle not yet visible"),
                Err(e) => warn!(attempt, error = %e, "mode toggle read-back failed"),
            }
        }
        if toggled {
            self.facade
                .set_operation_mode(OperationMode::SelfConsumption)
                .await?;
        }
        Ok(())
    }

    async fn check_discrepancy(&self, rest: &PriceSnapshot, last_synced: Option<(f64, f64)>) {
        let Some(last) = last_synced else { return };
        let delta = (rest.import.per_kwh_cents - last.0)
            .abs()
            .max((rest.export.per_kwh_cents - last.1).abs());
        if delta <= DISCREPANCY_ALERT_CENTS {
            return;
        }
        let mut alert_at = self.last_discrepancy_alert.lock().await;
        let now = Utc::now();
        if let Some(previous) = *alert_at {
            if now - previous < DISCREPANCY_ALERT_COOLDOWN {
                return;
            }
        }
        *alert_at = Some(now);
        warn!(
            delta_cents = delta,
            "REST price disagrees with streamed price well beyond threshold"
        );
    }
}

/// The prices the transformer used for the slot containing `now`:
/// highest precedence, latest start per channel.
fn current_slot_prices(forecast: &[PricePoint], now: DateTime<Utc>) -> Option<(f64, f64)> {
    let pick = |channel: PriceChannel| {
        forecast
            .iter()
            .filter(|p| p.channel == channel && p.start <= now && now < p.end)
            .max_by(|a, b| {
                (a.kind.precedence(), a.start).cmp(&(b.kind.precedence(), b.start))
            })
            .map(|p| p.per_kwh_cents)
    };
    Some((pick(PriceChannel::Import)?, pick(PriceChannel::Export)?))
}

async fn sleep_until_offset(offset_secs: u64) {
    let now = Utc::now();
    let target = clock::next_boundary(now) + chrono::Duration::seconds(offset_secs as i64);
    let wait = (target - now).num_milliseconds().max(0) as u64;
    tokio::time::sleep(Duration::from_millis(wait)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::{BatteryError, MockBatteryController};
    use crate::domain::{PriceKind, TariffDocument};
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;

    struct TestSource {
        import_cents: f64,
        export_cents: f64,
        current: PlMutex<Option<PriceSnapshot>>,
        dynamic: bool,
    }

    impl TestSource {
        fn new(import_cents: f64, export_cents: f64) -> Self {
            Self {
                import_cents,
                export_cents,
                current: PlMutex::new(None),
                dynamic: true,
            }
        }
    }

    fn snapshot_at(now: DateTime<Utc>, import_cents: f64, export_cents: f64) -> PriceSnapshot {
        let start = clock::period_start(now);
        let end = start + chrono::Duration::minutes(5);
        let point = |channel, cents| PricePoint {
            start,
            end,
            channel,
            per_kwh_cents: cents,
            kind: PriceKind::Current,
            wholesale_cents: None,
            region: None,
        };
        PriceSnapshot {
            import: point(PriceChannel::Import, import_cents),
            export: point(PriceChannel::Export, export_cents),
        }
    }

    #[async_trait]
    impl PriceSource for TestSource {
        async fn current(&self) -> Result<PriceSnapshot, SourceError> {
            self.current.lock().clone().ok_or(SourceError::MissingData)
        }

        async fn forecast(&self, horizon_minutes: i64) -> Result<Vec<PricePoint>, SourceError> {
            let start = Utc::now()
                .duration_trunc(chrono::Duration::minutes(30))
                .unwrap();
            let mut points = Vec::new();
            for i in 0..(horizon_minutes / 30).max(1) {
                let s = start + chrono::Duration::minutes(30 * i);
                let e = s + chrono::Duration::minutes(30);
                for (channel, cents) in [
                    (PriceChannel::Import, self.import_cents),
                    (PriceChannel::Export, self.export_cents),
                ] {
                    points.push(PricePoint {
                        start: s,
                        end: e,
                        channel,
                        per_kwh_cents: cents,
                        kind: PriceKind::Forecast,
                        wholesale_cents: None,
                        region: None,
                    });
                }
            }
            Ok(points)
        }

        fn is_dynamic(&self) -> bool {
            self.dynamic
        }
    }

    use chrono::DurationRound;

    fn options() -> SyncOptions {
        SyncOptions {
            auto_sync: true,
            settled_only: false,
            price_change_threshold_cents: PRICE_CHANGE_THRESHOLD_CENTS,
            forecast_horizon_minutes: 24 * 60,
            timezone: chrono_tz::UTC,
            metadata: TariffMetadata {
                name: "Dynamic Sync".to_string(),
                utility: "Acme Energy".to_string(),
                code: "DYN".to_string(),
                currency: "AUD".to_string(),
                daily_charge: 1.0,
                demand_charges: vec![],
            },
            modifiers: ModifierConfig::default(),
            source_is_wholesale: false,
            demand_window: None,
            force_tariff_refresh: false,
        }
    }

    fn engine_with_uploads(
        source: TestSource,
        options: SyncOptions,
    ) -> (Arc<SyncEngine>, Arc<PlMutex<Vec<TariffDocument>>>, Arc<OverrideFlags>) {
        let uploads: Arc<PlMutex<Vec<TariffDocument>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = uploads.clone();
        let mut mock = MockBatteryController::new();
        mock.expect_upload_tariff().returning(move |doc| {
            sink.lock().push(doc.clone());
            Ok(())
        });
        let overrides = Arc::new(OverrideFlags::default());
        let engine = Arc::new(SyncEngine::new(
            options,
            Arc::new(source),
            Arc::new(SiteFacade::new(Arc::new(mock))),
            overrides.clone(),
            EventBus::new(),
        ));
        (engine, uploads, overrides)
    }

    #[tokio::test]
    async fn test_stage1_uploads_then_small_move_suppressed() {
        let (engine, uploads, _) = engine_with_uploads(TestSource::new(25.0, -8.0), options());

        engine.run_stage1().await;
        assert_eq!(uploads.lock().len(), 1);
        let label = clock::slot_label(clock::slot_index_in_tz(Utc::now(), chrono_tz::UTC));
        assert_eq!(uploads.lock()[0].buy_rate(&label), Some(0.25));
        assert_eq!(uploads.lock()[0].sell_rate(&label), Some(0.08));

        // 0.3c / 0.2c deltas stay under the 0.5c gate
        engine
            .on_stream_price(snapshot_at(Utc::now(), 25.3, -8.2))
            .await;
        assert_eq!(uploads.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_stage2_triggered_by_large_move() {
        let (engine, uploads, _) = engine_with_uploads(TestSource::new(25.0, -8.0), options());

        engine.run_stage1().await;
        engine
            .on_stream_price(snapshot_at(Utc::now(), 27.0, -8.0))
            .await;
        let uploads = uploads.lock();
        assert_eq!(uploads.len(), 2);
        let label = clock::slot_label(clock::slot_index_in_tz(Utc::now(), chrono_tz::UTC));
        assert_eq!(uploads[1].buy_rate(&label), Some(0.27));
    }

    #[tokio::test]
    async fn test_stage1_runs_once_per_period() {
        let (engine, uploads, _) = engine_with_uploads(TestSource::new(25.0, -8.0), options());
        engine.run_stage1().await;
        engine.run_stage1().await;
        assert_eq!(uploads.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_force_mode_suppresses_uploads() {
        let (engine, uploads, overrides) =
            engine_with_uploads(TestSource::new(25.0, -8.0), options());
        overrides.set_force_mode(true);
        engine.run_stage1().await;
        engine
            .on_stream_price(snapshot_at(Utc::now(), 40.0, -8.0))
            .await;
        assert_eq!(uploads.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_static_source_never_syncs() {
        let mut source = TestSource::new(25.0, -8.0);
        source.dynamic = false;
        let (engine, uploads, _) = engine_with_uploads(source, options());
        engine.run_stage1().await;
        assert_eq!(uploads.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_settled_only_skips_stage1_and_2() {
        let mut opts = options();
        opts.settled_only = true;
        let (engine, uploads, _) = engine_with_uploads(TestSource::new(25.0, -8.0), opts);
        engine.run_stage1().await;
        engine
            .on_stream_price(snapshot_at(Utc::now(), 40.0, -8.0))
            .await;
        assert_eq!(uploads.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_stage3_polls_rest_when_stream_silent() {
        let source = TestSource::new(25.0, -8.0);
        *source.current.lock() = Some(snapshot_at(Utc::now(), 27.0, -8.0));
        let (engine, uploads, _) = engine_with_uploads(source, options());

        engine.run_stage1().await;
        engine.run_stage3().await;
        assert_eq!(uploads.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_stage3_skipped_after_stream_delivery() {
        let source = TestSource::new(25.0, -8.0);
        *source.current.lock() = Some(snapshot_at(Utc::now(), 40.0, -8.0));
        let (engine, uploads, _) = engine_with_uploads(source, options());

        engine.run_stage1().await;
        engine
            .on_stream_price(snapshot_at(Utc::now(), 27.0, -8.0))
            .await;
        assert_eq!(uploads.lock().len(), 2);
        engine.run_stage3().await;
        // websocket_received gates the REST fallback
        assert_eq!(uploads.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_upload_failure_contained() {
        let mut mock = MockBatteryController::new();
        mock.expect_upload_tariff()
            .returning(|_| Err(BatteryError::Client("HTTP 422".to_string())));
        let engine = SyncEngine::new(
            options(),
            Arc::new(TestSource::new(25.0, -8.0)),
            Arc::new(SiteFacade::new(Arc::new(mock))),
            Arc::new(OverrideFlags::default()),
            EventBus::new(),
        );
        engine.run_stage1().await;
        // A failed stage leaves the period open for the next stage
        assert!(!engine.state.lock().await.stage1_done);
    }

    #[test]
    fn test_current_slot_prices_prefers_precedence() {
        let now = Utc::now();
        let start = clock::period_start(now);
        let end = start + chrono::Duration::minutes(30);
        let mk = |channel, cents, kind| PricePoint {
            start,
            end,
            channel,
            per_kwh_cents: cents,
            kind,
            wholesale_cents: None,
            region: None,
        };
        let forecast = vec![
            mk(PriceChannel::Import, 20.0, PriceKind::Forecast),
            mk(PriceChannel::Import, 22.0, PriceKind::Settled),
            mk(PriceChannel::Export, -8.0, PriceKind::Forecast),
        ];
        assert_eq!(current_slot_prices(&forecast, now), Some((22.0, -8.0)));
    }
}
