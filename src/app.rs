#![allow(dead_code)]
//! Composition root: build every component from configuration and wire
//! the background tasks together.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::battery::{http::HttpBattery, rpc::RpcBattery, BatteryController, SiteFacade};
use crate::config::{BatterySystem, Config, ProviderKind};
use crate::curtail::{self, CurtailOptions, CurtailmentController};
use crate::events::EventBus;
use crate::force::ForceModeManager;
use crate::inverter::InverterController;
use crate::prices::rate_card::{RateCard, RateCardSource};
use crate::prices::retailer::RetailerSource;
use crate::prices::stream::{PriceStreamClient, StreamConfig, DEFAULT_MAX_AGE};
use crate::prices::wholesale::WholesaleSource;
use crate::prices::{static_token, PriceSource};
use crate::spike::{SpikeManager, SpikeOptions};
use crate::store::StateStore;
use crate::sync::{OverrideFlags, SyncEngine};
use crate::sync::scheduler::SyncOptions;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub facade: Arc<SiteFacade>,
    pub source: Arc<dyn PriceSource>,
    pub stream: Option<Arc<PriceStreamClient>>,
    pub engine: Arc<SyncEngine>,
    pub spike: Option<Arc<SpikeManager>>,
    pub force: Arc<ForceModeManager>,
    pub curtail: Arc<CurtailmentController>,
    pub store: Arc<StateStore>,
    pub events: EventBus,
    pub overrides: Arc<OverrideFlags>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        let tz = config.site.tz()?;
        let events = EventBus::new();
        let overrides = Arc::new(OverrideFlags::default());

        if let Some(parent) = config.store.path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let store = Arc::new(StateStore::open(config.store.path.clone()).await);

        let source = build_source(&config, tz)?;
        let controller = build_battery(&config).await?;
        let facade = Arc::new(SiteFacade::new(controller));

        let stream = build_stream(&config);

        let engine = Arc::new(SyncEngine::new(
            SyncOptions {
                auto_sync: config.sync.auto_sync,
                settled_only: config.sync.settled_only,
                price_change_threshold_cents: config.sync.price_change_threshold_cents,
                forecast_horizon_minutes: config.sync.forecast_horizon_minutes,
                timezone: tz,
                metadata: config.tariff_metadata(),
                modifiers: config.sync.modifiers.clone(),
                source_is_wholesale: config.provider.kind == ProviderKind::Wholesale,
                demand_window: config
                    .sync
                    .demand_window_start
                    .clone()
                    .zip(config.sync.demand_window_end.clone()),
                force_tariff_refresh: config.sync.force_tariff_refresh,
            },
            source.clone(),
            facade.clone(),
            overrides.clone(),
            events.clone(),
        ));

        let spike = if config.spike.enabled {
            let wholesale: Arc<dyn PriceSource> = Arc::new(
                WholesaleSource::new(
                    config.spike.wholesale_url.clone(),
                    config.spike.region.clone(),
                )
                .map_err(|e| anyhow::anyhow!("wholesale source: {}", e))?,
            );
            Some(Arc::new(SpikeManager::new(
                SpikeOptions {
                    region: config.spike.region.clone(),
                    threshold_cents: config.spike.threshold_dollars_per_mwh / 10.0,
                    poll_interval: Duration::from_secs(60),
                    window_slots: config.spike.window_slots,
                    timezone: tz,
                    metadata: config.tariff_metadata(),
                },
                wholesale,
                facade.clone(),
                overrides.clone(),
                events.clone(),
            )))
        } else {
            None
        };

        let force = Arc::new(ForceModeManager::new(
            facade.clone(),
            store.clone(),
            overrides.clone(),
            events.clone(),
            engine.clone(),
            source.is_dynamic(),
            tz,
            config.tariff_metadata(),
        ));

        let inverter = build_inverter(&config).await?;
        let curtail = Arc::new(CurtailmentController::new(
            CurtailOptions {
                restore_soc: config.curtailment.restore_soc,
                reassert_interval: Duration::from_secs(config.curtailment.reassert_secs),
            },
            facade.clone(),
            inverter,
            store.clone(),
            events.clone(),
        ));

        Ok(Self {
            config,
            facade,
            source,
            stream,
            engine,
            spike,
            force,
            curtail,
            store,
            events,
            overrides,
        })
    }

    /// Start every background task. Call once after construction.
    pub async fn spawn_tasks(&self) {
        self.curtail.load_persisted().await;
        self.force.restore_on_startup().await;

        if let Some(stream) = &self.stream {
            stream.start();

            if self.curtailment_enabled() {
                // Streamed prices also drive curtailment re-evaluation.
                let curtail = self.curtail.clone();
                let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
                stream.subscribe(Arc::new(move |snapshot| {
                    let _ = tx.send(snapshot);
                }));
                tokio::spawn(async move {
                    while let Some(snapshot) = rx.recv().await {
                        curtail
                            .evaluate(
                                snapshot.import.per_kwh_cents,
                                snapshot.export.export_earnings_cents(),
                            )
                            .await;
                    }
                });
            }

            SyncEngine::spawn(self.engine.clone(), stream.clone());
        }

        if self.curtailment_enabled() {
            match &self.stream {
                Some(stream) => {
                    let stream = stream.clone();
                    curtail::spawn(self.curtail.clone(), move || {
                        stream.latest(DEFAULT_MAX_AGE).map(|s| {
                            (s.import.per_kwh_cents, s.export.export_earnings_cents())
                        })
                    });
                }
                None => curtail::spawn(self.curtail.clone(), || None),
            }
        }

        if let Some(spike) = &self.spike {
            SpikeManager::spawn(spike.clone());
        }
        ForceModeManager::spawn_reversion_watch(self.force.clone());
        info!("background tasks started");
    }

    fn curtailment_enabled(&self) -> bool {
        self.config.curtailment.enabled
    }
}

fn build_source(config: &Config, tz: chrono_tz::Tz) -> Result<Arc<dyn PriceSource>> {
    let source: Arc<dyn PriceSource> = match config.provider.kind {
        ProviderKind::Retailer => Arc::new(
            RetailerSource::new(
                config.provider.base_url.clone(),
                config.provider.site_id.clone().unwrap_or_default(),
                static_token(config.provider.api_token.clone().unwrap_or_default()),
                config.provider.forecast_class,
            )
            .map_err(|e| anyhow::anyhow!("retailer source: {}", e))?,
        ),
        ProviderKind::Wholesale => Arc::new(
            WholesaleSource::new(
                config.provider.base_url.clone(),
                config.provider.region.clone().unwrap_or_default(),
            )
            .map_err(|e| anyhow::anyhow!("wholesale source: {}", e))?,
        ),
        ProviderKind::RateCard => {
            let preset = config.provider.rate_card_preset.as_deref().unwrap_or("flat_rate");
            let card = RateCard::preset(preset)
                .with_context(|| format!("unknown rate card preset {}", preset))?;
            Arc::new(RateCardSource::new(card, tz))
        }
    };
    Ok(source)
}

async fn build_battery(config: &Config) -> Result<Arc<dyn BatteryController>> {
    let token = static_token(config.battery.api_token.clone().unwrap_or_default());
    let controller: Arc<dyn BatteryController> = match config.battery.system {
        BatterySystem::Http => Arc::new(
            HttpBattery::new(config.battery.base_url.clone(), config.battery.site_id.clone(), token)
                .map_err(|e| anyhow::anyhow!("battery http transport: {}", e))?,
        ),
        BatterySystem::Rpc => Arc::new(
            RpcBattery::new(config.battery.base_url.clone(), config.battery.site_id.clone(), token)
                .map_err(|e| anyhow::anyhow!("battery rpc transport: {}", e))?,
        ),
        BatterySystem::Modbus => {
            #[cfg(feature = "modbus")]
            {
                let addr = config
                    .battery
                    .gateway_addr
                    .as_deref()
                    .context("modbus battery needs gateway_addr")?;
                Arc::new(
                    crate::battery::modbus::ModbusBattery::new(
                        addr,
                        config.battery.unit_id,
                        config.site.timezone.clone(),
                    )
                    .await
                    .map_err(|e| anyhow::anyhow!("battery modbus transport: {}", e))?,
                )
            }
            #[cfg(not(feature = "modbus"))]
            {
                anyhow::bail!("built without modbus support; enable the `modbus` feature")
            }
        }
    };
    Ok(controller)
}

fn build_stream(config: &Config) -> Option<Arc<PriceStreamClient>> {
    let url = config.provider.stream_url.clone()?;
    if config.provider.kind != ProviderKind::Retailer {
        return None;
    }
    let token = static_token(config.provider.api_token.clone().unwrap_or_default());
    let site_id = config.provider.site_id.clone().unwrap_or_default();
    Some(Arc::new(PriceStreamClient::new(StreamConfig::new(
        url, site_id, token,
    ))))
}

async fn build_inverter(config: &Config) -> Result<Option<Arc<dyn InverterController>>> {
    if !config.curtailment.enabled {
        return Ok(None);
    }
    let (Some(brand), Some(addr)) = (
        config.curtailment.inverter_brand.as_deref(),
        config.curtailment.inverter_addr.as_deref(),
    ) else {
        return Ok(None);
    };
    #[cfg(feature = "modbus")]
    {
        let controller =
            crate::inverter::for_brand(brand, addr, config.curtailment.inverter_unit_id)
                .await
                .map_err(|e| anyhow::anyhow!("inverter: {}", e))?;
        Ok(Some(controller))
    }
    #[cfg(not(feature = "modbus"))]
    {
        let _ = (brand, addr);
        anyhow::bail!("inverter curtailment requires the `modbus` feature")
    }
}
