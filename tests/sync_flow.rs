//! End-to-end sync flow against mocked provider and battery APIs: the
//! retailer serves a forecast, stage 1 uploads a tariff, and a streamed
//! price either re-uploads or is suppressed by the delta gate.

use std::sync::Arc;

use chrono::{DurationRound, Utc};
use serde_json::json;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gridsync::battery::{http::HttpBattery, SiteFacade};
use gridsync::clock;
use gridsync::domain::{PriceChannel, PriceKind, PricePoint, PriceSnapshot, TariffMetadata};
use gridsync::events::EventBus;
use gridsync::prices::retailer::{ForecastClass, RetailerSource};
use gridsync::prices::{static_token, PriceSource};
use gridsync::sync::scheduler::{SyncEngine, SyncOptions, PRICE_CHANGE_THRESHOLD_CENTS};
use gridsync::sync::OverrideFlags;
use gridsync::tariff::ModifierConfig;

fn forecast_body(import_cents: f64, export_cents: f64) -> serde_json::Value {
    let start = Utc::now()
        .duration_trunc(chrono::Duration::minutes(30))
        .unwrap();
    let mut records = Vec::new();
    for i in 0..48 {
        let s = start + chrono::Duration::minutes(30 * i);
        let e = s + chrono::Duration::minutes(30);
        for (channel, cents) in [("general", import_cents), ("feedIn", export_cents)] {
            records.push(json!({
                "type": "ForecastInterval",
                "perKwh": cents,
                "channelType": channel,
                "startTime": s.to_rfc3339(),
                "endTime": e.to_rfc3339(),
            }));
        }
    }
    serde_json::Value::Array(records)
}

fn snapshot(import_cents: f64, export_cents: f64) -> PriceSnapshot {
    let start = clock::period_start(Utc::now());
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

async fn engine(provider: &MockServer, battery: &MockServer) -> SyncEngine {
    let source = RetailerSource::new(
        provider.uri(),
        "SITE1",
        static_token("psk_integration_test"),
        ForecastClass::Predicted,
    )
    .unwrap();
    let controller =
        HttpBattery::new(battery.uri(), "1234567890123456", static_token("tok")).unwrap();

    SyncEngine::new(
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
        },
        Arc::new(source) as Arc<dyn PriceSource>,
        Arc::new(SiteFacade::new(Arc::new(controller))),
        Arc::new(OverrideFlags::default()),
        EventBus::new(),
    )
}

#[tokio::test]
async fn stage1_uploads_and_small_stream_move_is_suppressed() {
    let provider = MockServer::start().await;
    let battery = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/sites/SITE1/prices/forecast"))
        .respond_with(ResponseTemplate::new(200).set_body_json(forecast_body(25.0, -8.0)))
        .mount(&provider)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/api/1/energy_sites/\d+/tariff$"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"response": {"result": true}})),
        )
        .expect(1)
        .mount(&battery)
        .await;

    let engine = engine(&provider, &battery).await;
    engine.run_stage1().await;

    // 0.3c / 0.2c: under the threshold, no second upload
    engine.on_stream_price(snapshot(25.3, -8.2)).await;
    // expectations checked when `battery` drops
}

#[tokio::test]
async fn large_stream_move_triggers_second_upload() {
    let provider = MockServer::start().await;
    let battery = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/sites/SITE1/prices/forecast"))
        .respond_with(ResponseTemplate::new(200).set_body_json(forecast_body(25.0, -8.0)))
        .mount(&provider)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/api/1/energy_sites/\d+/tariff$"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"response": {"result": true}})),
        )
        .expect(2)
        .mount(&battery)
        .await;

    let engine = engine(&provider, &battery).await;
    engine.run_stage1().await;
    engine.on_stream_price(snapshot(27.0, -8.0)).await;
}

#[tokio::test]
async fn provider_outage_skips_the_stage_without_uploading() {
    let provider = MockServer::start().await;
    let battery = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&provider)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": {}})))
        .expect(0)
        .mount(&battery)
        .await;

    let engine = engine(&provider, &battery).await;
    engine.run_stage1().await;
}
