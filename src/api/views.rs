#![allow(dead_code)]
//! Read-only JSON views: shallow read-through to in-memory state.

use axum::{extract::State, Json};
use serde::Serialize;
use serde_json::json;

use super::error::ApiError;
use crate::app::AppState;
use crate::domain::{ExportRule, LiveStatus};
use crate::prices::stream::DEFAULT_MAX_AGE;

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub live: LiveStatus,
    pub force_mode: Option<crate::force::ForceModeState>,
    pub spike_active: bool,
    pub export_rule: Option<ExportRule>,
    pub sync_suppressed: bool,
}

pub async fn get_status(State(state): State<AppState>) -> Result<Json<SystemStatus>, ApiError> {
    let live = state.facade.get_live_status().await?;
    let force_mode = state.force.current_state().await;
    Ok(Json(SystemStatus {
        live,
        force_mode,
        spike_active: state.overrides.spike_mode_active(),
        export_rule: state.curtail.cached_rule().await,
        sync_suppressed: state.overrides.any_active(),
    }))
}

/// The current-interval price as the controller sees it: stream cache
/// first, REST fallback.
pub async fn get_tariff_price(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(stream) = &state.stream {
        if let Some(snapshot) = stream.latest(DEFAULT_MAX_AGE) {
            return Ok(Json(json!({ "source": "stream", "prices": snapshot })));
        }
    }
    match state.source.current().await {
        Ok(snapshot) => Ok(Json(json!({ "source": "rest", "prices": snapshot }))),
        Err(e) => Err(ApiError::ServiceUnavailable(e.to_string())),
    }
}

pub async fn get_stream_health(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match &state.stream {
        Some(stream) => Ok(Json(serde_json::to_value(stream.health()).unwrap_or_default())),
        None => Err(ApiError::NotFound("no stream client configured".to_string())),
    }
}

pub async fn get_inverter_status(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (inverter_state, limit) = state.curtail.inverter_status().await;
    Ok(Json(json!({
        "state": inverter_state,
        "power_limit_w": limit,
    })))
}

/// Provider configuration with credentials elided.
pub async fn get_provider_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    let provider = &state.config.provider;
    Json(json!({
        "kind": provider.kind,
        "base_url": provider.base_url,
        "region": provider.region,
        "forecast_class": provider.forecast_class,
        "rate_card_preset": provider.rate_card_preset,
        "stream_enabled": provider.stream_url.is_some(),
    }))
}

/// Battery site settings, read through to the facade.
pub async fn get_settings(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let info = state.facade.get_site_info().await?;
    Ok(Json(json!({
        "operation_mode": info.operation_mode,
        "backup_reserve_percent": info.backup_reserve_percent,
        "export_rule": info.export_rule,
        "timezone": info.timezone,
        "auto_sync": state.config.sync.auto_sync,
        "settled_only": state.config.sync.settled_only,
    })))
}

/// Stored battery health readings.
pub async fn get_battery_health(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stored = state
        .store
        .get::<serde_json::Value>(crate::store::keys::BATTERY_HEALTH)
        .await;
    Ok(Json(stored.unwrap_or(serde_json::Value::Null)))
}
