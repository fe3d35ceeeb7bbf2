#![allow(dead_code)]
//! Mutating service endpoints: named operations the host platform (or
//! the mobile app) invokes. Thin wrappers over the managers.

use std::time::Duration;

use axum::{extract::State, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use super::error::ApiError;
use crate::app::AppState;
use crate::domain::{ExportRule, OperationMode};
use crate::events::Event;
use crate::inverter::CurtailMode;

/// Force-mode windows are bounded to keep a runaway request from
/// parking the battery in an override for days.
const MIN_FORCE_MINUTES: u64 = 1;
const MAX_FORCE_MINUTES: u64 = 24 * 60;

#[derive(Debug, Deserialize)]
pub struct DurationBody {
    pub duration_minutes: u64,
}

fn force_duration(body: &DurationBody) -> Result<Duration, ApiError> {
    if !(MIN_FORCE_MINUTES..=MAX_FORCE_MINUTES).contains(&body.duration_minutes) {
        return Err(ApiError::BadRequest(format!(
            "duration_minutes must be within {}..={}",
            MIN_FORCE_MINUTES, MAX_FORCE_MINUTES
        )));
    }
    Ok(Duration::from_secs(body.duration_minutes * 60))
}

pub async fn sync_now(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let uploaded = state.engine.sync_now().await;
    Ok(Json(json!({ "uploaded": uploaded })))
}

pub async fn force_charge(
    State(state): State<AppState>,
    Json(body): Json<DurationBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let duration = force_duration(&body)?;
    state.force.force_charge(duration).await?;
    Ok(Json(json!({ "status": "charging", "duration_minutes": body.duration_minutes })))
}

pub async fn force_discharge(
    State(state): State<AppState>,
    Json(body): Json<DurationBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let duration = force_duration(&body)?;
    state.force.force_discharge(duration).await?;
    Ok(Json(json!({ "status": "discharging", "duration_minutes": body.duration_minutes })))
}

pub async fn restore_normal(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.force.restore_normal().await?;
    Ok(Json(json!({ "status": "restored" })))
}

#[derive(Debug, Deserialize)]
pub struct ReserveBody {
    pub percent: f64,
}

pub async fn set_backup_reserve(
    State(state): State<AppState>,
    Json(body): Json<ReserveBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !(0.0..=100.0).contains(&body.percent) {
        return Err(ApiError::BadRequest("percent must be 0-100".to_string()));
    }
    state.facade.set_backup_reserve(body.percent).await?;
    Ok(Json(json!({ "backup_reserve_percent": body.percent })))
}

#[derive(Debug, Deserialize)]
pub struct ModeBody {
    pub mode: String,
}

pub async fn set_operation_mode(
    State(state): State<AppState>,
    Json(body): Json<ModeBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mode: OperationMode = body.mode.parse().map_err(ApiError::BadRequest)?;
    state.facade.set_operation_mode(mode).await?;
    Ok(Json(json!({ "operation_mode": mode })))
}

#[derive(Debug, Deserialize)]
pub struct ExportRuleBody {
    pub rule: String,
}

/// User-driven export rule write. Becomes the manual override the
/// curtailment controller treats as "normal".
pub async fn set_grid_export(
    State(state): State<AppState>,
    Json(body): Json<ExportRuleBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rule: ExportRule = body.rule.parse().map_err(ApiError::BadRequest)?;
    state.curtail.set_manual_override(Some(rule)).await?;
    let verified = state.facade.set_export_rule(rule).await?;
    Ok(Json(json!({ "export_rule": rule, "verified": verified })))
}

#[derive(Debug, Deserialize)]
pub struct GridChargingBody {
    pub enabled: bool,
}

pub async fn set_grid_charging(
    State(state): State<AppState>,
    Json(body): Json<GridChargingBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.facade.set_grid_charging(body.enabled).await?;
    Ok(Json(json!({ "grid_charging": body.enabled })))
}

#[derive(Debug, Deserialize)]
pub struct CurtailBody {
    pub mode: String,
}

pub async fn curtail_inverter(
    State(state): State<AppState>,
    Json(body): Json<CurtailBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mode: CurtailMode = body.mode.parse().map_err(ApiError::BadRequest)?;
    state.curtail.curtail_inverter(mode).await?;
    Ok(Json(json!({ "inverter": "curtailed", "mode": mode })))
}

pub async fn restore_inverter(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.curtail.restore_inverter().await?;
    Ok(Json(json!({ "inverter": "normal" })))
}

/// Capture a battery health reading into the store and signal the host.
pub async fn sync_battery_health(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let live = state.facade.get_live_status().await?;
    let reading = json!({
        "soc": live.battery_soc,
        "battery_power_w": live.battery_power_w,
        "captured_at": Utc::now(),
    });
    state
        .store
        .put(crate::store::keys::BATTERY_HEALTH, &reading)
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?;
    state.events.emit(Event::BatteryHealthUpdate { soc: live.battery_soc });
    Ok(Json(reading))
}
