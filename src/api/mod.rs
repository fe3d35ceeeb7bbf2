pub mod error;
pub mod services;
pub mod views;

use axum::{
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::app::AppState;
use crate::auth::{require_bearer, ApiToken};
use crate::config::Config;

pub fn router(state: AppState, cfg: &Config) -> Router {
    let mut app = Router::new()
        .nest("/api/v1", v1_router(state, cfg))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http());
    if cfg.server.enable_cors {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

fn v1_router(state: AppState, cfg: &Config) -> Router {
    Router::new()
        // Read views
        .route("/status", get(views::get_status))
        .route("/tariff/price", get(views::get_tariff_price))
        .route("/stream/health", get(views::get_stream_health))
        .route("/inverter/status", get(views::get_inverter_status))
        .route("/provider/config", get(views::get_provider_config))
        .route("/settings", get(views::get_settings))
        .route("/battery/health", get(views::get_battery_health))
        // Services
        .route("/sync/now", post(services::sync_now))
        .route("/force/charge", post(services::force_charge))
        .route("/force/discharge", post(services::force_discharge))
        .route("/restore", post(services::restore_normal))
        .route("/battery/backup-reserve", post(services::set_backup_reserve))
        .route("/battery/operation-mode", post(services::set_operation_mode))
        .route("/battery/export-rule", post(services::set_grid_export))
        .route("/battery/grid-charging", post(services::set_grid_charging))
        .route("/battery/health-sync", post(services::sync_battery_health))
        .route("/inverter/curtail", post(services::curtail_inverter))
        .route("/inverter/restore", post(services::restore_inverter))
        .layer(middleware::from_fn_with_state(
            ApiToken(cfg.auth.token.clone()),
            require_bearer,
        ))
        .with_state(state)
}

pub async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}
