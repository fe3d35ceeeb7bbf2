use anyhow::Result;
use axum::Router;
use tracing::{info, warn};

use gridsync::config::Config;
use gridsync::telemetry::{self, init_tracing};
use gridsync::{api, app};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = Config::load()?;
    init_tracing(&cfg.telemetry);

    let app_state = app::AppState::new(cfg.clone()).await?;
    app_state.spawn_tasks().await;

    let app: Router = api::router(app_state.clone(), &cfg);

    let addr = cfg.server.socket_addr()?;
    info!(%addr, site_tz = %cfg.site.timezone, "starting gridsync controller");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    warn!("shutdown complete");
    Ok(())
}
