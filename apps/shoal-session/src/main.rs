mod config;
mod hub;
mod routes;
mod service;
mod state;
mod telemetry;

use std::sync::Arc;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use shoal_auth::AuthService;
use shoal_tenant::CacheHandle;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::hub::SessionHub;
use crate::service::SessionService;
use crate::state::AppState;

#[tokio::main]
async fn main() {
    let cfg = AppConfig::from_env();
    telemetry::init_tracing(&cfg.log_filter);
    let prometheus = install_metrics_recorder();

    let cache = match CacheHandle::connect(&cfg.redis_addr).await {
        Ok(cache) => cache,
        Err(err) => {
            error!(redis = %cfg.redis_addr, error = %err, "failed to connect to redis");
            std::process::exit(1);
        }
    };
    if let Err(err) = cache.ping().await {
        error!(redis = %cfg.redis_addr, error = %err, "redis ping failed");
        std::process::exit(1);
    }

    let dbman = Arc::new(shoal_dbman::Client::from_endpoints(&cfg.dbman_endpoints));
    let hub = SessionHub::new(Some(cache));
    hub.start();
    let service = SessionService::new(dbman, hub.clone());
    let auth = AuthService::new(&cfg.jwt_secret, cfg.jwt_ttl_minutes);

    let app_state = AppState {
        auth,
        service,
        hub: hub.clone(),
    };
    let app = routes::router(app_state, prometheus);

    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr = %addr, error = %err, "failed to bind");
            std::process::exit(1);
        }
    };

    info!(
        addr = %addr,
        redis = %cfg.redis_addr,
        dbman = ?cfg.dbman_endpoints,
        "starting shoal-session"
    );

    if let Err(err) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %err, "server error");
        std::process::exit(1);
    }

    hub.stop();
    info!("shoal-session stopped");
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn install_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}
