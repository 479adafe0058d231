mod config;
mod envelope;
mod fanout;
mod idempotency;
mod pipeline;
mod routes;
mod state;
mod telemetry;
mod vector;
mod ws;

use std::sync::Arc;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use shoal_auth::AuthService;
use shoal_core::TenantMetaProvider;
use shoal_tenant::{
    BrokerHandle, BrokerRouter, CacheHandle, CacheRouter, DbRouter, ObjectBinding, ObjectRouter,
    TenantRouter,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::fanout::RoomFanout;
use crate::pipeline::ChatService;
use crate::state::AppState;
use crate::vector::VectorClient;

#[tokio::main]
async fn main() {
    let cfg = AppConfig::from_env();
    telemetry::init_tracing(&cfg.log_filter);
    let prometheus = install_metrics_recorder();

    let shared_cache = match CacheHandle::connect(&cfg.redis_addr).await {
        Ok(cache) => cache,
        Err(err) => {
            error!(redis = %cfg.redis_addr, error = %err, "failed to connect to redis");
            std::process::exit(1);
        }
    };
    if let Err(err) = shared_cache.ping().await {
        error!(redis = %cfg.redis_addr, error = %err, "redis ping failed");
        std::process::exit(1);
    }

    let shared_db = match PgPoolOptions::new()
        .max_connections(10)
        .connect_lazy(&cfg.postgres_dsn)
    {
        Ok(pool) => pool,
        Err(err) => {
            error!(error = %err, "invalid postgres dsn");
            std::process::exit(1);
        }
    };

    let dbman = Arc::new(shoal_dbman::Client::from_endpoints(&cfg.dbman_endpoints));
    let provider: Arc<dyn TenantMetaProvider> = dbman.clone();

    let broker = if cfg.use_mq {
        match BrokerHandle::connect(&cfg.lavinmq_url).await {
            Ok(handle) => Some(Arc::new(BrokerRouter::new(handle, provider.clone()))),
            Err(err) => {
                error!(broker = %cfg.lavinmq_url, error = %err, "failed to connect to broker");
                std::process::exit(1);
            }
        }
    } else {
        // No broker: messages still persist, but no message.created events
        // are emitted.
        None
    };

    let shared_object = ObjectBinding {
        endpoint: cfg.object_endpoint.clone(),
        access_key: cfg.object_access_key.clone(),
        secret_key: cfg.object_secret_key.clone(),
        bucket: cfg.object_bucket.clone(),
        use_ssl: cfg.object_use_ssl,
        key_prefix: String::new(),
    };

    let tenants = TenantRouter::new(
        CacheRouter::new(shared_cache.clone(), provider.clone()),
        DbRouter::new(shared_db, provider.clone()),
        broker.clone(),
        ObjectRouter::new(shared_object, provider.clone()),
    );

    let vector = VectorClient::new(&cfg.vectorman_endpoint, cfg.vector_enabled);
    let chat = ChatService::new(dbman, broker, vector);
    let fanout = RoomFanout::new();
    let auth = AuthService::new(&cfg.jwt_secret, cfg.jwt_ttl_minutes);

    let app_state = AppState {
        auth,
        chat,
        fanout,
        tenants: tenants.clone(),
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
        mq = cfg.use_mq,
        dbman = ?cfg.dbman_endpoints,
        vector = cfg.vector_enabled,
        "starting shoal-chat"
    );

    if let Err(err) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %err, "server error");
        std::process::exit(1);
    }

    tenants.close().await;
    info!("shoal-chat stopped");
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn install_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}
