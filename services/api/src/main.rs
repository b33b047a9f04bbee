use std::{net::SocketAddr, str::FromStr, sync::Arc};

use anyhow::Context;
use armonia_api::{
    auth::revocation::RevocationList,
    config::Config,
    router,
    store::postgres::PgBackend,
    tenant::registry::spawn_idle_sweeper,
    AppState,
};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
    }
}

/// Boot the API: control-plane pool and migrations, the tenant registry with
/// its idle sweep, then the HTTP server.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let connect_options =
        PgConnectOptions::from_str(&config.database_url).context("invalid DATABASE_URL")?;
    let control = PgPoolOptions::new()
        .max_connections(5)
        .connect_with(connect_options.clone())
        .await
        .context("failed to connect to postgres")?;

    sqlx::migrate!("./migrations")
        .run(&control)
        .await
        .context("failed to run migrations")?;

    let revocations = match &config.redis_url {
        Some(url) => RevocationList::connect(url)
            .await
            .context("failed to connect to redis")?,
        None => {
            tracing::warn!("REDIS_URL not set; revoked sessions are kept in process memory");
            RevocationList::in_memory()
        }
    };

    let backend = Arc::new(PgBackend::new(control.clone(), connect_options, &config.registry));
    let state = AppState::new(&config, backend, revocations);
    let sweeper = spawn_idle_sweeper(state.registry().clone(), config.registry.sweep_interval);

    let app = router(state.clone(), config.cors_allow_origin.as_deref());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind api listener on {addr}"))?;
    tracing::info!(%addr, "api service starting");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sweeper.abort();
    state.registry().shutdown().await;
    control.close().await;
    tracing::info!("api service stopped");

    served.context("api server exited with error")
}
