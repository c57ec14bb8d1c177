mod config;

use clap::Parser as _;
use config::Config;
use std::sync::Arc;
use std::time::Duration;
use switchyard::{
    AppState, build_metrics_layer_and_handle, build_metrics_router, build_router,
    client::{PoolSettings, create_hyper_client},
    persistence::FileSnapshotStore,
    registry::{ConfigFile, Registry},
    router::Router,
};
use tokio::net::TcpListener;
use tracing::{info, instrument, warn};

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse().validate()?;
    info!(
        "Starting router on port {} with providers from {} and state in {}",
        config.port,
        config.providers.display(),
        config.state_file.display()
    );

    let file = ConfigFile::from_path(&config.providers).await?;
    let client = create_hyper_client(PoolSettings {
        max_idle_per_host: config.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.pool_idle_timeout_secs),
    });
    let registry = Registry::from_configs(
        &file.providers,
        client,
        Duration::from_secs(config.request_timeout_secs),
    )
    .map_err(|e| anyhow::anyhow!("Failed to create providers from config: {}", e))?;
    if registry.is_empty() {
        warn!("No AI providers configured, every request will fail");
    }

    let router = Router::builder()
        .registry(registry)
        .settings(file.router)
        .store(Arc::new(FileSnapshotStore::new(&config.state_file)))
        .build();
    router.load_state().await;

    let sweeper = router.clone();
    let sweep_every = Duration::from_secs(config.sweep_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            sweeper.sweep();
        }
    });

    let mut app_state = AppState::new(router.clone());
    match config.admin_key.clone() {
        Some(key) => app_state = app_state.with_admin_keys([key.into()].into_iter().collect()),
        None => warn!("No admin key configured, /admin endpoints are open"),
    }
    let mut app = build_router(app_state);

    if config.metrics {
        let (prometheus_layer, handle) = build_metrics_layer_and_handle(config.metrics_prefix);
        app = app.layer(prometheus_layer);

        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr).await?;
        info!("Metrics endpoint listening on {}", metrics_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, build_metrics_router(handle)).await {
                warn!("Metrics server stopped: {}", e);
            }
        });
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Router listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
        })
        .await?;

    router.flush().await;
    Ok(())
}
