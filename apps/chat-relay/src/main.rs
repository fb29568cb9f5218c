use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use chat_relay::{
    build_router,
    cli::{self, Cli, Commands},
    janitor::Janitor,
    registry::ConnectionRegistry,
    store_redis::RedisStore,
    telemetry::{self, Telemetry},
    AppState, Config, EventIds, Relay,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Debug client
    if let Some(Commands::Chat(args)) = cli.command {
        telemetry::init_logging("warn");
        if let Err(e) = cli::run_chat_client(args).await {
            error!("Chat client error: {}", e);
            std::process::exit(1);
        }
        return Ok(());
    }

    let config = Config::try_from(cli.serve)?;
    let telemetry = Telemetry::init()?;

    info!("Starting chat relay on {}", config.listen_addr);
    info!("Redis URL: {}", config.redis_url);
    info!(
        lifetime_secs = config.session_lifetime.as_secs(),
        sweep_secs = config.sweep_interval.as_secs(),
        history_limit = config.history_limit,
        "session settings"
    );

    let store = RedisStore::connect(&config.redis_url)
        .await
        .with_context(|| format!("failed to connect to Redis at {}", config.redis_url))?;

    let registry = Arc::new(ConnectionRegistry::new());
    let ids = Arc::new(EventIds::new());
    let relay = Relay::new(Arc::new(store), registry.clone(), ids.clone(), &config);

    let pump = relay
        .start()
        .await
        .context("failed to subscribe to relay channel")?;
    let janitor = Janitor::new(
        relay.sessions().clone(),
        registry,
        ids,
        config.session_lifetime,
        config.sweep_interval,
    )
    .spawn();

    let app = build_router(AppState {
        relay,
        metrics: Some(telemetry.metrics_handle()),
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("Chat relay listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!(
        grace_secs = config.shutdown_grace.as_secs(),
        "shutting down background tasks"
    );
    janitor.abort();
    pump.abort();
    let drained = tokio::time::timeout(config.shutdown_grace, async {
        let _ = janitor.await;
        let _ = pump.await;
    })
    .await;
    if drained.is_err() {
        error!("background tasks did not stop within the grace period");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
