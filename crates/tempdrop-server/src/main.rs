//! Tempdrop server binary

use ephemeral_registry::{
    Broadcaster, CancellationToken, EvictionScheduler, FsContentStore, Ledger, Registry,
    RetryPolicy,
};
use std::sync::Arc;
use tempdrop_server::config::Config;
use tempdrop_server::error::{Result, ServerError};
use tempdrop_server::server::{start_server, ServerState};
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("tempdrop_server=info".parse()?)
        .add_directive("ephemeral_registry=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    let config = Config::from_env();
    config.validate().map_err(ServerError::Config)?;
    info!(
        port = config.port,
        upload_dir = ?config.upload_dir,
        ledger = ?config.ledger_path,
        ttl_secs = config.object_ttl.as_secs(),
        max_batch_bytes = config.max_batch_bytes,
        "Starting tempdrop"
    );

    let store = FsContentStore::new(&config.upload_dir);
    store.init().await?;

    let registry = Arc::new(
        Registry::open(
            Ledger::new(&config.ledger_path),
            Arc::new(store),
            Broadcaster::new(config.event_buffer),
            RetryPolicy::default(),
        )
        .await?,
    );

    let shutdown = CancellationToken::new();

    let scheduler = EvictionScheduler::new(registry.clone(), config.tick_interval)
        .with_shutdown(shutdown.clone())
        .spawn();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                signal_token.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    let state = Arc::new(ServerState::new(registry, &config));
    let served = start_server(state, config.port, shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = scheduler.await {
        error!(error = %e, "Eviction scheduler task failed");
    }

    served?;
    info!("Tempdrop stopped");
    Ok(())
}
