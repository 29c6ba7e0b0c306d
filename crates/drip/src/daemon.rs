//! Daemon command wiring the store, the dispatch loop, and the HTTP API.

use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tokio::sync::watch;
use tracing::info;

use drip_scheduler::{CampaignScheduler, CrmClient, Dispatcher, DispatcherConfig};
use drip_store::JobStore;
use drip_web::{AppState, create_router};

/// Configuration for the daemon.
pub struct DaemonConfig {
    pub db: String,
    pub bind: String,
    pub crm_url: String,
    pub default_timezone: String,
    pub sweep_interval: u64,
    pub transport_timeout: u64,
    pub max_attempts: u32,
    pub batch_size: u32,
}

pub async fn run(config: DaemonConfig) -> Result<()> {
    let store = JobStore::open(&config.db)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    // One CRM client serves as email source, settings lookup, and transport.
    let crm = Arc::new(CrmClient::new(&config.crm_url));

    let scheduler = CampaignScheduler::new(
        store.clone(),
        crm.clone(),
        crm.clone(),
        &config.default_timezone,
    )
    .with_max_attempts(config.max_attempts);

    let dispatcher = Dispatcher::new(
        store,
        crm,
        &config.default_timezone,
        DispatcherConfig {
            sweep_interval: Duration::from_secs(config.sweep_interval),
            transport_timeout: Duration::from_secs(config.transport_timeout),
            max_attempts: config.max_attempts,
            batch_size: config.batch_size,
        },
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    // Spawn the dispatch loop
    let dispatcher_handle = {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { dispatcher.run(shutdown_rx).await })
    };

    let router = create_router(Arc::new(AppState { scheduler }));
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    info!("API listening on http://{}", config.bind);

    let mut serve_shutdown = shutdown_rx.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown.changed().await;
        })
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    // The dispatcher finishes its in-flight batch before exiting.
    let _ = dispatcher_handle.await;

    info!("daemon shut down gracefully");
    Ok(())
}
