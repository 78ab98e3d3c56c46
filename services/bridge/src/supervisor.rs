//! Lifecycle: bus first, then the historian, then the listener; on
//! shutdown the root scope is cancelled, sessions drain within their
//! bounded window, and the pipeline flushes before the process exits.

use std::sync::Arc;
use tracing::{info, warn};

use fb_bus::{BusAdapter, BusSettings, MemoryBus};
use fb_core::config::BridgeConfig;
use fb_historian::{HistorianPipeline, HistorianStore, MemoryStore, PgStore};

use crate::state::AppState;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("unsupported bus url '{0}' (expected memory://…)")]
    UnsupportedBusUrl(String),
    #[error("bus initialization failed: {0}")]
    Bus(#[from] fb_bus::BusError),
    #[error("auth key rejected: {0}")]
    Auth(#[from] fb_core::auth::AuthFailure),
    #[error("historian store: {0}")]
    Store(#[from] fb_historian::StoreError),
    #[error("listener: {0}")]
    Io(#[from] std::io::Error),
}

pub async fn run(config: BridgeConfig) -> Result<(), SupervisorError> {
    // The production log engine is external; the in-process engine backs
    // memory:// urls for development and embedded deployments.
    let driver = if config.bus.url.starts_with("memory://") {
        Arc::new(MemoryBus::new())
    } else {
        return Err(SupervisorError::UnsupportedBusUrl(config.bus.url.clone()));
    };
    let adapter = Arc::new(BusAdapter::new(driver, BusSettings::from(&config.bus)));
    initialize_with_reconnect(&adapter, &config).await?;
    info!(url = %config.bus.url, "bus adapter initialized");

    let state = AppState::new(&config, Arc::clone(&adapter))?;

    let pipeline = if config.historian.enabled {
        let store: Arc<dyn HistorianStore> = if config.historian.db_connection_string == "memory" {
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(PgStore::connect(&config.historian.db_connection_string).await?)
        };
        let pipeline = HistorianPipeline::start(
            Arc::clone(&adapter),
            store,
            &config.historian,
            state.shutdown.child_token(),
        )
        .await?;
        state.metrics.set_historian(pipeline.writer_counters());
        info!(
            consumers = config.historian.consumers.len(),
            "historian pipeline started"
        );
        Some(pipeline)
    } else {
        None
    };

    let router = crate::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.gateway.bind).await?;
    info!(addr = %config.gateway.bind, "bridge listening");

    let root = state.shutdown.clone();
    let drain_window = config.gateway.drain_window;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received, draining sessions");
            root.cancel();
            tokio::time::sleep(drain_window).await;
        })
        .await?;

    if let Some(pipeline) = pipeline {
        pipeline.shutdown(&adapter).await;
    }
    adapter.shutdown();
    info!("bridge shut down gracefully");
    Ok(())
}

/// Retry `initialize` with the configured backoff until it succeeds or the
/// attempt budget runs out.
async fn initialize_with_reconnect(
    adapter: &BusAdapter,
    config: &BridgeConfig,
) -> Result<(), fb_bus::BusError> {
    let reconnect = &config.bus.reconnect;
    let mut delay = reconnect.initial_delay;
    let mut attempt = 0u32;
    loop {
        match adapter.initialize().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempt += 1;
                if reconnect.max_attempts > 0 && attempt >= reconnect.max_attempts {
                    return Err(e);
                }
                warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "bus initialize failed, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(reconnect.max_delay);
            }
        }
    }
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful
/// shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        () = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
