//! tx-relayer - publishes transactions through a pool of ledger accounts
//!
//! Accepts requests over HTTP, binds each to a free account and nonce,
//! submits it to the ledger and polls until it is included or retries run out.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};

use tx_relayer::accounts::load_accounts;
use tx_relayer::api::{self, AppState};
use tx_relayer::config::Settings;
use tx_relayer::coordination::TransactionManager;
use tx_relayer::ledger::JsonRpcLedger;
use tx_relayer::metrics::MetricsServer;
use tx_relayer::state::{run_journal, StateManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting tx-relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    let accounts = load_accounts(&settings.signers).context("Failed to load signers")?;
    info!("Loaded {} signing accounts", accounts.len());

    let ledger = Arc::new(
        JsonRpcLedger::new(settings.ledger.clone()).context("Failed to set up ledger client")?,
    );

    // Optional attempt journal
    let (state_manager, journal_tx, journal_handle) = match &settings.database {
        Some(db) => {
            let state_manager = Arc::new(
                StateManager::new(db)
                    .await
                    .context("Failed to connect to database")?,
            );
            state_manager.run_migrations().await?;
            for (status, count) in state_manager.attempt_counts().await? {
                info!(%status, count, "Journaled attempts");
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let handle = tokio::spawn(run_journal(state_manager.clone(), rx));
            (Some(state_manager), Some(tx), Some(handle))
        }
        None => {
            info!("No database configured, attempt history is kept in memory only");
            (None, None, None)
        }
    };

    let manager = Arc::new(TransactionManager::new(
        settings.relayer.clone(),
        accounts,
        ledger,
        journal_tx,
    )?);
    manager.start().await?;

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState::new(manager.clone(), state_manager.clone());
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    info!("tx-relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    api_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    manager.stop().await;

    // Give the journal a moment to flush what is already queued
    drop(manager);
    if let Some(h) = journal_handle {
        if tokio::time::timeout(Duration::from_secs(5), h).await.is_err() {
            info!("Attempt journal still busy at shutdown, abandoning");
        }
    }

    info!("tx-relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tx_relayer=debug,sqlx=warn,hyper=warn"));

    let json = std::env::var("RELAYER_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
