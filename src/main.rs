//! Failover Relayer - Cross-chain transaction failover orchestration
//!
//! Monitors a user's pending intents on the intent ledger, attempts
//! execution, and on failure bridges funds to the best backup chain and
//! retries, emitting observable lifecycle events throughout.

use anyhow::{anyhow, Context, Result};
use ethers::signers::LocalWallet;
use ethers::types::Address;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

mod api;
mod bridge;
mod chain;
mod config;
mod error;
mod events;
mod failover;
mod ledger;
mod metrics;
mod selector;
mod state;

use bridge::rpc::RpcBridgeAdapter;
use bridge::BridgeAdapter;
use chain::RpcChainMetrics;
use config::{Settings, WalletConfig};
use events::EventBus;
use failover::FailoverEngine;
use ledger::rpc::RpcIntentLedger;
use ledger::IntentLedger;
use metrics::MetricsServer;
use selector::{ChainProfile, ChainSelector};
use state::StateStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Failover Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Initialize database connection
    let store = Arc::new(StateStore::new(&settings.database).await?);
    info!("Database connection established");

    // Run migrations
    store.run_migrations().await?;

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Per-chain RPC access
    let chains = chain::build_chains(&settings)?;
    let chain_ids: Vec<u64> = chains.keys().copied().collect();
    info!("Chain connections initialized: {:?}", chain_ids);

    // Signing keys
    let wallet = load_wallet(&settings.wallet)?;
    let delegated_wallet = load_delegated_wallet(&settings.wallet)?;
    if delegated_wallet.is_some() {
        info!("Delegated signing enabled for intent execution");
    }

    // External collaborators
    let ledger: Arc<dyn IntentLedger> = Arc::new(RpcIntentLedger::new(
        chains.clone(),
        wallet.clone(),
        delegated_wallet,
    ));
    let bridge_adapter: Arc<dyn BridgeAdapter> =
        Arc::new(RpcBridgeAdapter::new(chains.clone(), wallet));

    // Chain selector fed by live RPC metrics
    let profiles: Vec<ChainProfile> = settings
        .enabled_chains()
        .into_iter()
        .map(|(_, c)| ChainProfile {
            chain_id: c.chain_id,
            name: c.name.clone(),
            avg_block_time_secs: c.avg_block_time_secs,
            reliability: c.reliability,
        })
        .collect();
    let selector = Arc::new(ChainSelector::new(
        profiles,
        Arc::new(RpcChainMetrics::new(chains)),
        settings.selection.clone(),
    ));

    // Event bus and persistence journal
    let bus = Arc::new(EventBus::new());
    let journal_handle = state::spawn_journal(&bus, store.clone());

    // Failover engine
    let engine = Arc::new(FailoverEngine::new(
        ledger,
        selector,
        bridge_adapter,
        bus.clone(),
    ));
    info!("Failover engine initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let api_config = settings.api.clone();
        let engine = engine.clone();
        let bus = bus.clone();
        let store = store.clone();
        let chain_ids = chain_ids.clone();
        async move {
            if let Err(e) = api::run_server(api_config, engine, bus, store, chain_ids).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Start monitoring the configured user
    let user: Address = settings
        .monitor
        .user_address
        .as_deref()
        .ok_or_else(|| anyhow!("monitor.user_address is required"))?
        .parse()
        .context("Invalid monitor.user_address")?;
    engine.start_monitoring(user, settings.monitor.clone());

    info!("Failover Relayer is running");
    info!(
        "API server: http://{}:{}",
        settings.api.host, settings.api.port
    );
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Stop scheduling new poll cycles; in-flight sequences finish on their own
    engine.stop_monitoring();

    // Abort background tasks
    api_handle.abort();
    journal_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Failover Relayer stopped");
    Ok(())
}

fn load_wallet(config: &WalletConfig) -> Result<LocalWallet> {
    let env_name = config
        .private_key_env
        .as_deref()
        .unwrap_or("RELAYER_PRIVATE_KEY");
    let key = std::env::var(env_name)
        .with_context(|| format!("No signing key configured; set ${}", env_name))?;
    key.parse::<LocalWallet>()
        .map_err(|e| anyhow!("Invalid private key in ${}: {}", env_name, e))
}

fn load_delegated_wallet(config: &WalletConfig) -> Result<Option<LocalWallet>> {
    let Some(env_name) = config.delegated_key_env.as_deref() else {
        return Ok(None);
    };
    let key = std::env::var(env_name)
        .with_context(|| format!("delegated_key_env is set but ${} is missing", env_name))?;
    let wallet = key
        .parse::<LocalWallet>()
        .map_err(|e| anyhow!("Invalid delegated key in ${}: {}", env_name, e))?;
    Ok(Some(wallet))
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,failover_relayer=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
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
