use anyhow::Result;
use clap::Parser;
use poolkeeper_mgmt::audit_trail::AuditStore;
use poolkeeper_mgmt::cli::{Cli, Command};
use poolkeeper_mgmt::{
    AdminApi, AdminConfig, AuditLogger, AuthGate, ExecutorKind, FileAuditStore, IssuedTokenStore,
    MemoryAuditStore, MockExecutor, PoolExecutor, PoolManager, StatsCollector, ZpoolCliExecutor,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Command::Serve { config } => {
            let config = AdminConfig::load_or_default(config)?;
            init_tracing(config.log_json);
            serve(config).await
        }
        _ => {
            init_tracing(false);
            cli.run().await
        }
    }
}

fn audit_store(config: &AdminConfig) -> Result<Arc<dyn AuditStore>> {
    let store: Arc<dyn AuditStore> = match &config.audit_log_path {
        Some(path) => Arc::new(FileAuditStore::open(path, config.audit_memory_capacity)?),
        None => {
            tracing::warn!("audit_log_path not set, audit records are kept in memory only");
            Arc::new(MemoryAuditStore::new(config.audit_memory_capacity))
        }
    };
    Ok(store)
}

fn executor(config: &AdminConfig) -> Arc<dyn PoolExecutor> {
    match config.executor {
        ExecutorKind::Zpool => Arc::new(ZpoolCliExecutor::new(config.zpool_bin.clone())),
        ExecutorKind::Mock => {
            tracing::warn!("running with the in-memory mock executor, no pools are touched");
            Arc::new(MockExecutor::new())
        }
    }
}

fn token_store(config: &AdminConfig) -> Arc<IssuedTokenStore> {
    if config.token_secret.is_empty() {
        tracing::warn!("token_secret is empty, no token will validate");
    }
    let store = Arc::new(IssuedTokenStore::new(config.token_secret.as_bytes()));
    for (idx, token) in config.issued_tokens.iter().enumerate() {
        match store.register(token) {
            Ok(hash) => tracing::debug!(index = idx, hash = %hash, "issued token registered"),
            Err(e) => tracing::warn!(index = idx, error = %e, "skipping issued token"),
        }
    }
    store
}

async fn serve(config: AdminConfig) -> Result<()> {
    tracing::info!(bind = %config.bind_addr, executor = ?config.executor, "poolkeeper starting");

    let audit = AuditLogger::new(audit_store(&config)?);
    let manager = Arc::new(PoolManager::new(executor(&config), audit));
    if let Err(e) = manager.sync_inventory().await {
        tracing::warn!(error = %e, "initial inventory sync failed, starting empty");
    }

    let tokens = token_store(&config);
    let gate = Arc::new(AuthGate::new(tokens));
    let stats = Arc::new(StatsCollector::new(manager.clone(), config.stats_config()));
    let api = AdminApi::new(manager, stats.clone(), gate, config.bind_addr);

    let shutdown = CancellationToken::new();
    let stats_handle = tokio::spawn(stats.run(shutdown.clone()));

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        tracing::info!("shutdown requested");
        signal.cancel();
    });

    let result = api.serve(shutdown.clone()).await;
    shutdown.cancel();
    let _ = stats_handle.await;
    match &result {
        Ok(()) => tracing::info!("admin API stopped"),
        Err(e) => tracing::error!(error = %e, "admin API failed"),
    }
    result
}
