use std::sync::{Arc, Mutex};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use card_broker::gateway::HttpProvider;
use card_broker::notify::WeComBotSink;
use card_broker::{
    config, db, shutdown_channel, AccountProvider, AccountStore, BalanceReconciler, Breaker,
    CycleContext, ErrorBudget, NotificationDispatcher, NotificationSink, SqliteStore,
    TransactionReconciler, TripPolicy,
};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // RUST_LOG wins; otherwise LOG_DEBUG picks debug or info
    let default_level = if config::log_debug() { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stdout)
        .with_target(false)
        .init();

    info!("Card broker starting...");

    let cfg = config::load()?;
    info!("  DB Path: {}", cfg.db_path);
    info!("  Provider: {}", cfg.provider_url);
    info!("  Auth endpoint: {}", cfg.auth_endpoint);
    info!("  Balance interval: {:?}", cfg.balance_interval);
    info!("  Transaction interval: {:?}", cfg.transaction_interval);
    info!("  Batch size: {}", cfg.batch_size);

    let conn = db::connect(&cfg.db_path)?;
    db::run_migrations(&conn)?;

    let store: Arc<dyn AccountStore> = Arc::new(SqliteStore::new(Arc::new(Mutex::new(conn))));
    let provider: Arc<dyn AccountProvider> = Arc::new(HttpProvider::new(&cfg.provider_url)?);
    let sink: Arc<dyn NotificationSink> = Arc::new(WeComBotSink::new()?);

    let budget = Arc::new(ErrorBudget::new());
    let ctx = CycleContext {
        store: Arc::clone(&store),
        provider,
        breaker: Breaker::new(
            budget,
            Arc::clone(&store),
            TripPolicy::from_abandon_flag(cfg.breaker_abandons_batch),
        ),
        notifier: NotificationDispatcher::new(Arc::clone(&store), sink, &cfg.auth_endpoint),
        batch_size: cfg.batch_size,
    };

    let (stop, shutdown) = shutdown_channel();

    let balance_handle = tokio::spawn({
        let reconciler = BalanceReconciler::new(ctx.clone(), cfg.balance_interval);
        let shutdown = shutdown.clone();
        async move { reconciler.run(shutdown).await }
    });

    let transaction_handle = tokio::spawn({
        let reconciler = TransactionReconciler::new(ctx, cfg.transaction_interval);
        async move { reconciler.run(shutdown).await }
    });

    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {:?}", e);
    }
    info!("Shutdown signal received, stopping...");
    let _ = stop.send(true);

    for (name, handle) in [("balance", balance_handle), ("transactions", transaction_handle)] {
        if let Err(e) = handle.await {
            error!("{} cycle panicked: {:?}", name, e);
        }
    }

    info!("Card broker stopped.");
    Ok(())
}
