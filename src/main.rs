use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use tundra::api::api_routes;
use tundra::config::MarketConfig;
use tundra::executor::{ExecutionAdapter, ExecutorRegistry};
use tundra::market::{Marketplace, spawn_active_provider_loops, spawn_stale_sweep};
use tundra::registry;
use tundra::router::KeywordRouter;
use tundra::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr, and additionally to a daily file when TUNDRA_LOG_DIR is set.
    let _log_guard = init_tracing();

    let config = MarketConfig::from_env()?;

    eprintln!("Tundra v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   API: http://0.0.0.0:{}", config.api_port);
    eprintln!(
        "   Marketplace: {}",
        if config.enabled { "enabled" } else { "disabled" }
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to open database at {}: {e}", config.db_path.display()))?,
    );

    if config.seed_providers {
        let seeded = registry::seed(&db).await?;
        eprintln!("   Providers: {seeded} seeded");
    }

    // ── Providers ────────────────────────────────────────────────────────
    let executors = Arc::new(ExecutorRegistry::with_builtins(config.executor_timeout));
    let adapter = ExecutionAdapter::new(executors, config.executor_timeout);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = spawn_active_provider_loops(
        Arc::clone(&db),
        adapter,
        config.poll_interval,
        config.poll_jitter,
        shutdown_rx.clone(),
    )
    .await?;

    if let Some(stale_after) = config.stale_after {
        let interval = (stale_after / 2).clamp(Duration::from_secs(1), Duration::from_secs(60));
        handles.push(spawn_stale_sweep(
            Arc::clone(&db),
            stale_after,
            interval,
            shutdown_rx.clone(),
        ));
        eprintln!("   Stale sweep: after {}s", stale_after.as_secs());
    }

    // ── API ──────────────────────────────────────────────────────────────
    let market = Marketplace::new(Arc::clone(&db), Arc::new(KeywordRouter), &config);
    let app = api_routes(market);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.api_port)).await?;
    tracing::info!(port = config.api_port, "API server started");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Received shutdown signal");
    };

    tokio::select! {
        result = axum::serve(listener, app).into_future() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "API server failed");
            }
        }
        _ = shutdown => {}
    }

    tracing::info!("Shutting down, waiting for provider loops to settle");
    shutdown_tx.send(true).ok();
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Background task panicked");
        }
    }

    Ok(())
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match std::env::var("TUNDRA_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            use tracing_subscriber::layer::SubscriberExt;
            use tracing_subscriber::util::SubscriberInitExt;

            let appender = tracing_appender::rolling::daily(dir.trim(), "tundra.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}
