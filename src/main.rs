// =============================================================================
// Spotmind — Main Entry Point
// =============================================================================
//
// Boot order: config -> store -> cache -> exchange client -> risk ->
// strategy -> execution -> market-data streams -> scheduler loops.
// Ctrl+C flips the shutdown flag; every loop finishes its current atomic
// step before exiting.
// =============================================================================

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use spotmind::binance::BinanceClient;
use spotmind::cache::MarketCache;
use spotmind::config::Config;
use spotmind::execution::ExecutionEngine;
use spotmind::market_data::kline_stream::{run_kline_stream, SUPPORTED_INTERVALS};
use spotmind::market_data::depth_stream::run_depth_stream;
use spotmind::risk::RiskManager;
use spotmind::scheduler;
use spotmind::store::Store;
use spotmind::strategy::StrategyCoordinator;
use spotmind::types::SystemStatus;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    info!(symbols = ?config.symbols, testnet = config.testnet, "Spotmind engine starting");

    if config.api_key.is_empty() || config.api_secret.is_empty() {
        warn!("exchange API credentials not configured — signed endpoints will fail");
    }

    // ── 2. Durable store ─────────────────────────────────────────────────
    let store = Arc::new(Store::open(&config.database_path)?);

    // ── 3. Market cache ──────────────────────────────────────────────────
    let market_cache = Arc::new(MarketCache::new());
    market_cache.set_system_status(SystemStatus::Active, "");

    // ── 4. Exchange client ───────────────────────────────────────────────
    let client = Arc::new(BinanceClient::new(
        config.api_key.clone(),
        config.api_secret.clone(),
        config.testnet,
    ));

    // ── 5. Engines ───────────────────────────────────────────────────────
    let risk = Arc::new(RiskManager::new(
        client.clone(),
        market_cache.clone(),
        store.clone(),
        &config,
    ));
    let coordinator = Arc::new(StrategyCoordinator::new(
        client.clone(),
        market_cache.clone(),
        store.clone(),
        risk.clone(),
        &config,
    ));
    let engine = ExecutionEngine::new(
        client.clone(),
        market_cache.clone(),
        store.clone(),
        risk.clone(),
    );

    // ── 6. Market data streams ───────────────────────────────────────────
    for symbol in &config.symbols {
        for interval in SUPPORTED_INTERVALS {
            let cache = market_cache.clone();
            let stream_store = store.clone();
            let sym = symbol.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) =
                        run_kline_stream(&sym, interval, &cache, &stream_store).await
                    {
                        error!(symbol = %sym, interval, error = %e, "kline stream error — reconnecting in 5s");
                    }
                    tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                }
            });
        }

        let cache = market_cache.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = run_depth_stream(&sym, &cache).await {
                    error!(symbol = %sym, error = %e, "depth stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }
    info!(count = config.symbols.len(), "market data streams launched");

    // ── 7. Scheduler loops ───────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(scheduler::run_strategy_loop(
        coordinator.clone(),
        engine.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(scheduler::run_position_monitor_loop(
        engine.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(scheduler::run_circuit_breaker_loop(
        risk.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(scheduler::run_risk_broadcast_loop(
        risk.clone(),
        market_cache.clone(),
        shutdown_rx,
    ));

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");
    let _ = shutdown_tx.send(true);

    // Give in-flight loop bodies a moment to finish their atomic step.
    tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;

    info!("Spotmind shut down complete.");
    Ok(())
}
