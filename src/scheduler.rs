// =============================================================================
// Scheduler — the four periodic cadences of the engine
// =============================================================================
//
//   strategy tick        every  1 s — evaluate symbols, dispatch signals
//   position monitor     every  5 s — trailing stops, stop/TP exits
//   circuit breaker      every 60 s — daily drawdown guard
//   risk broadcast       every 60 s — risk ledger fan-out to subscribers
//
// Every loop uses skip-on-miss interval semantics: a tick whose body
// overruns does not pile up behind itself, the next firing is simply
// skipped. Per-signal execution is spawned onto its own task so the tick
// itself stays short. All loops exit when the shutdown flag flips, after
// finishing their current body.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::cache::{DashboardMessage, MarketCache, DASHBOARD_CHANNEL};
use crate::execution::{dispatch_signal, ExecutionEngine};
use crate::risk::{BreakerVerdict, RiskManager};
use crate::strategy::StrategyCoordinator;

const STRATEGY_TICK: Duration = Duration::from_secs(1);
const POSITION_MONITOR_TICK: Duration = Duration::from_secs(5);
const CIRCUIT_BREAKER_TICK: Duration = Duration::from_secs(60);
const RISK_BROADCAST_TICK: Duration = Duration::from_secs(60);

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period);
    // Non-reentrant ticks: a slow body skips firings instead of bursting.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Strategy tick: evaluate all symbols and hand each valid signal to its
/// own execution worker.
pub async fn run_strategy_loop(
    coordinator: Arc<StrategyCoordinator>,
    engine: Arc<ExecutionEngine>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(period_secs = STRATEGY_TICK.as_secs(), "strategy loop started");
    let mut ticker = ticker(STRATEGY_TICK);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let signals = coordinator.evaluate_all_symbols().await;
                for signal in signals {
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        if let Err(e) = dispatch_signal(&engine, &signal).await {
                            error!(symbol = %signal.symbol, action = %signal.action, error = %e, "signal dispatch failed");
                        }
                    });
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("strategy loop stopped");
}

/// Position monitor: trailing-stop updates and exit detection.
pub async fn run_position_monitor_loop(
    engine: Arc<ExecutionEngine>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        period_secs = POSITION_MONITOR_TICK.as_secs(),
        "position monitor started"
    );
    let mut ticker = ticker(POSITION_MONITOR_TICK);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                engine.monitor_positions().await;
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("position monitor stopped");
}

/// Circuit breaker: evaluate the daily drawdown and trip when crossed.
pub async fn run_circuit_breaker_loop(
    risk: Arc<RiskManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        period_secs = CIRCUIT_BREAKER_TICK.as_secs(),
        "circuit breaker loop started"
    );
    let mut ticker = ticker(CIRCUIT_BREAKER_TICK);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match risk.check_circuit_breaker().await {
                    Ok(BreakerVerdict::Clear) => {}
                    Ok(BreakerVerdict::AlreadyPaused(reason)) => {
                        debug!(reason = %reason, "system paused");
                    }
                    Ok(BreakerVerdict::Tripped(reason)) => {
                        if let Err(e) = risk.trigger_circuit_breaker(&reason).await {
                            error!(error = %e, "circuit breaker trigger failed");
                        }
                    }
                    Err(e) => {
                        // Logged and retried next minute; the scheduler never dies.
                        error!(error = %e, "circuit breaker check failed");
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("circuit breaker loop stopped");
}

/// Risk broadcast: push the daily ledger to dashboard subscribers.
pub async fn run_risk_broadcast_loop(
    risk: Arc<RiskManager>,
    cache: Arc<MarketCache>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        period_secs = RISK_BROADCAST_TICK.as_secs(),
        "risk broadcast loop started"
    );
    let mut ticker = ticker(RISK_BROADCAST_TICK);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match risk.current_risk_metrics() {
                    Ok(metrics) => {
                        cache.publish(DASHBOARD_CHANNEL, &DashboardMessage::RiskUpdate { risk: metrics });
                    }
                    Err(e) => {
                        error!(error = %e, "risk metrics build failed");
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("risk broadcast loop stopped");
}
