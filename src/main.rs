// =============================================================================
// Meridian LP Nexus — Main Entry Point
// =============================================================================
//
// Automated liquidity management for DLMM pools. Startup wires the stack
// bottom-up (gateway -> adapters -> manager -> scheduler -> API); shutdown
// drains it in reverse (broadcaster -> scheduler -> manager -> listeners).
//
// Exit codes: 0 on clean shutdown, 1 on fatal initialisation failure.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod amm;
mod analytics;
mod api;
mod chain;
mod error;
mod events;
mod retry;
mod runtime_config;
mod storage;
mod strategy;
mod swap;
#[cfg(test)]
mod testkit;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::amm::precision::TokenPrecisionCache;
use crate::amm::RpcAmmAdapter;
use crate::api::rest::ApiState;
use crate::api::ws::TelemetryBroadcaster;
use crate::chain::wallet::Wallet;
use crate::chain::ChainGateway;
use crate::events::EventBus;
use crate::retry::RetryCoordinator;
use crate::runtime_config::RuntimeConfig;
use crate::storage::InstanceStorage;
use crate::strategy::health::HealthChecker;
use crate::strategy::manager::{ManagerDeps, StrategyManager};
use crate::strategy::scheduler::StrategyScheduler;
use crate::swap::JupiterSwapAdapter;

const CONFIG_PATH: &str = "meridian.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    let config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        // Can't warn before the subscriber exists; stderr is fine here.
        eprintln!("config: {e:#}; using defaults");
        RuntimeConfig::default()
    });

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian LP Nexus — Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Wallet & chain gateway ────────────────────────────────────────
    let wallet = Wallet::from_env().context("wallet initialisation failed")?;

    let gateway = Arc::new(ChainGateway::new(
        &config.rpc_endpoints(),
        &config.rpc.commitment,
        Duration::from_secs(config.rpc.confirm_timeout_secs),
    ));

    // ── 3. Adapters ──────────────────────────────────────────────────────
    let precision = TokenPrecisionCache::new(gateway.clone());
    let amm = Arc::new(RpcAmmAdapter::new(
        gateway.clone(),
        wallet.clone(),
        precision,
        config.rpc.priority_fee_microlamports,
    ));
    let swap = Arc::new(JupiterSwapAdapter::new(
        config.swap_api_base.clone(),
        gateway.clone(),
        wallet.clone(),
    ));

    // ── 4. Runtime core ──────────────────────────────────────────────────
    let bus = EventBus::new();
    let storage = Arc::new(
        InstanceStorage::open(&config.data_root).context("storage initialisation failed")?,
    );

    let manager = Arc::new(StrategyManager::new(ManagerDeps {
        amm,
        swap,
        retry: RetryCoordinator::new(),
        bus: bus.clone(),
        storage,
        owner: wallet.pubkey(),
        analytics: crate::analytics::AnalyticsConfig {
            annualization_factor: config.analytics.annualization_factor,
            benchmark_rate_per_minute: config.analytics.benchmark_rate_per_minute,
        },
        simple_y_defaults: config.strategy.default_params.clone(),
        monitor_interval: Duration::from_secs(config.strategy.monitor_interval_secs),
        max_active: config.strategy.max_active_strategies,
    }));

    let restored = manager.boot().context("instance recovery failed")?;
    if restored > 0 {
        info!(count = restored, "recovered instances will reconcile on their first tick");
    }

    // ── 5. Background subsystems ─────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = StrategyScheduler::new(manager.clone(), config.strategy.max_active_strategies);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let health = HealthChecker::new(manager.clone(), bus.clone(), config.health.clone());
    let health_task = tokio::spawn(health.run(shutdown_rx.clone()));

    // ── 6. Telemetry broadcaster + WS listener ───────────────────────────
    let broadcaster = TelemetryBroadcaster::new(bus.clone());
    broadcaster.start();

    let ws_addr = format!("0.0.0.0:{}", config.server.ws_port);
    let ws_listener = tokio::net::TcpListener::bind(&ws_addr)
        .await
        .with_context(|| format!("failed to bind WS listener on {ws_addr}"))?;
    info!(addr = %ws_addr, "websocket listener ready");
    let ws_app = api::ws::router(broadcaster.clone());
    let mut ws_shutdown = shutdown_rx.clone();
    let ws_task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = ws_shutdown.changed().await;
        };
        if let Err(e) = axum::serve(ws_listener, ws_app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "websocket server failed");
        }
    });

    // ── 7. REST listener ─────────────────────────────────────────────────
    let api_state = ApiState {
        manager: manager.clone(),
        gateway: gateway.clone(),
        started_at: std::time::Instant::now(),
    };
    let rest_addr = format!("0.0.0.0:{}", config.server.port);
    let rest_listener = tokio::net::TcpListener::bind(&rest_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {rest_addr}"))?;
    info!(addr = %rest_addr, "api server listening");
    let rest_app = api::rest::router(api_state);
    let mut rest_shutdown = shutdown_rx.clone();
    let rest_task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = rest_shutdown.changed().await;
        };
        if let Err(e) = axum::serve(rest_listener, rest_app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "api server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown, reverse order ──────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — draining");

    broadcaster.shutdown();
    let _ = shutdown_tx.send(true);
    let _ = scheduler_task.await;
    let _ = health_task.await;
    manager.save_all();
    let _ = ws_task.await;
    let _ = rest_task.await;

    if let Err(e) = config.save(CONFIG_PATH) {
        warn!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Meridian LP Nexus shut down complete.");
    Ok(())
}
