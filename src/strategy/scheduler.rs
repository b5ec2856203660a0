// =============================================================================
// Strategy Scheduler — per-instance cadence, bounded tick fan-out
// =============================================================================
//
// A 1 s scanner finds due instances (status running/recovering, cadence
// elapsed) and spawns one tick task each. Concurrency discipline:
//
//   - a global semaphore caps in-flight ticks across all instances,
//   - the per-instance tick lock guarantees ticks for one instance never
//     interleave: if the previous tick still runs, the new one is skipped,
//   - a tick that exceeds 2x its interval is logged as slow and allowed to
//     finish.
//
// Stopping an instance flips its cancel signal; the in-flight tick observes
// it at the next chain-action boundary or retry delay and exits cleanly.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, ErrorKind};
use crate::strategy::manager::{InstanceHandle, StrategyManager};
use crate::types::{Decision, InstanceStatus};

/// Scan cadence for due instances.
const SCAN_INTERVAL: Duration = Duration::from_secs(1);

pub struct StrategyScheduler {
    manager: Arc<StrategyManager>,
    /// Caps concurrent in-flight ticks process-wide (RPC pressure bound).
    semaphore: Arc<Semaphore>,
}

impl StrategyScheduler {
    pub fn new(manager: Arc<StrategyManager>, max_in_flight: usize) -> Arc<Self> {
        Arc::new(Self {
            manager,
            semaphore: Arc::new(Semaphore::new(max_in_flight.max(1))),
        })
    }

    /// Run until `shutdown` flips true. Spawn as a background task.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            permits = self.semaphore.available_permits(),
            "strategy scheduler started"
        );
        let mut ticker = interval(SCAN_INTERVAL);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.scan(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("strategy scheduler shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One pass over the instance set, spawning ticks for due instances.
    fn scan(&self) {
        for handle in self.manager.handles() {
            if !matches!(
                handle.status(),
                InstanceStatus::Running | InstanceStatus::Recovering
            ) {
                continue;
            }

            let due = match *handle.last_tick_completed.lock() {
                Some(last) => last.elapsed() >= handle.interval,
                None => true,
            };
            if !due {
                continue;
            }

            let manager = self.manager.clone();
            let semaphore = self.semaphore.clone();
            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return; // semaphore closed at shutdown
                };
                drive_tick(&manager, &handle).await;
            });
        }
    }
}

/// Execute one tick for `handle`: recover if needed, evaluate, act,
/// persist, publish.
pub async fn drive_tick(manager: &StrategyManager, handle: &Arc<InstanceHandle>) {
    // No overlap per instance: skip when the previous tick still runs.
    let Ok(_tick_guard) = handle.tick_lock.try_lock() else {
        debug!(instance = %handle.id, "previous tick still in flight — skipping");
        return;
    };

    let started = Instant::now();
    let executor = handle.executor();

    // Recovering instances reconcile before their first real tick.
    if handle.status() == InstanceStatus::Recovering {
        if let Err(e) = manager.recover_instance(handle).await {
            warn!(instance = %handle.id, error = %e, "recovery tick failed");
            finish_tick(handle, started);
            return;
        }
        if handle.status() != InstanceStatus::Running {
            finish_tick(handle, started);
            return;
        }
    }

    match executor.tick().await {
        Ok(decision) => {
            if decision != Decision::Hold && decision != Decision::Complete {
                if let Err(e) = executor.handle(decision).await {
                    handle_tick_error(manager, handle, &e);
                    finish_tick(handle, started);
                    return;
                }
            }
            if let Err(e) = manager.after_tick(handle) {
                error!(instance = %handle.id, error = %e, "post-tick persistence failed");
            }
        }
        Err(e) => handle_tick_error(manager, handle, &e),
    }

    finish_tick(handle, started);
}

fn handle_tick_error(manager: &StrategyManager, handle: &Arc<InstanceHandle>, error: &EngineError) {
    match error.kind() {
        // A stop is in progress; the manager owns the transition.
        ErrorKind::Cancelled => {
            debug!(instance = %handle.id, "tick cancelled");
        }
        // Validation failures (e.g. zero balance at Opening) leave the
        // instance where it is: it never opened anything and may become
        // viable on a later tick.
        ErrorKind::Validation => {
            warn!(instance = %handle.id, error = %error, "tick rejected by validation");
        }
        _ => {
            error!(instance = %handle.id, error = %error, "tick failed terminally");
            manager.fail(handle, error);
        }
    }
}

fn finish_tick(handle: &Arc<InstanceHandle>, started: Instant) {
    let elapsed = started.elapsed();
    if elapsed > handle.interval * 2 {
        warn!(
            instance = %handle.id,
            elapsed_secs = elapsed.as_secs(),
            interval_secs = handle.interval.as_secs(),
            "slow tick exceeded twice its interval"
        );
    }
    *handle.last_tick_completed.lock() = Some(Instant::now());
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::AnalyticsConfig;
    use crate::events::EventBus;
    use crate::retry::RetryCoordinator;
    use crate::runtime_config::SimpleYDefaults;
    use crate::storage::InstanceStorage;
    use crate::strategy::manager::ManagerDeps;
    use crate::strategy::ExecPhase;
    use crate::testkit::{mock_owner, MockAmm, MockSwap};
    use crate::types::StrategyKind;

    const Y_AMOUNT: u64 = 25_000_000_000;

    fn rig() -> (Arc<StrategyManager>, Arc<MockAmm>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let amm = MockAmm::new(500, Y_AMOUNT * 4);
        let swap = MockSwap::new(amm.clone());
        let storage = Arc::new(InstanceStorage::open(dir.path()).unwrap());
        let manager = Arc::new(StrategyManager::new(ManagerDeps {
            amm: amm.clone(),
            swap,
            retry: RetryCoordinator::new(),
            bus: EventBus::new(),
            storage,
            owner: mock_owner(),
            analytics: AnalyticsConfig::default(),
            simple_y_defaults: SimpleYDefaults::default(),
            monitor_interval: Duration::from_secs(30),
            max_active: 10,
        }));
        (manager, amm, dir)
    }

    fn config(amm: &MockAmm) -> serde_json::Value {
        serde_json::json!({
            "poolAddress": amm.pool.address.to_string(),
            "yAmountRaw": Y_AMOUNT,
            "binRange": 10u32,
        })
    }

    #[tokio::test]
    async fn drive_tick_opens_and_persists() {
        let (manager, amm, _dir) = rig();
        let id = manager
            .create(StrategyKind::SimpleY, "t", config(&amm))
            .unwrap();
        manager.start(&id).unwrap();

        let handle = manager
            .handles()
            .into_iter()
            .find(|h| h.id == id)
            .unwrap();
        drive_tick(&manager, &handle).await;

        let record = manager.get(&id).unwrap();
        assert_eq!(record.positions.len(), 1);
        assert!(record.last_snapshot.is_some());
        assert!(handle.last_tick_completed.lock().is_some());
    }

    #[tokio::test]
    async fn recovering_instance_reconciles_then_ticks() {
        let (manager, amm, dir) = rig();
        let id = manager
            .create(StrategyKind::SimpleY, "t", config(&amm))
            .unwrap();
        manager.start(&id).unwrap();
        let handle = manager
            .handles()
            .into_iter()
            .find(|h| h.id == id)
            .unwrap();
        drive_tick(&manager, &handle).await;
        drop(manager);

        // Reboot over the same storage + chain.
        let swap = MockSwap::new(amm.clone());
        let storage = Arc::new(InstanceStorage::open(dir.path()).unwrap());
        let manager = Arc::new(StrategyManager::new(ManagerDeps {
            amm: amm.clone(),
            swap,
            retry: RetryCoordinator::new(),
            bus: EventBus::new(),
            storage,
            owner: mock_owner(),
            analytics: AnalyticsConfig::default(),
            simple_y_defaults: SimpleYDefaults::default(),
            monitor_interval: Duration::from_secs(30),
            max_active: 10,
        }));
        manager.boot().unwrap();
        let handle = manager
            .handles()
            .into_iter()
            .find(|h| h.id == id)
            .unwrap();
        assert_eq!(handle.status(), InstanceStatus::Recovering);

        drive_tick(&manager, &handle).await;
        assert_eq!(handle.status(), InstanceStatus::Running);
        assert_eq!(handle.executor().phase(), ExecPhase::InRange);
    }

    #[tokio::test]
    async fn terminal_tick_error_marks_instance() {
        let (manager, amm, _dir) = rig();
        let id = manager
            .create(StrategyKind::SimpleY, "t", config(&amm))
            .unwrap();
        manager.start(&id).unwrap();

        amm.push_open_error(crate::error::EngineError::OnChainTerminal(
            "custom program error: 0x1".into(),
        ));
        let handle = manager
            .handles()
            .into_iter()
            .find(|h| h.id == id)
            .unwrap();
        drive_tick(&manager, &handle).await;

        let record = manager.get(&id).unwrap();
        assert_eq!(record.status, InstanceStatus::Error);
        assert_eq!(record.error_reason.as_deref(), Some("on-chain-terminal"));
    }

    #[tokio::test]
    async fn validation_error_keeps_instance_running() {
        let (manager, amm, _dir) = rig();
        let id = manager
            .create(StrategyKind::SimpleY, "t", config(&amm))
            .unwrap();
        manager.start(&id).unwrap();
        amm.set_balances(0, 0); // zero Y at Opening

        let handle = manager
            .handles()
            .into_iter()
            .find(|h| h.id == id)
            .unwrap();
        drive_tick(&manager, &handle).await;

        // Never left Init, still running; a funded wallet would let a
        // later tick proceed.
        assert_eq!(handle.status(), InstanceStatus::Running);
        assert_eq!(handle.executor().phase(), ExecPhase::Init);
        assert!(manager.get(&id).unwrap().positions.is_empty());
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let (manager, amm, _dir) = rig();
        let id = manager
            .create(StrategyKind::SimpleY, "t", config(&amm))
            .unwrap();
        manager.start(&id).unwrap();
        let handle = manager
            .handles()
            .into_iter()
            .find(|h| h.id == id)
            .unwrap();

        // Hold the tick lock to simulate an in-flight tick.
        let _guard = handle.tick_lock.lock().await;
        drive_tick(&manager, &handle).await;

        // The skipped tick did nothing: no position opened.
        assert!(amm.live_positions().is_empty());
    }
}
