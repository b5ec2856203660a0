// =============================================================================
// Health Checker — slow-cadence audit of running instances
// =============================================================================
//
// Every few minutes, for each running instance:
//   1. liveness — the executor completed a tick within 2x its interval,
//   2. position integrity — the on-chain position set matches the record
//      (count and addresses),
//   3. storage consistency — a record exists on disk iff the instance is
//      known to the manager.
//
// Findings are published on the bus; the only remediation applied when
// `auto_remediate` is on is re-writing a missing storage record — anything
// touching chain state stays a human decision.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::runtime_config::HealthConfig;
use crate::strategy::manager::{InstanceHandle, StrategyManager};
use crate::types::InstanceStatus;

/// Bus topic carrying health findings.
pub const TOPIC_HEALTH_FINDING: &str = "health.finding";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum Finding {
    /// No completed tick within twice the monitoring interval.
    StuckExecutor { instance_id: String, last_tick_age_secs: u64 },
    /// Recorded and on-chain position sets differ.
    PositionMismatch {
        instance_id: String,
        recorded: Vec<String>,
        on_chain: Vec<String>,
    },
    /// The manager knows the instance but storage has no record.
    MissingRecord { instance_id: String },
}

pub struct HealthChecker {
    manager: Arc<StrategyManager>,
    bus: EventBus,
    config: HealthConfig,
}

impl HealthChecker {
    pub fn new(manager: Arc<StrategyManager>, bus: EventBus, config: HealthConfig) -> Arc<Self> {
        Arc::new(Self {
            manager,
            bus,
            config,
        })
    }

    /// Run until `shutdown` flips true. Spawn as a background task.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval_secs,
            auto_remediate = self.config.auto_remediate,
            "health checker started"
        );
        let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let findings = self.audit().await;
                    self.report(findings);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("health checker shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One audit pass over all running instances.
    pub async fn audit(&self) -> Vec<Finding> {
        let mut findings = Vec::new();

        for handle in self.manager.handles() {
            if handle.status() != InstanceStatus::Running {
                continue;
            }

            self.check_liveness(&handle, &mut findings);
            self.check_positions(&handle, &mut findings).await;
            self.check_storage(&handle, &mut findings);
        }

        findings
    }

    fn check_liveness(&self, handle: &Arc<InstanceHandle>, findings: &mut Vec<Finding>) {
        if let Some(last) = *handle.last_tick_completed.lock() {
            let age = last.elapsed();
            if age > handle.interval * 2 {
                findings.push(Finding::StuckExecutor {
                    instance_id: handle.id.clone(),
                    last_tick_age_secs: age.as_secs(),
                });
            }
        }
    }

    async fn check_positions(&self, handle: &Arc<InstanceHandle>, findings: &mut Vec<Finding>) {
        let (recorded, pool_address) = {
            let record = handle.record.lock();
            let pool = record
                .config
                .get("poolAddress")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok());
            (record.positions.clone(), pool)
        };
        let Some(pool_address) = pool_address else {
            return;
        };

        let amm = self.manager.amm();
        let Ok(pool) = amm.read_pool(&pool_address).await else {
            debug!(instance = %handle.id, "pool unreadable during audit — skipping");
            return;
        };
        let Ok(on_chain) = amm
            .read_positions_for_owner(&pool, &self.manager.owner())
            .await
        else {
            debug!(instance = %handle.id, "positions unreadable during audit — skipping");
            return;
        };

        let on_chain_set: HashSet<String> =
            on_chain.iter().map(|p| p.address.to_string()).collect();
        let recorded_set: HashSet<String> = recorded.iter().cloned().collect();

        // Positions recorded by this instance must all exist on chain. The
        // reverse containment is checked only for count drift: other
        // instances may own positions in the same pool.
        if !recorded_set.is_subset(&on_chain_set) {
            findings.push(Finding::PositionMismatch {
                instance_id: handle.id.clone(),
                recorded,
                on_chain: on_chain_set.into_iter().collect(),
            });
        }
    }

    fn check_storage(&self, handle: &Arc<InstanceHandle>, findings: &mut Vec<Finding>) {
        if !self.manager.storage().exists(&handle.id) {
            findings.push(Finding::MissingRecord {
                instance_id: handle.id.clone(),
            });
            if self.config.auto_remediate {
                let record = handle.record.lock().clone();
                if self.manager.storage().save(&record).is_ok() {
                    info!(instance = %handle.id, "missing record re-written (auto-remediation)");
                }
            }
        }
    }

    fn report(&self, findings: Vec<Finding>) {
        if findings.is_empty() {
            debug!("health audit clean");
            return;
        }
        warn!(count = findings.len(), "health audit produced findings");
        for finding in findings {
            if let Ok(payload) = serde_json::to_value(&finding) {
                self.bus.publish(TOPIC_HEALTH_FINDING, payload);
            }
        }
    }
}
