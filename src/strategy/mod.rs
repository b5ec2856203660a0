// =============================================================================
// Strategy runtime: executor contract, typed configurations, lifecycle
// =============================================================================

pub mod chain_position;
pub mod health;
pub mod manager;
pub mod scheduler;
pub mod simple_y;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::amm::AmmAdapter;
use crate::analytics::{AnalyticsConfig, LedgerEntry, Snapshot};
use crate::error::EngineError;
use crate::events::EventBus;
use crate::retry::RetryCoordinator;
use crate::runtime_config::SimpleYDefaults;
use crate::swap::SwapAdapter;
use crate::types::{CloseReason, Decision, StrategyKind};

// ---------------------------------------------------------------------------
// Execution phases
// ---------------------------------------------------------------------------

/// Observable phase of an executor's state machine. Simple-Y and
/// Chain-Position each use their own subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecPhase {
    Init,
    Opening,
    InRange,
    OutOfRangeUp,
    OutOfRangeDown,
    Recentering,
    Tracking,
    Shifting,
    Harvesting,
    Closing,
    Done,
    Error,
}

impl std::fmt::Display for ExecPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Opening => "opening",
            Self::InRange => "in-range",
            Self::OutOfRangeUp => "out-of-range-up",
            Self::OutOfRangeDown => "out-of-range-down",
            Self::Recentering => "recentering",
            Self::Tracking => "tracking",
            Self::Shifting => "shifting",
            Self::Harvesting => "harvesting",
            Self::Closing => "closing",
            Self::Done => "done",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Result of boot-time reconciliation against the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverOutcome {
    /// On-chain set matches the recorded set.
    Clean,
    /// Extra on-chain positions were adopted into the instance.
    Adopted(usize),
    /// Recorded positions are missing on chain; the instance is orphaned.
    Orphaned,
}

// ---------------------------------------------------------------------------
// Executor contract
// ---------------------------------------------------------------------------

/// The contract every strategy variant implements. The scheduler drives
/// `tick` → `handle`; the manager drives `initialize`, `teardown`,
/// `recover`.
#[async_trait]
pub trait StrategyExecutor: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn instance_id(&self) -> &str;

    /// Validate configuration and balances; moves Init → Opening.
    async fn initialize(&self) -> Result<(), EngineError>;

    /// Observe chain state, update analytics, evaluate transitions.
    async fn tick(&self) -> Result<Decision, EngineError>;

    /// Execute the side effects of a non-Hold decision.
    async fn handle(&self, decision: Decision) -> Result<(), EngineError>;

    /// Close all positions and settle residuals for `reason`.
    async fn teardown(&self, reason: CloseReason) -> Result<(), EngineError>;

    /// Reconcile the recorded position set against the chain at boot.
    async fn recover(&self, recorded: &[String]) -> Result<RecoverOutcome, EngineError>;

    /// Rehydrate analytics from a persisted ledger.
    fn restore_ledger(&self, entries: Vec<LedgerEntry>);

    fn phase(&self) -> ExecPhase;

    fn last_snapshot(&self) -> Option<Snapshot>;

    /// Base58 addresses of currently-owned positions.
    fn position_addresses(&self) -> Vec<String>;

    fn ledger(&self) -> Vec<LedgerEntry>;

    /// Terminal reason code when the phase is Error.
    fn error_reason(&self) -> Option<String>;
}

/// Everything an executor needs from the runtime, owned per instance.
#[derive(Clone)]
pub struct ExecutorContext {
    pub instance_id: String,
    /// Operator wallet address owning every position of this instance.
    pub owner: solana_sdk::pubkey::Pubkey,
    pub amm: Arc<dyn AmmAdapter>,
    pub swap: Arc<dyn SwapAdapter>,
    pub retry: RetryCoordinator,
    pub bus: EventBus,
    pub cancel: watch::Receiver<bool>,
    pub analytics: AnalyticsConfig,
}

// ---------------------------------------------------------------------------
// Typed configurations
// ---------------------------------------------------------------------------

/// Wire form of the Simple-Y configuration. Unknown keys are rejected at
/// create; omitted options fall back to the process-level defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SimpleYConfigInput {
    pub pool_address: String,
    pub y_amount_raw: u64,
    #[serde(default)]
    pub bin_range: Option<u32>,
    #[serde(default)]
    pub stop_loss_count: Option<u32>,
    #[serde(default)]
    pub stop_loss_bin_offset: Option<u32>,
    #[serde(default)]
    pub upward_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub downward_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub slippage_bps: Option<u16>,
}

/// Fully-resolved Simple-Y configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleYConfig {
    pub pool_address: String,
    pub y_amount_raw: u64,
    pub bin_range: u32,
    pub stop_loss_count: u32,
    pub stop_loss_bin_offset: u32,
    pub upward_timeout_seconds: u64,
    pub downward_timeout_seconds: u64,
    pub slippage_bps: u16,
}

impl SimpleYConfig {
    /// Parse and validate a raw config value, applying process defaults.
    pub fn from_value(
        value: &serde_json::Value,
        defaults: &SimpleYDefaults,
    ) -> Result<Self, EngineError> {
        let input: SimpleYConfigInput = serde_json::from_value(value.clone())
            .map_err(|e| EngineError::Validation(format!("simple-y config: {e}")))?;

        let config = Self {
            pool_address: input.pool_address,
            y_amount_raw: input.y_amount_raw,
            bin_range: input.bin_range.unwrap_or(defaults.bin_range),
            stop_loss_count: input.stop_loss_count.unwrap_or(defaults.stop_loss_count),
            stop_loss_bin_offset: input
                .stop_loss_bin_offset
                .unwrap_or(defaults.stop_loss_bin_offset),
            upward_timeout_seconds: input
                .upward_timeout_seconds
                .unwrap_or(defaults.upward_timeout_seconds),
            downward_timeout_seconds: input
                .downward_timeout_seconds
                .unwrap_or(defaults.downward_timeout_seconds),
            slippage_bps: input.slippage_bps.unwrap_or(defaults.slippage_bps),
        };

        crate::amm::bins::validate_width(config.bin_range)?;
        if config.y_amount_raw == 0 {
            return Err(EngineError::Validation("yAmountRaw must be positive".into()));
        }
        if config.stop_loss_count == 0 {
            return Err(EngineError::Validation("stopLossCount must be >= 1".into()));
        }
        config
            .pool_address
            .parse::<solana_sdk::pubkey::Pubkey>()
            .map_err(|e| EngineError::Validation(format!("poolAddress: {e}")))?;

        Ok(config)
    }
}

/// Chain variant: which side of the active bin the chain extends toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainVariant {
    #[serde(rename = "Y_CHAIN")]
    YChain,
    #[serde(rename = "X_CHAIN")]
    XChain,
    #[serde(rename = "XY_CHAIN")]
    XyChain,
}

impl std::fmt::Display for ChainVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::YChain => write!(f, "Y_CHAIN"),
            Self::XChain => write!(f, "X_CHAIN"),
            Self::XyChain => write!(f, "XY_CHAIN"),
        }
    }
}

/// Smart stop-loss sub-config shared with Simple-Y semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StopLossConfig {
    #[serde(default = "StopLossConfig::default_count")]
    pub stop_loss_count: u32,
    #[serde(default = "StopLossConfig::default_offset")]
    pub stop_loss_bin_offset: u32,
}

impl StopLossConfig {
    fn default_count() -> u32 {
        1
    }
    fn default_offset() -> u32 {
        35
    }
}

impl Default for StopLossConfig {
    fn default() -> Self {
        Self {
            stop_loss_count: Self::default_count(),
            stop_loss_bin_offset: Self::default_offset(),
        }
    }
}

/// Chain-Position configuration. Unknown keys rejected at create.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChainPositionConfig {
    pub pool_address: String,
    pub chain_position_type: ChainVariant,
    /// Principal per link, raw units of the funding side.
    pub position_amount_raw: u64,
    /// Width of each link in bins.
    #[serde(default = "ChainPositionConfig::default_bin_range")]
    pub bin_range: u32,
    /// Number of links K in the chain.
    #[serde(default = "ChainPositionConfig::default_chain_length")]
    pub chain_length: u32,
    #[serde(default = "ChainPositionConfig::default_interval")]
    pub monitoring_interval_seconds: u64,
    /// Tolerated time with the active bin on the adverse side of the
    /// super-range before the chain closes out.
    #[serde(default = "ChainPositionConfig::default_oor_timeout")]
    pub out_of_range_timeout_seconds: u64,
    /// Harvest fees when unrealized exceeds this percent of principal.
    #[serde(default = "ChainPositionConfig::default_yield_threshold")]
    pub yield_extraction_threshold_percent: f64,
    #[serde(default)]
    pub enable_smart_stop_loss: bool,
    #[serde(default)]
    pub stop_loss_config: Option<StopLossConfig>,
    #[serde(default = "ChainPositionConfig::default_slippage")]
    pub slippage_bps: u16,
}

impl ChainPositionConfig {
    fn default_bin_range() -> u32 {
        10
    }
    fn default_chain_length() -> u32 {
        3
    }
    fn default_interval() -> u64 {
        30
    }
    fn default_oor_timeout() -> u64 {
        300
    }
    fn default_yield_threshold() -> f64 {
        1.0
    }
    fn default_slippage() -> u16 {
        50
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|e| EngineError::Validation(format!("chain-position config: {e}")))?;

        crate::amm::bins::validate_width(config.bin_range)?;
        if config.chain_length == 0 {
            return Err(EngineError::Validation("chainLength must be >= 1".into()));
        }
        if config.position_amount_raw == 0 {
            return Err(EngineError::Validation(
                "positionAmountRaw must be positive".into(),
            ));
        }
        if config.yield_extraction_threshold_percent < 0.0 {
            return Err(EngineError::Validation(
                "yieldExtractionThresholdPercent must be >= 0".into(),
            ));
        }
        config
            .pool_address
            .parse::<solana_sdk::pubkey::Pubkey>()
            .map_err(|e| EngineError::Validation(format!("poolAddress: {e}")))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POOL: &str = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";

    fn defaults() -> SimpleYDefaults {
        SimpleYDefaults::default()
    }

    #[test]
    fn simple_y_defaults_fill_omitted_fields() {
        let value = serde_json::json!({
            "poolAddress": POOL,
            "yAmountRaw": 25_000_000_000u64,
        });
        let config = SimpleYConfig::from_value(&value, &defaults()).unwrap();
        assert_eq!(config.bin_range, 10);
        assert_eq!(config.stop_loss_count, 1);
        assert_eq!(config.stop_loss_bin_offset, 35);
        assert_eq!(config.upward_timeout_seconds, 300);
        assert_eq!(config.downward_timeout_seconds, 60);
    }

    #[test]
    fn simple_y_rejects_unknown_keys() {
        let value = serde_json::json!({
            "poolAddress": POOL,
            "yAmountRaw": 1u64,
            "surpriseOption": true,
        });
        let err = SimpleYConfig::from_value(&value, &defaults()).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn simple_y_rejects_zero_amount_and_bad_width() {
        let value = serde_json::json!({"poolAddress": POOL, "yAmountRaw": 0u64});
        assert!(SimpleYConfig::from_value(&value, &defaults()).is_err());

        let value = serde_json::json!({
            "poolAddress": POOL,
            "yAmountRaw": 1u64,
            "binRange": 70u32,
        });
        assert!(SimpleYConfig::from_value(&value, &defaults()).is_err());
    }

    #[test]
    fn simple_y_rejects_bad_pool_address() {
        let value = serde_json::json!({"poolAddress": "not-a-pubkey", "yAmountRaw": 1u64});
        assert!(SimpleYConfig::from_value(&value, &defaults()).is_err());
    }

    #[test]
    fn chain_config_parses_variant_names() {
        let value = serde_json::json!({
            "poolAddress": POOL,
            "chainPositionType": "Y_CHAIN",
            "positionAmountRaw": 1_000_000u64,
            "chainLength": 3u32,
        });
        let config = ChainPositionConfig::from_value(&value).unwrap();
        assert_eq!(config.chain_position_type, ChainVariant::YChain);
        assert_eq!(config.chain_length, 3);
        assert_eq!(config.bin_range, 10);
        assert!(!config.enable_smart_stop_loss);
    }

    #[test]
    fn chain_config_rejects_zero_links() {
        let value = serde_json::json!({
            "poolAddress": POOL,
            "chainPositionType": "X_CHAIN",
            "positionAmountRaw": 1u64,
            "chainLength": 0u32,
        });
        assert!(ChainPositionConfig::from_value(&value).is_err());
    }

    #[test]
    fn stop_loss_config_defaults() {
        let sl: StopLossConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(sl.stop_loss_count, 1);
        assert_eq!(sl.stop_loss_bin_offset, 35);
    }
}
