// =============================================================================
// Runtime Configuration — process-level settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian engine. Persistence uses the
// atomic tmp + rename pattern so a crash mid-write never corrupts the file,
// and every field carries a serde default so adding new fields never breaks
// loading an older config.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_server_port() -> u16 {
    3000
}

fn default_ws_port() -> u16 {
    3001
}

fn default_rpc_primary() -> String {
    "https://api.mainnet-beta.solana.com".to_string()
}

fn default_commitment() -> String {
    "confirmed".to_string()
}

fn default_priority_fee_microlamports() -> u64 {
    10_000
}

fn default_confirm_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_monitor_interval_secs() -> u64 {
    30
}

fn default_strategy_timeout_secs() -> u64 {
    120
}

fn default_max_active_strategies() -> usize {
    10
}

fn default_bin_range() -> u32 {
    10
}

fn default_stop_loss_count() -> u32 {
    1
}

fn default_stop_loss_bin_offset() -> u32 {
    35
}

fn default_upward_timeout_secs() -> u64 {
    300
}

fn default_downward_timeout_secs() -> u64 {
    60
}

fn default_slippage_bps() -> u16 {
    50
}

fn default_annualization_factor() -> f64 {
    525_600.0
}

fn default_health_interval_secs() -> u64 {
    300
}

fn default_swap_api_base() -> String {
    "https://quote-api.jup.ag/v6".to_string()
}

fn default_data_root() -> String {
    "data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// =============================================================================
// Sections
// =============================================================================

/// HTTP / WebSocket listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            ws_port: default_ws_port(),
        }
    }
}

/// Chain Gateway endpoints and retry profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_primary")]
    pub primary: String,
    #[serde(default)]
    pub backups: Vec<String>,
    /// Confirmation commitment: processed | confirmed | finalized.
    #[serde(default = "default_commitment")]
    pub commitment: String,
    /// Compute-unit price attached to every transaction.
    #[serde(default = "default_priority_fee_microlamports")]
    pub priority_fee_microlamports: u64,
    /// Default confirmation deadline in seconds.
    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            primary: default_rpc_primary(),
            backups: Vec::new(),
            commitment: default_commitment(),
            priority_fee_microlamports: default_priority_fee_microlamports(),
            confirm_timeout_secs: default_confirm_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

/// Defaults applied to Simple-Y instances when the caller omits an option.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleYDefaults {
    #[serde(default = "default_bin_range")]
    pub bin_range: u32,
    #[serde(default = "default_stop_loss_count")]
    pub stop_loss_count: u32,
    #[serde(default = "default_stop_loss_bin_offset")]
    pub stop_loss_bin_offset: u32,
    #[serde(default = "default_upward_timeout_secs")]
    pub upward_timeout_seconds: u64,
    #[serde(default = "default_downward_timeout_secs")]
    pub downward_timeout_seconds: u64,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u16,
}

impl Default for SimpleYDefaults {
    fn default() -> Self {
        Self {
            bin_range: default_bin_range(),
            stop_loss_count: default_stop_loss_count(),
            stop_loss_bin_offset: default_stop_loss_bin_offset(),
            upward_timeout_seconds: default_upward_timeout_secs(),
            downward_timeout_seconds: default_downward_timeout_secs(),
            slippage_bps: default_slippage_bps(),
        }
    }
}

/// Scheduler and executor-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Default per-instance tick period in seconds.
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    /// Watchdog: a tick exceeding 2x the interval is reported stuck.
    #[serde(default = "default_strategy_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Global cap on concurrently-ticking instances.
    #[serde(default = "default_max_active_strategies")]
    pub max_active_strategies: usize,
    #[serde(default)]
    pub default_params: SimpleYDefaults,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: default_monitor_interval_secs(),
            default_timeout_secs: default_strategy_timeout_secs(),
            max_active_strategies: default_max_active_strategies(),
            default_params: SimpleYDefaults::default(),
        }
    }
}

/// Analytics knobs: annualization and optional benchmark feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsSection {
    /// Minutes-per-year applied when annualizing windowed yield.
    #[serde(default = "default_annualization_factor")]
    pub annualization_factor: f64,
    /// Reference yield-per-minute; absent means benchmark rates are null.
    #[serde(default)]
    pub benchmark_rate_per_minute: Option<f64>,
}

impl Default for AnalyticsSection {
    fn default() -> Self {
        Self {
            annualization_factor: default_annualization_factor(),
            benchmark_rate_per_minute: None,
        }
    }
}

/// Health checker cadence and remediation gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    /// When false, findings are published but nothing is auto-repaired.
    #[serde(default)]
    pub auto_remediate: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            auto_remediate: false,
        }
    }
}

/// Logging collaborator settings (transport/rotation live outside this
/// process; only the level is consumed here).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub max_file_size: Option<u64>,
    #[serde(default)]
    pub max_files: Option<u32>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_file_size: None,
            max_files: None,
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub analytics: AnalyticsSection,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Swap aggregator HTTP base URL.
    #[serde(default = "default_swap_api_base")]
    pub swap_api_base: String,
    /// Root directory for persisted instance records.
    #[serde(default = "default_data_root")]
    pub data_root: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            rpc: RpcConfig::default(),
            strategy: StrategyConfig::default(),
            analytics: AnalyticsSection::default(),
            health: HealthConfig::default(),
            logging: LoggingConfig::default(),
            swap_api_base: default_swap_api_base(),
            data_root: default_data_root(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`. Missing file is an
    /// error so the caller can fall back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            rpc_primary = %config.rpc.primary,
            backups = config.rpc.backups.len(),
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration using an atomic write (write to
    /// `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// All configured RPC endpoints, primary first.
    pub fn rpc_endpoints(&self) -> Vec<String> {
        let mut endpoints = vec![self.rpc.primary.clone()];
        endpoints.extend(self.rpc.backups.iter().cloned());
        endpoints
    }
}
