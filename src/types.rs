// =============================================================================
// Shared types used across the Meridian liquidity engine
// =============================================================================

use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;

// ---------------------------------------------------------------------------
// Strategy kind & lifecycle
// ---------------------------------------------------------------------------

/// Which executor variant an instance runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    SimpleY,
    ChainPosition,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SimpleY => write!(f, "simple-y"),
            Self::ChainPosition => write!(f, "chain-position"),
        }
    }
}

/// Lifecycle status of a strategy instance.
///
/// `Recovering` is a boot-time transient for instances that were `Running`
/// before a restart; one successful reconcile tick moves them back to
/// `Running` (or to `Error` when the on-chain set no longer matches).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Error,
    Completed,
    Recovering,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Completed => "completed",
            Self::Recovering => "recovering",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// Which side(s) of the pair a position is funded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    X,
    Y,
    Xy,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::X => write!(f, "X"),
            Self::Y => write!(f, "Y"),
            Self::Xy => write!(f, "XY"),
        }
    }
}

/// Immutable pool description, read once per instance run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    pub address: Pubkey,
    pub token_x_mint: Pubkey,
    pub token_y_mint: Pubkey,
    pub reserve_x: Pubkey,
    pub reserve_y: Pubkey,
    pub oracle: Pubkey,
    pub decimals_x: u8,
    pub decimals_y: u8,
    /// Bin step in basis points; bin `i` prices at `(1 + step/10_000)^i`.
    pub bin_step: u16,
}

/// A live on-chain liquidity position owned by exactly one instance.
#[derive(Debug, Clone)]
pub struct Position {
    pub address: Pubkey,
    pub pool: Pubkey,
    pub owner: Pubkey,
    /// Inclusive bin bounds.
    pub lower_bin: i32,
    pub upper_bin: i32,
    /// Raw deposited amounts, precision-preserving.
    pub amount_x_raw: u64,
    pub amount_y_raw: u64,
    /// Unclaimed fees as of the last read.
    pub fees_x_raw: u64,
    pub fees_y_raw: u64,
}

impl Position {
    /// Inclusive width of the bin range.
    pub fn width(&self) -> u32 {
        (self.upper_bin - self.lower_bin + 1).max(0) as u32
    }

    pub fn contains(&self, bin: i32) -> bool {
        self.lower_bin <= bin && bin <= self.upper_bin
    }
}

/// What the AMM returned when a position was closed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloseOutcome {
    pub x_raw_returned: u64,
    pub y_raw_returned: u64,
    pub fees_x_raw: u64,
    pub fees_y_raw: u64,
}

/// Fees claimed by a harvest, positions left open.
#[derive(Debug, Clone, Copy, Default)]
pub struct HarvestOutcome {
    pub fees_x_raw: u64,
    pub fees_y_raw: u64,
}

// ---------------------------------------------------------------------------
// Executor decisions
// ---------------------------------------------------------------------------

/// Outcome of one executor tick evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Decision {
    Hold,
    RecenterUp,
    RecenterDown,
    Harvest,
    StopLoss,
    Complete,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Hold => "hold",
            Self::RecenterUp => "recenter-up",
            Self::RecenterDown => "recenter-down",
            Self::Harvest => "harvest",
            Self::StopLoss => "stop-loss",
            Self::Complete => "complete",
        };
        write!(f, "{s}")
    }
}

/// Why an instance is closing its positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloseReason {
    StopLoss,
    UserStop,
    Completed,
    Error,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StopLoss => "stop-loss",
            Self::UserStop => "user-stop",
            Self::Completed => "completed",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}
